//! Message receiver: reads, validates, and demultiplexes inbound frames.
//!
//! One reader task per connection. Complete frames are routed by their
//! leading request id; frames for ids with no live request are silently
//! dropped, which is the intentional race-free policy for messages arriving after
//! a request ended locally. Authentication-typed frames are a protocol
//! error once the connection is established, which is the only state this
//! task runs in.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;
use trunkline_proto::{Frame, FrameDecoder, FrameType};

use crate::connection::{ConnInner, ConnectionState, ReadBufReturn};
use crate::error::Result;

pub(crate) async fn run(
    mut read_half: OwnedReadHalf,
    conn: Arc<ConnInner>,
    mut buf: BytesMut,
    buf_return: Option<ReadBufReturn>,
) {
    match read_loop(&mut read_half, &conn, &mut buf).await {
        Ok(()) => debug!(peer = %conn.peer(), "receiver finished"),
        Err(err) => debug!(peer = %conn.peer(), error = %err, "receiver stopped"),
    }
    conn.shutdown();
    if let Some(put_back) = buf_return {
        put_back(buf);
    }
}

async fn read_loop(
    read_half: &mut OwnedReadHalf,
    conn: &Arc<ConnInner>,
    buf: &mut BytesMut,
) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut state_rx = conn.subscribe_state();
    loop {
        loop {
            match decoder.decode(buf) {
                Ok(Some(frame)) => handle_frame(conn, frame)?,
                Ok(None) => break,
                Err(err) => return Err(conn.protocol_error(err.to_string())),
            }
        }

        tokio::select! {
            read = read_half.read_buf(buf) => {
                if read? == 0 {
                    // Peer hung up.
                    return Ok(());
                }
            }
            _ = state_rx.changed() => {
                if matches!(
                    *state_rx.borrow(),
                    ConnectionState::ShuttingDown | ConnectionState::Closed
                ) {
                    return Ok(());
                }
            }
        }
    }
}

fn handle_frame(conn: &Arc<ConnInner>, frame: Frame) -> Result<()> {
    conn.metrics.record_frame_received(frame.encoded_len());
    match frame.frame_type {
        FrameType::Authentication => Err(conn.protocol_error(
            "authentication frame on an established connection".into(),
        )),
        FrameType::Request => {
            let id = match frame.request_id() {
                Some(id) => id,
                None => {
                    return Err(
                        conn.protocol_error("request frame shorter than a request id".into())
                    )
                }
            };
            conn.deliver_request_frame(id, frame.body());
            Ok(())
        }
    }
}
