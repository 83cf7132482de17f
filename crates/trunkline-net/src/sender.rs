//! Message sender: serial, queued writes with application-layer batching.
//!
//! All producers on a connection enqueue frames through an unbounded FIFO;
//! one writer task drains the queue and coalesces whatever is pending into
//! as few socket writes as possible. There is no flush primitive; a frame
//! is on its way to the kernel as soon as the writer task wakes. A socket
//! write error terminates the task and drives the connection into
//! ShuttingDown, dropping whatever was still queued.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trunkline_proto::Frame;

use crate::connection::ConnInner;

/// Queue items the writer task consumes.
#[derive(Debug)]
pub(crate) enum SendItem {
    /// Encode and write this frame.
    Frame(Frame),
    /// Finish outstanding writes and exit.
    Close,
}

pub(crate) async fn run(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    conn: Arc<ConnInner>,
) {
    match write_loop(&mut write_half, &mut rx, &conn).await {
        Ok(()) => debug!(peer = %conn.peer(), "sender finished"),
        Err(err) => warn!(peer = %conn.peer(), error = %err, "socket write failed"),
    }
    // Remaining queue items are dropped with the receiver half of `rx`.
    conn.shutdown();
    conn.finalize();
}

async fn write_loop(
    write_half: &mut OwnedWriteHalf,
    rx: &mut mpsc::UnboundedReceiver<SendItem>,
    conn: &Arc<ConnInner>,
) -> std::io::Result<()> {
    let batch_bytes = conn.config.batch_bytes;
    let mut batch = BytesMut::with_capacity(batch_bytes);
    loop {
        let first = match rx.recv().await {
            Some(item) => item,
            None => return Ok(()),
        };

        batch.clear();
        let mut closing = false;
        match first {
            SendItem::Frame(frame) => frame.encode_into(&mut batch),
            SendItem::Close => closing = true,
        }

        // Coalesce whatever else is already queued, up to the batch cap.
        while !closing && batch.len() < batch_bytes {
            match rx.try_recv() {
                Ok(SendItem::Frame(frame)) => frame.encode_into(&mut batch),
                Ok(SendItem::Close) => closing = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            write_half.write_all(&batch).await?;
            conn.metrics.record_socket_write();
            conn.mark_written(batch.len());
        }
        if closing {
            return Ok(());
        }
    }
}
