//! Runtime behavior tests: demultiplexing, id isolation, protocol errors.
//!
//! Client-side behavior is exercised against a scripted node speaking the
//! raw wire protocol; end-to-end request flow runs against a real listener
//! and registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use trunkline_net::{
    ClientConfig, ClientCredentials, ClientRoc, Connection, ConnectionConfig, ConnectionSet,
    ConnectionState, Listener, ListenerConfig, NetMetrics, NodeCredentials, RequestDescriptor,
    RequestNotification, RequestOutcome, RequestRegistry, RequestType, ServerRequest,
};
use trunkline_proto::{Frame, FrameHeader, FrameType, PayloadWriter, HEADER_LEN};

const KEY: &[u8] = &[7u8; 16];

fn client_creds() -> ClientCredentials {
    ClientCredentials::new("tester", KEY.to_vec())
}

fn node_creds() -> Arc<NodeCredentials> {
    let mut creds = NodeCredentials::new();
    creds.add("tester", KEY.to_vec());
    Arc::new(creds)
}

/// Runs the node side of the handshake on a raw socket, accepting whatever
/// proof the client presents.
async fn scripted_handshake(stream: &mut TcpStream) {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await.unwrap();
    stream.write_all(&version).await.unwrap();

    // Timestamp frame in, nonce frame out.
    read_frame_raw(stream).await;
    write_frame_raw(stream, FrameType::Authentication, &[9u8; 8]).await;
    // Name + mac frame in, accept verdict out.
    read_frame_raw(stream).await;
    write_frame_raw(stream, FrameType::Authentication, &[0u8]).await;
}

async fn read_frame_raw(stream: &mut TcpStream) -> (FrameType, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let header = FrameHeader::decode(&header).unwrap();
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (header.frame_type, payload)
}

async fn write_frame_raw(stream: &mut TcpStream, frame_type: FrameType, payload: &[u8]) {
    let frame = Frame::new(frame_type, Bytes::copy_from_slice(payload)).unwrap();
    stream.write_all(&frame.encode()).await.unwrap();
}

fn request_frame(id: u64, body: &[u8]) -> Bytes {
    Frame::request(id, body).unwrap().encode()
}

#[tokio::test]
async fn test_version_mismatch_exchanges_nothing_further() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let node = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut version = [0u8; 1];
        stream.read_exact(&mut version).await.unwrap();
        stream.write_all(&[version[0] + 1]).await.unwrap();
        // The client must close without sending anything else.
        let mut rest = Vec::new();
        let read = stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(read, 0);
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let result = Connection::establish_client(
        stream,
        &client_creds(),
        ConnectionConfig::default(),
        Arc::new(NetMetrics::new()),
    )
    .await;
    assert!(result.is_err());
    node.await.unwrap();
}

#[tokio::test]
async fn test_authentication_frame_after_establish_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let node = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        scripted_handshake(&mut stream).await;
        write_frame_raw(&mut stream, FrameType::Authentication, b"late").await;
        stream
    });

    let metrics = Arc::new(NetMetrics::new());
    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = Connection::establish_client(
        stream,
        &client_creds(),
        ConnectionConfig::default(),
        Arc::clone(&metrics),
    )
    .await
    .unwrap();
    assert_eq!(conn.state(), ConnectionState::Established);

    conn.closed().await;
    assert_eq!(metrics.snapshot().protocol_errors, 1);
    node.await.unwrap();
}

#[tokio::test]
async fn test_unknown_request_id_is_silently_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    // Scripted node: read the opening frame, then reply twice: once under a
    // bogus id, once under the real one.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        scripted_handshake(&mut stream).await;

        let (_, opening) = read_frame_raw(&mut stream).await;
        let id = u64::from_le_bytes(opening[..8].try_into().unwrap());

        let mut bogus = BytesMut::new();
        bogus.extend_from_slice(&request_frame(id + 999, b"ghost"));
        bogus.extend_from_slice(&request_frame(id, b"real"));
        stream.write_all(&bogus).await.unwrap();

        // Keep the socket open until the client is done.
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink).await;
    });

    let mut config = ClientConfig::new(client_creds());
    config.backoff.initial = Duration::from_millis(20);
    let (conns, _notifications) = ConnectionSet::new(config);
    conns.add_node(addr);
    conns.wait_established(1).await;

    let (body_tx, mut body_rx) = mpsc::unbounded_channel::<Bytes>();
    let descriptor = RequestDescriptor::new(42, 1, RequestType::SingleNode);
    let handler: trunkline_net::ClientHandler = Arc::new(move |roc: ClientRoc| {
        let body_tx = body_tx.clone();
        Box::pin(async move {
            let body = roc.dispatcher.recv().await?;
            let _ = body_tx.send(body);
            Ok(())
        })
    });
    conns.assign(descriptor, Bytes::new(), handler).unwrap();

    // The ghost frame must never surface; the real frame arrives intact
    // and in order.
    let body = tokio::time::timeout(Duration::from_secs(5), body_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&body[..], b"real");
    assert_eq!(conns.metrics().snapshot().frames_dropped, 1);

    conns.shutdown();
}

/// Registry with one command: stream `count` numbered frames, no status
/// semantics beyond Supported.
fn counting_registry() -> Arc<RequestRegistry> {
    let mut registry = RequestRegistry::new();
    registry.register(
        42,
        1,
        Default::default(),
        Arc::new(|req: ServerRequest| {
            Box::pin(async move {
                let mut reader = trunkline_proto::PayloadReader::new(req.args);
                let count = reader.take_u32()?;
                for seq in 0..count {
                    req.dispatcher
                        .send(|w| {
                            w.put_u32(seq);
                        })
                        .await?;
                }
                Ok(())
            })
        }),
    );
    Arc::new(registry)
}

#[tokio::test]
async fn test_concurrent_requests_demultiplex_in_order() {
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        counting_registry(),
        ListenerConfig::default(),
    )
    .await
    .unwrap();

    let (conns, mut notifications) = ConnectionSet::new(ClientConfig::new(client_creds()));
    conns.add_node(listener.local_addr());
    conns.wait_established(1).await;

    const REQUESTS: usize = 8;
    const FRAMES: u32 = 50;

    let (seq_tx, mut seq_rx) = mpsc::unbounded_channel::<(u64, Vec<u32>)>();
    for _ in 0..REQUESTS {
        let seq_tx = seq_tx.clone();
        let descriptor = RequestDescriptor::new(42, 1, RequestType::SingleNode);
        let handler: trunkline_net::ClientHandler = Arc::new(move |roc: ClientRoc| {
            let seq_tx = seq_tx.clone();
            Box::pin(async move {
                roc.dispatcher.recv_initial_status().await?;
                let mut seen = Vec::with_capacity(FRAMES as usize);
                for _ in 0..FRAMES {
                    seen.push(roc.dispatcher.recv_value::<u32>().await?);
                }
                let _ = seq_tx.send((roc.dispatcher.request_id(), seen));
                Ok(())
            })
        });
        let args = {
            let mut writer = PayloadWriter::with_capacity(4);
            writer.put_u32(FRAMES);
            writer.into_bytes()
        };
        conns.assign(descriptor, args, handler).unwrap();
    }
    drop(seq_tx);

    // Every request observes exactly its own frames, in send order.
    let mut finished = 0;
    while let Some((_, seen)) = seq_rx.recv().await {
        let expected: Vec<u32> = (0..FRAMES).collect();
        assert_eq!(seen, expected);
        finished += 1;
    }
    assert_eq!(finished, REQUESTS);

    // And every request reports exactly one Finished notification.
    let mut notified = 0;
    while notified < REQUESTS {
        match notifications.recv().await.unwrap() {
            RequestNotification::Finished { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::Succeeded);
                notified += 1;
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    conns.shutdown();
    listener.shutdown();
}

#[tokio::test]
async fn test_unsupported_command_leaves_connection_healthy() {
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        counting_registry(),
        ListenerConfig::default(),
    )
    .await
    .unwrap();

    let (conns, mut notifications) = ConnectionSet::new(ClientConfig::new(client_creds()));
    conns.add_node(listener.local_addr());
    conns.wait_established(1).await;

    let unknown = RequestDescriptor::new(99, 1, RequestType::SingleNode);
    let handler: trunkline_net::ClientHandler = Arc::new(|roc: ClientRoc| {
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            Ok(())
        })
    });
    conns.assign(unknown, Bytes::new(), handler).unwrap();

    let mut saw_unsupported = false;
    let mut saw_failed = false;
    while !(saw_unsupported && saw_failed) {
        match notifications.recv().await.unwrap() {
            RequestNotification::Unsupported { status, .. } => {
                assert_eq!(
                    status,
                    trunkline_proto::InitialStatus::RequestNotSupported
                );
                saw_unsupported = true;
            }
            RequestNotification::Finished { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::Failed);
                saw_failed = true;
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    // The connection survived the rejection.
    assert_eq!(conns.established_count(), 1);

    conns.shutdown();
    listener.shutdown();
}

/// Registry with a handler split into sub-fibers: an echo fiber answers
/// message type 1; a watcher announces itself with type 4, parks on a
/// signal, and says farewell with type 3; a trigger fiber raises that
/// signal when the client sends type 5; a fourth fiber never wakes up and
/// is aborted during teardown.
fn fibered_registry() -> Arc<RequestRegistry> {
    use trunkline_net::EventDispatcher;

    let mut registry = RequestRegistry::new();
    registry.register(
        43,
        1,
        Default::default(),
        Arc::new(|req: ServerRequest| {
            Box::pin(async move {
                let acquire = req.dispatcher.buffer_acquire();
                let events = EventDispatcher::new(req.dispatcher, acquire);

                let echo = events.spawn_fiber("echo", |ctx| async move {
                    let (_, body) = ctx.recv_msg(&[1]).await?;
                    let mut scratch = ctx.acquire_buffer();
                    scratch.extend_from_slice(&body);
                    ctx.send(|w| {
                        w.put_u8(2);
                        w.put_raw(&scratch);
                    })
                    .await?;
                    Ok(())
                });
                // The watcher is parked on the signal before the client can
                // have seen its type-4 announcement.
                let watcher = events.spawn_fiber("watcher", |ctx| async move {
                    ctx.send(|w| w.put_u8(4)).await?;
                    ctx.wait_signal(&[9]).await?;
                    ctx.send(|w| w.put_u8(3)).await?;
                    Ok(())
                });
                let trigger = events.spawn_fiber("trigger", |ctx| async move {
                    let (_, _) = ctx.recv_msg(&[5]).await?;
                    ctx.raise_signal(9);
                    Ok(())
                });
                let stuck = events.spawn_fiber("stuck", |ctx| async move {
                    ctx.wait_signal(&[42]).await?;
                    Ok(())
                });

                events.join_fiber(echo).await?;
                events.join_fiber(trigger).await?;
                events.join_fiber(watcher).await?;
                events.abort_fiber(stuck);
                match events.join_fiber(stuck).await {
                    Ok(()) | Err(trunkline_net::NetError::Aborted) => Ok(()),
                    Err(err) => Err(err),
                }
            })
        }),
    );
    Arc::new(registry)
}

#[tokio::test]
async fn test_sub_fibers_route_messages_and_signals() {
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        fibered_registry(),
        ListenerConfig::default(),
    )
    .await
    .unwrap();

    let (conns, mut notifications) = ConnectionSet::new(ClientConfig::new(client_creds()));
    conns.add_node(listener.local_addr());
    conns.wait_established(1).await;

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
    let descriptor = RequestDescriptor::new(43, 1, RequestType::SingleNode);
    let handler: trunkline_net::ClientHandler = Arc::new(move |roc: ClientRoc| {
        let reply_tx = reply_tx.clone();
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            roc.dispatcher
                .send(|w| {
                    w.put_u8(1);
                    w.put_raw(b"marco");
                })
                .await?;

            // The echo answer and the watcher's announcement arrive in
            // either order.
            let mut seen_echo = false;
            let mut seen_watcher = false;
            while !(seen_echo && seen_watcher) {
                let (msg_type, body) = roc.dispatcher.recv_one_of(&[2, 4]).await?;
                if msg_type == 2 {
                    let _ = reply_tx.send(body);
                    seen_echo = true;
                } else {
                    seen_watcher = true;
                }
            }

            // Poke the trigger fiber; the watcher's farewell proves the
            // signal crossed fibers.
            roc.dispatcher.send(|w| w.put_u8(5)).await?;
            let (_, _) = roc.dispatcher.recv_one_of(&[3]).await?;
            Ok(())
        })
    });
    conns.assign(descriptor, Bytes::new(), handler).unwrap();

    let echoed = reply_rx.recv().await.unwrap();
    assert_eq!(&echoed[..], b"marco");

    match notifications.recv().await.unwrap() {
        RequestNotification::Finished { outcome, .. } => {
            assert_eq!(outcome, RequestOutcome::Succeeded)
        }
        other => panic!("unexpected notification {other:?}"),
    }

    conns.shutdown();
    listener.shutdown();
}

#[tokio::test]
async fn test_round_robin_advances_past_rejecting_node() {
    // First node knows no commands at all, second one does. A RoundRobin
    // request picks the rejecting node first, fails with Unsupported, and
    // advances to the good one.
    let empty = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        Arc::new(RequestRegistry::new()),
        ListenerConfig::default(),
    )
    .await
    .unwrap();
    let good = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        counting_registry(),
        ListenerConfig::default(),
    )
    .await
    .unwrap();

    let (conns, mut notifications) = ConnectionSet::new(ClientConfig::new(client_creds()));
    conns.add_node(empty.local_addr());
    conns.add_node(good.local_addr());
    conns.wait_established(2).await;

    let descriptor = RequestDescriptor::new(42, 1, RequestType::RoundRobin);
    let handler: trunkline_net::ClientHandler = Arc::new(|roc: ClientRoc| {
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            Ok(())
        })
    });
    let args = {
        let mut writer = PayloadWriter::with_capacity(4);
        writer.put_u32(0);
        writer.into_bytes()
    };
    conns.assign(descriptor, args, handler).unwrap();

    let mut saw_unsupported = false;
    loop {
        match notifications.recv().await.unwrap() {
            RequestNotification::Unsupported { .. } => saw_unsupported = true,
            RequestNotification::Finished { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::Succeeded);
                break;
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }
    assert!(saw_unsupported, "the rejecting node was never tried");

    conns.shutdown();
    empty.shutdown();
    good.shutdown();
}

/// Full client handshake on a raw socket, computing the real HMAC proof.
async fn raw_client_handshake(stream: &mut TcpStream, name: &str, key: &[u8]) {
    use hmac::{Hmac, Mac};

    stream.write_all(&[1u8]).await.unwrap();
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(version[0], 1);

    let timestamp: u64 = 1_700_000_000;
    write_frame_raw(stream, FrameType::Authentication, &timestamp.to_le_bytes()).await;
    let (_, nonce) = read_frame_raw(stream).await;
    assert_eq!(nonce.len(), 8);

    let mut mac = Hmac::<sha1::Sha1>::new_from_slice(key).unwrap();
    mac.update(&timestamp.to_le_bytes());
    mac.update(&nonce);
    let proof = mac.finalize().into_bytes();

    let mut payload = Vec::new();
    payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(&proof);
    write_frame_raw(stream, FrameType::Authentication, &payload).await;

    let (_, verdict) = read_frame_raw(stream).await;
    assert_eq!(verdict, vec![0u8]);
}

#[tokio::test]
async fn test_late_frame_for_drained_request_is_not_a_new_request() {
    // A node-side request ends; a frame for its id racing in afterwards
    // must be dropped, not dispatched as a fresh request.
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        node_creds(),
        counting_registry(),
        ListenerConfig::default(),
    )
    .await
    .unwrap();

    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    raw_client_handshake(&mut stream, "tester", KEY).await;

    // Open request 5: command 42, version 1, one counted frame.
    let mut opening = vec![42u8, 1u8];
    opening.extend_from_slice(&1u32.to_le_bytes());
    stream.write_all(&request_frame(5, &opening)).await.unwrap();

    // Supported status, then the single data frame.
    let (_, status) = read_frame_raw(&mut stream).await;
    assert_eq!(status[8], 1);
    let (_, data) = read_frame_raw(&mut stream).await;
    assert_eq!(&data[8..], &0u32.to_le_bytes());

    // Give the node time to retire the request, then race a late frame in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.write_all(&request_frame(5, b"late")).await.unwrap();

    // Open request 6; the first frame we see next must answer id 6. A
    // node that mistook the late frame for a new request would have
    // replied to id 5 first.
    let mut opening = vec![42u8, 1u8];
    opening.extend_from_slice(&0u32.to_le_bytes());
    stream.write_all(&request_frame(6, &opening)).await.unwrap();
    let (_, status) = read_frame_raw(&mut stream).await;
    let id = u64::from_le_bytes(status[..8].try_into().unwrap());
    assert_eq!(id, 6);
    assert_eq!(status[8], 1);

    listener.shutdown();
}
