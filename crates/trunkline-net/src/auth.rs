//! Connection handshake and authentication.
//!
//! Both sides first exchange one raw protocol-version byte. The rest of the
//! handshake travels in `Authentication`-typed frames:
//! client timestamp (8 bytes) → node nonce (8 bytes) → client name
//! (u16_le length prefix) plus 20-byte HMAC-SHA1 over timestamp‖nonce →
//! node verdict byte (0 = accepted). After a non-zero verdict the
//! connection is closed.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use trunkline_proto::{Frame, FrameHeader, FrameType, PayloadReader, PayloadWriter, HEADER_LEN};

use crate::credentials::{ClientCredentials, NodeCredentials};
use crate::error::{NetError, Result};

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA1 output length.
pub const MAC_LEN: usize = 20;

/// Ceiling on handshake frame payloads; anything larger is hostile.
const MAX_AUTH_PAYLOAD: u32 = 1024;

const VERDICT_ACCEPT: u8 = 0;
const VERDICT_REJECT: u8 = 1;

fn compute_mac(key: &[u8], timestamp: u64, nonce: &[u8; 8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| NetError::Protocol {
        reason: "empty authentication key".into(),
    })?;
    mac.update(&timestamp.to_le_bytes());
    mac.update(nonce);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn verify_mac(key: &[u8], timestamp: u64, nonce: &[u8; 8], presented: &[u8]) -> bool {
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(&timestamp.to_le_bytes());
    mac.update(nonce);
    mac.verify_slice(presented).is_ok()
}

async fn write_auth_frame(stream: &mut TcpStream, payload: Bytes) -> Result<()> {
    let frame = Frame::authentication(payload)?;
    stream.write_all(&frame.encode()).await?;
    Ok(())
}

async fn read_auth_frame(stream: &mut TcpStream) -> Result<Bytes> {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    let header = FrameHeader::decode(&raw)?;
    if header.frame_type != FrameType::Authentication {
        return Err(NetError::Protocol {
            reason: format!("expected authentication frame, got {:?}", header.frame_type),
        });
    }
    if header.length > MAX_AUTH_PAYLOAD {
        return Err(NetError::Protocol {
            reason: format!("authentication frame of {} bytes", header.length),
        });
    }
    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Exchanges protocol version bytes; a mismatch closes the connection with
/// no further I/O.
pub(crate) async fn exchange_version(stream: &mut TcpStream, ours: u8) -> Result<()> {
    stream.write_all(&[ours]).await?;
    let mut theirs = [0u8; 1];
    stream.read_exact(&mut theirs).await?;
    if theirs[0] != ours {
        return Err(NetError::VersionMismatch {
            ours,
            theirs: theirs[0],
        });
    }
    Ok(())
}

/// Runs the client side of the authentication exchange, after the version
/// bytes are through.
pub(crate) async fn client_authenticate(
    stream: &mut TcpStream,
    creds: &ClientCredentials,
    addr: SocketAddr,
) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut writer = PayloadWriter::with_capacity(8);
    writer.put_u64(timestamp);
    write_auth_frame(stream, writer.into_bytes()).await?;

    let nonce_payload = read_auth_frame(stream).await?;
    let mut reader = PayloadReader::new(nonce_payload);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&reader.take_exact(8)?);
    reader.expect_end()?;
    let mac = compute_mac(&creds.key, timestamp, &nonce)?;

    let mut writer = PayloadWriter::with_capacity(2 + creds.name.len() + MAC_LEN);
    writer.put_u16(creds.name.len() as u16);
    writer.put_raw(creds.name.as_bytes());
    writer.put_raw(&mac);
    write_auth_frame(stream, writer.into_bytes()).await?;

    let verdict = read_auth_frame(stream).await?;
    if verdict.len() != 1 {
        return Err(NetError::Protocol {
            reason: "malformed authentication verdict".into(),
        });
    }
    if verdict[0] != VERDICT_ACCEPT {
        return Err(NetError::AuthRejected { addr });
    }
    debug!(node = %addr, name = %creds.name, "authenticated");
    Ok(())
}

/// Runs the node side of the authentication exchange; returns the
/// authenticated client name.
pub(crate) async fn server_authenticate(
    stream: &mut TcpStream,
    creds: &NodeCredentials,
    peer: SocketAddr,
) -> Result<String> {
    let ts_payload = read_auth_frame(stream).await?;
    let mut reader = PayloadReader::new(ts_payload);
    let timestamp = reader.take_u64()?;
    reader.expect_end()?;

    let nonce: [u8; 8] = rand::random();
    let mut writer = PayloadWriter::with_capacity(8);
    writer.put_raw(&nonce);
    write_auth_frame(stream, writer.into_bytes()).await?;

    let proof = read_auth_frame(stream).await?;
    let mut reader = PayloadReader::new(proof);
    let name_len = reader.take_u16()? as usize;
    let name_raw = reader.take_exact(name_len)?;
    let name = String::from_utf8(name_raw.to_vec()).map_err(|_| NetError::Protocol {
        reason: "client name is not valid UTF-8".into(),
    })?;
    let presented = reader.take_exact(MAC_LEN)?;
    reader.expect_end()?;

    let accepted = match creds.key_for(&name) {
        Some(key) => verify_mac(key, timestamp, &nonce, &presented),
        None => false,
    };

    let verdict = if accepted { VERDICT_ACCEPT } else { VERDICT_REJECT };
    let mut writer = PayloadWriter::with_capacity(1);
    writer.put_u8(verdict);
    write_auth_frame(stream, writer.into_bytes()).await?;

    if !accepted {
        warn!(peer = %peer, name = %name, "authentication failed");
        if creds.key_for(&name).is_none() {
            return Err(NetError::UnknownClient { name });
        }
        return Err(NetError::AuthRejected { addr: peer });
    }
    info!(peer = %peer, name = %name, "client authenticated");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ClientCredentials, NodeCredentials};

    fn pair() -> (ClientCredentials, NodeCredentials) {
        let client = ClientCredentials::new("alice", vec![7u8; 16]);
        let mut store = NodeCredentials::new();
        store.add("alice", vec![7u8; 16]);
        (client, store)
    }

    async fn run_handshake(
        client: ClientCredentials,
        store: NodeCredentials,
        client_version: u8,
        server_version: u8,
    ) -> (Result<()>, Result<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, peer) = listener.accept().await.unwrap();
            exchange_version(&mut stream, server_version).await?;
            server_authenticate(&mut stream, &store, peer).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let client_result = async {
            exchange_version(&mut stream, client_version).await?;
            client_authenticate(&mut stream, &client, addr).await
        }
        .await;
        let server_result = server.await.unwrap();
        (client_result, server_result)
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (client, store) = pair();
        let (client_result, server_result) = run_handshake(client, store, 1, 1).await;
        client_result.unwrap();
        assert_eq!(server_result.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_version_mismatch_stops_handshake() {
        let (client, store) = pair();
        let (client_result, server_result) = run_handshake(client, store, 1, 2).await;
        assert!(matches!(
            client_result,
            Err(NetError::VersionMismatch { ours: 1, theirs: 2 })
        ));
        assert!(server_result.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let client = ClientCredentials::new("alice", vec![1u8; 16]);
        let mut store = NodeCredentials::new();
        store.add("alice", vec![2u8; 16]);
        let (client_result, server_result) = run_handshake(client, store, 1, 1).await;
        assert!(matches!(client_result, Err(NetError::AuthRejected { .. })));
        assert!(matches!(server_result, Err(NetError::AuthRejected { .. })));
    }

    #[tokio::test]
    async fn test_unknown_name_rejected() {
        let client = ClientCredentials::new("mallory", vec![1u8; 16]);
        let store = {
            let mut store = NodeCredentials::new();
            store.add("alice", vec![1u8; 16]);
            store
        };
        let (client_result, server_result) = run_handshake(client, store, 1, 1).await;
        assert!(matches!(client_result, Err(NetError::AuthRejected { .. })));
        assert!(matches!(
            server_result,
            Err(NetError::UnknownClient { name }) if name == "mallory"
        ));
    }

    #[test]
    fn test_mac_depends_on_nonce() {
        // A captured proof is useless against a fresh nonce.
        let key = [9u8; 16];
        let mac_one = compute_mac(&key, 1000, &[1u8; 8]).unwrap();
        assert!(verify_mac(&key, 1000, &[1u8; 8], &mac_one));
        assert!(!verify_mac(&key, 1000, &[2u8; 8], &mac_one));
    }

    #[test]
    fn test_mac_depends_on_timestamp_and_key() {
        let mac = compute_mac(&[9u8; 16], 1000, &[1u8; 8]).unwrap();
        assert!(!verify_mac(&[9u8; 16], 1001, &[1u8; 8], &mac));
        assert!(!verify_mac(&[8u8; 16], 1000, &[1u8; 8], &mac));
    }
}
