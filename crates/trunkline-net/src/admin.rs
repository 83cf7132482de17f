//! Admin commands over a unix socket.
//!
//! Line protocol: one command per line, one reply line per command.
//! `reset` acknowledges and does nothing; `drop-all-connections` finalizes
//! every open connection but keeps the listeners; `stats` emits one line
//! of JSON with the listener's metrics snapshot.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::listener::Listener;

/// Admin socket serving a node's operator commands.
pub struct AdminSocket {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl AdminSocket {
    /// Binds the socket at `path` (replacing a stale one) and serves
    /// commands against `listener`.
    pub fn bind(path: impl AsRef<Path>, listener: Listener) -> Result<AdminSocket> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let socket = UnixListener::bind(&path)?;
        info!(path = %path.display(), "admin socket bound");

        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match socket.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "admin accept failed");
                        continue;
                    }
                };
                let listener = listener.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = match line.trim() {
                            "reset" => "OK\n".to_string(),
                            "drop-all-connections" => {
                                listener.drop_all_connections();
                                "OK\n".to_string()
                            }
                            "stats" => {
                                let snapshot = listener.metrics().snapshot();
                                match serde_json::to_string(&snapshot) {
                                    Ok(json) => format!("{json}\n"),
                                    Err(_) => "ERR stats unavailable\n".to_string(),
                                }
                            }
                            other => {
                                debug!(command = other, "unknown admin command");
                                "ERR unknown command\n".to_string()
                            }
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Ok(AdminSocket { path, task })
    }

    /// Path the socket is bound at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdminSocket {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}
