//! User-visible notifications.
//!
//! A closed tagged union: the variant names the category, the payload
//! carries only the fields that case needs. There is no default state.
//! Notifications are delivered on the runtime's tasks; a receiver that went
//! away is logged and never breaks the event loop.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::debug;
use trunkline_proto::InitialStatus;

use crate::roc::RequestId;

/// Aggregated terminal state of a request across its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Every node succeeded.
    Succeeded,
    /// At least one success and at least one failure.
    PartialSuccess,
    /// No node succeeded.
    Failed,
}

/// Framework-level notification delivered to the user channel.
#[derive(Debug)]
pub enum RequestNotification {
    /// The request finished on all its nodes; delivered exactly once per
    /// request.
    Finished {
        id: RequestId,
        outcome: RequestOutcome,
    },
    /// A node answered the opening frame with a not-supported status. The
    /// connection stays healthy.
    Unsupported {
        id: RequestId,
        addr: SocketAddr,
        status: InitialStatus,
    },
    /// A node reported a request-level error.
    NodeError {
        id: RequestId,
        addr: SocketAddr,
        message: String,
    },
    /// A connection attempt to a node failed.
    ConnectionError { addr: SocketAddr, message: String },
}

/// Sending side of the user notification channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<RequestNotification>,
}

impl Notifier {
    /// Creates a notifier and the receiver the user drains.
    pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<RequestNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier { tx }, rx)
    }

    /// Delivers a notification. A dropped receiver is logged, not an error.
    pub fn notify(&self, notification: RequestNotification) {
        if self.tx.send(notification).is_err() {
            debug!("notification receiver dropped, discarding notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.notify(RequestNotification::Finished {
            id: 7,
            outcome: RequestOutcome::Succeeded,
        });
        match rx.recv().await.unwrap() {
            RequestNotification::Finished { id, outcome } => {
                assert_eq!(id, 7);
                assert_eq!(outcome, RequestOutcome::Succeeded);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.notify(RequestNotification::ConnectionError {
            addr: "127.0.0.1:9".parse().unwrap(),
            message: "refused".into(),
        });
    }
}
