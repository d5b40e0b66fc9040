//! Reply routing
//!
//! Replies arrive on a node's pull address in any order. The deliverator
//! matches each one to the caller waiting on its message id.

use crate::message::Message;
use cumulus_core::error::{CumulusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Routes replies to the requests that are waiting for them
#[derive(Clone, Default)]
pub struct Deliverator {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>,
}

impl Deliverator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `message_id`
    ///
    /// The slot is released when the returned handle is dropped.
    pub fn add_request(&self, message_id: Uuid) -> PendingDelivery {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(message_id, tx).is_some() {
            warn!(%message_id, "Replacing an existing delivery slot");
        }
        PendingDelivery {
            message_id,
            receiver: rx,
            pending: self.pending.clone(),
        }
    }

    /// Hand a reply to its waiter; returns false if nobody was waiting
    pub fn deliver_reply(&self, reply: Message) -> bool {
        let slot = self.pending.lock().remove(&reply.message_id);
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(
                    message_id = %reply.message_id,
                    message_type = reply.kind.name(),
                    "Discarding reply nobody is waiting for"
                );
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A registered wait for one reply
pub struct PendingDelivery {
    message_id: Uuid,
    receiver: oneshot::Receiver<Message>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>,
}

impl PendingDelivery {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Wait up to `timeout` for the reply
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CumulusError::Halted),
            Err(_) => Err(CumulusError::Timeout {
                what: format!("reply to {}", self.message_id),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingDelivery {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.message_id);
    }
}

/// Feed replies from a pull listener into the deliverator until halted
pub fn spawn_reply_listener(
    mut replies: mpsc::Receiver<Message>,
    deliverator: Deliverator,
    halt: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = halt.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(reply) => {
                        deliverator.deliver_reply(reply);
                    }
                    None => break,
                },
            }
        }
        debug!("Reply listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, ResultReply};

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let deliverator = Deliverator::new();
        let first = Message::new(MessageKind::Ping, vec![]);
        let second = Message::new(MessageKind::Ping, vec![]);
        let wait_first = deliverator.add_request(first.message_id);
        let wait_second = deliverator.add_request(second.message_id);

        let reply = MessageKind::ArchiveKeyReply(ResultReply::success());
        assert!(deliverator.deliver_reply(second.reply(reply.clone(), vec![])));
        assert!(deliverator.deliver_reply(first.reply(reply, vec![])));

        let got = wait_second.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.message_id, second.message_id);
        let got = wait_first.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.message_id, first.message_id);
        assert_eq!(deliverator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded() {
        let deliverator = Deliverator::new();
        let stray = Message::new(MessageKind::Ping, vec![]);
        assert!(!deliverator.deliver_reply(stray));
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let deliverator = Deliverator::new();
        let wait = deliverator.add_request(Uuid::new_v4());
        assert_eq!(deliverator.pending_count(), 1);

        let err = wait.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CumulusError::Timeout { .. }));
        assert_eq!(deliverator.pending_count(), 0);
    }
}
