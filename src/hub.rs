use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, CloseReason, Enqueue};
use crate::dispatcher::DeliverySink;
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no recipient reachable")]
    NoRecipientReachable,
    #[error("delivery cancelled")]
    Cancelled,
    #[error("encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub identities: usize,
    pub connections: usize,
}

type Snapshot = SmallVec<[ClientHandle; 4]>;

/// Registry of live connections keyed by identity. The lock is only held
/// for map reads and writes; enqueueing works on a cloned snapshot.
#[derive(Default)]
pub struct Hub {
    clients: RwLock<HashMap<String, HashMap<u64, ClientHandle>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client: ClientHandle) {
        let user_id = client.user_id().to_owned();
        let id = client.id();
        let active = {
            let mut guard = self.clients.write().await;
            let sessions = guard.entry(user_id.clone()).or_default();
            sessions.insert(id, client);
            sessions.len()
        };
        info!("client {id} connected as {user_id} ({active} active for identity)");
    }

    /// Removes `client` if present. Returns whether anything was removed.
    pub async fn unregister(&self, client: &ClientHandle) -> bool {
        let user_id = client.user_id();
        let remaining = {
            let mut guard = self.clients.write().await;
            let Some(sessions) = guard.get_mut(user_id) else {
                return false;
            };
            if sessions.remove(&client.id()).is_none() {
                return false;
            }
            let remaining = sessions.len();
            if remaining == 0 {
                guard.remove(user_id);
            }
            remaining
        };
        info!(
            "client {} disconnected from {user_id} ({remaining} active for identity)",
            client.id()
        );
        true
    }

    pub async fn snapshot(&self, user_id: &str) -> Snapshot {
        let guard = self.clients.read().await;
        guard
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> HubStats {
        let guard = self.clients.read().await;
        HubStats {
            identities: guard.len(),
            connections: guard.values().map(HashMap::len).sum(),
        }
    }

    /// Enqueues `envelope` on every live connection of every recipient.
    /// Returns how many connections accepted it.
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        envelope: &Envelope,
    ) -> Result<usize, DeliveryError> {
        let frame: Arc<str> = Arc::from(envelope.to_frame_text()?);
        let mut seen = HashSet::with_capacity(envelope.recipients.len());
        let mut accepted = 0;

        for recipient in &envelope.recipients {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            if !seen.insert(recipient.as_str()) {
                continue;
            }
            for client in self.snapshot(recipient).await {
                match client.try_enqueue(frame.clone()) {
                    Enqueue::Accepted => accepted += 1,
                    Enqueue::Overflow => {
                        warn!(
                            "client {} for {recipient} overflowed its send buffer, closing",
                            client.id()
                        );
                        client.close(CloseReason::Overflow);
                        self.unregister(&client).await;
                    }
                    Enqueue::Closed => {
                        debug!("client {} for {recipient} already closing", client.id());
                        self.unregister(&client).await;
                    }
                }
            }
        }

        if accepted == 0 {
            return Err(DeliveryError::NoRecipientReachable);
        }
        Ok(accepted)
    }
}

#[async_trait]
impl DeliverySink for Hub {
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        envelope: &Envelope,
    ) -> Result<usize, DeliveryError> {
        Hub::deliver(self, cancel, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::value::RawValue;
    use tokio_util::sync::CancellationToken;

    use super::{DeliveryError, Hub};
    use crate::client::{ClientHandle, CloseReason};
    use crate::envelope::Envelope;

    fn envelope(recipients: &[&str]) -> Result<Envelope> {
        let recipients = recipients
            .iter()
            .map(|r| (*r).to_owned())
            .collect::<Vec<_>>();
        Ok(Envelope::new(
            "sender",
            &recipients,
            RawValue::from_string(r#"{"x":1}"#.to_owned())?,
        ))
    }

    #[tokio::test]
    async fn concurrent_register_unregister_leaves_exact_set() -> Result<()> {
        let hub = Arc::new(Hub::new());
        let mut handles = Vec::new();
        for i in 0..64 {
            let (handle, rx) = ClientHandle::new(&format!("user-{}", i % 5), 4);
            handles.push((handle, rx));
        }

        let mut tasks = Vec::new();
        for (handle, _) in &handles {
            let hub = hub.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { hub.register(handle).await }));
        }
        for task in tasks {
            task.await?;
        }

        let mut tasks = Vec::new();
        for (i, (handle, _)) in handles.iter().enumerate() {
            if i % 2 == 0 {
                let hub = hub.clone();
                let handle = handle.clone();
                tasks.push(tokio::spawn(async move { hub.unregister(&handle).await }));
            }
        }
        for task in tasks {
            assert!(task.await?);
        }

        let stats = hub.stats().await;
        assert_eq!(stats.connections, 32);
        for (i, (handle, _)) in handles.iter().enumerate() {
            let live = hub.snapshot(handle.user_id()).await;
            let present = live.iter().any(|c| c.id() == handle.id());
            assert_eq!(present, i % 2 == 1);
        }

        for (handle, _) in &handles {
            hub.unregister(handle).await;
        }
        assert_eq!(hub.stats().await.identities, 0);
        Ok(())
    }

    #[tokio::test]
    async fn double_unregister_is_a_noop() {
        let hub = Hub::new();
        let (handle, _rx) = ClientHandle::new("u1", 1);
        assert!(!hub.unregister(&handle).await);
        hub.register(handle.clone()).await;
        assert!(hub.unregister(&handle).await);
        assert!(!hub.unregister(&handle).await);
        assert_eq!(hub.stats().await.identities, 0);
    }

    #[tokio::test]
    async fn delivers_only_to_online_recipients() -> Result<()> {
        let hub = Hub::new();
        let (a, mut a_rx) = ClientHandle::new("A", 4);
        hub.register(a).await;

        let accepted = hub
            .deliver(&CancellationToken::new(), &envelope(&["A", "B", "A"])?)
            .await?;
        assert_eq!(accepted, 1);
        let frame = a_rx.try_recv()?;
        assert!(frame.contains(r#""payload":{"x":1}"#));
        assert!(a_rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn no_live_recipient_reports_failure() -> Result<()> {
        let hub = Hub::new();
        let err = hub
            .deliver(&CancellationToken::new(), &envelope(&["A", "B"])?)
            .await
            .err();
        assert!(matches!(err, Some(DeliveryError::NoRecipientReachable)));
        Ok(())
    }

    #[tokio::test]
    async fn every_connection_of_an_identity_receives_a_copy() -> Result<()> {
        let hub = Hub::new();
        let (first, mut first_rx) = ClientHandle::new("A", 4);
        let (second, mut second_rx) = ClientHandle::new("A", 4);
        hub.register(first).await;
        hub.register(second).await;

        let accepted = hub
            .deliver(&CancellationToken::new(), &envelope(&["A"])?)
            .await?;
        assert_eq!(accepted, 2);
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn overflow_closes_only_the_slow_client() -> Result<()> {
        let hub = Hub::new();
        let (slow, _slow_rx) = ClientHandle::new("slow", 1);
        let (fast, mut fast_rx) = ClientHandle::new("fast", 4);
        hub.register(slow.clone()).await;
        hub.register(fast.clone()).await;
        let cancel = CancellationToken::new();

        hub.deliver(&cancel, &envelope(&["slow"])?).await?;
        let accepted = hub.deliver(&cancel, &envelope(&["slow", "fast"])?).await?;
        assert_eq!(accepted, 1);

        assert_eq!(slow.close_reason(), Some(CloseReason::Overflow));
        assert!(hub.snapshot("slow").await.is_empty());
        assert_eq!(fast.close_reason(), None);
        assert_eq!(hub.snapshot("fast").await.len(), 1);
        assert!(fast_rx.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_delivery_enqueues_nothing() -> Result<()> {
        let hub = Hub::new();
        let (a, mut a_rx) = ClientHandle::new("A", 4);
        hub.register(a).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = hub.deliver(&cancel, &envelope(&["A"])?).await.err();
        assert!(matches!(err, Some(DeliveryError::Cancelled)));
        assert!(a_rx.try_recv().is_err());
        Ok(())
    }
}
