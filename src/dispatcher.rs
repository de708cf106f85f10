use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backbone::{Record, Subscription};
use crate::envelope::Envelope;
use crate::hub::DeliveryError;

/// Where decoded envelopes go. The Hub is the production sink.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        envelope: &Envelope,
    ) -> Result<usize, DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(usize),
    /// Undecodable record; committed so it is never seen again.
    Malformed,
    /// Left uncommitted for redelivery.
    Undelivered,
}

impl DispatchOutcome {
    pub fn commits(self) -> bool {
        !matches!(self, Self::Undelivered)
    }
}

/// Stateless consumer loop: decode, hand to the sink, commit on success.
pub struct Dispatcher {
    sink: Arc<dyn DeliverySink>,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn DeliverySink>, retry_backoff: Duration) -> Self {
        Self {
            sink,
            retry_backoff,
        }
    }

    pub async fn dispatch(&self, cancel: &CancellationToken, record: &Record) -> DispatchOutcome {
        let envelope = match Envelope::decode(&record.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    "skipping malformed record {}/{}@{} (key {}): {err}",
                    record.topic,
                    record.partition,
                    record.offset,
                    record.key.as_deref().unwrap_or("-")
                );
                return DispatchOutcome::Malformed;
            }
        };

        match self.sink.deliver(cancel, &envelope).await {
            Ok(accepted) => {
                debug!(
                    "delivered {} from {} to {accepted} connection(s)",
                    envelope.id, envelope.sender_id
                );
                DispatchOutcome::Delivered(accepted)
            }
            Err(err) => {
                debug!(
                    "leaving {} at {}/{}@{} for redelivery: {err}",
                    envelope.id, record.topic, record.partition, record.offset
                );
                DispatchOutcome::Undelivered
            }
        }
    }

    /// Consumes until `cancel` fires or the subscription ends. Cancellation
    /// is a normal exit.
    pub async fn run(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("dispatcher started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.next_record() => next,
            };
            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    warn!("backbone consume error: {err:#}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                    continue;
                }
                None => {
                    info!("backbone subscription ended");
                    break;
                }
            };

            let outcome = self.dispatch(&cancel, &record).await;
            if outcome.commits() {
                if let Err(err) = subscription.commit(&record).await {
                    warn!(
                        "commit {}/{}@{} failed: {err:#}",
                        record.topic, record.partition, record.offset
                    );
                }
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }
}
