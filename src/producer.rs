use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backbone::{Delivery, SendError, Transport};
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish cancelled")]
    Cancelled,
    #[error("backbone rejected envelope: {0}")]
    Rejected(String),
    #[error("publish failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        envelope: &Envelope,
    ) -> Result<Delivery, PublishError>;
}

/// Sends envelopes keyed by sender so one sender's submissions stay ordered.
/// Holds at most one send in flight per call.
pub struct Producer {
    transport: Arc<dyn Transport>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Producer {
    pub fn new(transport: Arc<dyn Transport>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            transport,
            max_retries,
            retry_backoff,
        }
    }
}

#[async_trait]
impl Publisher for Producer {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        envelope: &Envelope,
    ) -> Result<Delivery, PublishError> {
        let value = envelope.encode()?;
        let attempts = self.max_retries.saturating_add(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            match self.transport.send(&envelope.sender_id, &value).await {
                Ok(delivery) => {
                    debug!(
                        "published {} from {} to partition {} offset {}",
                        envelope.id, envelope.sender_id, delivery.partition, delivery.offset
                    );
                    return Ok(delivery);
                }
                Err(SendError::Rejected(reason)) => return Err(PublishError::Rejected(reason)),
                Err(SendError::Transient(reason)) => {
                    warn!(
                        "publish attempt {attempt}/{attempts} for {} failed: {reason}",
                        envelope.id
                    );
                    last = reason;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
            }
        }

        Err(PublishError::Exhausted { attempts, last })
    }
}
