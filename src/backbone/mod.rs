#[cfg(feature = "kafka")]
mod kafka;
mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{BackboneConfig, BackboneKind, GroupMode};

pub use memory::MemoryBackbone;

/// One claimed message, detached from the client library that produced it.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// Where the backbone stored a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),
    #[error("backbone rejected record: {0}")]
    Rejected(String),
}

/// Keyed append with full-replica acknowledgment.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, key: &str, value: &[u8]) -> Result<Delivery, SendError>;
}

/// A consumer-group membership. Records come back in partition order; a
/// record is only considered consumed once committed.
#[async_trait]
pub trait Subscription: Send {
    async fn next_record(&mut self) -> Option<Result<Record>>;
    async fn commit(&mut self, record: &Record) -> Result<()>;
}

pub struct Backbone {
    pub transport: Arc<dyn Transport>,
    pub subscription: Box<dyn Subscription>,
    pub group: String,
}

pub async fn connect(cfg: &BackboneConfig) -> Result<Backbone> {
    let group = resolve_group(cfg);
    match cfg.kind {
        BackboneKind::Memory => {
            let log = MemoryBackbone::new(&cfg.topic, cfg.partitions);
            let subscription = log.subscribe(&group).await;
            info!(
                "joined in-process backbone topic={} partitions={} group={}",
                cfg.topic, cfg.partitions, group
            );
            Ok(Backbone {
                transport: Arc::new(log),
                subscription: Box::new(subscription),
                group,
            })
        }
        BackboneKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let transport =
                    kafka::KafkaTransport::new(&cfg.brokers, &cfg.topic, cfg.send_timeout())?;
                let subscription =
                    kafka::KafkaSubscription::join(&cfg.brokers, &cfg.topic, &group)?;
                info!(
                    "joined kafka backbone brokers={} topic={} group={}",
                    cfg.brokers.join(","),
                    cfg.topic,
                    group
                );
                return Ok(Backbone {
                    transport: Arc::new(transport),
                    subscription: Box::new(subscription),
                    group,
                });
            }

            #[cfg(not(feature = "kafka"))]
            {
                anyhow::bail!(
                    "kafka backbone requested for topic {} but binary was built without \
                     `kafka` feature",
                    cfg.topic
                );
            }
        }
    }
}

pub fn resolve_group(cfg: &BackboneConfig) -> String {
    match cfg.group_mode {
        GroupMode::Shared => cfg.group.clone(),
        GroupMode::PerInstance => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", cfg.group, &suffix[..12])
        }
    }
}
