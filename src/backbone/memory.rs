use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{Delivery, Record, SendError, Subscription, Transport};

/// Process-local partitioned log with per-group committed offsets.
#[derive(Clone)]
pub struct MemoryBackbone {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    log: Mutex<Log>,
    appended: Notify,
}

struct Log {
    partitions: Vec<Partition>,
    committed: HashMap<String, Vec<i64>>,
}

/// Records below every group's committed offset are released, so `base`
/// keeps offsets absolute across compaction.
#[derive(Default)]
struct Partition {
    base: i64,
    records: VecDeque<StoredRecord>,
}

impl Partition {
    fn next_offset(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        let index = usize::try_from(offset - self.base).ok()?;
        self.records.get(index)
    }
}

impl Log {
    fn starting_positions(&self) -> Vec<i64> {
        self.partitions.iter().map(|p| p.base).collect()
    }

    fn compact(&mut self, partition: usize) {
        let Some(low) = self
            .committed
            .values()
            .filter_map(|offsets| offsets.get(partition).copied())
            .min()
        else {
            return;
        };
        let Some(part) = self.partitions.get_mut(partition) else {
            return;
        };
        while part.base < low && part.records.pop_front().is_some() {
            part.base += 1;
        }
    }
}

struct StoredRecord {
    key: Option<String>,
    value: Vec<u8>,
}

pub struct MemorySubscription {
    inner: Arc<Inner>,
    group: String,
    positions: Vec<i64>,
    cursor: usize,
}

impl MemoryBackbone {
    pub fn new(topic: &str, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            inner: Arc::new(Inner {
                topic: topic.to_owned(),
                log: Mutex::new(Log {
                    partitions: (0..partitions).map(|_| Partition::default()).collect(),
                    committed: HashMap::new(),
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// Joins `group`, resuming from its committed offsets. A new group
    /// starts at the oldest retained record.
    pub async fn subscribe(&self, group: &str) -> MemorySubscription {
        let mut log = self.inner.log.lock().await;
        let start = log.starting_positions();
        let positions = log
            .committed
            .entry(group.to_owned())
            .or_insert(start)
            .clone();
        MemorySubscription {
            inner: self.inner.clone(),
            group: group.to_owned(),
            positions,
            cursor: 0,
        }
    }

    #[cfg(test)]
    pub async fn committed(&self, group: &str, partition: i32) -> i64 {
        let log = self.inner.log.lock().await;
        log.committed
            .get(group)
            .and_then(|offsets| offsets.get(partition as usize).copied())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub async fn retained(&self, partition: usize) -> usize {
        let log = self.inner.log.lock().await;
        log.partitions
            .get(partition)
            .map_or(0, |p| p.records.len())
    }
}

#[async_trait]
impl Transport for MemoryBackbone {
    async fn send(&self, key: &str, value: &[u8]) -> Result<Delivery, SendError> {
        let delivery = {
            let mut log = self.inner.log.lock().await;
            let partition = partition_for(key, log.partitions.len());
            let part = &mut log.partitions[partition];
            let offset = part.next_offset();
            part.records.push_back(StoredRecord {
                key: Some(key.to_owned()),
                value: value.to_vec(),
            });
            Delivery {
                partition: partition as i32,
                offset,
            }
        };
        self.inner.appended.notify_waiters();
        Ok(delivery)
    }
}

impl MemorySubscription {
    async fn claim(&mut self) -> Option<Record> {
        let log = self.inner.log.lock().await;
        let count = log.partitions.len();
        for step in 0..count {
            let partition = (self.cursor + step) % count;
            let part = &log.partitions[partition];
            let position = self.positions[partition].max(part.base);
            if let Some(stored) = part.get(position) {
                self.positions[partition] = position + 1;
                self.cursor = (partition + 1) % count;
                return Some(Record {
                    topic: self.inner.topic.clone(),
                    partition: partition as i32,
                    offset: position,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                });
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_record(&mut self) -> Option<Result<Record>> {
        let inner = self.inner.clone();
        loop {
            let appended = inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            if let Some(record) = self.claim().await {
                return Some(Ok(record));
            }
            appended.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        let mut log = self.inner.log.lock().await;
        let start = log.starting_positions();
        let partition = usize::try_from(record.partition)
            .ok()
            .filter(|p| *p < start.len())
            .ok_or_else(|| anyhow::anyhow!("unknown partition {}", record.partition))?;
        let offsets = log.committed.entry(self.group.clone()).or_insert(start);
        offsets[partition] = offsets[partition].max(record.offset + 1);
        log.compact(partition);
        Ok(())
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;

    use super::MemoryBackbone;
    use crate::backbone::{Subscription, Transport};

    #[tokio::test]
    async fn same_key_lands_on_one_partition_in_order() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 4);
        let first = log.send("u1", b"a").await?;
        let second = log.send("u1", b"b").await?;
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);

        let mut sub = log.subscribe("g").await;
        let a = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        let b = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(a.value, b"a");
        assert_eq!(b.value, b"b");
        Ok(())
    }

    #[tokio::test]
    async fn new_subscription_resumes_from_committed_offset() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 1);
        log.send("u1", b"one").await?;
        log.send("u1", b"two").await?;

        let mut sub = log.subscribe("g").await;
        let mut other_group = log.subscribe("h").await;
        let one = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        sub.commit(&one).await?;
        let two = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(two.value, b"two");
        drop(sub);

        assert_eq!(log.committed("g", 0).await, 1);
        let mut resumed = log.subscribe("g").await;
        let again = resumed
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(again.value, b"two");
        assert_eq!(again.offset, 1);

        let fresh = other_group
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(fresh.value, b"one");
        Ok(())
    }

    #[tokio::test]
    async fn commit_is_cumulative_and_never_rewinds() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 1);
        log.send("k", b"0").await?;
        log.send("k", b"1").await?;
        let mut sub = log.subscribe("g").await;
        let r0 = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        let r1 = sub
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        sub.commit(&r1).await?;
        sub.commit(&r0).await?;
        assert_eq!(log.committed("g", 0).await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn waiting_subscriber_wakes_on_append() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 2);
        let mut sub = log.subscribe("g").await;
        let waiter = tokio::spawn(async move { sub.next_record().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.send("late", b"x").await?;
        let record = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await??
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(record.key.as_deref(), Some("late"));
        Ok(())
    }

    #[tokio::test]
    async fn committed_records_are_released() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 1);
        let mut sub = log.subscribe("g").await;
        for i in 0..3u8 {
            log.send("u1", &[i]).await?;
        }
        for _ in 0..3 {
            let record = sub
                .next_record()
                .await
                .ok_or_else(|| anyhow::anyhow!("ended"))??;
            sub.commit(&record).await?;
        }
        assert_eq!(log.retained(0).await, 0);

        let later = log.send("u1", b"later").await?;
        assert_eq!(later.offset, 3);
        drop(sub);
        let mut resumed = log.subscribe("g").await;
        let next = resumed
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        assert_eq!(next.offset, 3);
        assert_eq!(next.value, b"later");
        Ok(())
    }

    #[tokio::test]
    async fn slowest_group_pins_retention() -> Result<()> {
        let log = MemoryBackbone::new("ws-messages", 1);
        let mut fast = log.subscribe("fast").await;
        let slow = log.subscribe("slow").await;
        log.send("u1", b"a").await?;
        log.send("u1", b"b").await?;
        for _ in 0..2 {
            let record = fast
                .next_record()
                .await
                .ok_or_else(|| anyhow::anyhow!("ended"))??;
            fast.commit(&record).await?;
        }
        assert_eq!(log.retained(0).await, 2);

        drop(slow);
        let mut slow = log.subscribe("slow").await;
        let first = slow
            .next_record()
            .await
            .ok_or_else(|| anyhow::anyhow!("ended"))??;
        slow.commit(&first).await?;
        assert_eq!(first.offset, 0);
        assert_eq!(log.retained(0).await, 1);

        let late = log.subscribe("late").await;
        drop(late);
        assert_eq!(log.retained(0).await, 1);
        Ok(())
    }
}
