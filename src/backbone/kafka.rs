use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;

use super::{Delivery, Record, SendError, Subscription, Transport};

pub struct KafkaTransport {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

impl KafkaTransport {
    pub fn new(brokers: &[String], topic: &str, send_timeout: Duration) -> Result<Self> {
        // Retries are owned by the publish path, so the client library must not add its own.
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", "all")
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .create()
            .context("create sync producer")?;
        Ok(Self {
            producer,
            topic: topic.to_owned(),
            send_timeout,
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, key: &str, value: &[u8]) -> Result<Delivery, SendError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(value);
        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(Delivery { partition, offset }),
            Err((err, _)) => Err(classify_send_error(err)),
        }
    }
}

impl KafkaSubscription {
    pub fn join(brokers: &[String], topic: &str, group: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest")
            .set("partition.assignment.strategy", "roundrobin")
            .create()
            .context("create consumer group")?;
        consumer
            .subscribe(&[topic])
            .with_context(|| format!("subscribe to topic {topic}"))?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_record(&mut self) -> Option<Result<Record>> {
        let claimed = match self.consumer.recv().await {
            Ok(message) => Ok(Record {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                value: message.payload().unwrap_or_default().to_vec(),
            }),
            Err(err) => Err(anyhow::anyhow!("consume from kafka: {err}")),
        };
        Some(claimed)
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        let position = commit_position(record)?;
        self.consumer.store_offsets(&position).with_context(|| {
            format!(
                "store offset {} for {}/{}",
                record.offset, record.topic, record.partition
            )
        })
    }
}

/// The group position after `record`: the offset of the next record to
/// consume. Stored verbatim, so librdkafka adds nothing on top.
fn commit_position(record: &Record) -> Result<TopicPartitionList> {
    let mut position = TopicPartitionList::new();
    position
        .add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )
        .with_context(|| format!("offset {} out of range", record.offset))?;
    Ok(position)
}

fn classify_send_error(err: KafkaError) -> SendError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => SendError::Rejected(err.to_string()),
        _ => SendError::Transient(err.to_string()),
    }
}
