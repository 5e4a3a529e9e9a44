//! [`Driver`] implementation backed by `rdkafka`'s async `StreamConsumer`.
//!
//! Grounded in `common-kafka::kafka_consumer::SingleTopicConsumer::new`'s
//! client-config assembly (bootstrap servers, TLS, statistics interval) and
//! `common-kafka::kafka_producer::create_kafka_producer`'s "ping the broker
//! with a metadata fetch on startup" pattern.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::consumer::{CommitMode, Consumer as RdConsumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::topic_partition_list::{Offset as RdOffset, TopicPartitionList};
use rdkafka::{ClientConfig, Message as RdMessage};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::driver::{Driver, Record};
use crate::error::DriverError;
use crate::topic_partition::TopicPartition;

fn client_config(kafka: &KafkaConfig, group: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false");

    if kafka.kafka_tls {
        config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }
    config
}

fn to_topic_partition_list(offsets: &HashMap<TopicPartition, i64>) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for (tp, offset) in offsets {
        list.add_partition_offset(&tp.topic, tp.partition, RdOffset::Offset(*offset + 1))
            .expect("valid offset");
    }
    list
}

/// A [`Driver`] over a single `rdkafka::consumer::StreamConsumer`.
///
/// This driver does not register its own rebalance callback: ownership of
/// the assignment is tracked through [`crate::flow::FlowController`] and
/// [`crate::rebalance::RebalanceHandler`], driven by whatever context the
/// embedding application installs on the underlying `rdkafka` consumer.
pub struct KafkaDriver {
    consumer: StreamConsumer,
    admin: AdminClient<rdkafka::client::DefaultClientContext>,
}

impl KafkaDriver {
    pub fn new(kafka: &KafkaConfig, consumer_cfg: &ConsumerConfig) -> Result<Self, KafkaError> {
        let mut config = client_config(kafka, &consumer_cfg.kafka_consumer_group);
        config.set("auto.offset.reset", &consumer_cfg.kafka_consumer_offset_reset);

        let consumer: StreamConsumer = config.create()?;
        let admin: AdminClient<_> = config.create()?;

        Ok(Self { consumer, admin })
    }
}

#[async_trait]
impl Driver for KafkaDriver {
    async fn fetch(
        &self,
        active: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Record>>, DriverError> {
        let mut out: HashMap<TopicPartition, Vec<Record>> = HashMap::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let message = match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(DriverError::Kafka(e)),
                Err(_) => break,
            };

            let tp = TopicPartition::new(message.topic(), message.partition());
            if active.contains(&tp) {
                out.entry(tp.clone()).or_default().push(Record {
                    tp,
                    offset: message.offset(),
                    key: message.key().map(|k| k.to_vec()),
                    value: message.payload().map(|v| v.to_vec()),
                    timestamp: message.timestamp().to_millis(),
                });
            }

            // One non-empty poll is enough for a batch; keep single-message
            // latency low instead of waiting out the full timeout.
            if !out.is_empty() {
                break;
            }
        }

        Ok(out)
    }

    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<bool, DriverError> {
        if offsets.is_empty() {
            return Ok(false);
        }
        let list = to_topic_partition_list(offsets);
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(DriverError::Kafka)?;
        Ok(true)
    }

    async fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), DriverError> {
        self.consumer
            .seek(
                &tp.topic,
                tp.partition,
                RdOffset::Offset(offset),
                Duration::from_secs(5),
            )
            .map_err(DriverError::Kafka)
    }

    async fn seek_to_committed(
        &self,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, DriverError> {
        let assignment = self.consumer.assignment().map_err(DriverError::Kafka)?;
        let committed = self
            .consumer
            .committed_offsets(assignment, Duration::from_secs(10))
            .map_err(DriverError::Kafka)?;

        let mut out = HashMap::new();
        for elem in committed.elements() {
            let tp = TopicPartition::new(elem.topic(), elem.partition());
            let offset = match elem.offset() {
                RdOffset::Offset(o) => Some(o),
                _ => None,
            };
            out.insert(tp, offset);
        }
        Ok(out)
    }

    async fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        let position = self.consumer.position().map_err(DriverError::Kafka)?;
        for elem in position.elements() {
            if elem.topic() == tp.topic && elem.partition() == tp.partition {
                return Ok(match elem.offset() {
                    RdOffset::Offset(o) => Some(o),
                    _ => None,
                });
            }
        }
        Ok(None)
    }

    async fn assignment(&self) -> Result<HashSet<TopicPartition>, DriverError> {
        let assignment = self.consumer.assignment().map_err(DriverError::Kafka)?;
        Ok(assignment
            .elements()
            .iter()
            .map(|e| TopicPartition::new(e.topic(), e.partition()))
            .collect())
    }

    async fn highwater(&self, tp: &TopicPartition) -> Result<i64, DriverError> {
        let (_low, high) = self
            .consumer
            .fetch_watermarks(&tp.topic, tp.partition, Duration::from_secs(5))
            .map_err(DriverError::Kafka)?;
        Ok(high)
    }

    async fn earliest_offsets(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        let mut out = HashMap::new();
        for tp in tps {
            let (low, _high) = self
                .consumer
                .fetch_watermarks(&tp.topic, tp.partition, Duration::from_secs(5))
                .map_err(DriverError::Kafka)?;
            out.insert(tp.clone(), low);
        }
        Ok(out)
    }

    async fn highwaters(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        let mut out = HashMap::new();
        for tp in tps {
            out.insert(tp.clone(), self.highwater(tp).await?);
        }
        Ok(out)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), DriverError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        info!(?topics, "subscribing");
        self.consumer.subscribe(&topics).map_err(DriverError::Kafka)
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication: i16,
    ) -> Result<(), DriverError> {
        let new_topic =
            NewTopic::new(topic, partitions, TopicReplication::Fixed(replication.into()));
        let results = self
            .admin
            .create_topics([&new_topic], &AdminOptions::new())
            .await
            .map_err(DriverError::Kafka)?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((name, err)) => {
                    debug!(topic = %name, error = %err, "create_topic reported error, likely already exists");
                }
            }
        }
        Ok(())
    }
}
