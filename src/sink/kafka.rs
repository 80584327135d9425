//! Kafka-compatible broker log backed by `rskafka`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rskafka::client::error::{Error as KafkaError, ProtocolError};
use rskafka::client::partition::{Compression, UnknownTopicHandling};
use rskafka::client::producer::aggregator::RecordAggregator;
use rskafka::client::producer::{BatchProducer, BatchProducerBuilder, ProducerClient};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tracing::{debug, info};

use super::{Ack, RecordLog, partition_for};
use crate::{IngestError, Result};

const CREATE_TOPIC_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a batch waits for more records before it is sent
pub const DEFAULT_LINGER: Duration = Duration::from_millis(5);

/// Upper bound on one batch, in approximate record bytes
pub const DEFAULT_MAX_BATCH_BYTES: usize = 100_000;

/// Append log on a Kafka topic.
///
/// Each partition has a batching producer shared by every worker. Appends
/// to the same partition within the linger window go out as one produce
/// request, and `append` returns once that request is acknowledged.
/// `flush` sends whatever is still lingering and waits for it.
pub struct KafkaLog {
    topic: String,
    brokers: Vec<String>,
    producers: Vec<BatchProducer<RecordAggregator>>,
}

impl KafkaLog {
    /// Connect to `brokers`, create `topic` if missing, and open its partitions.
    pub async fn connect(
        brokers: Vec<String>,
        topic: impl Into<String>,
        partitions: i32,
        replication_factor: i16,
    ) -> Result<Self> {
        let topic = topic.into();
        let destination = format!("kafka:{}", topic);

        let client = ClientBuilder::new(brokers.clone())
            .build()
            .await
            .map_err(|e| IngestError::emit_with_source(&destination, "failed to reach brokers", Box::new(e)))?;

        ensure_topic(&client, &topic, partitions, replication_factor, &destination).await?;

        let partition_count = client
            .list_topics()
            .await
            .map_err(|e| IngestError::emit_with_source(&destination, "failed to list topics", Box::new(e)))?
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions.len() as i32)
            .unwrap_or(partitions)
            .max(1);

        let mut clients: Vec<Arc<dyn ProducerClient>> = Vec::with_capacity(partition_count as usize);
        for partition in 0..partition_count {
            let client = client
                .partition_client(topic.clone(), partition, UnknownTopicHandling::Retry)
                .await
                .map_err(|e| {
                    IngestError::emit_with_source(&destination, format!("partition {} unavailable", partition), Box::new(e))
                })?;
            clients.push(Arc::new(client));
        }

        info!(topic = %topic, partitions = partition_count, brokers = ?brokers, "Connected to Kafka");
        Ok(Self::with_clients(topic, brokers, clients, DEFAULT_LINGER))
    }

    /// Batch appends through one producer client per partition
    fn with_clients(
        topic: String,
        brokers: Vec<String>,
        clients: Vec<Arc<dyn ProducerClient>>,
        linger: Duration,
    ) -> Self {
        let producers = clients
            .into_iter()
            .map(|client| {
                BatchProducerBuilder::new_with_client(client)
                    .with_linger(linger)
                    .with_compression(Compression::NoCompression)
                    .build(RecordAggregator::new(DEFAULT_MAX_BATCH_BYTES))
            })
            .collect();

        Self { topic, brokers, producers }
    }

    /// Topic records are written to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of partitions in use
    pub fn partition_count(&self) -> usize {
        self.producers.len()
    }
}

async fn ensure_topic(
    client: &Client,
    topic: &str,
    partitions: i32,
    replication_factor: i16,
    destination: &str,
) -> Result<()> {
    let controller = client
        .controller_client()
        .map_err(|e| IngestError::emit_with_source(destination, "no controller available", Box::new(e)))?;

    match controller
        .create_topic(topic, partitions, replication_factor, CREATE_TOPIC_TIMEOUT.as_millis() as i32)
        .await
    {
        Ok(()) => {
            info!(topic, partitions, replication_factor, "Created topic");
            Ok(())
        }
        Err(KafkaError::ServerError { protocol_error: ProtocolError::TopicAlreadyExists, .. }) => {
            debug!(topic, "Topic already exists");
            Ok(())
        }
        Err(e) => Err(IngestError::emit_with_source(destination, "failed to create topic", Box::new(e))),
    }
}

#[async_trait::async_trait]
impl RecordLog for KafkaLog {
    async fn append(&self, key: &str, value: &[u8]) -> Result<Ack> {
        let partition = partition_for(key, self.producers.len());
        let producer = self
            .producers
            .get(partition as usize)
            .ok_or_else(|| IngestError::emit(self.describe(), "topic has no partitions"))?;

        let record = Record {
            key: Some(key.as_bytes().to_vec()),
            value: Some(value.to_vec()),
            headers: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        };

        let offset = producer
            .produce(record)
            .await
            .map_err(|e| IngestError::emit_with_source(self.describe(), "produce failed", Box::new(e)))?;

        Ok(Ack { partition, offset })
    }

    async fn flush(&self) -> Result<()> {
        debug!(topic = %self.topic, partitions = self.producers.len(), "Flushing lingering batches");
        for (partition, producer) in self.producers.iter().enumerate() {
            producer.flush().await.map_err(|e| {
                IngestError::emit_with_source(self.describe(), format!("flush of partition {} failed", partition), Box::new(e))
            })?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("kafka:{}@{}", self.topic, self.brokers.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    /// Acknowledges every batch and remembers its size
    #[derive(Debug, Default)]
    struct RecordingClient {
        batches: Mutex<Vec<usize>>,
    }

    impl ProducerClient for RecordingClient {
        fn produce(
            &self,
            records: Vec<Record>,
            _compression: Compression,
        ) -> BoxFuture<'_, std::result::Result<Vec<i64>, KafkaError>> {
            let mut batches = self.batches.lock().unwrap();
            let base = batches.iter().sum::<usize>() as i64;
            batches.push(records.len());
            let offsets = (base..base + records.len() as i64).collect();
            Box::pin(async move { Ok(offsets) })
        }
    }

    fn log(client: &Arc<RecordingClient>, linger: Duration) -> KafkaLog {
        let client: Arc<dyn ProducerClient> = client.clone();
        KafkaLog::with_clients("events".to_string(), vec!["broker:9092".to_string()], vec![client], linger)
    }

    #[tokio::test]
    async fn appends_within_the_linger_share_one_request() {
        let client = Arc::new(RecordingClient::default());
        let log = log(&client, Duration::from_millis(50));

        let (a, b, c) = tokio::join!(log.append("a", b"1"), log.append("b", b"2"), log.append("c", b"3"));
        let mut offsets = vec![a.unwrap().offset, b.unwrap().offset, c.unwrap().offset];
        offsets.sort();

        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(*client.batches.lock().unwrap(), vec![3]);
        assert_eq!(log.describe(), "kafka:events@broker:9092");
    }

    #[tokio::test]
    async fn flush_sends_a_lingering_batch() {
        let client = Arc::new(RecordingClient::default());
        let log = Arc::new(log(&client, Duration::from_secs(3600)));

        let pending = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.append("a", b"1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert!(client.batches.lock().unwrap().is_empty());

        log.flush().await.unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap().unwrap();
        assert_eq!(ack, Ack { partition: 0, offset: 0 });
        assert_eq!(*client.batches.lock().unwrap(), vec![1]);
    }
}
