//! In-memory partitioned log

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{Ack, RecordLog, partition_for};
use crate::Result;

/// A record as stored by [`MemoryLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub offset: i64,
}

/// Partitioned append log held in memory, with read-back.
///
/// Records are routed with [`partition_for`], so a key always lands in the
/// same partition, and each partition assigns offsets from zero.
#[derive(Debug)]
pub struct MemoryLog {
    topic: String,
    partitions: Mutex<Vec<Vec<StoredRecord>>>,
    flushes: AtomicUsize,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            topic: topic.into(),
            partitions: Mutex::new(vec![Vec::new(); partitions]),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.lock().len()
    }

    /// Records in one partition, in offset order
    pub fn partition(&self, partition: i32) -> Vec<StoredRecord> {
        usize::try_from(partition).ok().and_then(|p| self.lock().get(p).cloned()).unwrap_or_default()
    }

    /// Every record, partition by partition
    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// Look up the latest record stored under `key`
    pub fn find(&self, key: &str) -> Option<StoredRecord> {
        let partitions = self.lock();
        let partition = partitions.get(partition_for(key, partitions.len()) as usize)?;
        partition.iter().rev().find(|record| record.key == key).cloned()
    }

    /// Total number of records
    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times `flush` was called
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<StoredRecord>>> {
        self.partitions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl RecordLog for MemoryLog {
    async fn append(&self, key: &str, value: &[u8]) -> Result<Ack> {
        let mut partitions = self.lock();
        let partition = partition_for(key, partitions.len());
        let records = &mut partitions[partition as usize];

        let offset = records.len() as i64;
        records.push(StoredRecord { key: key.to_string(), value: value.to_vec(), offset });
        Ok(Ack { partition, offset })
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.topic)
    }
}
