//! The port bus — numbered slots and queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PortError, PortResult};

/// Default sleep between polls while waiting on a port.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Port {
    /// Latest-snapshot record; replaced whole, never appended.
    slot: Option<Value>,
    /// FIFO work queue; a pop claims the record for one consumer.
    queue: VecDeque<Value>,
}

/// Process-wide registry of numbered ports. Cheap to clone; all clones
/// share the same underlying channels.
#[derive(Debug, Clone, Default)]
pub struct PortBus {
    ports: Arc<RwLock<HashMap<u16, Port>>>,
}

impl PortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a port. Idempotent; existing contents are kept.
    pub async fn open(&self, port: u16) {
        let mut ports = self.ports.write().await;
        ports.entry(port).or_default();
        debug!(port, "port open");
    }

    /// Whether the port has been opened.
    pub async fn is_open(&self, port: u16) -> bool {
        self.ports.read().await.contains_key(&port)
    }

    /// Replace the slot record with a new snapshot.
    pub async fn replace<T: Serialize>(&self, port: u16, record: &T) -> PortResult<()> {
        let value = serde_json::to_value(record)?;
        let mut ports = self.ports.write().await;
        let p = ports.get_mut(&port).ok_or(PortError::PortClosed(port))?;
        p.slot = Some(value);
        Ok(())
    }

    /// Peek the latest slot snapshot without consuming it.
    pub async fn peek<T: DeserializeOwned>(&self, port: u16) -> PortResult<Option<T>> {
        let ports = self.ports.read().await;
        let p = ports.get(&port).ok_or(PortError::PortClosed(port))?;
        match &p.slot {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write the slot record under the bus write lock.
    ///
    /// This is the only multi-writer-safe way to mutate a shared record
    /// in place (e.g. a result map keyed by task id).
    pub async fn update_slot(
        &self,
        port: u16,
        f: impl FnOnce(Option<Value>) -> Value,
    ) -> PortResult<()> {
        let mut ports = self.ports.write().await;
        let p = ports.get_mut(&port).ok_or(PortError::PortClosed(port))?;
        p.slot = Some(f(p.slot.take()));
        Ok(())
    }

    /// Clear the slot record.
    pub async fn clear_slot(&self, port: u16) -> PortResult<()> {
        let mut ports = self.ports.write().await;
        let p = ports.get_mut(&port).ok_or(PortError::PortClosed(port))?;
        p.slot = None;
        Ok(())
    }

    /// Enqueue a record at the back of the port's queue.
    pub async fn push<T: Serialize>(&self, port: u16, record: &T) -> PortResult<()> {
        let value = serde_json::to_value(record)?;
        let mut ports = self.ports.write().await;
        let p = ports.get_mut(&port).ok_or(PortError::PortClosed(port))?;
        p.queue.push_back(value);
        Ok(())
    }

    /// Pop the front record if one is queued. The pop happens under the
    /// write lock, so exactly one caller claims any given record.
    pub async fn try_pop<T: DeserializeOwned>(&self, port: u16) -> PortResult<Option<T>> {
        let mut ports = self.ports.write().await;
        let p = ports.get_mut(&port).ok_or(PortError::PortClosed(port))?;
        match p.queue.pop_front() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Pop the front record, cooperatively polling until one arrives or
    /// the timeout elapses.
    pub async fn pop_timeout<T: DeserializeOwned>(
        &self,
        port: u16,
        timeout: Duration,
    ) -> PortResult<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_pop(port).await? {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PortError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Number of queued records on the port.
    pub async fn queue_len(&self, port: u16) -> PortResult<usize> {
        let ports = self.ports.read().await;
        let p = ports.get(&port).ok_or(PortError::PortClosed(port))?;
        Ok(p.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        note: String,
    }

    fn record(id: u64) -> Record {
        Record { id, note: format!("r{id}") }
    }

    #[tokio::test]
    async fn unopened_port_is_closed() {
        let bus = PortBus::new();
        let err = bus.peek::<Record>(7).await.unwrap_err();
        assert!(matches!(err, PortError::PortClosed(7)));
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let bus = PortBus::new();
        bus.open(1).await;
        bus.push(1, &record(1)).await.unwrap();
        bus.open(1).await;
        assert_eq!(bus.queue_len(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slot_replace_and_peek_latest() {
        let bus = PortBus::new();
        bus.open(1).await;
        assert_eq!(bus.peek::<Record>(1).await.unwrap(), None);

        bus.replace(1, &record(1)).await.unwrap();
        bus.replace(1, &record(2)).await.unwrap();

        // Readers always see the latest snapshot; peeking twice works.
        assert_eq!(bus.peek::<Record>(1).await.unwrap(), Some(record(2)));
        assert_eq!(bus.peek::<Record>(1).await.unwrap(), Some(record(2)));
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let bus = PortBus::new();
        bus.open(1).await;
        for id in 1..=3 {
            bus.push(1, &record(id)).await.unwrap();
        }
        assert_eq!(bus.try_pop::<Record>(1).await.unwrap(), Some(record(1)));
        assert_eq!(bus.try_pop::<Record>(1).await.unwrap(), Some(record(2)));
        assert_eq!(bus.try_pop::<Record>(1).await.unwrap(), Some(record(3)));
        assert_eq!(bus.try_pop::<Record>(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pop_claims_exactly_once_across_consumers() {
        let bus = PortBus::new();
        bus.open(1).await;
        for id in 0..100u64 {
            bus.push(1, &record(id)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(r) = bus.try_pop::<Record>(1).await.unwrap() {
                    claimed.push(r.id);
                }
                claimed
            }));
        }

        let mut all: Vec<u64> = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort_unstable();
        // Every record claimed exactly once.
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pop_timeout_times_out_when_empty() {
        let bus = PortBus::new();
        bus.open(1).await;
        let err = bus
            .pop_timeout::<Record>(1, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Timeout));
    }

    #[tokio::test]
    async fn pop_timeout_sees_later_push() {
        let bus = PortBus::new();
        bus.open(1).await;

        let writer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.push(1, &record(9)).await.unwrap();
        });

        let got: Record = bus.pop_timeout(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, record(9));
    }

    #[tokio::test]
    async fn update_slot_read_modify_write() {
        let bus = PortBus::new();
        bus.open(1).await;

        for _ in 0..10 {
            bus.update_slot(1, |prev| {
                let count = prev.and_then(|v| v.get("count").and_then(Value::as_u64)).unwrap_or(0);
                serde_json::json!({ "count": count + 1 })
            })
            .await
            .unwrap();
        }

        let v: Value = bus.peek(1).await.unwrap().unwrap();
        assert_eq!(v["count"], 10);
    }

    #[tokio::test]
    async fn clear_slot_empties_snapshot() {
        let bus = PortBus::new();
        bus.open(1).await;
        bus.replace(1, &record(1)).await.unwrap();
        bus.clear_slot(1).await.unwrap();
        assert_eq!(bus.peek::<Record>(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ports_are_independent() {
        let bus = PortBus::new();
        bus.open(1).await;
        bus.open(2).await;
        bus.push(1, &record(1)).await.unwrap();
        assert_eq!(bus.queue_len(2).await.unwrap(), 0);
    }
}
