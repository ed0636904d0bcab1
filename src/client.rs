// src/client.rs - Scheduled tag operations on top of a controller
use crate::error::{PlcError, Result};
use crate::protocols::{Controller, ControllerIdentity, SessionState};
use crate::scan::ScanLoop;
use crate::scheduler::{Scheduler, PRIORITY_READ, PRIORITY_SCAN, PRIORITY_WRITE};
use crate::tag::{Tag, TagId, TagTable};
use crate::value::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One entry of a batched write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TagWrite {
    pub id: TagId,
    pub bit: Option<u8>,
    pub value: Value,
}

impl TagWrite {
    pub fn new(id: TagId, bit: Option<u8>, value: Value) -> Self {
        Self { id, bit, value }
    }
}

/// Facade the engine talks to
///
/// Every tag operation becomes a scheduler job; the tag snapshot is taken and
/// stored back inside that job, so tags only change while the job owns the
/// wire. Clones share the controller, scheduler, tag table and scan flag.
///
/// # Examples
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> vesta::Result<()> {
/// use std::sync::Arc;
/// use vesta::client::PlcClient;
/// use vesta::config::SchedulerConfig;
/// use vesta::project::TagConfig;
/// use vesta::protocols::Simulator;
/// use vesta::scheduler::Scheduler;
/// use vesta::value::DataType;
/// use vesta::{TagTable, Value};
///
/// let tags = TagTable::from_configs(&[TagConfig::new(1, "int0", DataType::Int)])?;
/// let plc = Simulator::new();
/// let client = PlcClient::new(Arc::new(plc), Scheduler::new(&SchedulerConfig::default()), tags);
/// client.open("127.0.0.1", 0, std::time::Duration::from_secs(1)).await?;
///
/// client.write_tag(1, None, Value::Int(-222)).await?;
/// assert_eq!(client.read_tag(1).await?.value, Value::Int(-222));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PlcClient {
    controller: Arc<dyn Controller>,
    scheduler: Scheduler,
    tags: TagTable,
    scan: ScanLoop,
}

impl PlcClient {
    pub fn new(controller: Arc<dyn Controller>, scheduler: Scheduler, tags: TagTable) -> Self {
        Self {
            controller,
            scheduler,
            tags,
            scan: ScanLoop::new(),
        }
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn identity(&self) -> Option<ControllerIdentity> {
        self.controller.identity()
    }

    pub fn protocol_name(&self) -> &'static str {
        self.controller.protocol_name()
    }

    pub async fn open(&self, address: &str, slot: u8, timeout: Duration) -> Result<()> {
        self.controller.open(address, slot, timeout).await
    }

    /// Stop any scan, then release the session
    pub async fn close(&self) -> Result<()> {
        if self.scan.stop() {
            debug!("Scan stopped before closing the session");
        }
        self.controller.close().await
    }

    /// Read one tag and return the updated snapshot
    pub async fn read_tag(&self, id: TagId) -> Result<Tag> {
        let controller = self.controller.clone();
        let table = self.tags.clone();
        self.scheduler
            .schedule(PRIORITY_READ, async move {
                let mut tag = table.get(id)?;
                controller.read_tag(&mut tag).await?;
                table.store(tag.clone());
                Ok(tag)
            })
            .await
    }

    /// Write a value, optionally into one bit, and return the updated snapshot
    pub async fn write_tag(&self, id: TagId, bit: Option<u8>, value: Value) -> Result<Tag> {
        let controller = self.controller.clone();
        let table = self.tags.clone();
        self.scheduler
            .schedule(PRIORITY_WRITE, async move {
                let mut tag = table.get(id)?;
                if let Some(bit) = bit {
                    tag.data_type.check_bit(bit)?;
                }
                tag.stage_write(value, bit);
                controller.write_tag(&mut tag).await?;
                table.store(tag.clone());
                Ok(tag)
            })
            .await
    }

    /// Read several tags in one job
    pub async fn read_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        self.read_batch(ids, PRIORITY_READ).await
    }

    async fn read_batch(&self, ids: &[TagId], priority: i32) -> Result<Vec<Tag>> {
        let controller = self.controller.clone();
        let table = self.tags.clone();
        let ids = ids.to_vec();
        self.scheduler
            .schedule(priority, async move {
                let mut tags = table.get_many(&ids)?;
                let result = controller.read_tags(&mut tags).await;
                // Values decoded before a sub-reply error are kept.
                table.store_many(tags.clone());
                result.map(|_| tags)
            })
            .await
    }

    /// Write several tags in one job
    pub async fn write_tags(&self, writes: &[TagWrite]) -> Result<Vec<Tag>> {
        let controller = self.controller.clone();
        let table = self.tags.clone();
        let writes = writes.to_vec();
        self.scheduler
            .schedule(PRIORITY_WRITE, async move {
                let mut tags = Vec::with_capacity(writes.len());
                for write in &writes {
                    let mut tag = table.get(write.id)?;
                    if let Some(bit) = write.bit {
                        tag.data_type.check_bit(bit)?;
                    }
                    tag.stage_write(write.value, write.bit);
                    tags.push(tag);
                }
                let result = controller.write_tags(&mut tags).await;
                for tag in tags.iter_mut() {
                    tag.pending = None;
                }
                table.store_many(tags.clone());
                result.map(|_| tags)
            })
            .await
    }

    /// Poll `ids` every `cadence` until stopped, a read fails or `on_cycle`
    /// breaks. Returns the number of cycles.
    pub async fn scan<F>(&self, ids: &[TagId], cadence: Duration, on_cycle: F) -> Result<u64>
    where
        F: FnMut(&[Tag]) -> ControlFlow<()>,
    {
        if !self.controller.is_connected() {
            return Err(PlcError::Connection(format!(
                "Cannot scan while the session is {}",
                self.state()
            )));
        }
        info!("Scanning {} tags every {}ms", ids.len(), cadence.as_millis());
        self.scan
            .run(cadence, || self.read_batch(ids, PRIORITY_SCAN), on_cycle)
            .await
    }

    pub fn stop_scan(&self) -> bool {
        self.scan.stop()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_scanning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::project::TagConfig;
    use crate::protocols::Simulator;
    use crate::value::DataType;

    async fn client() -> (PlcClient, Simulator) {
        let tags = TagTable::from_configs(&[
            TagConfig::new(1, "bool0", DataType::Bool),
            TagConfig::new(2, "int0", DataType::Int),
            TagConfig::new(3, "dint0", DataType::Dint),
        ])
        .unwrap();
        let sim = Simulator::new();
        let client = PlcClient::new(
            Arc::new(sim.clone()),
            Scheduler::new(&SchedulerConfig::default()),
            tags,
        );
        client.open("127.0.0.1", 0, Duration::from_secs(1)).await.unwrap();
        (client, sim)
    }

    #[tokio::test]
    async fn test_batched_write_then_read() {
        let (client, _sim) = client().await;
        client.write_tag(3, None, Value::Int(3333)).await.unwrap();
        client
            .write_tags(&[
                TagWrite::new(1, None, Value::Int(0)),
                TagWrite::new(2, None, Value::Int(123)),
                TagWrite::new(3, Some(3), Value::Int(1)),
            ])
            .await
            .unwrap();

        let tags = client.read_tags(&[1, 2, 3]).await.unwrap();
        let values: Vec<Value> = tags.iter().map(|t| t.value).collect();
        assert_eq!(values, vec![Value::Int(0), Value::Int(123), Value::Int(3341)]);
        assert!(client.tags().get(3).unwrap().pending.is_none());
    }

    #[tokio::test]
    async fn test_bit_out_of_range_rejected() {
        let (client, sim) = client().await;
        let err = client.write_tag(2, Some(20), Value::Int(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Requested bit 20 is out of range for INT type");
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let (client, _sim) = client().await;
        assert!(matches!(client.read_tag(99).await, Err(PlcError::TagNotFound(99))));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_value() {
        let (client, sim) = client().await;
        client.write_tag(2, None, Value::Int(5)).await.unwrap();
        sim.inject_fault(PlcError::Timeout("write".into()));
        assert!(client.write_tag(2, None, Value::Int(6)).await.is_err());
        let tag = client.tags().get(2).unwrap();
        assert_eq!(tag.value, Value::Int(5));
        assert!(tag.pending.is_none());
    }

    #[tokio::test]
    async fn test_close_stops_scan() {
        let (client, _sim) = client().await;
        let scanner = client.clone();
        let scan = tokio::spawn(async move {
            scanner
                .scan(&[1], Duration::from_millis(10), |_| ControlFlow::Continue(()))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(client.is_scanning());

        client.close().await.unwrap();
        // The loop either exits on the cleared flag or on the closed session.
        let _ = scan.await.unwrap();
        assert!(!client.is_scanning());
    }
}
