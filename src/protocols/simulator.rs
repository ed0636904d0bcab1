// src/protocols/simulator.rs - In-process controller for dry runs and tests
use crate::error::{PlcError, Result};
use crate::protocols::{Controller, ControllerIdentity, SessionState};
use crate::tag::Tag;
use crate::value::Value;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Write observed by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Memory key of the written tag, bit excluded
    pub key: String,
    pub bit: Option<u8>,
    pub value: Value,
    pub at: Instant,
}

#[derive(Default)]
struct Inner {
    memory: DashMap<String, Value>,
    state: Mutex<Option<SessionState>>,
    writes: Mutex<Vec<WriteRecord>>,
    faults: Mutex<VecDeque<PlcError>>,
    latency: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated controller memory
///
/// Values are keyed by the tag path with any trailing bit removed, so
/// `Status.3` and `Status` share storage the way they do on a real
/// controller. Clones share the same memory.
///
/// # Examples
///
/// ```rust
/// use vesta::protocols::Simulator;
/// use vesta::Value;
///
/// let plc = Simulator::new();
/// plc.set("Program:main.Counter", Value::Int(7));
/// assert_eq!(plc.get("Program:main.Counter"), Some(Value::Int(7)));
/// ```
#[derive(Clone, Default)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a memory location directly, as the controller program would
    pub fn set(&self, key: &str, value: Value) {
        self.inner.memory.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.memory.get(key).map(|v| *v)
    }

    /// Change a location after a delay, from a background task
    pub fn schedule_change(&self, key: &str, value: Value, after: Duration) {
        let sim = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!("Simulator changes {} to {}", key, value);
            sim.set(&key, value);
        });
    }

    /// Fail the next tag operation with `error`
    pub fn inject_fault(&self, error: PlcError) {
        lock(&self.inner.faults).push_back(error);
    }

    /// Delay applied to every tag operation
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Every write performed so far, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.inner.writes).clone()
    }

    /// Writes that targeted one memory key
    pub fn writes_to(&self, key: &str) -> Vec<WriteRecord> {
        lock(&self.inner.writes)
            .iter()
            .filter(|w| w.key == key)
            .cloned()
            .collect()
    }

    async fn operation(&self) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(PlcError::Connection(format!("Session is {}", self.state())));
        }
        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fault = lock(&self.inner.faults).pop_front();
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_into(&self, tag: &mut Tag) {
        let whole = self.get(&tag.address().key()).unwrap_or_default();
        tag.accept_read(whole);
    }

    fn write_from(&self, tag: &mut Tag) -> Result<()> {
        let pending = tag
            .pending
            .ok_or_else(|| PlcError::Validation(format!("Tag {} has no staged write", tag.name)))?;
        let key = tag.address().key();
        let whole = match pending.bit {
            Some(bit) => {
                let current = self.get(&key).unwrap_or_default();
                tag.data_type
                    .apply_bit(&current, bit, pending.value.as_int() != 0)
            }
            None => tag.data_type.coerce(pending.value.as_float()),
        };
        self.set(&key, whole);
        lock(&self.inner.writes).push(WriteRecord {
            key,
            bit: pending.bit,
            value: pending.value,
            at: Instant::now(),
        });
        tag.accept_write();
        Ok(())
    }
}

#[async_trait]
impl Controller for Simulator {
    async fn open(&self, address: &str, slot: u8, _timeout: Duration) -> Result<()> {
        address.trim().parse::<Ipv4Addr>().map_err(|_| {
            PlcError::Connection(format!("'{}' is not a valid IPv4 address", address))
        })?;
        let mut state = lock(&self.inner.state);
        if matches!(*state, Some(SessionState::Connected)) {
            return Err(PlcError::Connection("Session is already connected".into()));
        }
        *state = Some(SessionState::Connected);
        info!("Simulated controller online at {} slot {}", address, slot);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *lock(&self.inner.state) = Some(SessionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> SessionState {
        lock(&self.inner.state).unwrap_or(SessionState::Disconnected)
    }

    fn identity(&self) -> Option<ControllerIdentity> {
        (self.state() == SessionState::Connected).then(|| {
            ControllerIdentity {
                vendor: 1,
                device_type: 0x0E,
                product_code: 0x36,
                version: "1.0".into(),
                serial_number: 0x5645_5354,
                name: "VESTA Simulator".into(),
                ..Default::default()
            }
            .with_status(0x0060)
        })
    }

    async fn read_tag(&self, tag: &mut Tag) -> Result<()> {
        self.operation().await?;
        self.read_into(tag);
        Ok(())
    }

    async fn write_tag(&self, tag: &mut Tag) -> Result<()> {
        self.operation().await?;
        self.write_from(tag)
    }

    async fn read_tags(&self, tags: &mut [Tag]) -> Result<()> {
        self.operation().await?;
        for tag in tags.iter_mut() {
            self.read_into(tag);
        }
        Ok(())
    }

    async fn write_tags(&self, tags: &mut [Tag]) -> Result<()> {
        self.operation().await?;
        for tag in tags.iter_mut() {
            self.write_from(tag)?;
        }
        Ok(())
    }

    fn protocol_name(&self) -> &'static str {
        "Simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::TagConfig;
    use crate::value::DataType;

    async fn online() -> Simulator {
        let sim = Simulator::new();
        sim.open("127.0.0.1", 0, Duration::from_secs(1)).await.unwrap();
        sim
    }

    #[tokio::test]
    async fn test_bit_write_shares_memory() {
        let sim = online().await;
        sim.set("dint0", Value::Int(3333));

        let mut bit_tag = Tag::new(&TagConfig::new(2, "dint0.3", DataType::Dint)).unwrap();
        bit_tag.stage_write(Value::Int(1), None);
        sim.write_tag(&mut bit_tag).await.unwrap();
        assert_eq!(sim.get("dint0"), Some(Value::Int(3341)));

        let mut whole = Tag::new(&TagConfig::new(1, "dint0", DataType::Dint)).unwrap();
        sim.read_tag(&mut whole).await.unwrap();
        assert_eq!(whole.value, Value::Int(3341));
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let sim = online().await;
        sim.inject_fault(PlcError::Timeout("read".into()));
        let mut tag = Tag::new(&TagConfig::new(1, "a", DataType::Int)).unwrap();
        assert!(sim.read_tag(&mut tag).await.is_err());
        assert!(sim.read_tag(&mut tag).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_simulator_refuses_io() {
        let sim = online().await;
        sim.close().await.unwrap();
        let mut tag = Tag::new(&TagConfig::new(1, "a", DataType::Int)).unwrap();
        assert!(matches!(
            sim.read_tag(&mut tag).await,
            Err(PlcError::Connection(_))
        ));
        assert!(sim.identity().is_none());
    }
}
