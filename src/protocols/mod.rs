// src/protocols/mod.rs - Controller capability interface
use crate::{error::Result, tag::Tag};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub mod cip;
pub mod simulator;

pub use cip::CipSession;
pub use simulator::Simulator;

/// Connection state of a controller session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Identity reported by the controller at connect time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerIdentity {
    pub vendor: u16,
    pub device_type: u16,
    pub product_code: u16,
    /// `major.minor` revision
    pub version: String,
    pub serial_number: u32,
    pub name: String,
    /// Raw identity status word
    pub status: u16,
    pub faulted: bool,
    pub minor_recoverable_fault: bool,
    pub minor_unrecoverable_fault: bool,
    pub major_recoverable_fault: bool,
    pub major_unrecoverable_fault: bool,
}

impl ControllerIdentity {
    /// Derive the fault flags from the identity status word
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self.faulted = status & 0x0F00 != 0;
        self.minor_recoverable_fault = status & 0x0100 != 0;
        self.minor_unrecoverable_fault = status & 0x0200 != 0;
        self.major_recoverable_fault = status & 0x0400 != 0;
        self.major_unrecoverable_fault = status & 0x0800 != 0;
        self
    }
}

/// Capabilities every controller backend provides
///
/// Implemented by the EtherNet/IP session and by the in-process simulator.
/// Callers are expected to serialize calls through the
/// [`Scheduler`](crate::scheduler::Scheduler); implementations may assume at
/// most one request in flight.
///
/// # Examples
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> vesta::Result<()> {
/// use std::time::Duration;
/// use vesta::protocols::{Controller, Simulator};
///
/// let plc = Simulator::new();
/// plc.open("10.0.0.5", 0, Duration::from_secs(1)).await?;
/// assert!(plc.is_connected());
/// plc.close().await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Controller: Send + Sync {
    /// Connect and read the controller identity
    async fn open(&self, address: &str, slot: u8, timeout: Duration) -> Result<()>;

    /// Release the connection; calling it twice is harmless
    async fn close(&self) -> Result<()>;

    fn state(&self) -> SessionState;

    fn identity(&self) -> Option<ControllerIdentity>;

    /// Read one tag, storing the decoded value into it
    async fn read_tag(&self, tag: &mut Tag) -> Result<()>;

    /// Perform the tag's pending write
    async fn write_tag(&self, tag: &mut Tag) -> Result<()>;

    /// Read several tags in as few round trips as possible
    async fn read_tags(&self, tags: &mut [Tag]) -> Result<()>;

    /// Perform the pending writes of several tags
    async fn write_tags(&self, tags: &mut [Tag]) -> Result<()>;

    fn protocol_name(&self) -> &'static str;

    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_flags() {
        let id = ControllerIdentity::default().with_status(0x0560);
        assert!(id.faulted);
        assert!(id.minor_recoverable_fault);
        assert!(id.major_recoverable_fault);
        assert!(!id.minor_unrecoverable_fault);
        assert!(!id.major_unrecoverable_fault);

        assert!(!ControllerIdentity::default().with_status(0x0060).faulted);
    }
}
