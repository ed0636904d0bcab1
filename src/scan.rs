// src/scan.rs - Fixed-cadence polling loop
use crate::error::{PlcError, Result};
use crate::tag::Tag;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Owner of the "is scanning" flag of a session
///
/// Only one scan may run at a time. [`ScanLoop::stop`] clears the flag; the
/// running loop notices it before its next read and returns cleanly.
#[derive(Debug, Clone, Default)]
pub struct ScanLoop {
    scanning: Arc<AtomicBool>,
}

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ScanLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Ask the running loop to exit; returns whether one was running
    pub fn stop(&self) -> bool {
        self.scanning.swap(false, Ordering::AcqRel)
    }

    /// Read, call back, sleep, repeat.
    ///
    /// Returns the number of completed cycles. A read error ends the loop and
    /// is returned; `on_cycle` may end it early with [`ControlFlow::Break`].
    pub async fn run<R, Fut, F>(&self, cadence: Duration, mut read: R, mut on_cycle: F) -> Result<u64>
    where
        R: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<Tag>>>,
        F: FnMut(&[Tag]) -> ControlFlow<()>,
    {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PlcError::Validation("A scan is already in progress".into()));
        }
        let _running = Running(&self.scanning);

        let mut cycles = 0u64;
        while self.is_scanning() {
            let tags = read().await.map_err(|e| {
                warn!("Scan stopped after {} cycles: {}", cycles, e);
                e
            })?;
            cycles += 1;
            if on_cycle(&tags).is_break() {
                break;
            }
            tokio::time::sleep(cadence).await;
        }
        debug!("Scan finished after {} cycles", cycles);
        Ok(cycles)
    }
}
