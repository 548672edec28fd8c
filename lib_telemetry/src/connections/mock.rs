//! # Mock Device
//!
//! An in-memory `DeviceClient` whose behaviour is scripted through a
//! `MockProbe`. The probe counts connect and read calls and can inject a run
//! of failures, which is how the poll-loop tests check the single-poller and
//! fault-tolerance guarantees.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::DeviceClient;
use super::error::{DeviceError, ExceptionCode};

/// The failure a scripted read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Timeout,
    Exception(u8),
    ConnectionLost,
}

impl MockFault {
    fn to_error(self) -> DeviceError {
        match self {
            MockFault::Timeout => DeviceError::Timeout(Duration::from_millis(1)),
            MockFault::Exception(code) => DeviceError::Exception(ExceptionCode(code)),
            MockFault::ConnectionLost => {
                DeviceError::lost(io::ErrorKind::ConnectionReset, "scripted connection loss")
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    registers: Mutex<Vec<u16>>,
    read_fault: Mutex<Option<(MockFault, usize)>>,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    reads: AtomicUsize,
}

/// Handle kept by the test to script and observe a `MockDevice`.
#[derive(Clone)]
pub struct MockProbe {
    shared: Arc<Shared>,
}

impl MockProbe {
    /// Total `connect` calls, successful or not.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Total `read_block` calls, successful or not.
    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Makes the next `n` reads fail with `fault`.
    pub fn fail_next_reads(&self, n: usize, fault: MockFault) {
        *self.shared.read_fault.lock().unwrap_or_else(PoisonError::into_inner) = (n > 0).then_some((fault, n));
    }

    /// Makes the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Replaces the register image served by later reads.
    pub fn set_registers(&self, registers: Vec<u16>) {
        *self.shared.registers.lock().unwrap_or_else(PoisonError::into_inner) = registers;
    }
}

/// Scripted in-memory device.
pub struct MockDevice {
    shared: Arc<Shared>,
    connected: bool,
}

impl MockDevice {
    /// A device that answers every read with `registers`, indexed from
    /// address 0. Addresses past the end read as zero.
    pub fn new(registers: Vec<u16>) -> (Self, MockProbe) {
        let shared = Arc::new(Shared {
            registers: Mutex::new(registers),
            ..Default::default()
        });
        let probe = MockProbe {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                connected: false,
            },
            probe,
        )
    }

    fn take_read_fault(&self) -> Option<MockFault> {
        let mut slot = self.shared.read_fault.lock().unwrap_or_else(PoisonError::into_inner);
        let (fault, remaining) = slot.as_mut()?;
        let fault = *fault;
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(fault)
    }
}

impl DeviceClient for MockDevice {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), DeviceError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            self.connected = false;
            return Err(DeviceError::Connection {
                endpoint: format!("{host}:{port}"),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn read_block(&mut self, start: u16, count: u16, _unit_id: u8) -> Result<Vec<u16>, DeviceError> {
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        if let Some(fault) = self.take_read_fault() {
            let err = fault.to_error();
            if err.requires_reconnect() {
                self.connected = false;
            }
            return Err(err);
        }

        let registers = self.shared.registers.lock().unwrap_or_else(PoisonError::into_inner);
        let start = usize::from(start);
        Ok((start..start + usize::from(count))
            .map(|addr| registers.get(addr).copied().unwrap_or(0))
            .collect())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
