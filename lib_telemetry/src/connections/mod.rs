//! # Connections Module
//!
//! This module owns the device side of the gateway: the `DeviceClient`
//! abstraction the poll loop drives, and its Modbus TCP implementation.
//!
//! A `DeviceClient` performs no retries of its own. Reconnect and retry policy
//! belongs to the caller, which decides per tick what to do with a failure.

use std::future::Future;

/// Typed device failures.
pub mod error;
/// Modbus TCP application header (MBAP) and PDU framing.
pub mod mbap;
/// Modbus TCP client over a single `TcpStream`.
pub mod modbus_tcp;
/// Scripted in-memory device for tests.
#[cfg(any(test, feature = "mock-device"))]
pub mod mock;

pub use error::{DeviceError, DeviceErrorKind, ExceptionCode};
pub use modbus_tcp::ModbusTcpClient;

/// # Device Client
///
/// A request/response capability against one remote device.
///
/// Once `connect` succeeds the connection is reused by every `read_block`
/// call. A `DeviceError::ConnectionLost` marks it unusable until `connect`
/// is called again.
pub trait DeviceClient: Send + 'static {
    /// Establishes the device connection, replacing any existing one.
    fn connect(
        &mut self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Reads `count` input registers starting at `start` from unit `unit_id`.
    ///
    /// On success the returned vector holds exactly `count` values in
    /// register order.
    fn read_block(
        &mut self,
        start: u16,
        count: u16,
        unit_id: u8,
    ) -> impl Future<Output = Result<Vec<u16>, DeviceError>> + Send;

    /// Whether a usable connection is currently held.
    fn is_connected(&self) -> bool;

    /// Drops the current connection, if any.
    fn disconnect(&mut self);
}
