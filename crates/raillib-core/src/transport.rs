//! Transport trait for command-station communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a command
//! station. The ESU ECoS speaks its text protocol over TCP; serial-attached
//! stations and the mock transport from `raillib-test-harness` implement the
//! same trait, so protocol engines never touch a socket directly.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a command station.
///
/// Implementations deliver raw bytes in order. Frame assembly (waiting for
/// the `<END ...>` trailer of a reply) is done by the protocol engine that
/// owns the transport, not here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the command station.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes into the provided buffer.
    ///
    /// Returns the number of bytes read. Waits up to `timeout`; returns
    /// [`Error::Timeout`](crate::error::Error::Timeout) if nothing arrives
    /// within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the connection.
    ///
    /// Afterwards `send()` and `receive()` return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
