//! raillib-test-harness: Test utilities and mock transports for raillib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! protocol engines without a real command station, and [`MockTcpServer`]
//! for testing the full stack over a localhost TCP connection.

pub mod mock_tcp;
pub mod mock_transport;

pub use mock_tcp::MockTcpServer;
pub use mock_transport::{MockHandle, MockTransport};
