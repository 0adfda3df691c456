//! Mock transport for deterministic testing of protocol engines.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. On top of scripted exchanges it can deliver
//! unsolicited frames (station events) injected through a [`MockHandle`]
//! after the transport has been moved into an IO task.
//!
//! # Example
//!
//! ```
//! use raillib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! mock.expect(
//!     b"get(1, status)\n",
//!     b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
//! );
//! let handle = mock.handle();
//! handle.inject(b"<EVENT 1>\n1 status[STOP]\n<END 0 (OK)>\n");
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use raillib_core::error::{Error, Result};
use raillib_core::transport::Transport;

/// A pre-loaded request/response pair.
#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// State shared between the transport and its handles.
#[derive(Debug)]
struct Shared {
    connected: bool,
    sent_log: Vec<Vec<u8>>,
    injected: VecDeque<Vec<u8>>,
}

/// A mock [`Transport`] for testing protocol engines without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; the
/// corresponding response is then returned by subsequent `receive()` calls.
/// When no scripted response is pending, injected frames are delivered in
/// injection order. With nothing to deliver, `receive()` returns
/// [`Error::Timeout`] immediately.
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    pending_response: Option<Vec<u8>>,
    response_cursor: usize,
    shared: Arc<Mutex<Shared>>,
}

/// Cloneable handle to a [`MockTransport`] that has been moved elsewhere.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    /// Queue an unsolicited frame for delivery by the next idle `receive()`.
    pub fn inject(&self, data: &[u8]) {
        self.shared.lock().injected.push_back(data.to_vec());
    }

    /// Everything sent through the transport so far, one entry per `send()`.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sent_log.clone()
    }

    /// Sent data decoded as UTF-8 lines.
    pub fn sent_lines(&self) -> Vec<String> {
        self.shared
            .lock()
            .sent_log
            .iter()
            .map(|d| String::from_utf8_lossy(d).trim_end().to_string())
            .collect()
    }

    /// Simulate the station dropping the connection.
    pub fn drop_connection(&self) {
        self.shared.lock().connected = false;
    }
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            pending_response: None,
            response_cursor: 0,
            shared: Arc::new(Mutex::new(Shared {
                connected: true,
                sent_log: Vec::new(),
                injected: VecDeque::new(),
            })),
        }
    }

    /// Add an expected request/response pair.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// A handle for injecting frames and inspecting traffic later.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// All data sent through this transport, one entry per `send()`.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sent_log.clone()
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state. While disconnected, `send()` and
    /// `receive()` return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.shared.lock().connected = connected;
    }

    fn check_connected(&self) -> Result<()> {
        if self.shared.lock().connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_connected()?;
        self.shared.lock().sent_log.push(data.to_vec());

        let expectation = self
            .expectations
            .pop_front()
            .ok_or_else(|| Error::Protocol("no more expectations in mock transport".into()))?;
        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }
        self.pending_response = Some(expectation.response);
        self.response_cursor = 0;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        self.check_connected()?;

        if let Some(ref response) = self.pending_response {
            let remaining = &response[self.response_cursor..];
            if !remaining.is_empty() {
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.response_cursor += n;
                if self.response_cursor >= response.len() {
                    self.pending_response = None;
                    self.response_cursor = 0;
                }
                return Ok(n);
            }
            self.pending_response = None;
            self.response_cursor = 0;
        }

        let mut shared = self.shared.lock();
        match shared.injected.pop_front() {
            Some(mut frame) if !frame.is_empty() => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                if n < frame.len() {
                    frame.drain(..n);
                    shared.injected.push_front(frame);
                }
                Ok(n)
            }
            _ => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.lock().connected = false;
        self.pending_response = None;
        self.response_cursor = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }
}
