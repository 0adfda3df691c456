//! Mock TCP command station for network-level testing.
//!
//! [`MockTcpServer`] is a localhost listener pre-loaded with a script of
//! request/response exchanges and unsolicited frames. It lets the whole
//! stack (TCP transport, IO task, station backend, dispatcher) be exercised
//! without a real command station.
//!
//! # Example
//!
//! ```
//! use raillib_test_harness::MockTcpServer;
//!
//! # async fn example() -> raillib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server.expect(
//!     b"get(1, status)\n",
//!     b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
//! );
//! server.push(b"<EVENT 1>\n1 status[STOP]\n<END 0 (OK)>\n");
//! let addr = server.addr().to_string();
//! server.start();
//! // ... connect a TcpTransport to `addr` ...
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use raillib_core::error::{Error, Result};

/// One step of the server script.
#[derive(Debug, Clone)]
enum Step {
    /// Read exactly `request`, then write `response`.
    Exchange { request: Vec<u8>, response: Vec<u8> },
    /// Write bytes without waiting for a request.
    Push(Vec<u8>),
}

/// A scripted TCP server for protocol tests.
///
/// The server accepts a single connection once [`start`](Self::start) is
/// called and runs its script in order. Any mismatch ends the task with an
/// error string that [`wait`](Self::wait) returns. After the script the
/// connection is held open until the client closes it.
pub struct MockTcpServer {
    addr: String,
    listener: Option<TcpListener>,
    script: VecDeque<Step>,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Bind a new server on a random localhost port.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {e}")))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();
        Ok(Self {
            addr,
            listener: Some(listener),
            script: VecDeque::new(),
            server_handle: None,
        })
    }

    /// Append a request/response exchange to the script.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.script.push_back(Step::Exchange {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Append an unsolicited frame to the script.
    pub fn push(&mut self, data: &[u8]) {
        self.script.push_back(Step::Push(data.to_vec()));
    }

    /// The `host:port` address clients should connect to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The port the server is bound to.
    pub fn port(&self) -> u16 {
        self.addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// Start accepting a single client and running the script.
    ///
    /// The listener is already bound, so clients may connect immediately.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let script: Vec<Step> = self.script.drain(..).collect();

        self.server_handle = Some(tokio::spawn(async move {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {e}"))?;
            run_script(&mut stream, &script).await?;

            // Hold the connection until the client hangs up.
            let mut sink = [0u8; 256];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
            Ok(())
        }));
    }

    /// Wait for the server task and return any script error.
    pub async fn wait(self) -> std::result::Result<(), String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Ok(()),
        }
    }
}

async fn run_script(stream: &mut TcpStream, script: &[Step]) -> std::result::Result<(), String> {
    for (i, step) in script.iter().enumerate() {
        let response = match step {
            Step::Push(data) => data,
            Step::Exchange { request, response } => {
                let mut buf = vec![0u8; request.len()];
                stream
                    .read_exact(&mut buf)
                    .await
                    .map_err(|e| format!("step {i}: read error: {e}"))?;
                if &buf != request {
                    return Err(format!(
                        "step {i}: request mismatch: expected {:?}, got {:?}",
                        String::from_utf8_lossy(request),
                        String::from_utf8_lossy(&buf)
                    ));
                }
                response
            }
        };
        stream
            .write_all(response)
            .await
            .map_err(|e| format!("step {i}: write error: {e}"))?;
        stream
            .flush()
            .await
            .map_err(|e| format!("step {i}: flush error: {e}"))?;
    }
    Ok(())
}
