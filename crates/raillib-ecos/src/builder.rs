//! EcosBuilder -- fluent builder for constructing [`EcosStation`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! the network address, timeouts, retry policy and the initial
//! synchronisation before the connection is established.
//!
//! # Example
//!
//! ```no_run
//! use raillib_ecos::builder::EcosBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> raillib_core::Result<()> {
//! let station = EcosBuilder::new("192.168.1.50")
//!     .command_timeout(Duration::from_secs(1))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use raillib_core::error::{Error, Result};
use raillib_core::events::StationEvent;
use raillib_core::transport::Transport;
use raillib_transport::{ECOS_DEFAULT_PORT, TcpTransport};

use crate::commands;
use crate::io::{IoConfig, spawn_io_task};
use crate::managers::EntityManagers;
use crate::station::{EcosStation, ManagerHandler};

/// Number of locomotive functions read during synchronisation.
pub const DEFAULT_FUNCTION_COUNT: u8 = 29;

/// Fluent builder for [`EcosStation`].
pub struct EcosBuilder {
    host: String,
    port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
    auto_retry: bool,
    max_retries: u32,
    subscribe_events: bool,
    sync_on_connect: bool,
    function_count: u8,
    event_capacity: usize,
}

impl EcosBuilder {
    /// Create a new builder for the station at `host`.
    pub fn new(host: &str) -> Self {
        EcosBuilder {
            host: host.to_string(),
            port: ECOS_DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            auto_retry: true,
            max_retries: 2,
            subscribe_events: true,
            sync_on_connect: true,
            function_count: DEFAULT_FUNCTION_COUNT,
            event_capacity: 256,
        }
    }

    /// Override the TCP port (default: 15471).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the TCP connect timeout (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the timeout for the reply to a single command (default: 2s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable resending a command whose reply timed out.
    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    /// Set the maximum number of resends (default: 2).
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Request views on every object so the station reports changes
    /// (default: true).
    pub fn subscribe_events(mut self, enabled: bool) -> Self {
        self.subscribe_events = enabled;
        self
    }

    /// Read all entity tables right after connecting (default: true).
    pub fn sync_on_connect(mut self, enabled: bool) -> Self {
        self.sync_on_connect = enabled;
        self
    }

    /// Number of functions read per locomotive during synchronisation
    /// (default: 29, F0..F28).
    pub fn function_count(mut self, count: u8) -> Self {
        self.function_count = count;
        self
    }

    /// Capacity of the event broadcast channel (default: 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build an [`EcosStation`] with a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a
    /// `MockTransport` from `raillib-test-harness`).
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<EcosStation> {
        if self.event_capacity == 0 {
            return Err(Error::InvalidParameter(
                "event_capacity must be at least 1".into(),
            ));
        }

        let config = IoConfig {
            command_timeout: self.command_timeout,
            auto_retry: self.auto_retry,
            max_retries: self.max_retries,
            shutdown_command: self
                .subscribe_events
                .then(|| commands::cmd_release_view(commands::BASE_OBJECT)),
            ..IoConfig::default()
        };

        let managers = Arc::new(EntityManagers::new());
        let (event_tx, _) = broadcast::channel::<StationEvent>(self.event_capacity);
        let io = spawn_io_task(
            transport,
            config,
            event_tx.clone(),
            Box::new(ManagerHandler::new(Arc::clone(&managers))),
        );

        // The reply is merged into the tables by the handler.
        let reply = io
            .command(commands::cmd_read_info(), self.command_timeout)
            .await;
        if let Err(e) = reply {
            io.cancel.cancel();
            io.task.abort();
            return Err(e);
        }
        let mut info = managers.info();
        if info.manufacturer.is_empty() {
            info.manufacturer = "ESU".to_string();
        }
        if info.model.is_empty() {
            info.model = "ECoS".to_string();
        }
        tracing::info!(
            model = %info.model,
            version = info.application_version.as_deref().unwrap_or("?"),
            "connected to command station"
        );

        let station = EcosStation::new(
            io,
            managers,
            event_tx,
            info,
            self.command_timeout,
            self.function_count,
            self.subscribe_events,
        );
        if self.sync_on_connect {
            station.synchronize().await?;
        }
        Ok(station)
    }

    /// Build an [`EcosStation`] over TCP.
    pub async fn build(self) -> Result<EcosStation> {
        if self.host.is_empty() {
            return Err(Error::InvalidParameter("host is required for build()".into()));
        }
        let transport =
            TcpTransport::connect_host(&self.host, self.port, self.connect_timeout).await?;
        self.build_with_transport(Box::new(transport)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raillib_core::CommandStation;
    use raillib_test_harness::{MockTcpServer, MockTransport};

    const INFO_REPLY: &[u8] =
        b"<REPLY get(1, info)>\n1 ECoS2\n1 ApplicationVersion[4.2.13]\n<END 0 (OK)>\n";

    #[tokio::test]
    async fn builder_defaults() {
        let builder = EcosBuilder::new("ecos.local");
        assert_eq!(builder.port, 15471);
        assert!(builder.sync_on_connect);
        assert!(builder.subscribe_events);
        assert_eq!(builder.function_count, DEFAULT_FUNCTION_COUNT);
    }

    #[tokio::test]
    async fn info_failure_fails_build() {
        let mut mock = MockTransport::new();
        mock.expect(b"get(1, info)\n", b"");
        let result = EcosBuilder::new("ecos.local")
            .command_timeout(Duration::from_millis(100))
            .auto_retry(false)
            .sync_on_connect(false)
            .build_with_transport(Box::new(mock))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn zero_event_capacity_is_invalid() {
        let result = EcosBuilder::new("ecos.local")
            .event_capacity(0)
            .build_with_transport(Box::new(MockTransport::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn empty_host_is_invalid() {
        let result = EcosBuilder::new("").build().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn build_over_tcp() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect(b"get(1, info)\n", INFO_REPLY);
        server.expect(
            b"get(1, status)\n",
            b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
        );
        let port = server.port();
        server.start();

        let station = EcosBuilder::new("127.0.0.1")
            .port(port)
            .command_timeout(Duration::from_millis(500))
            .sync_on_connect(false)
            .subscribe_events(false)
            .build()
            .await
            .unwrap();
        assert_eq!(station.info().model, "ECoS2");
        assert!(station.power().await.unwrap());

        station.disconnect().await.unwrap();
        server.wait().await.unwrap();
    }
}
