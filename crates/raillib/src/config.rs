//! Connection configuration for [`Dispatcher::connect`](crate::Dispatcher::connect).
//!
//! The concrete backend is picked from [`StationKind`] at startup; there is
//! no runtime lookup of driver types.

use std::sync::Arc;
use std::time::Duration;

use raillib_core::error::Result;
use raillib_core::station::CommandStation;
use raillib_ecos::EcosBuilder;
use raillib_transport::ECOS_DEFAULT_PORT;

/// Supported command-station families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationKind {
    /// ESU ECoS / ECoS2 (and the Märklin CS1 "reloaded" firmware).
    Ecos,
}

/// How to reach and initialise a command station.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub kind: StationKind,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub auto_retry: bool,
    pub max_retries: u32,
    /// Ask the station to report changes of every object.
    pub subscribe_events: bool,
    /// Read all entity tables after connecting.
    pub sync_on_connect: bool,
    /// Locomotive functions read per locomotive.
    pub function_count: u8,
    pub event_capacity: usize,
}

impl StationConfig {
    /// Defaults for an ECoS at `host`.
    pub fn ecos(host: &str) -> Self {
        StationConfig {
            kind: StationKind::Ecos,
            host: host.to_string(),
            port: ECOS_DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            auto_retry: true,
            max_retries: 2,
            subscribe_events: true,
            sync_on_connect: true,
            function_count: raillib_ecos::builder::DEFAULT_FUNCTION_COUNT,
            event_capacity: 256,
        }
    }

    /// Connect to the configured station.
    pub async fn connect(&self) -> Result<Arc<dyn CommandStation>> {
        match self.kind {
            StationKind::Ecos => {
                let station = EcosBuilder::new(&self.host)
                    .port(self.port)
                    .connect_timeout(self.connect_timeout)
                    .command_timeout(self.command_timeout)
                    .auto_retry(self.auto_retry)
                    .max_retries(self.max_retries)
                    .subscribe_events(self.subscribe_events)
                    .sync_on_connect(self.sync_on_connect)
                    .function_count(self.function_count)
                    .event_capacity(self.event_capacity)
                    .build()
                    .await?;
                Ok(Arc::new(station))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecos_defaults() {
        let config = StationConfig::ecos("192.168.1.50");
        assert_eq!(config.kind, StationKind::Ecos);
        assert_eq!(config.port, 15471);
        assert!(config.sync_on_connect);
        assert_eq!(config.function_count, 29);
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = StationConfig::ecos("127.0.0.1");
        config.port = port;
        config.connect_timeout = Duration::from_millis(500);
        assert!(config.connect().await.is_err());
    }
}
