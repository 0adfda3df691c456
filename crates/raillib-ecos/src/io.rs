//! IO task for the ECoS backend.
//!
//! One tokio task owns the transport exclusively. It sends commands, reads
//! replies, and merges every decoded block (replies and unsolicited events
//! alike) through an [`EventHandler`] in wire order, so the entity tables
//! always follow the station's own sequence of updates.
//!
//! Commands arrive on two channels. The real-time channel carries throttle
//! traffic (speed, direction, functions, accessories) and is always served
//! before the background channel, which carries bulk reads such as the
//! initial synchronisation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use raillib_core::error::{Error, Result};
use raillib_core::events::StationEvent;
use raillib_core::transport::Transport;

use crate::protocol::{EcosMessage, FrameBuffer};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for the IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// How long to wait for the reply to one command.
    pub command_timeout: Duration,
    /// Whether to resend a command whose reply timed out.
    pub auto_retry: bool,
    /// Maximum number of resends when `auto_retry` is enabled.
    pub max_retries: u32,
    /// Receive timeout of one idle read.
    pub idle_poll: Duration,
    /// Command sent (without waiting for a reply) on graceful shutdown.
    pub shutdown_command: Option<String>,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            command_timeout: Duration::from_secs(2),
            auto_retry: true,
            max_retries: 2,
            idle_poll: Duration::from_millis(100),
            shutdown_command: None,
        }
    }
}

/// A request sent from the station to the IO task.
pub enum Request {
    /// Send a command and wait for its `<REPLY ...>`.
    Command {
        command: String,
        reply: oneshot::Sender<Result<EcosMessage>>,
    },
    /// Graceful shutdown; returns the transport.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Callback for every decoded block.
///
/// The ECoS backend implements this to merge blocks into its entity tables
/// and publish the resulting [`StationEvent`]s.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, msg: &EcosMessage, event_tx: &broadcast::Sender<StationEvent>);
}

/// Handle to the IO task.
pub struct StationIo {
    /// Real-time command channel, served first.
    pub rt_tx: mpsc::Sender<Request>,
    /// Background command channel.
    pub bg_tx: mpsc::Sender<Request>,
    /// Cancellation token for the IO loop.
    pub cancel: CancellationToken,
    /// Join handle for the IO task.
    pub task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl StationIo {
    /// Send a command on the background channel and await its reply.
    pub async fn command(&self, command: String, timeout: Duration) -> Result<EcosMessage> {
        Self::send_command(&self.bg_tx, command, timeout).await
    }

    /// Send a command on the real-time channel and await its reply.
    pub async fn rt_command(&self, command: String, timeout: Duration) -> Result<EcosMessage> {
        Self::send_command(&self.rt_tx, command, timeout).await
    }

    async fn send_command(
        tx: &mpsc::Sender<Request>,
        command: String,
        timeout: Duration,
    ) -> Result<EcosMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Request::Command {
            command,
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::NotConnected)?;

        // Queueing behind other commands and retries is allowed for.
        match tokio::time::timeout(timeout * 4 + Duration::from_millis(500), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Whether the IO task is running on a live transport.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.task.is_finished()
    }

    /// Stop the IO task and close the transport.
    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .rt_tx
            .send(Request::Shutdown { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        match reply_rx.await {
            Ok(mut transport) => transport.close().await,
            Err(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task and return its handle.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    event_tx: broadcast::Sender<StationEvent>,
    handler: Box<dyn EventHandler>,
) -> StationIo {
    let (rt_tx, rt_rx) = mpsc::channel::<Request>(32);
    let (bg_tx, bg_rx) = mpsc::channel::<Request>(64);
    let cancel = CancellationToken::new();
    let connected = Arc::new(AtomicBool::new(true));

    let task = tokio::spawn(io_loop(
        transport,
        config,
        event_tx,
        handler,
        rt_rx,
        bg_rx,
        cancel.clone(),
        Arc::clone(&connected),
    ));

    StationIo {
        rt_tx,
        bg_tx,
        cancel,
        task,
        connected,
    }
}

// ---------------------------------------------------------------------------
// IO loop
// ---------------------------------------------------------------------------

/// Whether an error means the connection is gone for good.
fn is_fatal(e: &Error) -> bool {
    matches!(e, Error::ConnectionLost | Error::NotConnected | Error::Io(_))
}

/// The main IO loop.
///
/// `tokio::select! { biased; }` orders the arms:
/// 1. Cancellation
/// 2. Real-time commands
/// 3. Background commands
/// 4. Idle reads of unsolicited events
#[allow(clippy::too_many_arguments)]
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: IoConfig,
    event_tx: broadcast::Sender<StationEvent>,
    handler: Box<dyn EventHandler>,
    mut rt_rx: mpsc::Receiver<Request>,
    mut bg_rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let mut frames = FrameBuffer::new();

    loop {
        let lost = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("ECoS IO task cancelled");
                break;
            }

            req = rt_rx.recv() => match req {
                Some(Request::Shutdown { reply }) => {
                    connected.store(false, Ordering::Release);
                    shutdown(transport, &config, reply).await;
                    return;
                }
                Some(Request::Command { command, reply }) => {
                    run_command(
                        command,
                        reply,
                        &mut *transport,
                        &mut frames,
                        &config,
                        &*handler,
                        &event_tx,
                    )
                    .await
                }
                None => {
                    debug!("RT channel closed, exiting IO task");
                    break;
                }
            },

            req = bg_rx.recv() => match req {
                Some(Request::Shutdown { reply }) => {
                    connected.store(false, Ordering::Release);
                    shutdown(transport, &config, reply).await;
                    return;
                }
                Some(Request::Command { command, reply }) => {
                    run_command(
                        command,
                        reply,
                        &mut *transport,
                        &mut frames,
                        &config,
                        &*handler,
                        &event_tx,
                    )
                    .await
                }
                None => {
                    debug!("BG channel closed, exiting IO task");
                    break;
                }
            },

            lost = async {
                drain_frames(&mut frames, &*handler, &event_tx);
                let mut buf = [0u8; 4096];
                match transport.receive(&mut buf, config.idle_poll).await {
                    Ok(n) => {
                        frames.push(&buf[..n]);
                        drain_frames(&mut frames, &*handler, &event_tx);
                        false
                    }
                    Err(e) if is_fatal(&e) => {
                        tracing::warn!(error = %e, "connection to command station lost");
                        true
                    }
                    Err(_) => {
                        // Timeout: yield so commands and cancellation get a look in.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        false
                    }
                }
            } => lost,
        };

        if lost {
            connected.store(false, Ordering::Release);
            let _ = event_tx.send(StationEvent::Disconnected);
            return;
        }
    }

    connected.store(false, Ordering::Release);
}

async fn shutdown(
    mut transport: Box<dyn Transport>,
    config: &IoConfig,
    reply: oneshot::Sender<Box<dyn Transport>>,
) {
    debug!("ECoS IO task shutdown requested");
    if let Some(cmd) = &config.shutdown_command {
        let _ = transport.send(format!("{cmd}\n").as_bytes()).await;
    }
    let _ = reply.send(transport);
}

/// Execute one command and deliver its result. Returns `true` if the
/// connection was lost.
#[allow(clippy::too_many_arguments)]
async fn run_command(
    command: String,
    reply: oneshot::Sender<Result<EcosMessage>>,
    transport: &mut dyn Transport,
    frames: &mut FrameBuffer,
    config: &IoConfig,
    handler: &dyn EventHandler,
    event_tx: &broadcast::Sender<StationEvent>,
) -> bool {
    let result = execute_command(transport, frames, &command, config, handler, event_tx).await;
    let lost = matches!(&result, Err(e) if is_fatal(e));
    let _ = reply.send(result);
    lost
}

/// Send a command and wait for the reply that echoes it.
///
/// Events and unrelated replies that arrive in the meantime are handed to
/// the handler. A reply with a non-zero code is still returned as `Ok`;
/// the caller decides how to treat it.
async fn execute_command(
    transport: &mut dyn Transport,
    frames: &mut FrameBuffer,
    command: &str,
    config: &IoConfig,
    handler: &dyn EventHandler,
    event_tx: &broadcast::Sender<StationEvent>,
) -> Result<EcosMessage> {
    let retries = if config.auto_retry {
        config.max_retries
    } else {
        0
    };
    let line = format!("{command}\n");
    let mut recv_buf = [0u8; 4096];

    for attempt in 0..=retries {
        if attempt > 0 {
            debug!(attempt, command, "ECoS command retry");
            tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
        }

        transport.send(line.as_bytes()).await?;
        let deadline = tokio::time::Instant::now() + config.command_timeout;

        loop {
            while let Some(frame) = frames.next_frame() {
                match frame {
                    Ok(msg) => {
                        handler.handle(&msg, event_tx);
                        if msg.answers(command) {
                            return Ok(msg);
                        }
                        if !msg.is_event() {
                            debug!(header = msg.header(), command, "skipping unexpected reply");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed frame discarded"),
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            match transport.receive(&mut recv_buf, deadline - now).await {
                Ok(n) => frames.push(&recv_buf[..n]),
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
    }

    Err(Error::Timeout)
}

/// Hand every complete block in the buffer to the handler.
fn drain_frames(
    frames: &mut FrameBuffer,
    handler: &dyn EventHandler,
    event_tx: &broadcast::Sender<StationEvent>,
) {
    while let Some(frame) = frames.next_frame() {
        match frame {
            Ok(msg) => {
                if !msg.is_event() {
                    debug!(header = msg.header(), "reply without a waiting request");
                }
                handler.handle(&msg, event_tx);
            }
            Err(e) => tracing::warn!(error = %e, "malformed frame discarded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use raillib_test_harness::MockTransport;

    fn test_config() -> IoConfig {
        IoConfig {
            command_timeout: Duration::from_millis(200),
            auto_retry: false,
            max_retries: 0,
            idle_poll: Duration::from_millis(20),
            shutdown_command: None,
        }
    }

    struct NullEventHandler;

    impl EventHandler for NullEventHandler {
        fn handle(&self, _msg: &EcosMessage, _event_tx: &broadcast::Sender<StationEvent>) {}
    }

    /// Records the header of every block it sees and turns `status` rows of
    /// events into power events.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EventHandler for RecordingHandler {
        fn handle(&self, msg: &EcosMessage, event_tx: &broadcast::Sender<StationEvent>) {
            self.seen.lock().push(msg.header().to_string());
            if msg.is_event() {
                if let Some(status) = msg.row(1).and_then(|r| r.get("status")) {
                    let _ = event_tx.send(StationEvent::PowerChanged { on: status == "GO" });
                }
            }
        }
    }

    #[tokio::test]
    async fn command_returns_matching_reply() {
        let mut mock = MockTransport::new();
        mock.expect(
            b"get(1, status)\n",
            b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
        );
        let (event_tx, _) = broadcast::channel(16);
        let io = spawn_io_task(Box::new(mock), test_config(), event_tx, Box::new(NullEventHandler));

        let msg = io
            .command("get(1, status)".into(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(msg.row(1).unwrap().get("status"), Some("GO"));

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_is_returned_not_retried() {
        let mut mock = MockTransport::new();
        mock.expect(
            b"set(1000, speed[5])\n",
            b"<REPLY set(1000, speed[5])>\n<END 25 (NERROR_NOCONTROL)>\n",
        );
        let handle = mock.handle();
        let (event_tx, _) = broadcast::channel(16);
        let mut config = test_config();
        config.auto_retry = true;
        config.max_retries = 3;
        let io = spawn_io_task(Box::new(mock), config, event_tx, Box::new(NullEventHandler));

        let msg = io
            .rt_command("set(1000, speed[5])".into(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!msg.is_valid());
        assert_eq!(msg.error_code(), 25);
        assert_eq!(handle.sent_data().len(), 1);

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_event_is_handled_before_reply() {
        let mut mock = MockTransport::new();
        mock.expect(
            b"get(1000, speed)\n",
            b"<EVENT 1>\n1 status[STOP]\n<END 0 (OK)>\n<REPLY get(1000, speed)>\n1000 speed[3]\n<END 0 (OK)>\n",
        );
        let handler = RecordingHandler::default();
        let seen = Arc::clone(&handler.seen);
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let io = spawn_io_task(Box::new(mock), test_config(), event_tx, Box::new(handler));

        let msg = io
            .command("get(1000, speed)".into(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(msg.object_id(), 1000);
        assert_eq!(
            *seen.lock(),
            vec!["1".to_string(), "get(1000, speed)".to_string()]
        );
        assert_eq!(
            event_rx.recv().await.unwrap(),
            StationEvent::PowerChanged { on: false }
        );

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_without_reply() {
        let mut mock = MockTransport::new();
        mock.expect(b"get(1, status)\n", b"");
        let (event_tx, _) = broadcast::channel(16);
        let io = spawn_io_task(Box::new(mock), test_config(), event_tx, Box::new(NullEventHandler));

        let result = io
            .command("get(1, status)".into(), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn retry_resends_after_timeout() {
        let mut mock = MockTransport::new();
        mock.expect(b"get(1, status)\n", b"");
        mock.expect(
            b"get(1, status)\n",
            b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
        );
        let handle = mock.handle();
        let (event_tx, _) = broadcast::channel(16);
        let mut config = test_config();
        config.auto_retry = true;
        config.max_retries = 1;
        let io = spawn_io_task(Box::new(mock), config, event_tx, Box::new(NullEventHandler));

        let msg = io
            .command("get(1, status)".into(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(msg.is_valid());
        assert_eq!(handle.sent_data().len(), 2);

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn idle_events_reach_handler() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let io = spawn_io_task(
            Box::new(mock),
            test_config(),
            event_tx,
            Box::new(RecordingHandler::default()),
        );

        // Split across two reads.
        handle.inject(b"<EVENT 1>\n1 sta");
        handle.inject(b"tus[GO]\n<END 0 (OK)>\n");

        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, StationEvent::PowerChanged { on: true });

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn connection_loss_emits_disconnected() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let io = spawn_io_task(Box::new(mock), test_config(), event_tx, Box::new(NullEventHandler));
        assert!(io.is_connected());

        handle.drop_connection();
        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, StationEvent::Disconnected);

        let _ = io.task.await;
        let (reply_tx, _) = oneshot::channel();
        assert!(
            io.bg_tx
                .send(Request::Command {
                    command: "get(1, status)".into(),
                    reply: reply_tx,
                })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn shutdown_sends_shutdown_command() {
        let mut mock = MockTransport::new();
        mock.expect(b"release(1, view)\n", b"");
        let handle = mock.handle();
        let (event_tx, _) = broadcast::channel(16);
        let mut config = test_config();
        config.shutdown_command = Some("release(1, view)".into());
        let io = spawn_io_task(Box::new(mock), config, event_tx, Box::new(NullEventHandler));

        io.close().await.unwrap();
        assert_eq!(handle.sent_lines(), vec!["release(1, view)".to_string()]);
        assert!(!io.is_connected());
    }

    #[tokio::test]
    async fn command_after_close_is_not_connected() {
        let mock = MockTransport::new();
        let (event_tx, _) = broadcast::channel(16);
        let io = spawn_io_task(Box::new(mock), test_config(), event_tx, Box::new(NullEventHandler));
        io.close().await.unwrap();

        let result = io
            .command("get(1, status)".into(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
