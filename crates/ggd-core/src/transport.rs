//! Agent side of the agent/dispatcher link.
//!
//! The link owns the TCP session and reconnects with exponential backoff.
//! The agent sees it as a pair of channels: [`LinkEvent`]s in, outgoing
//! [`AgentMessage`]s out. Messages queued while disconnected are dropped on
//! reconnect; the agent re-announces itself with a fresh `Hello`.

use std::sync::Arc;
use std::time::Duration;

use ggd_types::{AgentMessage, DispatcherMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::framing::{read_message, write_message};
use crate::utils::{Backoff, GracefulShutdown, RetryConfig};

/// What the link reports to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Message(DispatcherMessage),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub addr: String,
    /// Restart the session when nothing arrives for this long.
    pub backend_silence: Duration,
    pub max_frame_bytes: usize,
    pub retry: RetryConfig,
}

impl LinkSettings {
    pub fn from_config(config: &ggd_config::Config) -> Self {
        Self {
            addr: config.agent_connect.clone(),
            backend_silence: config.backend_silence(),
            max_frame_bytes: config.max_frame_bytes,
            retry: RetryConfig {
                max_retries: u32::MAX,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(config.reconnect_max_delay_secs.max(1)),
                exponential_base: 2.0,
            },
        }
    }
}

/// Channel ends handed to the agent.
pub struct AgentLink {
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub outbox: mpsc::UnboundedSender<AgentMessage>,
}

enum SessionEnd {
    Lost(String),
    AgentGone,
    Shutdown,
}

/// Spawn the connection loop.
pub fn spawn_agent_link(
    settings: LinkSettings,
    shutdown: Arc<GracefulShutdown>,
) -> (AgentLink, JoinHandle<()>) {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(link_loop(settings, event_tx, outbox_rx, shutdown));
    (AgentLink { events, outbox }, task)
}

async fn link_loop(
    settings: LinkSettings,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut outbox: mpsc::UnboundedReceiver<AgentMessage>,
    shutdown: Arc<GracefulShutdown>,
) {
    let mut backoff = Backoff::new(settings.retry.clone());

    loop {
        if shutdown.is_shutting_down() {
            break;
        }

        match TcpStream::connect(&settings.addr).await {
            Ok(stream) => {
                info!(addr = %settings.addr, "Connected to dispatcher");
                backoff.reset();
                let mut stale = 0usize;
                while outbox.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(count = stale, "Dropped messages queued while disconnected");
                }
                if events.send(LinkEvent::Connected).is_err() {
                    break;
                }

                let end = session(stream, &settings, &events, &mut outbox, &shutdown).await;
                let _ = events.send(LinkEvent::Disconnected);
                match end {
                    SessionEnd::Lost(reason) => {
                        warn!(addr = %settings.addr, %reason, "Dispatcher connection lost")
                    }
                    SessionEnd::AgentGone | SessionEnd::Shutdown => break,
                }
            }
            Err(e) => {
                warn!(addr = %settings.addr, error = %e, "Failed to connect to dispatcher");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to dispatcher");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
        }
    }
    debug!("Agent link stopped");
}

async fn session(
    stream: TcpStream,
    settings: &LinkSettings,
    events: &mpsc::UnboundedSender<LinkEvent>,
    outbox: &mut mpsc::UnboundedReceiver<AgentMessage>,
    shutdown: &GracefulShutdown,
) -> SessionEnd {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let read_side = async {
        loop {
            let next = tokio::time::timeout(
                settings.backend_silence,
                read_message::<_, DispatcherMessage>(&mut reader, settings.max_frame_bytes),
            )
            .await;
            match next {
                Err(_) => return SessionEnd::Lost("dispatcher went silent".to_string()),
                Ok(Ok(Some(msg))) => {
                    if events.send(LinkEvent::Message(msg)).is_err() {
                        return SessionEnd::AgentGone;
                    }
                }
                Ok(Ok(None)) => return SessionEnd::Lost("closed by dispatcher".to_string()),
                Ok(Err(e)) => return SessionEnd::Lost(e.to_string()),
            }
        }
    };

    let write_side = async {
        while let Some(msg) = outbox.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                return SessionEnd::Lost(format!("write failed: {e}"));
            }
        }
        SessionEnd::AgentGone
    };

    tokio::select! {
        end = read_side => end,
        end = write_side => end,
        _ = shutdown.wait() => SessionEnd::Shutdown,
    }
}
