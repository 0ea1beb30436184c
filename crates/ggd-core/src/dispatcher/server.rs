//! TCP front of the dispatcher: one task per agent connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ggd_types::{AgentMessage, DispatcherMessage, GradeGridError, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::Dispatcher;
use crate::framing::{read_message, write_message};
use crate::utils::GracefulShutdown;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub ping_interval: Duration,
    /// Drop an agent after this many pings without any frame back.
    pub max_missed_pings: u32,
    pub max_frame_bytes: usize,
}

impl ServerSettings {
    pub fn from_config(config: &ggd_config::Config) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            max_missed_pings: config.max_missed_pings.max(1),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Bind the agent listener. Failure here is fatal for the dispatcher.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GradeGridError::Config(format!("Failed to bind {addr}: {e}")))
}

/// Accept agent connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    settings: ServerSettings,
    shutdown: Arc<GracefulShutdown>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Dispatcher listening for agents");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer.to_string(),
                        dispatcher.clone(),
                        settings.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept agent connection"),
            },
            _ = shutdown.wait() => break,
        }
    }

    info!("Dispatcher listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    dispatcher: Dispatcher,
    settings: ServerSettings,
    shutdown: Arc<GracefulShutdown>,
) {
    let _ = stream.set_nodelay(true);
    let (agent, mut outbound) = dispatcher.register_connection(peer.clone()).await;
    let (mut reader, mut writer) = stream.into_split();
    let missed = AtomicU32::new(0);

    let read_side = async {
        loop {
            match read_message::<_, AgentMessage>(&mut reader, settings.max_frame_bytes).await {
                Ok(Some(msg)) => {
                    missed.store(0, Ordering::Relaxed);
                    if !matches!(msg, AgentMessage::Pong) {
                        debug!(agent, kind = msg.kind(), "Message from agent");
                    }
                    dispatcher.handle_agent_message(agent, msg).await;
                }
                Ok(None) => return "closed by agent".to_string(),
                Err(e) => return e.to_string(),
            }
        }
    };

    let write_side = async {
        let mut ticker = tokio::time::interval(settings.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = write_message(&mut writer, &msg).await {
                            return format!("write failed: {e}");
                        }
                    }
                    None => return "connection dropped by dispatcher".to_string(),
                },
                _ = ticker.tick() => {
                    if missed.fetch_add(1, Ordering::Relaxed) >= settings.max_missed_pings {
                        return "agent stopped answering pings".to_string();
                    }
                    if let Err(e) = write_message(&mut writer, &DispatcherMessage::Ping).await {
                        return format!("write failed: {e}");
                    }
                }
            }
        }
    };

    let reason = tokio::select! {
        reason = read_side => reason,
        reason = write_side => reason,
        _ = shutdown.wait() => "shutdown".to_string(),
    };
    info!(agent, peer = %peer, %reason, "Agent connection closed");
    dispatcher.agent_disconnected(agent).await;
}
