//! Heartbeat monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use mesh_primitives::AgentId;

use crate::presence::AgentRegistry;

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Time without a heartbeat before an agent is declared disconnected.
    pub heartbeat_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Periodically scans the presence table for silent agents.
///
/// Agents past the heartbeat timeout are marked disconnected and their ids
/// are pushed onto the disconnect channel, which the dispatcher drains to
/// reassign in-flight work.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    registry: Arc<AgentRegistry>,
    config: MonitorConfig,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Creates a monitor over the given registry.
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, config: MonitorConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Starts the scan loop, returning the receiver of disconnect events.
    ///
    /// Scans run at a third of the heartbeat timeout so an agent is declared
    /// silent within one timeout plus one scan interval.
    pub fn start(&mut self) -> mpsc::UnboundedReceiver<AgentId> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::clone(&self.registry);
        let shutdown = Arc::clone(&self.shutdown);
        let timeout = self.config.heartbeat_timeout;

        let handle = tokio::spawn(async move {
            let scan_every = timeout / 3;
            let mut interval = tokio::time::interval(scan_every.max(Duration::from_millis(10)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !shutdown.load(Ordering::Acquire) {
                interval.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let cutoff = Utc::now()
                    - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(30));
                for snapshot in registry.all() {
                    if !snapshot.status.is_connected() || snapshot.last_heartbeat >= cutoff {
                        continue;
                    }
                    let agent_id = snapshot.descriptor.id();
                    if registry.mark_disconnected(agent_id) {
                        warn!(agent_id = %agent_id, "heartbeat timeout; reassigning in-flight work");
                        if tx.send(agent_id).is_err() {
                            // Receiver dropped; nothing left to notify.
                            return;
                        }
                    }
                }
            }
            info!("heartbeat monitor stopped");
        });

        self.worker = Some(handle);
        rx
    }

    /// Stops the scan loop.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_primitives::{AgentDescriptor, AgentStatus, ConnectionId};

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor::builder(AgentId::random())
            .name("monitored")
            .unwrap()
            .version("0.1.0")
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn silent_agent_is_disconnected() {
        let registry = Arc::new(AgentRegistry::in_memory());
        let descriptor = descriptor();
        let agent_id = descriptor.id();
        registry
            .register(descriptor, ConnectionId::random())
            .await
            .unwrap();

        // Age the heartbeat past the timeout.
        registry
            .update_heartbeat(agent_id, Utc::now() - chrono::Duration::seconds(5))
            .unwrap();

        let mut monitor = HeartbeatMonitor::new(
            Arc::clone(&registry),
            MonitorConfig {
                heartbeat_timeout: Duration::from_millis(50),
            },
        );
        let mut disconnects = monitor.start();

        let notified = tokio::time::timeout(Duration::from_secs(1), disconnects.recv())
            .await
            .expect("monitor notifies")
            .expect("channel open");
        assert_eq!(notified, agent_id);
        assert_eq!(
            registry.get(agent_id).unwrap().status,
            AgentStatus::Disconnected
        );

        monitor.stop();
    }

    #[tokio::test]
    async fn fresh_agent_is_left_alone() {
        let registry = Arc::new(AgentRegistry::in_memory());
        let descriptor = descriptor();
        let agent_id = descriptor.id();
        registry
            .register(descriptor, ConnectionId::random())
            .await
            .unwrap();

        let mut monitor = HeartbeatMonitor::new(
            Arc::clone(&registry),
            MonitorConfig {
                heartbeat_timeout: Duration::from_secs(30),
            },
        );
        let mut disconnects = monitor.start();

        let result =
            tokio::time::timeout(Duration::from_millis(100), disconnects.recv()).await;
        assert!(result.is_err(), "no disconnect expected");
        assert_eq!(registry.get(agent_id).unwrap().status, AgentStatus::Ready);

        monitor.stop();
    }
}
