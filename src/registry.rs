use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tokio::sync::RwLock;

use crate::clock::Millis;
use crate::error::{OrchestratorError, Result};
use crate::message::{Command, CommandTemplate, Device, ServerMessage};
use crate::metrics;

pub type Tx = Sender<ServerMessage>;
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub filename: String,
    pub offset_ms: Millis,
    pub reported_at: Millis,
}

pub struct Connection {
    pub id: ConnectionId,
    pub sender: Tx,
    pub authorized_clients: Vec<Device>,
    pub last_status: Option<ClientStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Updated,
    /// Took over from an older connection for the same username.
    Replaced,
}

/// Connected user as exposed to the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub devices: Vec<Device>,
    pub last_status: Option<ClientStatus>,
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, OrchestratorError)>,
}

/// Live connections keyed by username, and the only way commands reach them.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        ConnectionRegistry {
            connections: Default::default(),
            send_timeout,
        }
    }

    /// Registers `username` on connection `id`. Re-registering from the same
    /// connection replaces the device list; a different connection for the
    /// same username takes over and the older one is told it was replaced.
    pub async fn register(
        &self,
        username: &str,
        id: ConnectionId,
        sender: Tx,
        authorized_clients: Vec<Device>,
    ) -> Registration {
        let devices: Vec<Device> = authorized_clients
            .into_iter()
            .filter(Device::is_complete)
            .collect();
        let mut connections = self.connections.write().await;
        match connections.get_mut(username) {
            Some(existing) if existing.id == id => {
                info!(
                    "{} updated authorized clients: {:?}",
                    username,
                    titles(&devices)
                );
                existing.authorized_clients = devices;
                Registration::Updated
            }
            Some(existing) => {
                info!(
                    "{} reconnected on connection {}, replacing connection {} with clients {:?}",
                    username,
                    id,
                    existing.id,
                    titles(&devices)
                );
                // The old socket may be half-open, so never wait on it.
                if let Err(e) = existing.sender.try_send(ServerMessage::RegisterDeclined {
                    reason: "replaced by a newer connection".to_string(),
                }) {
                    debug!("could not notify replaced connection {}: {}", existing.id, e);
                }
                *existing = Connection {
                    id,
                    sender,
                    authorized_clients: devices,
                    last_status: None,
                };
                Registration::Replaced
            }
            None => {
                info!("{} registered with clients {:?}", username, titles(&devices));
                connections.insert(
                    username.to_string(),
                    Connection {
                        id,
                        sender,
                        authorized_clients: devices,
                        last_status: None,
                    },
                );
                Registration::New
            }
        }
    }

    /// Removes the connection if it is still the one identified by `id`.
    pub async fn unregister(&self, username: &str, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(username).map(|c| c.id) == Some(id) {
            connections.remove(username);
            info!("{} unregistered", username);
            true
        } else {
            false
        }
    }

    pub async fn is_registered(&self, username: &str, id: ConnectionId) -> bool {
        self.connections.read().await.get(username).map(|c| c.id) == Some(id)
    }

    pub async fn authorized_clients(&self, username: &str) -> Vec<Device> {
        self.connections
            .read()
            .await
            .get(username)
            .map(|c| c.authorized_clients.clone())
            .unwrap_or_default()
    }

    pub async fn record_status(&self, username: &str, status: ClientStatus) {
        if let Some(connection) = self.connections.write().await.get_mut(username) {
            connection.last_status = Some(status);
        }
    }

    pub async fn last_status(&self, username: &str) -> Option<ClientStatus> {
        self.connections
            .read()
            .await
            .get(username)
            .and_then(|c| c.last_status.clone())
    }

    pub async fn users(&self) -> Vec<UserSummary> {
        let mut users: Vec<UserSummary> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(username, c)| UserSummary {
                username: username.clone(),
                devices: c.authorized_clients.clone(),
                last_status: c.last_status.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Queues `message` for `username`. Fire-and-forget: a missing
    /// connection, a closed channel, or a queue that stays full past the send
    /// timeout all count as offline.
    pub async fn send(&self, username: &str, message: ServerMessage) -> Result<()> {
        let sender = self
            .connections
            .read()
            .await
            .get(username)
            .map(|c| c.sender.clone())
            .ok_or_else(|| OrchestratorError::UserOffline(username.to_string()))?;
        match tokio::time::timeout(self.send_timeout, sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("channel to {} closed: {}", username, e);
                Err(OrchestratorError::UserOffline(username.to_string()))
            }
            Err(_) => {
                warn!("send to {} timed out", username);
                Err(OrchestratorError::UserOffline(username.to_string()))
            }
        }
    }

    pub async fn dispatch(&self, username: &str, command: Command) -> Result<()> {
        let kind = command.kind();
        let device = command.device().title.clone();
        match self.send(username, command.into()).await {
            Ok(()) => {
                debug!("{} sent to {} on {}", kind, username, device);
                metrics::COMMANDS_SENT.with_label_values(&[kind]).inc();
                Ok(())
            }
            Err(e) => {
                metrics::COMMANDS_DROPPED.inc();
                Err(e)
            }
        }
    }

    /// Sends each recipient the template instantiated for their device.
    /// Every send is independent; failures are logged and reported.
    pub async fn broadcast<I>(&self, recipients: I, template: &CommandTemplate) -> BroadcastReport
    where
        I: IntoIterator<Item = (String, Device)>,
    {
        let sends = recipients.into_iter().map(|(username, device)| async move {
            let result = self.dispatch(&username, template.for_device(device)).await;
            (username, result)
        });
        let mut report = BroadcastReport::default();
        for (username, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(username),
                Err(e) => {
                    info!("Dropping {:?} for {}: {}", template, username, e);
                    report.failed.push((username, e));
                }
            }
        }
        report
    }
}

fn titles(devices: &[Device]) -> Vec<&str> {
    devices.iter().map(|d| d.title.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{channel, Receiver};

    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_millis(50))
    }

    fn local() -> Device {
        Device::new("Local", "m1")
    }

    async fn connect(
        registry: &ConnectionRegistry,
        username: &str,
        id: ConnectionId,
    ) -> Receiver<ServerMessage> {
        let (tx, rx) = channel(8);
        registry.register(username, id, tx, vec![local()]).await;
        rx
    }

    #[tokio::test]
    async fn newer_connection_replaces_half_open_one() {
        let registry = registry();
        // The first connection never closed; its receiver is still alive.
        let mut stale = connect(&registry, "alice", 1).await;
        let (tx, mut fresh) = channel(8);
        let devices = vec![Device::new("Den", "m2")];
        assert_eq!(
            registry.register("alice", 2, tx, devices.clone()).await,
            Registration::Replaced
        );
        assert!(registry.is_registered("alice", 2).await);
        assert!(!registry.is_registered("alice", 1).await);
        assert_eq!(registry.authorized_clients("alice").await, devices);
        assert!(matches!(
            stale.recv().await,
            Some(ServerMessage::RegisterDeclined { .. })
        ));

        registry
            .dispatch("alice", Command::Stop { device: Device::new("Den", "m2") })
            .await
            .unwrap();
        assert!(matches!(fresh.recv().await, Some(ServerMessage::Command { .. })));
        assert!(stale.try_recv().is_err());

        // The old socket closing later leaves the new one in place.
        assert!(!registry.unregister("alice", 1).await);
        assert!(registry.is_registered("alice", 2).await);
    }

    #[tokio::test]
    async fn replacing_a_full_connection_does_not_block() {
        let registry = registry();
        let (tx, _stuck) = channel(1);
        registry.register("alice", 1, tx.clone(), vec![local()]).await;
        tx.try_send(ServerMessage::RegisterDeclined {
            reason: "filler".to_string(),
        })
        .unwrap();
        let (tx, _fresh) = channel(8);
        assert_eq!(
            registry.register("alice", 2, tx, vec![local()]).await,
            Registration::Replaced
        );
    }

    #[tokio::test]
    async fn same_connection_updates_devices() {
        let registry = registry();
        let _rx = connect(&registry, "alice", 1).await;
        let (tx, _unused) = channel(8);
        let devices = vec![Device::new("Den", "m2"), Device::new("", "broken")];
        assert_eq!(
            registry.register("alice", 1, tx, devices).await,
            Registration::Updated
        );
        assert_eq!(
            registry.authorized_clients("alice").await,
            vec![Device::new("Den", "m2")]
        );
    }

    #[tokio::test]
    async fn stale_connection_cannot_unregister_newer_one() {
        let registry = registry();
        let _rx = connect(&registry, "alice", 1).await;
        assert!(registry.unregister("alice", 1).await);
        let _rx = connect(&registry, "alice", 2).await;
        assert!(!registry.unregister("alice", 1).await);
        assert!(registry.is_registered("alice", 2).await);
    }

    #[tokio::test]
    async fn repeated_register_unregister_cycles() {
        let registry = registry();
        for id in 0..5 {
            let _rx = connect(&registry, "alice", id).await;
            assert!(registry.unregister("alice", id).await);
        }
        assert!(registry.users().await.is_empty());
    }

    #[tokio::test]
    async fn send_to_missing_user_is_offline() {
        let registry = registry();
        let result = registry.dispatch("ghost", Command::Stop { device: local() }).await;
        assert_eq!(
            result,
            Err(OrchestratorError::UserOffline("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn send_to_dropped_channel_is_offline() {
        let registry = registry();
        let rx = connect(&registry, "alice", 1).await;
        drop(rx);
        let result = registry.dispatch("alice", Command::Pause { device: local() }).await;
        assert_eq!(
            result,
            Err(OrchestratorError::UserOffline("alice".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out_as_offline() {
        let registry = registry();
        let (tx, _rx) = channel(1);
        registry.register("slow", 1, tx, vec![local()]).await;
        let mut results = Vec::new();
        for _ in 0..2 {
            results.push(registry.dispatch("slow", Command::Pause { device: local() }).await);
        }
        assert_eq!(
            results,
            vec![
                Ok(()),
                Err(OrchestratorError::UserOffline("slow".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_reports_partial_failure() {
        let registry = registry();
        let mut alice = connect(&registry, "alice", 1).await;
        let recipients = vec![
            ("alice".to_string(), local()),
            ("bob".to_string(), Device::new("Den", "m2")),
        ];
        let report = registry.broadcast(recipients, &CommandTemplate::Pause).await;
        assert_eq!(report.delivered, vec!["alice".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bob");
        assert_eq!(
            alice.recv().await,
            Some(ServerMessage::from(Command::Pause { device: local() }))
        );
    }

    #[tokio::test]
    async fn records_last_status() {
        let registry = registry();
        let _rx = connect(&registry, "alice", 1).await;
        let status = ClientStatus {
            filename: "a.mkv".to_string(),
            offset_ms: 1000,
            reported_at: 5,
        };
        registry.record_status("alice", status.clone()).await;
        assert_eq!(registry.last_status("alice").await, Some(status));
    }
}
