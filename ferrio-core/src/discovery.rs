//! Periodic registry traffic: heartbeat broadcast (push) and data-node list
//! refresh (pull).
//!
//! Pushes go to every configured registry so replicas converge without
//! gossip; the pull walks registries in order and keeps the previous
//! snapshot when all of them are down. Every connection is short-lived and
//! bounded by the shared connect timeout.

use crate::client::Connection;
use crate::node::DataNodeEntry;
use crate::wire::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;

pub const DATA_PUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const NAME_PUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const PULL_INTERVAL: Duration = Duration::from_secs(10);

/// Shared snapshot of the live data-service set, replaced atomically by the
/// pull task and read by the location selector.
pub type DataNodeSnapshot = Arc<RwLock<Vec<DataNodeEntry>>>;

async fn broadcast_once(
    registries: &[String],
    token: &str,
    command: Command,
    payload: String,
    await_ack: bool,
) {
    for registry in registries {
        let result = async {
            let mut conn = Connection::connect(registry, token).await?;
            if await_ack {
                conn.request(command, payload.clone()).await.map(|_| ())
            } else {
                conn.send_only(command, payload.clone()).await
            }
        }
        .await;

        if let Err(error) = result {
            tracing::debug!("registry {} unreachable: {}", registry, error);
        }
    }
}

/// Data-service push loop. The first tick registers (and reads the ack);
/// every later tick is a plain heartbeat carrying `addr|freeSpace`.
pub fn spawn_datanode_push(
    registries: Vec<String>,
    token: String,
    advertised: String,
    free_space: impl Fn() -> i64 + Send + Sync + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(DATA_PUSH_INTERVAL);
        let mut registered = false;
        loop {
            ticker.tick().await;
            let payload = DataNodeEntry {
                address: advertised.clone(),
                free_space: free_space(),
            }
            .to_wire();
            let command = if registered {
                Command::RegistryHeartbeat
            } else {
                Command::RegistryRegister
            };
            broadcast_once(&registries, &token, command, payload, !registered).await;
            registered = true;
        }
    })
}

/// Name-service push loop: address-only heartbeats every 10 s, with an
/// initial registration.
pub fn spawn_namenode_push(
    registries: Vec<String>,
    token: String,
    advertised: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(NAME_PUSH_INTERVAL);
        let mut registered = false;
        loop {
            ticker.tick().await;
            let command = if registered {
                Command::RegistryHeartbeatNameNode
            } else {
                Command::RegistryRegisterNameNode
            };
            broadcast_once(&registries, &token, command, advertised.clone(), !registered).await;
            registered = true;
        }
    })
}

/// Refresh `snapshot` from the first reachable registry once.
pub async fn pull_data_nodes(
    registries: &[String],
    token: &str,
    snapshot: &DataNodeSnapshot,
) -> bool {
    for registry in registries {
        let fetched = async {
            let mut conn = Connection::connect(registry, token).await?;
            conn.fetch_data_nodes().await
        }
        .await;

        match fetched {
            Ok(nodes) => {
                tracing::debug!("data-node snapshot from {}: {} entries", registry, nodes.len());
                *snapshot.write().await = nodes;
                return true;
            }
            Err(error) => {
                tracing::debug!("registry {} pull failed: {}", registry, error);
            }
        }
    }

    tracing::warn!("all registries unreachable; keeping previous data-node snapshot");
    false
}

/// Name-service pull loop feeding the location selector.
pub fn spawn_datanode_pull(
    registries: Vec<String>,
    token: String,
    snapshot: DataNodeSnapshot,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PULL_INTERVAL);
        loop {
            ticker.tick().await;
            pull_data_nodes(&registries, &token, &snapshot).await;
        }
    })
}
