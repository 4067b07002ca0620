//! The registry service: liveness tables for data and name services.
//!
//! Registration and heartbeat are the same upsert; `list` filters by
//! heartbeat age and evicts what it encounters, and a background sweeper
//! removes expired members with compare-and-delete semantics so a record
//! refreshed mid-sweep survives.

use super::{check_token, reject_unknown, send_reply, Wire};
use crate::config::RegistryConfig;
use dashmap::DashMap;
use ferrio_core::{Command, DataNodeEntry, Frame, FrameCodec, Packet, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub free_space: i64,
    pub last_heartbeat: i64,
}

pub struct RegistryService {
    token: String,
    timeout_ms: i64,
    data_nodes: DashMap<String, NodeRecord>,
    name_nodes: DashMap<String, NodeRecord>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RegistryService {
    pub fn new(token: String, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            token,
            timeout_ms: timeout.as_millis() as i64,
            data_nodes: DashMap::new(),
            name_nodes: DashMap::new(),
        })
    }

    fn upsert(table: &DashMap<String, NodeRecord>, address: String, free_space: i64) {
        table.insert(
            address,
            NodeRecord {
                free_space,
                last_heartbeat: now_ms(),
            },
        );
    }

    fn expired(&self, record: &NodeRecord, now: i64) -> bool {
        now - record.last_heartbeat > self.timeout_ms
    }

    /// Active members of one table, evicting expired entries on the way.
    fn active(&self, table: &DashMap<String, NodeRecord>) -> Vec<(String, NodeRecord)> {
        let now = now_ms();
        let mut alive = Vec::new();
        let mut dead = Vec::new();

        for entry in table.iter() {
            if self.expired(entry.value(), now) {
                dead.push((entry.key().clone(), entry.value().last_heartbeat));
            } else {
                alive.push((entry.key().clone(), entry.value().clone()));
            }
        }

        for (address, observed) in dead {
            table.remove_if(&address, |_, record| record.last_heartbeat == observed);
        }

        alive
    }

    pub fn active_data_nodes(&self) -> Vec<(String, NodeRecord)> {
        self.active(&self.data_nodes)
    }

    pub fn active_name_nodes(&self) -> Vec<String> {
        self.active(&self.name_nodes)
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    /// One sweep over both tables; removal only happens when the heartbeat
    /// observed during the scan still matches.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let mut removed = 0usize;

        for table in [&self.data_nodes, &self.name_nodes] {
            let dead: Vec<(String, i64)> = table
                .iter()
                .filter(|entry| self.expired(entry.value(), now))
                .map(|entry| (entry.key().clone(), entry.value().last_heartbeat))
                .collect();

            for (address, observed) in dead {
                if table
                    .remove_if(&address, |_, record| record.last_heartbeat == observed)
                    .is_some()
                {
                    removed += 1;
                }
            }
        }

        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = service.sweep();
                if removed > 0 {
                    tracing::info!("registry sweep removed {} expired members", removed);
                }
            }
        })
    }

    async fn handle_packet(&self, wire: &mut Wire, packet: Packet) -> Result<()> {
        check_token(wire, &self.token, &packet).await?;

        match packet.command {
            Command::RegistryRegister | Command::RegistryHeartbeat => {
                let payload = packet.data_utf8()?;
                let (address, free_space) = match payload.split_once('|') {
                    Some((address, free)) => {
                        (address.to_string(), free.trim().parse::<i64>().unwrap_or(0))
                    }
                    None => (payload.to_string(), 0),
                };
                Self::upsert(&self.data_nodes, address.clone(), free_space);

                if packet.command == Command::RegistryRegister {
                    tracing::info!("data service registered: {}", address);
                    send_reply(wire, Command::RegistryResponseRegister, "OK").await?;
                }
                Ok(())
            }
            Command::RegistryRegisterNameNode | Command::RegistryHeartbeatNameNode => {
                let address = packet.data_utf8()?.to_string();
                Self::upsert(&self.name_nodes, address.clone(), 0);

                if packet.command == Command::RegistryRegisterNameNode {
                    tracing::info!("name service registered: {}", address);
                    send_reply(wire, Command::RegistryResponseRegisterNameNode, "OK").await?;
                }
                Ok(())
            }
            Command::RegistryGetDataNodes => {
                let members = self
                    .active_data_nodes()
                    .into_iter()
                    .map(|(address, record)| {
                        DataNodeEntry {
                            address,
                            free_space: record.free_space,
                        }
                        .to_wire()
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                send_reply(wire, Command::RegistryResponseDataNodes, members).await
            }
            Command::RegistryGetNameNodes => {
                let members = self.active_name_nodes().join(",");
                send_reply(wire, Command::RegistryResponseNameNodes, members).await
            }
            _ => reject_unknown(wire, &packet).await,
        }
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let mut wire = Framed::new(stream, FrameCodec::new());

        while let Some(frame) = wire.next().await {
            let result = match frame {
                Ok(Frame::Packet(packet)) => self.handle_packet(&mut wire, packet).await,
                Ok(Frame::StreamChunk(_)) => break,
                Err(error) => Err(error),
            };

            if let Err(error) = result {
                tracing::debug!("registry connection {:?} closed: {}", peer, error);
                break;
            }
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            tokio::spawn(self.clone().handle_connection(stream));
        }
    }
}

/// Entry point for `ferrio registry`.
pub async fn run(cfg: RegistryConfig) -> Result<()> {
    let service = RegistryService::new(
        cfg.auth.token.clone(),
        Duration::from_millis(cfg.heartbeat.timeout_ms),
    );
    service.spawn_sweeper();

    let bind = format!("0.0.0.0:{}", cfg.server.port);
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!(
        "registry listening on {} (heartbeat timeout {} ms)",
        bind,
        cfg.heartbeat.timeout_ms
    );
    service.serve(listener).await
}
