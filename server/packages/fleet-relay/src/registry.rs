use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_relay_error::RelayError;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::protocol::{CommandKind, Outcome, Registered, Registration, ServerFrame};
use crate::reassembly::{ChunkAssembly, DEFAULT_MAX_CHUNKS};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_KEEP_ALIVE_EXTENSION_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Shared secret agents present when registering.
    pub agent_secret: String,
    pub default_timeout: Duration,
    pub keep_alive_extension: Duration,
    pub max_chunks: usize,
}

impl RelayConfig {
    pub fn new(agent_secret: impl Into<String>) -> Self {
        Self {
            agent_secret: agent_secret.into(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            keep_alive_extension: Duration::from_millis(DEFAULT_KEEP_ALIVE_EXTENSION_MS),
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    #[schema(value_type = String, format = DateTime)]
    pub connected_at: DateTime<Utc>,
    pub pending_requests: usize,
    pub active_transfers: usize,
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) correlation_id: String,
    pub(crate) kind: CommandKind,
    sink: oneshot::Sender<Outcome>,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) timeout: Duration,
    pub(crate) timer_generation: u64,
    pub(crate) timer: Option<AbortHandle>,
}

impl PendingRequest {
    pub(crate) fn new(
        correlation_id: String,
        kind: CommandKind,
        sink: oneshot::Sender<Outcome>,
    ) -> Self {
        let now = Instant::now();
        Self {
            correlation_id,
            kind,
            sink,
            created_at: now,
            deadline: now,
            timeout: Duration::ZERO,
            timer_generation: 0,
            timer: None,
        }
    }

    /// Delivers the terminal outcome. Consuming `self` is what makes
    /// resolution single-shot.
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.disarm();
        if self.sink.send(outcome).is_err() {
            tracing::debug!(
                correlation_id = %self.correlation_id,
                "caller went away before the outcome was delivered"
            );
        }
    }
}

/// Mutable per-agent state. Only touched with the owning connection's lock held.
#[derive(Debug, Default)]
pub(crate) struct AgentTables {
    pub(crate) closed: bool,
    pub(crate) pending: HashMap<String, PendingRequest>,
    pub(crate) transfers: HashMap<String, ChunkAssembly>,
}

impl AgentTables {
    /// Resolves and removes the pending request, dropping any transfer it
    /// owned. Returns `false` when the request was already resolved.
    pub(crate) fn resolve(&mut self, correlation_id: &str, outcome: Outcome) -> bool {
        self.transfers.remove(correlation_id);
        match self.pending.remove(correlation_id) {
            Some(pending) => {
                pending.complete(outcome);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct AgentConnection {
    id: String,
    name: String,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<ServerFrame>,
    next_sequence: AtomicU64,
    pub(crate) tables: Mutex<AgentTables>,
}

impl AgentConnection {
    fn new(id: String, name: String, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id,
            name,
            connected_at: Utc::now(),
            outbound,
            next_sequence: AtomicU64::new(0),
            tables: Mutex::new(AgentTables::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn pending_count(&self) -> usize {
        self.tables.lock().await.pending.len()
    }

    pub async fn transfer_count(&self) -> usize {
        self.tables.lock().await.transfers.len()
    }

    pub async fn summary(&self) -> AgentSummary {
        let tables = self.tables.lock().await;
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            connected_at: self.connected_at,
            pending_requests: tables.pending.len(),
            active_transfers: tables.transfers.len(),
        }
    }

    /// Counter plus random suffix; the counter alone keeps ids unique per
    /// agent and ids are never handed out twice.
    pub(crate) fn next_correlation_id(&self) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = Uuid::new_v4().simple().to_string();
        format!("{sequence:x}-{}", &nonce[..12])
    }

    pub(crate) async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Waits for a free slot in the outbound queue. Fails once the writer
    /// has gone away.
    pub(crate) async fn reserve(&self) -> Result<mpsc::Permit<'_, ServerFrame>, RelayError> {
        self.outbound
            .reserve()
            .await
            .map_err(|_| RelayError::AgentDisconnected {
                agent_id: self.id.clone(),
            })
    }

    /// Fails every outstanding request with `AgentDisconnected` and drops all
    /// in-flight transfers. Further dispatches see the connection as gone.
    pub(crate) async fn reconcile_disconnect(&self) -> usize {
        let mut tables = self.tables.lock().await;
        tables.closed = true;
        let pending: Vec<PendingRequest> = tables.pending.drain().map(|(_, p)| p).collect();
        let resolved = pending.len();
        for request in pending {
            tracing::debug!(
                agent_id = %self.id,
                correlation_id = %request.correlation_id,
                kind = %request.kind,
                "failing pending request on disconnect"
            );
            request.complete(Err(RelayError::AgentDisconnected {
                agent_id: self.id.clone(),
            }));
        }
        let dropped_transfers = tables.transfers.len();
        tables.transfers.clear();
        if dropped_transfers > 0 {
            tracing::warn!(
                agent_id = %self.id,
                dropped_transfers,
                "discarded in-flight transfers on disconnect"
            );
        }
        resolved
    }
}

/// Authoritative set of connected agents.
#[derive(Debug)]
pub struct Registry {
    config: RelayConfig,
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
}

impl Registry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Admits an agent after checking its secret. `connection_id` becomes the
    /// agent id and must not already be registered. The `registered` reply is
    /// queued on `outbound` before the agent becomes visible, so it always
    /// precedes any command.
    pub async fn register(
        &self,
        connection_id: String,
        registration: Registration,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Result<Arc<AgentConnection>, RelayError> {
        if registration.secret != self.config.agent_secret {
            tracing::warn!(
                connection_id = %connection_id,
                name = %registration.name,
                "rejected agent registration: invalid secret"
            );
            return Err(RelayError::Unauthorized {
                message: Some("invalid registration secret".to_string()),
            });
        }

        let mut agents = self.agents.write().await;
        if agents.contains_key(&connection_id) {
            tracing::warn!(connection_id = %connection_id, "rejected duplicate agent id");
            return Err(RelayError::InvalidRequest {
                message: format!("agent {connection_id} is already registered"),
            });
        }

        // The outbound queue is fresh, so this only fails if the writer is gone.
        if outbound
            .try_send(ServerFrame::Registered(Registered {
                agent_id: connection_id.clone(),
            }))
            .is_err()
        {
            return Err(RelayError::AgentDisconnected {
                agent_id: connection_id,
            });
        }

        let agent = Arc::new(AgentConnection::new(
            connection_id.clone(),
            registration.name,
            outbound,
        ));
        agents.insert(connection_id, agent.clone());
        let connected = agents.len();
        drop(agents);

        tracing::info!(
            agent_id = %agent.id,
            name = %agent.name,
            connected,
            "agent registered"
        );
        Ok(agent)
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        let agents: Vec<Arc<AgentConnection>> =
            self.agents.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(agents.len());
        for agent in agents {
            summaries.push(agent.summary().await);
        }
        summaries.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        summaries
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Tears an agent down: resolves its pending requests, discards its
    /// transfers, then removes it. Returns how many requests were failed.
    pub async fn disconnect(&self, agent_id: &str) -> usize {
        let Some(agent) = self.lookup(agent_id).await else {
            return 0;
        };
        let resolved = agent.reconcile_disconnect().await;
        self.remove(agent_id).await;
        tracing::info!(
            agent_id = %agent_id,
            name = %agent.name,
            failed_requests = resolved,
            "agent disconnected"
        );
        resolved
    }

    async fn remove(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.write().await.remove(agent_id)
    }

    /// Drains every connection. Used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        tracing::info!(agents = ids.len(), "draining agent registry");
        for id in ids {
            self.disconnect(&id).await;
        }
    }
}
