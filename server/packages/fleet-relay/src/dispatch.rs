use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use fleet_relay_error::RelayError;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::protocol::{CommandEnvelope, CommandKind, Outcome, ServerFrame};
use crate::registry::{PendingRequest, Registry};

/// Operator request to relay a command to one agent.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<CommandKind>,
    #[serde(default)]
    pub command: Option<String>,
    /// Forwarded to the agent untouched (e.g. delay before powering off).
    #[serde(default)]
    pub timer: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CommandRequest {
    pub fn execute(agent_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            kind: Some(CommandKind::Execute),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(&str, CommandKind), RelayError> {
        let agent_id = self
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid("agentId is required"))?;
        let kind = self.kind.ok_or_else(|| invalid("type is required"))?;
        let has_command = self
            .command
            .as_deref()
            .is_some_and(|command| !command.trim().is_empty());
        if kind.requires_command() && !has_command {
            return Err(invalid("command is required for execute"));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeoutMs must be greater than zero"));
        }
        Ok((agent_id, kind))
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::InvalidRequest {
        message: message.to_string(),
    }
}

/// Resolves exactly once with the command's terminal outcome.
#[derive(Debug)]
pub struct PendingReply {
    agent_id: String,
    correlation_id: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sink dropped without an outcome: the agent's state was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RelayError::AgentDisconnected {
                agent_id: self.agent_id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Registry {
    /// Registers a pending request, arms its deadline and sends the command.
    /// Validation and lookup failures are returned before anything is created.
    ///
    /// The deadline starts when dispatch is called. Waiting for room in the
    /// agent's outbound queue counts against it, and a request that cannot be
    /// queued in time fails with `Timeout` without ever becoming pending.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<PendingReply, RelayError> {
        let (agent_id, kind) = request.validate()?;
        let agent = self
            .lookup(agent_id)
            .await
            .ok_or_else(|| RelayError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| kind.default_timeout())
            .unwrap_or(self.config().default_timeout);
        let deadline = Instant::now() + timeout;
        let correlation_id = agent.next_correlation_id();

        let permit = match tokio::time::timeout_at(deadline, agent.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(err)) => {
                tracing::error!(
                    agent_id = %agent_id,
                    correlation_id = %correlation_id,
                    "agent writer closed; dropping command"
                );
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    correlation_id = %correlation_id,
                    kind = %kind,
                    timeout_ms = timeout.as_millis() as u64,
                    "outbound queue stayed full until the deadline"
                );
                return Err(RelayError::Timeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let (sink, receiver) = oneshot::channel();
        let pending_count = {
            let mut tables = agent.tables.lock().await;
            if tables.closed {
                return Err(RelayError::AgentNotFound {
                    agent_id: agent_id.to_string(),
                });
            }
            let mut pending = PendingRequest::new(correlation_id.clone(), kind, sink);
            pending.timeout = timeout;
            agent.arm_deadline_at(&mut pending, deadline);
            tables.pending.insert(correlation_id.clone(), pending);
            tables.pending.len()
        };

        tracing::info!(
            agent_id = %agent_id,
            correlation_id = %correlation_id,
            kind = %kind,
            timeout_ms = timeout.as_millis() as u64,
            pending_count,
            "dispatching command"
        );

        permit.send(ServerFrame::Command(CommandEnvelope {
            kind,
            command: request.command.clone(),
            timer: request.timer,
            correlation_id: correlation_id.clone(),
        }));

        Ok(PendingReply {
            agent_id: agent_id.to_string(),
            correlation_id,
            receiver,
        })
    }

    /// Dispatches and waits for the terminal outcome.
    pub async fn execute(&self, request: CommandRequest) -> Outcome {
        self.dispatch(request).await?.await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{AgentFrame, CommandReply, CommandResult, Registration};
    use crate::registry::{AgentConnection, RelayConfig};

    async fn registry_with_agent(
        id: &str,
    ) -> (Arc<Registry>, Arc<AgentConnection>, mpsc::Receiver<ServerFrame>) {
        let registry = Arc::new(Registry::new(RelayConfig::new("s")));
        let (tx, mut rx) = mpsc::channel(16);
        let agent = registry
            .register(
                id.to_string(),
                Registration {
                    name: id.to_uppercase(),
                    secret: "s".to_string(),
                },
                tx,
            )
            .await
            .expect("register");
        assert!(matches!(rx.recv().await, Some(ServerFrame::Registered(_))));
        (registry, agent, rx)
    }

    async fn next_command(rx: &mut mpsc::Receiver<ServerFrame>) -> CommandEnvelope {
        match rx.recv().await {
            Some(ServerFrame::Command(envelope)) => envelope,
            other => panic!("expected command frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_round_trip() {
        let (registry, agent, mut rx) = registry_with_agent("a1").await;
        let reply = registry
            .dispatch(CommandRequest::execute("a1", "ls"))
            .await
            .expect("dispatch");

        let envelope = next_command(&mut rx).await;
        assert_eq!(envelope.kind, CommandKind::Execute);
        assert_eq!(envelope.command.as_deref(), Some("ls"));
        assert_eq!(envelope.correlation_id, reply.correlation_id());

        registry
            .handle_frame(
                &agent,
                AgentFrame::CommandResponse(CommandResult {
                    correlation_id: envelope.correlation_id.clone(),
                    success: true,
                    message: "done".to_string(),
                    output: Some(serde_json::json!("file1\nfile2")),
                }),
            )
            .await;

        assert_eq!(
            reply.await.expect("outcome"),
            CommandReply {
                success: true,
                message: "done".to_string(),
                output: Some(serde_json::json!("file1\nfile2")),
            }
        );
        assert_eq!(agent.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found_without_side_effects() {
        let (registry, agent, mut rx) = registry_with_agent("a1").await;
        let err = registry
            .dispatch(CommandRequest::execute("ghost", "ls"))
            .await
            .expect_err("unknown agent");
        assert_eq!(
            err,
            RelayError::AgentNotFound {
                agent_id: "ghost".to_string()
            }
        );
        assert_eq!(agent.pending_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let (registry, agent, _rx) = registry_with_agent("a1").await;
        let cases = [
            CommandRequest {
                kind: Some(CommandKind::PowerOff),
                ..CommandRequest::default()
            },
            CommandRequest {
                agent_id: Some("a1".to_string()),
                kind: Some(CommandKind::Execute),
                ..CommandRequest::default()
            },
            CommandRequest {
                agent_id: Some("a1".to_string()),
                kind: Some(CommandKind::Execute),
                command: Some("   ".to_string()),
                ..CommandRequest::default()
            },
            CommandRequest {
                agent_id: Some("a1".to_string()),
                ..CommandRequest::default()
            },
        ];
        for request in cases {
            let err = registry.dispatch(request).await.expect_err("invalid");
            assert!(matches!(err, RelayError::InvalidRequest { .. }), "{err}");
        }
        assert_eq!(agent.pending_count().await, 0);
    }

    #[tokio::test]
    async fn power_command_forwards_timer() {
        let (registry, _agent, mut rx) = registry_with_agent("a1").await;
        let _reply = registry
            .dispatch(CommandRequest {
                agent_id: Some("a1".to_string()),
                kind: Some(CommandKind::PowerOff),
                timer: Some(60),
                ..CommandRequest::default()
            })
            .await
            .expect("dispatch");
        let envelope = next_command(&mut rx).await;
        assert_eq!(envelope.kind, CommandKind::PowerOff);
        assert_eq!(envelope.timer, Some(60));
        assert_eq!(envelope.command, None);
    }

    #[tokio::test]
    async fn closed_writer_fails_fast() {
        let (registry, agent, rx) = registry_with_agent("a1").await;
        drop(rx);
        let err = registry
            .dispatch(CommandRequest::execute("a1", "ls"))
            .await
            .expect_err("writer gone");
        assert!(matches!(err, RelayError::AgentDisconnected { .. }));
        assert_eq!(agent.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_outbound_queue_times_out_at_the_deadline() {
        let registry = Arc::new(Registry::new(RelayConfig::new("s")));
        // Capacity 1, already taken by the `registered` frame nobody reads.
        let (tx, rx) = mpsc::channel(1);
        let agent = registry
            .register(
                "a1".to_string(),
                Registration {
                    name: "A1".to_string(),
                    secret: "s".to_string(),
                },
                tx,
            )
            .await
            .expect("register");

        let started = tokio::time::Instant::now();
        let outcome = registry
            .execute(CommandRequest {
                timeout_ms: Some(50),
                ..CommandRequest::execute("a1", "ls")
            })
            .await;
        assert!(
            matches!(outcome, Err(RelayError::Timeout { timeout_ms: 50, .. })),
            "{outcome:?}"
        );
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(agent.pending_count().await, 0);

        drop(rx);
        let err = registry
            .execute(CommandRequest::execute("a1", "ls"))
            .await
            .expect_err("writer gone");
        assert!(matches!(err, RelayError::AgentDisconnected { .. }));
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let (registry, agent, mut rx) = registry_with_agent("a1").await;
        let reply = registry
            .dispatch(CommandRequest {
                timeout_ms: Some(20),
                ..CommandRequest::execute("a1", "sleep 5")
            })
            .await
            .expect("dispatch");
        let envelope = next_command(&mut rx).await;

        assert!(matches!(
            reply.await,
            Err(RelayError::Timeout { timeout_ms: 20, .. })
        ));

        registry
            .handle_frame(
                &agent,
                AgentFrame::CommandResponse(CommandResult {
                    correlation_id: envelope.correlation_id,
                    success: true,
                    message: "too late".to_string(),
                    output: None,
                }),
            )
            .await;
        assert_eq!(agent.pending_count().await, 0);
    }
}
