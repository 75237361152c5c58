use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{AgentFrame, ServerFrame};
use crate::registry::Registry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 256;

/// Drives one agent connection from handshake to teardown.
pub async fn handle_agent_socket(registry: Arc<Registry>, socket: WebSocket) {
    let (ws_sender, ws_receiver) = socket.split();
    serve_connection(registry, ws_sender, ws_receiver).await;
}

async fn serve_connection<S, R>(registry: Arc<Registry>, mut ws_sender: S, mut ws_receiver: R)
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = Uuid::new_v4().to_string();

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(err))) => {
            tracing::warn!(connection_id = %connection_id, error = %err, "handshake read failed");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::warn!(connection_id = %connection_id, "handshake timed out");
            let _ = ws_sender.close().await;
            return;
        }
    };

    let registration = match message_bytes(first).map(|data| parse_frame(&data)) {
        Some(Ok(AgentFrame::Register(registration))) => registration,
        Some(Ok(other)) => {
            tracing::warn!(
                connection_id = %connection_id,
                event = other.event_name(),
                "expected register as first frame"
            );
            let _ = ws_sender.close().await;
            return;
        }
        Some(Err(err)) => {
            tracing::warn!(connection_id = %connection_id, error = %err, "invalid register frame");
            let _ = ws_sender.close().await;
            return;
        }
        None => return,
    };

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let agent = match registry
        .register(connection_id.clone(), registration, tx)
        .await
    {
        Ok(agent) => agent,
        Err(err) => {
            tracing::warn!(connection_id = %connection_id, error = %err, "registration refused");
            let _ = ws_sender.close().await;
            return;
        }
    };

    let agent_id = agent.id().to_string();
    let writer_agent_id = agent_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(agent_id = %writer_agent_id, error = %err, "failed to encode frame");
                    continue;
                }
            };
            match tokio::time::timeout(WRITE_TIMEOUT, ws_sender.send(Message::Text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(agent_id = %writer_agent_id, error = %err, "socket write failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(agent_id = %writer_agent_id, "socket write timed out");
                    return;
                }
            }
        }
    });

    let read_loop = async {
        while let Some(result) = ws_receiver.next().await {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(agent_id = %agent_id, error = %err, "socket read failed");
                    break;
                }
            };
            if matches!(message, Message::Close(_)) {
                tracing::debug!(agent_id = %agent_id, "agent closed socket");
                break;
            }
            let Some(data) = message_bytes(message) else {
                continue;
            };
            match parse_frame(&data) {
                Ok(frame) => {
                    tracing::trace!(agent_id = %agent_id, event = frame.event_name(), "frame received");
                    registry.handle_frame(&agent, frame).await;
                }
                Err(err) => {
                    tracing::warn!(
                        agent_id = %agent_id,
                        error = %err,
                        bytes = data.len(),
                        "dropping malformed frame"
                    );
                }
            }
        }
    };

    // Either half stopping means the connection is lost.
    tokio::select! {
        _ = read_loop => {}
        _ = &mut write_task => {
            tracing::warn!(agent_id = %agent_id, "socket writer stopped; closing connection");
        }
    }

    registry.disconnect(&agent_id).await;
    drop(agent);
    write_task.abort();
}

fn message_bytes(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

fn parse_frame(data: &[u8]) -> Result<AgentFrame, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc::unbounded;

    use super::*;
    use crate::registry::RelayConfig;

    fn register_text(secret: &str) -> Message {
        Message::Text(format!(
            r#"{{"event":"register","name":"A1","secret":"{secret}"}}"#
        ))
    }

    #[tokio::test]
    async fn failed_writer_tears_the_connection_down() {
        let registry = Arc::new(Registry::new(RelayConfig::new("s")));
        let (inbound, ws_receiver) = unbounded::<Result<Message, axum::Error>>();
        inbound
            .unbounded_send(Ok(register_text("s")))
            .expect("queue register");
        let broken = Box::pin(futures::sink::unfold((), |(), _message: Message| async {
            Err::<(), _>(axum::Error::new("connection reset"))
        }));

        // The read side stays open; only the writer fails.
        tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(registry.clone(), broken, ws_receiver),
        )
        .await
        .expect("connection ends once the writer fails");
        assert_eq!(registry.agent_count().await, 0);
        drop(inbound);
    }

    #[tokio::test]
    async fn wrong_secret_ends_handshake_without_entry() {
        let registry = Arc::new(Registry::new(RelayConfig::new("s")));
        let (inbound, ws_receiver) = unbounded::<Result<Message, axum::Error>>();
        inbound
            .unbounded_send(Ok(register_text("nope")))
            .expect("queue register");
        let (outbound, mut sent) = unbounded::<Message>();
        let sink = outbound.sink_map_err(axum::Error::new);

        tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(registry.clone(), sink, ws_receiver),
        )
        .await
        .expect("handshake refused");
        assert_eq!(registry.agent_count().await, 0);
        assert!(sent.try_next().ok().flatten().is_none(), "no reply frame");
        drop(inbound);
    }

    #[test]
    fn control_frames_carry_no_payload() {
        assert!(message_bytes(Message::Ping(vec![1])).is_none());
        assert_eq!(
            message_bytes(Message::Text("{}".to_string())),
            Some(b"{}".to_vec())
        );
    }

    #[test]
    fn parses_register_frame() {
        let frame = parse_frame(br#"{"event":"register","name":"A1","secret":"s"}"#)
            .expect("register frame");
        match frame {
            AgentFrame::Register(registration) => {
                assert_eq!(registration.name, "A1");
                assert_eq!(registration.secret, "s");
            }
            other => panic!("unexpected {}", other.event_name()),
        }
        assert!(parse_frame(br#"{"event":"bogus"}"#).is_err());
    }
}
