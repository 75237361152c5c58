//! Routes inbound agent frames to the pending request they answer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_relay_error::RelayError;

use crate::protocol::{
    AgentFrame, ChunkAck, CommandReply, CommandResult, KeepAlive, ServerFrame, TransferChunk,
    TransferEnd, TransferFailure, TransferStart,
};
use crate::reassembly::{decode_chunk, ChunkAssembly, TransferRejection};
use crate::registry::{AgentConnection, Registry};

impl Registry {
    /// Looks the agent up and applies `frame` to its tables.
    pub async fn handle_agent_frame(
        &self,
        agent_id: &str,
        frame: AgentFrame,
    ) -> Result<(), RelayError> {
        let agent = self
            .lookup(agent_id)
            .await
            .ok_or_else(|| RelayError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        self.handle_frame(&agent, frame).await;
        Ok(())
    }

    /// Applies one inbound frame. Late, duplicate and unmatched frames are
    /// logged and dropped; nothing here fails the connection.
    pub async fn handle_frame(&self, agent: &Arc<AgentConnection>, frame: AgentFrame) {
        match frame {
            AgentFrame::Register(registration) => {
                tracing::warn!(
                    agent_id = %agent.id(),
                    name = %registration.name,
                    "ignoring repeated registration on an established connection"
                );
            }
            AgentFrame::CommandResponse(result) => on_command_response(agent, result).await,
            AgentFrame::TransferStart(start) => {
                on_transfer_start(agent, start, self.config().max_chunks).await
            }
            AgentFrame::TransferChunk(chunk) => on_transfer_chunk(agent, chunk).await,
            AgentFrame::TransferEnd(end) => on_transfer_end(agent, end).await,
            AgentFrame::TransferError(failure) => on_transfer_error(agent, failure).await,
            AgentFrame::KeepAlive(keep_alive) => {
                on_keep_alive(agent, keep_alive, self.config().keep_alive_extension).await
            }
        }
    }
}

async fn on_command_response(agent: &Arc<AgentConnection>, result: CommandResult) {
    let correlation_id = result.correlation_id;
    let reply = CommandReply {
        success: result.success,
        message: result.message,
        output: result.output,
    };
    let success = reply.success;
    let matched = agent.tables.lock().await.resolve(&correlation_id, Ok(reply));
    if matched {
        tracing::info!(
            agent_id = %agent.id(),
            correlation_id = %correlation_id,
            success,
            "command response matched"
        );
    } else {
        tracing::warn!(
            agent_id = %agent.id(),
            correlation_id = %correlation_id,
            "command response has no matching pending request"
        );
    }
}

async fn on_transfer_start(agent: &Arc<AgentConnection>, start: TransferStart, max_chunks: usize) {
    let correlation_id = start.correlation_id.clone();
    let total_chunks = start.total_chunks;
    let mut tables = agent.tables.lock().await;
    let result = if !tables.pending.contains_key(&correlation_id) {
        Err(TransferRejection::NoPendingRequest)
    } else if tables.transfers.contains_key(&correlation_id) {
        Err(TransferRejection::DuplicateStart)
    } else {
        ChunkAssembly::start(start, max_chunks)
    };

    match result {
        Ok(assembly) => {
            tables.transfers.insert(correlation_id.clone(), assembly);
            tracing::info!(
                agent_id = %agent.id(),
                correlation_id = %correlation_id,
                total_chunks,
                "transfer started"
            );
        }
        Err(rejection) => {
            tracing::warn!(
                agent_id = %agent.id(),
                correlation_id = %correlation_id,
                total_chunks,
                reason = %rejection,
                "transfer start rejected"
            );
        }
    }
}

async fn on_transfer_chunk(agent: &Arc<AgentConnection>, chunk: TransferChunk) {
    let TransferChunk {
        correlation_id,
        chunk_index,
        data,
    } = chunk;

    // Decode before taking the lock.
    let bytes = match decode_chunk(&data) {
        Ok(bytes) => bytes,
        Err(rejection) => {
            tracing::warn!(
                agent_id = %agent.id(),
                correlation_id = %correlation_id,
                chunk_index,
                reason = %rejection,
                "chunk rejected"
            );
            return;
        }
    };

    let receipt = {
        let mut tables = agent.tables.lock().await;
        match tables.transfers.get_mut(&correlation_id) {
            Some(assembly) => assembly.accept_chunk(chunk_index, bytes),
            None => Err(TransferRejection::UnknownTransfer),
        }
    };

    let receipt = match receipt {
        Ok(receipt) => receipt,
        Err(rejection) => {
            tracing::warn!(
                agent_id = %agent.id(),
                correlation_id = %correlation_id,
                chunk_index,
                reason = %rejection,
                "chunk rejected"
            );
            return;
        }
    };

    tracing::trace!(
        agent_id = %agent.id(),
        correlation_id = %correlation_id,
        chunk_index,
        size = receipt.size,
        duplicate = receipt.duplicate,
        "chunk received"
    );

    let ack = ServerFrame::ChunkAck(ChunkAck {
        correlation_id,
        chunk_index,
        size: receipt.size,
        received_at: Utc::now().timestamp_millis(),
        duplicate: receipt.duplicate,
    });
    if !agent.send(ack).await {
        tracing::debug!(agent_id = %agent.id(), "could not acknowledge chunk; writer closed");
    }
}

async fn on_transfer_end(agent: &Arc<AgentConnection>, end: TransferEnd) {
    let mut tables = agent.tables.lock().await;
    let Some(assembly) = tables.transfers.remove(&end.correlation_id) else {
        tracing::warn!(
            agent_id = %agent.id(),
            correlation_id = %end.correlation_id,
            reason = %TransferRejection::UnknownTransfer,
            "transfer end rejected"
        );
        return;
    };

    let received = assembly.received_count();
    let total = assembly.total_chunks();
    let outcome = assembly.finish(&end);
    match &outcome {
        Ok(_) => tracing::info!(
            agent_id = %agent.id(),
            correlation_id = %end.correlation_id,
            total_chunks = total,
            duration_ms = end.duration_ms,
            "transfer complete"
        ),
        Err(err) => tracing::warn!(
            agent_id = %agent.id(),
            correlation_id = %end.correlation_id,
            received,
            total_chunks = total,
            sent_chunks = end.sent_chunks,
            error = %err,
            "transfer failed"
        ),
    }
    tables.resolve(&end.correlation_id, outcome);
}

async fn on_transfer_error(agent: &Arc<AgentConnection>, failure: TransferFailure) {
    let mut tables = agent.tables.lock().await;
    let Some(assembly) = tables.transfers.remove(&failure.correlation_id) else {
        tracing::warn!(
            agent_id = %agent.id(),
            correlation_id = %failure.correlation_id,
            reason = %TransferRejection::UnknownTransfer,
            "transfer error rejected"
        );
        return;
    };

    tracing::warn!(
        agent_id = %agent.id(),
        correlation_id = %failure.correlation_id,
        message = %failure.message,
        failed_chunks = ?failure.failed_chunks,
        "agent aborted transfer"
    );
    let err = assembly.fail(failure.message, failure.failed_chunks);
    tables.resolve(&failure.correlation_id, Err(err));
}

async fn on_keep_alive(agent: &Arc<AgentConnection>, keep_alive: KeepAlive, default: Duration) {
    let extension = keep_alive
        .duration_ms
        .map(Duration::from_millis)
        .unwrap_or(default);
    if !agent
        .extend_deadline(&keep_alive.correlation_id, extension)
        .await
    {
        tracing::debug!(
            agent_id = %agent.id(),
            correlation_id = %keep_alive.correlation_id,
            "keep-alive for a request that is no longer pending"
        );
    }
}
