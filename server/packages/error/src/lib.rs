use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    AgentNotFound,
    Unauthorized,
    Timeout,
    AgentDisconnected,
    IncompleteTransfer,
    ChecksumMismatch,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:fleet-relay:error:invalid_request",
            Self::AgentNotFound => "urn:fleet-relay:error:agent_not_found",
            Self::Unauthorized => "urn:fleet-relay:error:unauthorized",
            Self::Timeout => "urn:fleet-relay:error:timeout",
            Self::AgentDisconnected => "urn:fleet-relay:error:agent_disconnected",
            Self::IncompleteTransfer => "urn:fleet-relay:error:incomplete_transfer",
            Self::ChecksumMismatch => "urn:fleet-relay:error:checksum_mismatch",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::AgentNotFound => "Agent Not Found",
            Self::Unauthorized => "Unauthorized",
            Self::Timeout => "Request Timed Out",
            Self::AgentDisconnected => "Agent Disconnected",
            Self::IncompleteTransfer => "Incomplete Transfer",
            Self::ChecksumMismatch => "Checksum Mismatch",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::AgentNotFound => 404,
            Self::Unauthorized => 401,
            Self::Timeout => 408,
            Self::AgentDisconnected => 500,
            Self::IncompleteTransfer => 500,
            Self::ChecksumMismatch => 500,
        }
    }
}

/// RFC 7807 body returned for every failed operator request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Terminal failure of a relayed command, or a request rejected before dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("agent not found or not connected: {agent_id}")]
    AgentNotFound { agent_id: String },
    #[error("unauthorized")]
    Unauthorized { message: Option<String> },
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },
    #[error("agent {agent_id} disconnected unexpectedly")]
    AgentDisconnected { agent_id: String },
    #[error("transfer {correlation_id} incomplete: {message}")]
    IncompleteTransfer {
        correlation_id: String,
        message: String,
        missing_chunks: Vec<u64>,
        failed_chunks: Vec<i64>,
    },
    #[error("transfer {correlation_id} checksum mismatch")]
    ChecksumMismatch {
        correlation_id: String,
        expected: String,
        actual: String,
    },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::AgentNotFound { .. } => ErrorType::AgentNotFound,
            Self::Unauthorized { .. } => ErrorType::Unauthorized,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::AgentDisconnected { .. } => ErrorType::AgentDisconnected,
            Self::IncompleteTransfer { .. } => ErrorType::IncompleteTransfer,
            Self::ChecksumMismatch { .. } => ErrorType::ChecksumMismatch,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_type().status_code()
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. } => {}
            Self::AgentNotFound { agent_id } | Self::AgentDisconnected { agent_id } => {
                map.insert("agentId".to_string(), Value::String(agent_id.clone()));
            }
            Self::Unauthorized { message } => {
                if let Some(message) = message {
                    map.insert("reason".to_string(), Value::String(message.clone()));
                }
            }
            Self::Timeout {
                correlation_id,
                timeout_ms,
            } => {
                map.insert(
                    "correlationId".to_string(),
                    Value::String(correlation_id.clone()),
                );
                map.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
            }
            Self::IncompleteTransfer {
                correlation_id,
                missing_chunks,
                failed_chunks,
                ..
            } => {
                map.insert(
                    "correlationId".to_string(),
                    Value::String(correlation_id.clone()),
                );
                map.insert("missingChunks".to_string(), Value::from(missing_chunks.clone()));
                map.insert("failedChunks".to_string(), Value::from(failed_chunks.clone()));
            }
            Self::ChecksumMismatch {
                correlation_id,
                expected,
                actual,
            } => {
                map.insert(
                    "correlationId".to_string(),
                    Value::String(correlation_id.clone()),
                );
                map.insert("expected".to_string(), Value::String(expected.clone()));
                map.insert("actual".to_string(), Value::String(actual.clone()));
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_transfer_problem_lists_missing_chunks() {
        let err = RelayError::IncompleteTransfer {
            correlation_id: "c2".to_string(),
            message: "missing 1 of 3 chunks".to_string(),
            missing_chunks: vec![1],
            failed_chunks: vec![],
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 500);
        assert_eq!(problem.type_, "urn:fleet-relay:error:incomplete_transfer");
        assert_eq!(problem.extensions["missingChunks"], serde_json::json!([1]));

        let body = serde_json::to_value(&problem).expect("serialize problem");
        assert_eq!(body["correlationId"], "c2");
        assert_eq!(body["title"], "Incomplete Transfer");
    }

    #[test]
    fn status_codes_follow_caller_contract() {
        let cases = [
            (
                RelayError::InvalidRequest {
                    message: "agentId is required".to_string(),
                },
                400,
            ),
            (
                RelayError::AgentNotFound {
                    agent_id: "a1".to_string(),
                },
                404,
            ),
            (
                RelayError::Timeout {
                    correlation_id: "c1".to_string(),
                    timeout_ms: 10_000,
                },
                408,
            ),
            (
                RelayError::AgentDisconnected {
                    agent_id: "a1".to_string(),
                },
                500,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }
}
