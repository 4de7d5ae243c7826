//! Per-destination outcomes aggregated by a fanout.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const SUCCESS: i32 = 0;
pub const ERR_NODE_UNREACHABLE: i32 = 1001;
pub const ERR_INVALID_STEP: i32 = 2017;
pub const ERR_CREDENTIAL_REJECTED: i32 = 4004;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NodeOutcome {
    pub node_name: String,
    pub node_id: u32,
}

/// One entry of a fanout reply: a status shared by a group of nodes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DestinationResult {
    pub status: i32,
    #[serde(default)]
    pub error_code: i32,
    pub nodes: Vec<NodeOutcome>,
}

impl DestinationResult {
    pub fn success(nodes: Vec<NodeOutcome>) -> Self {
        Self {
            status: SUCCESS,
            error_code: SUCCESS,
            nodes,
        }
    }

    pub fn failure(error_code: i32, nodes: Vec<NodeOutcome>) -> Self {
        Self {
            status: -1,
            error_code,
            nodes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS
    }
}

/// Remote error code reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteError {
    InvalidStep,
    NodeUnreachable,
    CredentialRejected,
    Other(i32),
}

impl RemoteError {
    pub fn from_code(code: i32) -> Self {
        match code {
            ERR_INVALID_STEP => RemoteError::InvalidStep,
            ERR_NODE_UNREACHABLE => RemoteError::NodeUnreachable,
            ERR_CREDENTIAL_REJECTED => RemoteError::CredentialRejected,
            other => RemoteError::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            RemoteError::InvalidStep => ERR_INVALID_STEP,
            RemoteError::NodeUnreachable => ERR_NODE_UNREACHABLE,
            RemoteError::CredentialRejected => ERR_CREDENTIAL_REJECTED,
            RemoteError::Other(code) => code,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::InvalidStep => f.write_str("job step does not exist on node"),
            RemoteError::NodeUnreachable => f.write_str("node unreachable"),
            RemoteError::CredentialRejected => f.write_str("node rejected credential"),
            RemoteError::Other(code) => write!(f, "remote error {}", code),
        }
    }
}
