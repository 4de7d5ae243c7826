//! sattach wire protocol
//!
//! Message envelope, typed payloads and framing spoken between the attach
//! tool and the per-node step daemons, plus the request/response transport
//! used to deliver one fanout request and collect per-node outcomes.

pub mod auth;
pub mod cred;
pub mod forward;
pub mod frame;
pub mod msg;
pub mod results;
pub mod tcp;

use std::io;
use std::net::SocketAddr;

pub use auth::{sign_msg, verify_msg, AuthCred};
pub use cred::ReattachCredential;
pub use forward::{ForwardSpec, NameTable, MAX_NODE_NAME};
pub use frame::{read_msg, receive_msg, write_msg, MAX_FRAME_BYTES};
pub use msg::{
    LaunchTasksResponse, Message, Msg, MsgType, ReattachTasksRequest, TaskExitMsg,
};
pub use results::{DestinationResult, NodeOutcome, RemoteError};
pub use tcp::{send_msg, TcpTransport, Transport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unexpected response type {0}")]
    UnexpectedResponse(MsgType),
    #[error("message signature does not verify")]
    BadSignature,
    #[error("invalid authentication key")]
    InvalidKey,
    #[error(transparent)]
    Io(#[from] io::Error),
}
