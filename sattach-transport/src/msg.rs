use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthCred;
use crate::cred::ReattachCredential;
use crate::forward::ForwardSpec;
use crate::results::DestinationResult;
use crate::TransportError;

/// Message kinds known to this protocol. Codes outside the table decode to
/// [`MsgType::Unknown`] and are kept so callers can log them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    ReattachTasks,
    LaunchTasksResponse,
    TaskExit,
    StepComplete,
    ForwardResults,
    Unknown(u16),
}

impl MsgType {
    pub const fn code(self) -> u16 {
        match self {
            MsgType::ReattachTasks => 5013,
            MsgType::LaunchTasksResponse => 6002,
            MsgType::TaskExit => 6003,
            MsgType::StepComplete => 7004,
            MsgType::ForwardResults => 8001,
            MsgType::Unknown(code) => code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            5013 => MsgType::ReattachTasks,
            6002 => MsgType::LaunchTasksResponse,
            6003 => MsgType::TaskExit,
            7004 => MsgType::StepComplete,
            8001 => MsgType::ForwardResults,
            other => MsgType::Unknown(other),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::ReattachTasks => f.write_str("REQUEST_REATTACH_TASKS"),
            MsgType::LaunchTasksResponse => f.write_str("RESPONSE_LAUNCH_TASKS"),
            MsgType::TaskExit => f.write_str("MESSAGE_TASK_EXIT"),
            MsgType::StepComplete => f.write_str("STEP_COMPLETE"),
            MsgType::ForwardResults => f.write_str("RESPONSE_FORWARD_RESULTS"),
            MsgType::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Envelope of every frame on the wire.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Msg {
    pub msg_type: u16,
    pub msg_id: String,
    pub auth: AuthCred,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardSpec<'static>>,
    pub payload: serde_json::Value,
}

impl Msg {
    pub fn new<P: Serialize>(
        kind: MsgType,
        payload: &P,
        auth: AuthCred,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            msg_type: kind.code(),
            msg_id: Uuid::new_v4().to_string(),
            auth,
            forward: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Attaches a forwarding descriptor so the first recipient re-delivers
    /// the message to the rest of the tree.
    pub fn with_forward(mut self, forward: ForwardSpec<'_>) -> Self {
        self.forward = Some(forward.into_owned());
        self
    }

    pub fn kind(&self) -> MsgType {
        MsgType::from_code(self.msg_type)
    }

    /// Decodes the payload according to the message type.
    pub fn decode(&self) -> Result<Message, TransportError> {
        let payload = self.payload.clone();
        Ok(match self.kind() {
            MsgType::ReattachTasks => Message::ReattachRequest(serde_json::from_value(payload)?),
            MsgType::LaunchTasksResponse => {
                Message::LaunchResponse(serde_json::from_value(payload)?)
            }
            MsgType::TaskExit => Message::TaskExit(serde_json::from_value(payload)?),
            MsgType::StepComplete => Message::StepComplete(payload),
            MsgType::ForwardResults => Message::ForwardResults(serde_json::from_value(payload)?),
            MsgType::Unknown(code) => Message::Unknown(code),
        })
    }
}

/// Decoded form of a [`Msg`].
#[derive(Debug, Clone)]
pub enum Message {
    ReattachRequest(ReattachTasksRequest),
    LaunchResponse(LaunchTasksResponse),
    TaskExit(TaskExitMsg),
    /// Payload is opaque to the attach tool.
    StepComplete(serde_json::Value),
    ForwardResults(Vec<DestinationResult>),
    Unknown(u16),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReattachTasksRequest {
    pub job_id: u32,
    pub step_id: u32,
    /// Ports the step daemons report task launch and exit events to.
    pub resp_ports: Vec<u16>,
    /// Task I/O ports. Always empty: the attach tool does not stream I/O.
    #[serde(default)]
    pub io_ports: Vec<u16>,
    pub cred: ReattachCredential,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LaunchTasksResponse {
    pub return_code: i32,
    pub node_name: String,
    /// Global task ids, parallel to `local_pids`.
    pub task_ids: Vec<u32>,
    #[serde(default)]
    pub local_pids: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskExitMsg {
    pub return_code: i32,
    pub task_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_survive_decoding() {
        assert_eq!(MsgType::from_code(1234), MsgType::Unknown(1234));
        assert_eq!(MsgType::Unknown(1234).code(), 1234);

        let mut msg = Msg::new(MsgType::TaskExit, &serde_json::json!({}), AuthCred::new(0, 0))
            .unwrap();
        msg.msg_type = 1234;
        assert!(matches!(msg.decode(), Ok(Message::Unknown(1234))));
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let msg = Msg::new(
            MsgType::TaskExit,
            &serde_json::json!({ "task_ids": "zero" }),
            AuthCred::new(0, 0),
        )
        .unwrap();
        assert!(matches!(msg.decode(), Err(TransportError::Codec(_))));
    }

    #[test]
    fn step_complete_payload_is_opaque() {
        let msg = Msg::new(
            MsgType::StepComplete,
            &serde_json::json!({ "anything": [1, 2] }),
            AuthCred::new(0, 0),
        )
        .unwrap();
        match msg.decode().unwrap() {
            Message::StepComplete(value) => assert_eq!(value["anything"][1], 2),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn launch_response_decodes() {
        let payload = LaunchTasksResponse {
            return_code: 0,
            node_name: "node1".into(),
            task_ids: vec![0, 1],
            local_pids: vec![4100, 4101],
        };
        let msg = Msg::new(MsgType::LaunchTasksResponse, &payload, AuthCred::new(0, 0)).unwrap();
        match msg.decode().unwrap() {
            Message::LaunchResponse(decoded) => assert_eq!(decoded, payload),
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
