//! Per-port accept loop and per-connection message handling.
//!
//! Each connection carries exactly one framed message from a step daemon.
//! The sender is authenticated, the message is applied to the tracker and
//! the connection is closed. Connections on one port are served one at a
//! time; ports are independent of each other.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sattach_transport::auth::shorten_sig;
use sattach_transport::{receive_msg, verify_msg, Message, Msg};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::tracker::TaskStateTracker;

/// Who may report task events.
///
/// The cluster service account, root and the attaching user are accepted;
/// everyone else is dropped. With a shared key the envelope signature is
/// checked first; without one the claimed uid is taken at face value.
#[derive(Clone)]
pub struct AuthPolicy {
    pub service_uid: u32,
    pub local_uid: u32,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDenied {
    BadSignature,
    Uid(u32),
}

impl fmt::Display for AuthDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthDenied::BadSignature => f.write_str("invalid message signature"),
            AuthDenied::Uid(uid) => write!(f, "message from uid {}", uid),
        }
    }
}

impl AuthPolicy {
    /// Policy for the current process.
    pub fn new(service_uid: u32, key: Option<Vec<u8>>) -> Self {
        Self {
            service_uid,
            local_uid: nix::unistd::getuid().as_raw(),
            key,
        }
    }

    pub fn permits(&self, uid: u32) -> bool {
        uid == self.service_uid || uid == 0 || uid == self.local_uid
    }

    pub fn authenticate(&self, msg: &Msg) -> Result<(), AuthDenied> {
        if let Some(key) = &self.key {
            if !verify_msg(msg, key) {
                return Err(AuthDenied::BadSignature);
            }
        }
        if self.permits(msg.auth.uid) {
            Ok(())
        } else {
            Err(AuthDenied::Uid(msg.auth.uid))
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("service_uid", &self.service_uid)
            .field("local_uid", &self.local_uid)
            .field("keyed", &self.key.is_some())
            .finish()
    }
}

/// Shared by every port of one listener.
#[derive(Debug)]
pub(crate) struct HandlerContext {
    pub tracker: Arc<TaskStateTracker>,
    pub policy: AuthPolicy,
    pub recv_timeout: Duration,
}

/// Accepts connections on one port until shutdown is signalled or the
/// socket fails.
///
/// Connections are handled one at a time, in accept order. A peer that
/// connects and never writes holds up the rest of this port for at most
/// `recv_timeout`; other ports keep serving.
pub(crate) async fn serve_port(
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                trace!(port, %peer, "accepted connection");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = handle_connection(stream, peer, &ctx) => {}
                }
            }
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted => {
                    trace!(port, "no connection pending: {}", err);
                }
                _ => {
                    error!(port, "accept failed, closing response port: {}", err);
                    break;
                }
            },
        }
    }
    debug!(port, "response port closed");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &HandlerContext) {
    let msg = match receive_msg(stream, ctx.recv_timeout).await {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%peer, "failed to receive message: {}", err);
            return;
        }
    };

    if let Err(denied) = ctx.policy.authenticate(&msg) {
        error!(
            %peer,
            uid = msg.auth.uid,
            sig = shorten_sig(&msg.auth.sig),
            "Security violation, {} dropped: {}",
            msg.kind(),
            denied
        );
        return;
    }

    dispatch(&msg, &ctx.tracker);
}

fn dispatch(msg: &Msg, tracker: &TaskStateTracker) {
    let decoded = match msg.decode() {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(uid = msg.auth.uid, "malformed {} payload: {}", msg.kind(), err);
            return;
        }
    };

    match decoded {
        Message::LaunchResponse(resp) => {
            if !tracker.accepts(&resp.task_ids) {
                warn!(node = %resp.node_name, tasks = ?resp.task_ids, "launch report names unknown task ids");
                return;
            }
            if resp.return_code != 0 {
                warn!(node = %resp.node_name, rc = resp.return_code, "node reported launch failure");
            }
            debug!(node = %resp.node_name, tasks = ?resp.task_ids, "tasks launched");
            tracker.mark_started(&resp);
        }
        Message::TaskExit(exit) => {
            if !tracker.accepts(&exit.task_ids) {
                warn!(tasks = ?exit.task_ids, "exit report names unknown task ids");
                return;
            }
            tracker.mark_exited(&exit);
        }
        Message::StepComplete(_) => {
            debug!("step complete");
        }
        Message::ReattachRequest(_) | Message::ForwardResults(_) => {
            error!("received spurious message type: {}", msg.kind());
        }
        Message::Unknown(code) => {
            error!("received spurious message type: {}", code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TaskCallbacks;
    use sattach_transport::{sign_msg, AuthCred, LaunchTasksResponse, MsgType, TaskExitMsg};

    fn policy(key: Option<&[u8]>) -> AuthPolicy {
        AuthPolicy {
            service_uid: 450,
            local_uid: 1000,
            key: key.map(<[u8]>::to_vec),
        }
    }

    fn exit_from(uid: u32, ids: &[u32]) -> Msg {
        let payload = TaskExitMsg {
            return_code: 0,
            task_ids: ids.to_vec(),
        };
        Msg::new(MsgType::TaskExit, &payload, AuthCred::new(uid, uid)).unwrap()
    }

    #[test]
    fn permits_service_root_and_self() {
        let policy = policy(None);
        assert!(policy.permits(450));
        assert!(policy.permits(0));
        assert!(policy.permits(1000));
        assert!(!policy.permits(1001));
    }

    #[test]
    fn keyed_policy_checks_signature_before_uid() {
        let policy = policy(Some(b"k"));
        let mut msg = exit_from(0, &[0]);
        assert_eq!(policy.authenticate(&msg), Err(AuthDenied::BadSignature));
        sign_msg(&mut msg, b"k").unwrap();
        assert_eq!(policy.authenticate(&msg), Ok(()));

        let mut stranger = exit_from(1001, &[0]);
        sign_msg(&mut stranger, b"k").unwrap();
        assert_eq!(policy.authenticate(&stranger), Err(AuthDenied::Uid(1001)));
    }

    #[test]
    fn dispatch_applies_known_messages() {
        let tracker = TaskStateTracker::new(4, TaskCallbacks::default());
        let launch = LaunchTasksResponse {
            return_code: 0,
            node_name: "node1".into(),
            task_ids: vec![0, 1],
            local_pids: vec![10, 11],
        };
        let msg = Msg::new(MsgType::LaunchTasksResponse, &launch, AuthCred::new(0, 0)).unwrap();
        dispatch(&msg, &tracker);
        dispatch(&exit_from(0, &[3]), &tracker);

        assert_eq!(tracker.started_count(), 2);
        assert!(tracker.is_exited(3));
    }

    #[test]
    fn dispatch_drops_bad_ids_and_unknown_types() {
        let tracker = TaskStateTracker::new(2, TaskCallbacks::default());
        dispatch(&exit_from(0, &[0, 9]), &tracker);

        let mut unknown = exit_from(0, &[0]);
        unknown.msg_type = 4242;
        dispatch(&unknown, &tracker);

        let complete = Msg::new(
            MsgType::StepComplete,
            &serde_json::json!({}),
            AuthCred::new(0, 0),
        );
        dispatch(&complete.unwrap(), &tracker);

        assert_eq!(tracker.exited_count(), 0);
        assert_eq!(tracker.started_count(), 0);
    }
}
