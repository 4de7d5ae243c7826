//! One attach attempt, start to finish.
//!
//! Phases run in order:
//! `ResolveLayout -> BuildCredential -> StartListener -> SendFanout ->
//! CollectResults -> Report`, or `Fatal` as soon as one of them fails. The
//! listener is started before the request goes out so the advertised
//! response ports already exist. A fatal error after that point shuts the
//! listener down before returning.

use std::io;
use std::sync::Arc;

use sattach_common::{AttachConfig, StepId, StepLayout};
use sattach_transport::{
    sign_msg, AuthCred, DestinationResult, ReattachCredential, RemoteError, Transport,
};
use tracing::{debug, error, info, warn};

use crate::backend::StepLayoutSource;
use crate::error::AttachError;
use crate::fanout::build_request;
use crate::handler::AuthPolicy;
use crate::listener::{Listener, ListenerOptions};
use crate::port_pool::PortPool;
use crate::tracker::{TaskCallbacks, TaskStateTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPhase {
    ResolveLayout,
    BuildCredential,
    StartListener,
    SendFanout,
    CollectResults,
    Report,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node_name: String,
    pub node_id: u32,
    pub error: RemoteError,
}

/// Per-node outcome of the re-attach request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<NodeFailure>,
}

impl AttachReport {
    /// At least one node accepted the attach.
    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && !self.succeeded.is_empty()
    }

    pub fn reported(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// A successful attach. The listener keeps feeding the tracker until
/// [`shutdown`](AttachSession::shutdown) or drop.
#[derive(Debug)]
pub struct AttachSession {
    pub step: StepId,
    pub layout: StepLayout,
    pub tracker: Arc<TaskStateTracker>,
    pub listener: Listener,
    pub report: AttachReport,
}

impl AttachSession {
    pub fn shutdown(&mut self) {
        self.listener.shutdown();
    }
}

pub struct AttachCoordinator<S, T> {
    source: S,
    transport: T,
    config: AttachConfig,
    policy: AuthPolicy,
    pool: Option<Arc<PortPool>>,
}

impl<S, T> AttachCoordinator<S, T>
where
    S: StepLayoutSource,
    T: Transport,
{
    pub fn new(source: S, transport: T, config: AttachConfig) -> Self {
        let policy = AuthPolicy::new(
            config.service_uid,
            config.auth_key_bytes().map(<[u8]>::to_vec),
        );
        let pool = config
            .response_port_range
            .map(|range| Arc::new(PortPool::new(range)));
        Self {
            source,
            transport,
            config,
            policy,
            pool,
        }
    }

    /// Replaces the uid policy applied to incoming task reports.
    pub fn with_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    pub fn port_pool(&self) -> Option<&Arc<PortPool>> {
        self.pool.as_ref()
    }

    /// Re-attaches to `step` on behalf of `uid`.
    pub async fn attach(
        &self,
        step: StepId,
        uid: u32,
        callbacks: TaskCallbacks,
    ) -> Result<AttachSession, AttachError> {
        let mut phase = AttachPhase::ResolveLayout;
        let result = self.run(step, uid, callbacks, &mut phase).await;
        if let Err(err) = &result {
            error!(
                %step,
                from = ?phase,
                to = ?AttachPhase::Fatal,
                "attach failed: {}",
                err
            );
        }
        result
    }

    async fn run(
        &self,
        step: StepId,
        uid: u32,
        callbacks: TaskCallbacks,
        phase: &mut AttachPhase,
    ) -> Result<AttachSession, AttachError> {
        let layout = self
            .source
            .resolve_step_layout(step)
            .await
            .map_err(AttachError::Lookup)?
            .ok_or(AttachError::StepNotFound(step))?;
        debug!(%step, nodes = layout.node_count(), tasks = layout.task_count(), "resolved step layout");

        advance(phase, AttachPhase::BuildCredential);
        let cred = ReattachCredential::fake(step.job_id, step.step_id, uid, layout.node_list());

        advance(phase, AttachPhase::StartListener);
        let tracker = Arc::new(TaskStateTracker::new(layout.task_count(), callbacks));
        let opts = ListenerOptions {
            bind_addr: self.config.bind_addr,
            clients_per_port: self.config.clients_per_port,
            recv_timeout: self.config.recv_timeout(),
            policy: self.policy.clone(),
            pool: self.pool.clone(),
        };
        let node_count = layout.node_count();
        let listener_tracker = Arc::clone(&tracker);
        let mut listener = tokio::task::spawn_blocking(move || {
            Listener::create(node_count, listener_tracker, opts)
        })
        .await
        .map_err(|err| AttachError::Thread(io::Error::other(err)))??;

        for line in layout.describe() {
            info!("{}", line);
        }

        advance(phase, AttachPhase::SendFanout);
        let ports = listener.ports().to_vec();
        let results = match self.send_fanout(&layout, step, cred, &ports).await {
            Ok(results) => results,
            Err(err) => {
                let _ = tokio::task::spawn_blocking(move || listener.shutdown()).await;
                return Err(err);
            }
        };

        advance(phase, AttachPhase::CollectResults);
        let report = collect_results(&layout, &results);

        advance(phase, AttachPhase::Report);
        Ok(AttachSession {
            step,
            layout,
            tracker,
            listener,
            report,
        })
    }

    async fn send_fanout(
        &self,
        layout: &StepLayout,
        step: StepId,
        cred: ReattachCredential,
        ports: &[u16],
    ) -> Result<Vec<DestinationResult>, AttachError> {
        let request = build_request(layout, step, cred, ports, self.config.forward_timeout_ms())?;
        let root = request.root;
        let mut msg = request.into_msg(AuthCred::current())?;
        if let Some(key) = self.config.auth_key_bytes() {
            sign_msg(&mut msg, key)?;
        }
        debug!(%root, ports = ?ports, "sending re-attach request");
        Ok(self
            .transport
            .send_and_receive(&msg, root, self.config.msg_timeout())
            .await?)
    }
}

/// Logs one line per node and sorts nodes into succeeded and failed.
///
/// A reply covering more or fewer nodes than the step has is only warned
/// about; every entry it does carry is still reported.
pub fn collect_results(layout: &StepLayout, results: &[DestinationResult]) -> AttachReport {
    let mut report = AttachReport::default();
    for result in results {
        if result.is_success() {
            for node in &result.nodes {
                info!(node = %node.node_name, node_id = node.node_id, "Attach success on node");
                report.succeeded.push(node.node_name.clone());
            }
        } else {
            let remote = RemoteError::from_code(result.error_code);
            for node in &result.nodes {
                error!(
                    node = %node.node_name,
                    node_id = node.node_id,
                    code = remote.code(),
                    "Attach failed on node: {}",
                    remote
                );
                report.failed.push(NodeFailure {
                    node_name: node.node_name.clone(),
                    node_id: node.node_id,
                    error: remote,
                });
            }
        }
    }

    if report.reported() != layout.node_count() {
        warn!(
            reported = report.reported(),
            expected = layout.node_count(),
            "result list does not match the step's node count"
        );
    }
    report
}

fn advance(phase: &mut AttachPhase, next: AttachPhase) {
    debug!(from = ?*phase, to = ?next, "attach phase");
    *phase = next;
}
