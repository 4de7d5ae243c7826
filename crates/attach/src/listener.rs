//! Response-port listener.
//!
//! Binds enough ports for the step's node count and serves them from one
//! background thread. The thread owns a single-threaded tokio runtime with
//! one accept task per port; it exits once every port has closed.

use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener as StdTcpListener};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::AttachError;
use crate::handler::{serve_port, AuthPolicy, HandlerContext};
use crate::port_pool::PortPool;
use crate::tracker::TaskStateTracker;

/// Clients served per response port.
pub const DEFAULT_CLIENTS_PER_PORT: usize = 48;

/// Response ports needed for `node_count` nodes.
pub fn estimate_ports(node_count: usize, clients_per_port: usize) -> usize {
    node_count.max(1).div_ceil(clients_per_port.max(1))
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub bind_addr: IpAddr,
    pub clients_per_port: usize,
    /// Deadline for a daemon to deliver its message once connected.
    pub recv_timeout: Duration,
    pub policy: AuthPolicy,
    /// Draw ports from this pool instead of the ephemeral range.
    pub pool: Option<Arc<PortPool>>,
}

impl ListenerOptions {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            clients_per_port: DEFAULT_CLIENTS_PER_PORT,
            recv_timeout: Duration::from_secs(80),
            policy,
            pool: None,
        }
    }
}

#[derive(Debug)]
pub struct Listener {
    ports: Vec<u16>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
    pool: Option<Arc<PortPool>>,
}

impl Listener {
    /// Binds the response ports and starts the background thread.
    ///
    /// Every returned port is accepting connections by the time this
    /// returns, so it is safe to advertise them right away.
    pub fn create(
        node_count: usize,
        tracker: Arc<TaskStateTracker>,
        opts: ListenerOptions,
    ) -> Result<Self, AttachError> {
        let num_ports = estimate_ports(node_count, opts.clients_per_port);
        let pool = opts.pool.clone();

        let mut sockets = Vec::with_capacity(num_ports);
        let mut ports = Vec::with_capacity(num_ports);
        for _ in 0..num_ports {
            let bound = bind_port(opts.bind_addr, pool.as_deref())
                .and_then(|socket| {
                    socket.set_nonblocking(true).map_err(AttachError::Bind)?;
                    let port = socket.local_addr().map_err(AttachError::Bind)?.port();
                    Ok((socket, port))
                });
            match bound {
                Ok((socket, port)) => {
                    sockets.push(socket);
                    ports.push(port);
                }
                Err(err) => {
                    release_all(pool.as_deref(), &ports);
                    return Err(err);
                }
            }
        }

        let ctx = Arc::new(HandlerContext {
            tracker,
            policy: opts.policy,
            recv_timeout: opts.recv_timeout,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();

        let spawned = thread::Builder::new()
            .name("sattach-listener".into())
            .spawn(move || run_event_loop(sockets, ctx, shutdown_rx, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                release_all(pool.as_deref(), &ports);
                return Err(AttachError::Thread(err));
            }
        };

        let started = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("listener thread exited during startup")),
        };
        if let Err(err) = started {
            let _ = handle.join();
            release_all(pool.as_deref(), &ports);
            return Err(AttachError::Thread(err));
        }

        info!(ports = ?ports, "listening for task reports");
        Ok(Self {
            ports,
            shutdown_tx,
            thread: Some(handle),
            pool,
        })
    }

    /// Bound response ports, in host byte order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Closes every port and joins the background thread. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shutdown_tx.send_replace(true);
        if handle.join().is_err() {
            warn!("listener thread panicked");
        }
        release_all(self.pool.as_deref(), &self.ports);
        debug!("listener shut down");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_loop(
    sockets: Vec<StdTcpListener>,
    ctx: Arc<HandlerContext>,
    shutdown_rx: watch::Receiver<bool>,
    ready_tx: mpsc::Sender<io::Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    runtime.block_on(async move {
        let mut ports = JoinSet::new();
        for socket in sockets {
            match TcpListener::from_std(socket) {
                Ok(listener) => {
                    ports.spawn(serve_port(listener, Arc::clone(&ctx), shutdown_rx.clone()));
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            }
        }
        let _ = ready_tx.send(Ok(()));

        while let Some(done) = ports.join_next().await {
            if let Err(err) = done {
                error!("response port task failed: {}", err);
            }
        }
    });
}

fn bind_port(addr: IpAddr, pool: Option<&PortPool>) -> Result<StdTcpListener, AttachError> {
    let Some(pool) = pool else {
        return StdTcpListener::bind((addr, 0)).map_err(AttachError::Bind);
    };
    for _ in 0..pool.size() {
        let Some(port) = pool.assign() else {
            break;
        };
        match StdTcpListener::bind((addr, port)) {
            Ok(socket) => return Ok(socket),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "response port in use");
                pool.release(port);
            }
            Err(err) => {
                pool.release(port);
                return Err(AttachError::Bind(err));
            }
        }
    }
    Err(AttachError::NoPorts)
}

fn release_all(pool: Option<&PortPool>, ports: &[u16]) {
    if let Some(pool) = pool {
        for &port in ports {
            pool.release(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TaskCallbacks;
    use sattach_common::PortRange;
    use sattach_transport::{send_msg, sign_msg, AuthCred, LaunchTasksResponse, Msg, MsgType};
    use std::net::SocketAddr;

    fn local_options(policy: AuthPolicy) -> ListenerOptions {
        ListenerOptions {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            recv_timeout: Duration::from_secs(2),
            ..ListenerOptions::new(policy)
        }
    }

    fn policy() -> AuthPolicy {
        AuthPolicy {
            service_uid: 450,
            local_uid: 1000,
            key: None,
        }
    }

    fn launch_from(uid: u32, ids: &[u32]) -> Msg {
        let payload = LaunchTasksResponse {
            return_code: 0,
            node_name: "node1".into(),
            task_ids: ids.to_vec(),
            local_pids: Vec::new(),
        };
        Msg::new(MsgType::LaunchTasksResponse, &payload, AuthCred::new(uid, uid)).unwrap()
    }

    #[test]
    fn port_count_follows_node_count() {
        assert_eq!(estimate_ports(100, 48), 3);
        assert_eq!(estimate_ports(48, 48), 1);
        assert_eq!(estimate_ports(49, 48), 2);
        assert_eq!(estimate_ports(1, 48), 1);
    }

    #[test]
    fn binds_one_port_per_client_group() {
        let tracker = Arc::new(TaskStateTracker::new(1, TaskCallbacks::default()));
        let mut listener = Listener::create(100, tracker, local_options(policy())).unwrap();
        assert_eq!(listener.ports().len(), 3);
        assert!(listener.ports().iter().all(|&p| p != 0));
        assert!(listener.is_running());

        listener.shutdown();
        listener.shutdown();
        assert!(!listener.is_running());
    }

    #[test]
    fn pooled_ports_return_to_pool_on_shutdown() {
        // Grab a free port and reuse its number as a one-port range.
        let probe = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let pool = Arc::new(PortPool::new(PortRange {
            min: port,
            max: port,
        }));
        let tracker = Arc::new(TaskStateTracker::new(1, TaskCallbacks::default()));
        let opts = ListenerOptions {
            pool: Some(Arc::clone(&pool)),
            ..local_options(policy())
        };

        let mut listener = Listener::create(1, Arc::clone(&tracker), opts.clone()).unwrap();
        assert_eq!(listener.ports(), &[port]);
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            Listener::create(1, tracker, opts),
            Err(AttachError::NoPorts)
        ));

        listener.shutdown();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn unauthorized_reports_leave_tracker_untouched() {
        let tracker = Arc::new(TaskStateTracker::new(2, TaskCallbacks::default()));
        let listener =
            Listener::create(1, Arc::clone(&tracker), local_options(policy())).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.ports()[0]));

        send_msg(addr, &launch_from(1001, &[0]), Duration::from_secs(2))
            .await
            .unwrap();
        send_msg(addr, &launch_from(450, &[1]), Duration::from_secs(2))
            .await
            .unwrap();

        // Connections on one port are handled in order, so once task 1 is
        // in, the earlier report has already been dropped.
        let waiter = Arc::clone(&tracker);
        let seen = tokio::task::spawn_blocking(move || {
            waiter.wait_until(|s| s.started().test(1), Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(seen);
        assert!(!tracker.is_started(0));
        drop(listener);
    }

    #[tokio::test]
    async fn silent_peer_delays_port_only_until_recv_timeout() {
        let tracker = Arc::new(TaskStateTracker::new(1, TaskCallbacks::default()));
        let opts = ListenerOptions {
            recv_timeout: Duration::from_millis(200),
            ..local_options(policy())
        };
        let listener = Listener::create(1, Arc::clone(&tracker), opts).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.ports()[0]));

        let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();
        send_msg(addr, &launch_from(0, &[0]), Duration::from_secs(2))
            .await
            .unwrap();

        let waiter = Arc::clone(&tracker);
        let seen = tokio::task::spawn_blocking(move || {
            waiter.wait_until(|s| s.all_started(), Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(seen);
        drop(listener);
    }

    #[tokio::test]
    async fn keyed_listener_rejects_unsigned_reports() {
        let tracker = Arc::new(TaskStateTracker::new(2, TaskCallbacks::default()));
        let opts = local_options(AuthPolicy {
            key: Some(b"cluster-key".to_vec()),
            ..policy()
        });
        let listener = Listener::create(1, Arc::clone(&tracker), opts).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.ports()[0]));

        send_msg(addr, &launch_from(0, &[0]), Duration::from_secs(2))
            .await
            .unwrap();
        let mut signed = launch_from(0, &[1]);
        sign_msg(&mut signed, b"cluster-key").unwrap();
        send_msg(addr, &signed, Duration::from_secs(2)).await.unwrap();

        let waiter = Arc::clone(&tracker);
        let seen = tokio::task::spawn_blocking(move || {
            waiter.wait_until(|s| s.started().test(1), Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(seen);
        assert!(!tracker.is_started(0));
        drop(listener);
    }
}
