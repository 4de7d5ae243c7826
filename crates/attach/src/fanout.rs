//! Re-attach request with an embedded one-hop forwarding tree.
//!
//! The request is sent to node 0 only. Node 0 re-delivers it to nodes
//! `1..N` using the descriptor built here and replies with the outcomes of
//! the whole tree.

use std::borrow::Cow;
use std::net::SocketAddr;

use sattach_common::{LayoutError, StepId, StepLayout};
use sattach_transport::{
    AuthCred, ForwardSpec, Msg, MsgType, NameTable, ReattachCredential, ReattachTasksRequest,
    TransportError,
};

/// Forwarding descriptor covering every node of `layout` but the first.
///
/// Node ids, names and addresses line up index for index; the addresses
/// borrow from the layout.
pub fn build_forward(layout: &StepLayout, timeout_ms: u64) -> ForwardSpec<'_> {
    let nodes = layout.node_count();
    let targets = nodes.saturating_sub(1);

    let mut names = NameTable::with_slots(targets);
    for (slot, name) in layout.hosts().iter().skip(1).take(targets).enumerate() {
        names.set(slot, name);
    }

    ForwardSpec {
        count: targets as u32,
        node_ids: (1..nodes as u32).collect(),
        names,
        addrs: Cow::Borrowed(layout.node_addrs().get(1..).unwrap_or_default()),
        timeout_ms,
    }
}

#[derive(Debug, Clone)]
pub struct FanoutRequest<'a> {
    /// Direct destination: node 0 of the step.
    pub root: SocketAddr,
    pub payload: ReattachTasksRequest,
    pub forward: ForwardSpec<'a>,
}

impl FanoutRequest<'_> {
    pub fn into_msg(self, auth: AuthCred) -> Result<Msg, TransportError> {
        Ok(Msg::new(MsgType::ReattachTasks, &self.payload, auth)?.with_forward(self.forward))
    }
}

pub fn build_request<'a>(
    layout: &'a StepLayout,
    step: StepId,
    cred: ReattachCredential,
    resp_ports: &[u16],
    timeout_ms: u64,
) -> Result<FanoutRequest<'a>, LayoutError> {
    let root = *layout.node_addrs().first().ok_or(LayoutError::NoNodes)?;
    Ok(FanoutRequest {
        root,
        payload: ReattachTasksRequest {
            job_id: step.job_id,
            step_id: step.step_id,
            resp_ports: resp_ports.to_vec(),
            io_ports: Vec::new(),
            cred,
        },
        forward: build_forward(layout, timeout_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(nodes: usize) -> StepLayout {
        let list = if nodes == 1 {
            "node0".to_string()
        } else {
            format!("node[0-{}]", nodes - 1)
        };
        let addrs = (0..nodes)
            .map(|i| SocketAddr::from(([10, 0, 0, i as u8 + 1], 6818)))
            .collect();
        StepLayout::block(list, addrs, &vec![2; nodes]).unwrap()
    }

    #[test]
    fn five_nodes_forward_to_the_last_four() {
        let layout = layout(5);
        let fwd = build_forward(&layout, 10_000);

        assert_eq!(fwd.count, 4);
        assert_eq!(fwd.node_ids, vec![1, 2, 3, 4]);
        assert_eq!(
            fwd.names.names().collect::<Vec<_>>(),
            vec!["node1", "node2", "node3", "node4"]
        );
        assert_eq!(&fwd.addrs[..], &layout.node_addrs()[1..]);
        assert_eq!(fwd.timeout_ms, 10_000);
    }

    #[test]
    fn single_node_needs_no_forwarding() {
        let layout = layout(1);
        let fwd = build_forward(&layout, 10_000);

        assert!(fwd.is_empty());
        assert!(fwd.node_ids.is_empty());
        assert!(fwd.names.is_empty());
        assert!(fwd.addrs.is_empty());
    }

    #[test]
    fn request_targets_node_zero() {
        let layout = layout(3);
        let step = StepId::new(42, 0);
        let cred = ReattachCredential::fake(42, 0, 1000, layout.node_list());
        let req = build_request(&layout, step, cred, &[40001, 40002], 5_000).unwrap();

        assert_eq!(req.root, layout.node_addrs()[0]);
        assert_eq!(req.payload.resp_ports, vec![40001, 40002]);
        assert!(req.payload.io_ports.is_empty());
        assert!(!req.payload.cred.is_signed());

        let msg = req.into_msg(AuthCred::new(1000, 1000)).unwrap();
        assert_eq!(msg.kind(), MsgType::ReattachTasks);
        assert_eq!(msg.forward.map(|f| f.count), Some(2));
    }
}
