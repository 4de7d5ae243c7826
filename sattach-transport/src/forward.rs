//! Forwarding descriptor carried by fanout messages.
//!
//! The first recipient of a message re-delivers it to every node listed in
//! the descriptor and aggregates their outcomes into its reply. Node names
//! travel in a fixed-stride table, one [`MAX_NODE_NAME`]-byte slot per target,
//! parallel to the node-id and address arrays.

use std::borrow::Cow;
use std::net::SocketAddr;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of one slot in a [`NameTable`].
pub const MAX_NODE_NAME: usize = 64;

/// Fixed-stride node-name table. Names longer than a slot are truncated at
/// a character boundary; shorter names are NUL padded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTable {
    #[serde(serialize_with = "encode_bytes", deserialize_with = "decode_bytes")]
    bytes: Vec<u8>,
}

impl NameTable {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            bytes: vec![0; slots * MAX_NODE_NAME],
        }
    }

    pub fn slots(&self) -> usize {
        self.bytes.len() / MAX_NODE_NAME
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes `name` into `slot`; returns false when the slot does not exist.
    pub fn set(&mut self, slot: usize, name: &str) -> bool {
        if slot >= self.slots() {
            return false;
        }
        let mut end = name.len().min(MAX_NODE_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let start = slot * MAX_NODE_NAME;
        let target = &mut self.bytes[start..start + MAX_NODE_NAME];
        target.fill(0);
        target[..end].copy_from_slice(&name.as_bytes()[..end]);
        true
    }

    pub fn get(&self, slot: usize) -> Option<&str> {
        if slot >= self.slots() {
            return None;
        }
        let start = slot * MAX_NODE_NAME;
        let raw = &self.bytes[start..start + MAX_NODE_NAME];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(MAX_NODE_NAME);
        std::str::from_utf8(&raw[..len]).ok()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        (0..self.slots()).filter_map(move |slot| self.get(slot))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardSpec<'a> {
    /// Number of nodes the first recipient forwards to.
    pub count: u32,
    /// Layout indices of the forwarding targets.
    pub node_ids: Vec<u32>,
    pub names: NameTable,
    /// Target addresses, index-aligned with `names` and `node_ids`.
    pub addrs: Cow<'a, [SocketAddr]>,
    /// Per-hop timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl ForwardSpec<'_> {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_owned(self) -> ForwardSpec<'static> {
        ForwardSpec {
            count: self.count,
            node_ids: self.node_ids,
            names: self.names,
            addrs: Cow::Owned(self.addrs.into_owned()),
            timeout_ms: self.timeout_ms,
        }
    }
}

fn encode_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
}

fn decode_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    general_purpose::STANDARD
        .decode(raw.as_bytes())
        .map_err(serde::de::Error::custom)
}
