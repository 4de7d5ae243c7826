//! Envelope authentication.
//!
//! Every message names the identity of its sender. With a shared cluster key
//! the envelope is signed (HMAC-SHA256 over a canonical body); without one
//! the claimed identity is taken as is and receivers rely on their own uid
//! checks.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::msg::Msg;
use crate::TransportError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuthCred {
    pub uid: u32,
    pub gid: u32,
    pub ts: u64,
    pub nonce: String,
    #[serde(default)]
    pub sig: String,
}

impl AuthCred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ts: now_ts(),
            nonce: Uuid::new_v4().to_string(),
            sig: String::new(),
        }
    }

    /// Credential for the real uid/gid of this process.
    pub fn current() -> Self {
        Self::new(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty()
    }
}

pub fn sign_msg(msg: &mut Msg, key: &[u8]) -> Result<(), TransportError> {
    let body = canonical_body(msg);
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TransportError::InvalidKey)?;
    mac.update(body.as_bytes());
    let sig = mac.finalize().into_bytes();
    msg.auth.sig = general_purpose::STANDARD.encode(sig);
    Ok(())
}

pub fn verify_msg(msg: &Msg, key: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(canonical_body(msg).as_bytes());
    let provided = general_purpose::STANDARD
        .decode(msg.auth.sig.as_bytes())
        .unwrap_or_default();
    mac.verify_slice(&provided).is_ok()
}

/// Leading characters of a signature, for log lines.
pub fn shorten_sig(sig: &str) -> &str {
    match sig.char_indices().nth(12) {
        Some((idx, _)) => &sig[..idx],
        None => sig,
    }
}

// The forwarding descriptor is rewritten at every hop, so it is left out.
fn canonical_body(msg: &Msg) -> String {
    let payload = serde_json::to_string(&msg.payload).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        msg.msg_type, msg.msg_id, msg.auth.uid, msg.auth.gid, msg.auth.ts, msg.auth.nonce, payload
    )
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
