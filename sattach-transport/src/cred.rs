use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credential presented by a re-attach request.
///
/// Built without the launch-time signing key: it authorizes nothing on its
/// own. Step daemons re-validate the requester's identity themselves.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReattachCredential {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub node_list: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl ReattachCredential {
    /// Unsigned credential for one attach attempt.
    pub fn fake(job_id: u32, step_id: u32, uid: u32, node_list: impl Into<String>) -> Self {
        Self {
            job_id,
            step_id,
            uid,
            node_list: node_list.into(),
            created_at: Utc::now(),
            signature: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_credential_is_unsigned() {
        let cred = ReattachCredential::fake(42, 0, 1000, "node[1-3]");
        assert!(!cred.is_signed());
        assert_eq!(cred.node_list, "node[1-3]");
        assert_eq!((cred.job_id, cred.step_id, cred.uid), (42, 0, 1000));
    }
}
