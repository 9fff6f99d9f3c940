use std::fmt;

/// Session key: `agent:<id>:main`, `agent:<id>:channel:<ch>:peer:<kind>:<id>`,
/// or a generated `session:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    pub fn for_peer(agent_id: &str, channel: &str, peer_kind: &str, peer_id: &str) -> Self {
        Self(format!(
            "agent:{agent_id}:channel:{channel}:peer:{peer_kind}:{peer_id}"
        ))
    }

    pub fn generated() -> Self {
        Self(format!("session:{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel segment of a peer key, if present.
    pub fn channel(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        while let Some(part) = parts.next() {
            if part == "channel" {
                return parts.next();
            }
        }
        None
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
