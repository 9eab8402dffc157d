use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `{name, instanceId}` — `name` is the logical routing identity, `instanceId`
/// is unique per process and shows up in every log/trace span this agent emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub instance_id: Uuid,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), instance_id: Uuid::new_v4() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_identities_with_same_name_differ_by_instance() {
        let a = AgentIdentity::new("patrol-bot");
        let b = AgentIdentity::new("patrol-bot");
        assert_eq!(a.name, b.name);
        assert_ne!(a.instance_id, b.instance_id);
    }
}
