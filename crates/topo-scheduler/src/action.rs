//! Actions produced by controller plans.

use std::fmt;

use serde::Serialize;

use topo_state::MemberId;

/// How a new stateful member gets its volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeBinding {
    /// A volume tagged for this ordinal already exists.
    Rebind { volume_id: String },
    /// No volume yet; provision one.
    Provision { volume_id: String, size_bytes: u64 },
}

impl VolumeBinding {
    pub fn volume_id(&self) -> &str {
        match self {
            VolumeBinding::Rebind { volume_id } | VolumeBinding::Provision { volume_id, .. } => {
                volume_id
            }
        }
    }
}

/// One step toward the desired state of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Create a member and wait until it is Running.
    Create {
        member: MemberId,
        volume: Option<VolumeBinding>,
    },
    /// A Pending member with a handle: wait for readiness.
    AwaitReady { member: MemberId },
    /// Terminate (if started) and recreate a member in place at the
    /// current revision, keeping its identity and volume.
    Recreate {
        member: MemberId,
        volume: Option<VolumeBinding>,
    },
    /// Surge replacement: create `new`, then terminate `old` once `new`
    /// is Running.
    Replace { old: MemberId, new: MemberId },
    /// Terminate a member and forget it. `release_volume` marks its
    /// volume Released.
    Terminate {
        member: MemberId,
        release_volume: bool,
    },
}

impl Action {
    pub fn member(&self) -> &MemberId {
        match self {
            Action::Create { member, .. }
            | Action::AwaitReady { member }
            | Action::Recreate { member, .. }
            | Action::Terminate { member, .. } => member,
            Action::Replace { new, .. } => new,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create { member, volume: None } => write!(f, "create {member}"),
            Action::Create {
                member,
                volume: Some(binding),
            } => write!(f, "create {member} with volume {}", binding.volume_id()),
            Action::AwaitReady { member } => write!(f, "await {member}"),
            Action::Recreate { member, .. } => write!(f, "recreate {member}"),
            Action::Replace { old, new } => write!(f, "replace {old} with {new}"),
            Action::Terminate { member, .. } => write!(f, "terminate {member}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_member() {
        let create = Action::Create {
            member: MemberId::Ordinal(1),
            volume: Some(VolumeBinding::Rebind {
                volume_id: "data-db-1".into(),
            }),
        };
        assert_eq!(create.to_string(), "create #1 with volume data-db-1");

        let replace = Action::Replace {
            old: MemberId::Instance("web-aaaaaa-0".into()),
            new: MemberId::Instance("web-bbbbbb-0".into()),
        };
        assert_eq!(replace.to_string(), "replace web-aaaaaa-0 with web-bbbbbb-0");
        assert_eq!(replace.member(), &MemberId::Instance("web-bbbbbb-0".into()));
    }
}
