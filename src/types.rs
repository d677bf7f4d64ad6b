//! Trigger events delivered by the external dispatcher.
//!
//! The dispatcher invokes the agent once per event, either with the event
//! name as the first argument or through a symlink named after the event.
//! Every event runs the same reconciliation pass; the variant is carried
//! through only so the logs say why a pass ran.

use std::fmt;
use std::str::FromStr;

/// The relation types whose changes trigger a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Coordination service peers (`hostname`, `port`).
    Etcd,
    /// Control-plane API server peers (`hostname`, `port`).
    Api,
    /// Network overlay peers (`private-address`, `overlay_type`).
    Network,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Etcd => "etcd",
            RelationKind::Api => "api",
            RelationKind::Network => "network",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConfigChanged,
    RelationChanged(RelationKind),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ConfigChanged => write!(f, "config-changed"),
            Trigger::RelationChanged(kind) => write!(f, "{}-relation-changed", kind.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown trigger event '{0}'")]
pub struct UnknownTrigger(pub String);

impl FromStr for Trigger {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config-changed" => Ok(Trigger::ConfigChanged),
            "etcd-relation-changed" => Ok(Trigger::RelationChanged(RelationKind::Etcd)),
            "api-relation-changed" => Ok(Trigger::RelationChanged(RelationKind::Api)),
            "network-relation-changed" => Ok(Trigger::RelationChanged(RelationKind::Network)),
            other => Err(UnknownTrigger(other.to_string())),
        }
    }
}
