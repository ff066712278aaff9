//! Ordin core types: resource identity, actions, change envelopes and bus partitions.

#![forbid(unsafe_code)]

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod envelope;

pub use envelope::{Change, ChangeEnvelope, EnvelopeError, EnvelopeKey, WireEnvelope};

/// Stable identifier of a resource (`metadata.uid`). Mirror key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Uid {
    fn from(s: String) -> Self { Self(s) }
}

/// Kind of change observed on the authoritative source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Add, Action::Update, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Action {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Action::Add),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(EnvelopeError::UnknownAction(other.to_string())),
        }
    }
}

/// A resource kind that can travel through the pipeline and be held in a mirror.
///
/// Any static kube resource (e.g. `k8s_openapi::api::apps::v1::Deployment`) qualifies.
pub trait Mirrored:
    kube::Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{
    fn uid(&self) -> Option<Uid> {
        self.meta().uid.as_deref().filter(|s| !s.is_empty()).map(Uid::from)
    }

    /// `metadata.resourceVersion` when it is a plain integer (etcd revision).
    fn revision(&self) -> Option<u64> {
        self.meta().resource_version.as_deref().and_then(|rv| rv.parse().ok())
    }

    /// `namespace/name` or `name` for cluster-scoped objects.
    fn display_name(&self) -> String {
        let meta = self.meta();
        let name = meta.name.as_deref().unwrap_or("");
        match meta.namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        }
    }
}

impl<K> Mirrored for K where
    K: kube::Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{
}

/// Items that carry an identity key for queue de-duplication.
pub trait Keyed {
    type Key: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static;
    fn key(&self) -> Self::Key;
}

/// Bus partition for a kind and action, e.g. `deployments_update`.
pub fn partition<K: Mirrored>(action: Action) -> String {
    format!("{}_{}", K::plural(&()), action)
}

/// All three partitions for a kind, in `Action::ALL` order.
pub fn partitions<K: Mirrored>() -> Vec<String> {
    Action::ALL.iter().map(|a| partition::<K>(*a)).collect()
}

pub mod prelude {
    pub use super::{partition, partitions, Action, Change, ChangeEnvelope, EnvelopeError, EnvelopeKey, Keyed, Mirrored, Uid, WireEnvelope};
}
