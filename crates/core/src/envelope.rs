//! Change envelopes: the typed form used inside a process and the wire form
//! that crosses the bus.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use kube::Resource as _;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Action, Keyed, Mirrored, Uid};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {field} payload: {source}")]
    Payload {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} action requires a {1} payload")]
    MissingPayload(Action, &'static str),
    #[error("{0} payload has no metadata.uid")]
    MissingUid(&'static str),
    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// What happened to a resource. `Update` carries the pre-change and post-change states.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Add(K),
    Update { old: K, new: K },
    Delete(K),
}

/// Unit of propagation: a change plus the producer's per-UID version stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEnvelope<K> {
    pub change: Change<K>,
    /// Monotonic per UID; `None` for envelopes from producers that do not stamp.
    pub version: Option<u64>,
}

impl<K: Mirrored> ChangeEnvelope<K> {
    pub fn add(obj: K) -> Self { Self { change: Change::Add(obj), version: None } }
    pub fn update(old: K, new: K) -> Self { Self { change: Change::Update { old, new }, version: None } }
    pub fn delete(obj: K) -> Self { Self { change: Change::Delete(obj), version: None } }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn action(&self) -> Action {
        match self.change {
            Change::Add(_) => Action::Add,
            Change::Update { .. } => Action::Update,
            Change::Delete(_) => Action::Delete,
        }
    }

    /// State at detection time; the pre-change state for updates.
    pub fn subject(&self) -> &K {
        match &self.change {
            Change::Add(o) | Change::Delete(o) => o,
            Change::Update { old, .. } => old,
        }
    }

    pub fn updated_subject(&self) -> Option<&K> {
        match &self.change {
            Change::Update { new, .. } => Some(new),
            _ => None,
        }
    }

    /// The state the change leaves behind (post-change for updates).
    pub fn latest(&self) -> &K { self.updated_subject().unwrap_or_else(|| self.subject()) }

    pub fn to_wire(&self) -> Result<WireEnvelope, EnvelopeError> {
        let obj = serde_json::to_value(self.subject())?;
        let updated_obj = self.updated_subject().map(serde_json::to_value).transpose()?;
        Ok(WireEnvelope { obj: Some(obj), action: self.action(), updated_obj, version: self.version, arrival: None })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> { self.to_wire()?.encode() }

    /// Decode the opaque payloads of a wire envelope into `K`.
    ///
    /// Every payload must carry a `metadata.uid`; an update needs both payloads.
    pub fn from_wire(wire: &WireEnvelope) -> Result<Self, EnvelopeError> {
        let subject = decode_payload::<K>(wire.obj.as_ref(), wire.action, "obj")?;
        let change = match wire.action {
            Action::Add => Change::Add(subject),
            Action::Delete => Change::Delete(subject),
            Action::Update => {
                let new = decode_payload::<K>(wire.updated_obj.as_ref(), wire.action, "updatedObj")?;
                Change::Update { old: subject, new }
            }
        };
        Ok(Self { change, version: wire.version })
    }
}

fn decode_payload<K: Mirrored>(v: Option<&Value>, action: Action, field: &'static str) -> Result<K, EnvelopeError> {
    let v = match v {
        Some(v) if !v.is_null() => v,
        _ => return Err(EnvelopeError::MissingPayload(action, field)),
    };
    let obj: K = serde_json::from_value(v.clone()).map_err(|source| EnvelopeError::Payload { field, source })?;
    if obj.uid().is_none() {
        return Err(EnvelopeError::MissingUid(field));
    }
    Ok(obj)
}

/// Identity of an envelope for at-most-once-pending de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvelopeKey {
    pub action: Action,
    pub uid: Uid,
    /// Version stamp, else `resourceVersion`, else a digest of the encoded envelope.
    /// Envelopes without a uid get their receive sequence instead.
    pub revision: String,
}

/// `~` plus a hex FxHash of the encoded envelope; equal only for identical content.
fn content_digest(wire: &WireEnvelope) -> String {
    let mut h = FxHasher::default();
    match wire.encode() {
        Ok(bytes) => h.write(&bytes),
        Err(_) => h.write_u64(wire.arrival.unwrap_or_default()),
    }
    format!("~{:016x}", h.finish())
}

impl<K: Mirrored> Keyed for ChangeEnvelope<K> {
    type Key = EnvelopeKey;

    fn key(&self) -> EnvelopeKey {
        let revision = match (self.version, self.latest().meta().resource_version.as_ref()) {
            (Some(v), _) => v.to_string(),
            (None, Some(rv)) => rv.clone(),
            (None, None) => self.to_wire().map(|w| content_digest(&w)).unwrap_or_default(),
        };
        EnvelopeKey { action: self.action(), uid: self.subject().uid().unwrap_or_default(), revision }
    }
}

/// JSON object exchanged on the bus:
/// `{"obj": .., "action": "add"|"update"|"delete", "updatedObj": .., "version": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(default)]
    pub obj: Option<Value>,
    pub action: Action,
    #[serde(rename = "updatedObj", default, skip_serializing_if = "Option::is_none")]
    pub updated_obj: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Process-local receive sequence assigned by [`WireEnvelope::decode`]. Never on the wire.
    #[serde(skip)]
    pub arrival: Option<u64>,
}

static ARRIVALS: AtomicU64 = AtomicU64::new(1);

impl WireEnvelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut env: Self = serde_json::from_slice(bytes)?;
        env.arrival = Some(ARRIVALS.fetch_add(1, Ordering::Relaxed));
        Ok(env)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> { Ok(serde_json::to_vec(self)?) }

    fn meta_str(v: Option<&Value>, field: &str) -> Option<String> {
        v.and_then(|o| o.get("metadata")).and_then(|m| m.get(field)).and_then(|s| s.as_str()).map(str::to_string)
    }
}

impl Keyed for WireEnvelope {
    type Key = EnvelopeKey;

    /// Best effort from the raw payload; undecodable payloads are rejected later by the applier.
    ///
    /// A uid-less envelope never shares a key with another received one, so each
    /// reaches the applier and is counted.
    fn key(&self) -> EnvelopeKey {
        let uid = Self::meta_str(self.obj.as_ref(), "uid").map(Uid::from).unwrap_or_default();
        let revision = match (self.version, self.arrival) {
            (_, Some(n)) if uid.is_empty() => format!("@{}", n),
            (Some(v), _) => v.to_string(),
            (None, _) => Self::meta_str(self.updated_obj.as_ref().or(self.obj.as_ref()), "resourceVersion")
                .unwrap_or_else(|| content_digest(self)),
        };
        EnvelopeKey { action: self.action, uid, revision }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn deploy(uid: &str, name: &str, rv: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                uid: Some(uid.into()),
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn update_keeps_old_in_obj_and_new_in_updated_obj() {
        let env = ChangeEnvelope::update(deploy("u1", "web", "10"), deploy("u1", "web", "11")).with_version(11);
        let wire = env.to_wire().unwrap();
        assert_eq!(wire.action, Action::Update);
        assert_eq!(wire.obj.as_ref().unwrap()["metadata"]["resourceVersion"], "10");
        assert_eq!(wire.updated_obj.as_ref().unwrap()["metadata"]["resourceVersion"], "11");

        let bytes = env.encode().unwrap();
        let back = ChangeEnvelope::<Deployment>::from_wire(&WireEnvelope::decode(&bytes).unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn wire_format_matches_legacy_shape() {
        let raw = br#"{"obj":{"metadata":{"uid":"a"}},"action":"add"}"#;
        let wire = WireEnvelope::decode(raw).unwrap();
        assert_eq!(wire.version, None);
        assert_eq!(wire.updated_obj, None);
        let env = ChangeEnvelope::<Deployment>::from_wire(&wire).unwrap();
        assert_eq!(env.subject().uid(), Some(Uid::from("a")));

        let out: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(out["action"], "add");
        assert!(out.get("updatedObj").is_none());
        assert!(out.get("version").is_none());
    }

    #[test]
    fn payload_errors_are_typed() {
        let no_uid = WireEnvelope { obj: Some(json!({"metadata": {"name": "x"}})), action: Action::Add, updated_obj: None, version: None, arrival: None };
        assert!(matches!(ChangeEnvelope::<Deployment>::from_wire(&no_uid), Err(EnvelopeError::MissingUid("obj"))));

        let bad_shape = WireEnvelope { obj: Some(json!({"metadata": "nope"})), action: Action::Delete, updated_obj: None, version: None, arrival: None };
        assert!(matches!(ChangeEnvelope::<Deployment>::from_wire(&bad_shape), Err(EnvelopeError::Payload { field: "obj", .. })));

        let half_update = WireEnvelope { obj: Some(json!({"metadata": {"uid": "a"}})), action: Action::Update, updated_obj: None, version: None, arrival: None };
        assert!(matches!(
            ChangeEnvelope::<Deployment>::from_wire(&half_update),
            Err(EnvelopeError::MissingPayload(Action::Update, "updatedObj"))
        ));

        assert!(matches!(WireEnvelope::decode(b"{not json"), Err(EnvelopeError::Json(_))));
        assert!(WireEnvelope::decode(br#"{"obj":null,"action":"upsert"}"#).is_err());
    }

    #[test]
    fn keys_agree_between_typed_and_wire_forms() {
        let env = ChangeEnvelope::delete(deploy("u9", "api", "77"));
        let wire = env.to_wire().unwrap();
        assert_eq!(env.key(), wire.key());
        assert_eq!(env.key().revision, "77");
        let stamped = env.clone().with_version(78);
        assert_eq!(stamped.key(), stamped.to_wire().unwrap().key());
        assert_ne!(stamped.key(), env.key());
    }

    #[test]
    fn unstamped_envelopes_without_resource_version_key_by_content() {
        let two = br#"{"obj":{"metadata":{"uid":"a"},"spec":{"replicas":2}},"action":"add"}"#;
        let three = br#"{"obj":{"metadata":{"uid":"a"},"spec":{"replicas":3}},"action":"add"}"#;
        let (a2, a3) = (WireEnvelope::decode(two).unwrap(), WireEnvelope::decode(three).unwrap());
        assert_ne!(a2.key(), a3.key());
        // identical content still collapses, whenever it was received
        assert_eq!(a2.key(), WireEnvelope::decode(two).unwrap().key());

        let mut bare = deploy("a", "web", "1");
        bare.metadata.resource_version = None;
        let mut scaled = bare.clone();
        scaled.metadata.name = Some("web-2".into());
        let (e1, e2) = (ChangeEnvelope::add(bare), ChangeEnvelope::add(scaled));
        assert_ne!(e1.key(), e2.key());
        assert_eq!(e1.key(), e1.to_wire().unwrap().key());
    }

    #[test]
    fn envelopes_without_uid_never_share_a_key() {
        let raw = br#"{"obj":{"metadata":{"name":"x"}},"action":"update"}"#;
        let first = WireEnvelope::decode(raw).unwrap();
        let second = WireEnvelope::decode(raw).unwrap();
        assert!(first.key().uid.is_empty());
        assert_ne!(first.key(), second.key());
        assert_eq!(first.key(), first.clone().key());
        assert_eq!(first.encode().unwrap(), second.encode().unwrap());
    }
}
