//! The versioned record model: [`Kind`], [`ItemDescriptor`],
//! [`SerializedItemDescriptor`], and the [`DataKind`] capability object.
//!
//! See `spec.md` §3. Payload types are modeled as a closed enum
//! ([`Payload`]) with two well-known variants (flag, segment) plus an
//! `Opaque` variant for caller-defined kinds, rather than `Box<dyn Any>` —
//! per REDESIGN FLAGS this keeps wildcard typing confined to the
//! serialization boundary (`DataKind::serialize`/`deserialize`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModelError;

/// A record namespace. The two intrinsic kinds (`flag`, `segment`) are
/// exposed as associated constants; `Kind::new` admits caller-defined
/// kinds, which the store treats opaquely.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kind(&'static str);

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(other.0)
    }
}

impl Kind {
    pub const FLAGS: Kind = Kind("flag");
    pub const SEGMENTS: Kind = Kind("segment");

    pub const fn new(name: &'static str) -> Self {
        Kind(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }

    /// Whether this kind participates in the prerequisite DAG (§4.6).
    /// Only flags do; segments and caller-defined kinds do not.
    pub fn is_dependency_ordered(&self) -> bool {
        *self == Kind::FLAGS
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque body of a flag record. The rule/variation schema itself belongs
/// to the external evaluation engine (out of scope here, per `spec.md`
/// §1); this crate only needs enough structure to (a) hand the evaluator a
/// typed payload and (b) walk the prerequisite edges for the dependency
/// orderer (§4.6) and the flag-change tracker (§4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagPayload {
    pub key: String,
    /// Keys of flags this flag lists as prerequisites.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Opaque to this crate; handed to the evaluator as-is.
    pub rules: serde_json::Value,
}

/// Opaque body of a segment record. Segments have no prerequisites of
/// their own (§4.6 rule 1: segments precede all flags, unconditionally).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPayload {
    pub key: String,
    pub rules: serde_json::Value,
}

/// A record body for a kind this crate does not know the shape of.
/// Treated as an opaque JSON document with no dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaquePayload {
    pub kind: String,
    pub value: serde_json::Value,
}

/// The kind-specific body of a record. `None` on an [`ItemDescriptor`]
/// means either "not found" or "tombstone" — see [`ItemDescriptor`] for the
/// distinction.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Flag(FlagPayload),
    Segment(SegmentPayload),
    Opaque(OpaquePayload),
}

impl Payload {
    pub fn as_flag(&self) -> Option<&FlagPayload> {
        match self {
            Payload::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&SegmentPayload> {
        match self {
            Payload::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Payload::Flag(f) => &f.key,
            Payload::Segment(s) => &s.key,
            Payload::Opaque(o) => match &o.value {
                serde_json::Value::Object(m) => m
                    .get("key")
                    .and_then(|v| v.as_str())
                    .unwrap_or(o.kind.as_str()),
                _ => o.kind.as_str(),
            },
        }
    }
}

/// The unit exchanged with the typed (in-memory) store: a version and an
/// optional payload.
///
/// `item == None` with a valid (non-negative) `version` is a tombstone — a
/// logical deletion recorded at that version. `version ==
/// ItemDescriptor::NOT_FOUND_VERSION` with `item == None` is the distinct
/// "not found" sentinel, returned only by reads (never stored).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    pub version: i64,
    pub item: Option<Payload>,
}

impl ItemDescriptor {
    pub const NOT_FOUND_VERSION: i64 = -1;

    pub fn not_found() -> Self {
        Self {
            version: Self::NOT_FOUND_VERSION,
            item: None,
        }
    }

    pub fn tombstone(version: i64) -> Self {
        Self { version, item: None }
    }

    pub fn present(version: i64, item: Payload) -> Self {
        Self {
            version,
            item: Some(item),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.item.is_none() && self.version == Self::NOT_FOUND_VERSION
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none() && self.version != Self::NOT_FOUND_VERSION
    }

    /// Tombstones resolve to "absent" for any caller outside the store
    /// itself (§4.2 "Tombstone semantics"). `get_all` callers that need the
    /// raw tombstone (the dependency orderer does not; the updater's change
    /// detection does) should inspect `item`/`is_tombstone` directly
    /// instead of going through this helper.
    pub fn as_present(&self) -> Option<&Payload> {
        self.item.as_ref()
    }
}

/// For persistent backends that store raw bytes: a version, a deletion
/// flag, and the serialized body. The wrapper translates between this and
/// [`ItemDescriptor`] via the per-kind [`DataKind`] codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItemDescriptor {
    pub version: i64,
    pub deleted: bool,
    pub bytes: Vec<u8>,
}

impl SerializedItemDescriptor {
    pub const NOT_FOUND_VERSION: i64 = -1;

    pub fn not_found() -> Self {
        Self {
            version: Self::NOT_FOUND_VERSION,
            deleted: false,
            bytes: Vec::new(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.version == Self::NOT_FOUND_VERSION
    }
}

/// A batch of records for one kind: an ordered list of `(key,
/// ItemDescriptor)` pairs. Order is significant only when the backing
/// store is non-atomic (§4.6).
pub type Collection = (Kind, Vec<(String, ItemDescriptor)>);

/// Per-kind capability object: serialization of the payload body plus the
/// dependency edges the orderer (§4.6) needs. Object-safe so callers can
/// hold `&dyn DataKind` without monomorphizing over every kind.
///
/// Deliberately narrower than "serialize the whole descriptor": version
/// and the deletion flag are tracked by [`SerializedItemDescriptor`]
/// itself (backend-level metadata), so a `DataKind` only ever marshals the
/// payload body, matching how a real backend stores version/deleted as
/// separate columns alongside an opaque value blob.
pub trait DataKind: Send + Sync {
    fn kind(&self) -> Kind;

    fn serialize_payload(&self, payload: &Payload) -> Vec<u8>;

    fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, ModelError>;

    /// Prerequisite keys this item depends on. Empty for kinds that do not
    /// participate in the dependency graph.
    fn dependency_keys(&self, item: &ItemDescriptor) -> Vec<String> {
        let _ = item;
        Vec::new()
    }
}

/// Translates a typed [`ItemDescriptor`] into the bytes-oriented form a
/// persistent backend stores (§4.3, §4.4).
pub fn to_serialized(data_kind: &dyn DataKind, item: &ItemDescriptor) -> SerializedItemDescriptor {
    match &item.item {
        Some(payload) => SerializedItemDescriptor {
            version: item.version,
            deleted: false,
            bytes: data_kind.serialize_payload(payload),
        },
        None => SerializedItemDescriptor {
            version: item.version,
            deleted: true,
            bytes: Vec::new(),
        },
    }
}

/// Translates a backend's raw [`SerializedItemDescriptor`] back into a
/// typed [`ItemDescriptor`]. Not-found and tombstones short-circuit
/// without touching the codec; only a present item's bytes are decoded.
pub fn from_serialized(
    data_kind: &dyn DataKind,
    serialized: &SerializedItemDescriptor,
) -> Result<ItemDescriptor, ModelError> {
    if serialized.is_not_found() {
        return Ok(ItemDescriptor::not_found());
    }
    if serialized.deleted {
        return Ok(ItemDescriptor::tombstone(serialized.version));
    }
    let payload = data_kind.deserialize_payload(&serialized.bytes)?;
    Ok(ItemDescriptor::present(serialized.version, payload))
}

/// `DataKind` implementation for [`Kind::FLAGS`].
pub struct FlagKind;

impl DataKind for FlagKind {
    fn kind(&self) -> Kind {
        Kind::FLAGS
    }

    fn serialize_payload(&self, payload: &Payload) -> Vec<u8> {
        match payload.as_flag() {
            Some(flag) => serde_json::to_vec(flag).unwrap_or_default(),
            // A payload that doesn't match the kind it was stored under is a
            // caller bug (the store never constructs this pairing itself),
            // not a codec failure; fall back to encoding whatever's actually
            // there instead of panicking.
            None => serde_json::to_vec(&serde_json::json!({ "key": payload.key() })).unwrap_or_default(),
        }
    }

    fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, ModelError> {
        let flag: FlagPayload =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Deserialize(e.to_string()))?;
        Ok(Payload::Flag(flag))
    }

    fn dependency_keys(&self, item: &ItemDescriptor) -> Vec<String> {
        item.item
            .as_ref()
            .and_then(Payload::as_flag)
            .map(|f| f.prerequisites.clone())
            .unwrap_or_default()
    }
}

/// `DataKind` implementation for [`Kind::SEGMENTS`].
pub struct SegmentKind;

impl DataKind for SegmentKind {
    fn kind(&self) -> Kind {
        Kind::SEGMENTS
    }

    fn serialize_payload(&self, payload: &Payload) -> Vec<u8> {
        match payload.as_segment() {
            Some(segment) => serde_json::to_vec(segment).unwrap_or_default(),
            None => serde_json::to_vec(&serde_json::json!({ "key": payload.key() })).unwrap_or_default(),
        }
    }

    fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, ModelError> {
        let segment: SegmentPayload =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Deserialize(e.to_string()))?;
        Ok(Payload::Segment(segment))
    }
}

/// `DataKind` for a caller-defined kind with no known internal structure.
pub struct OpaqueKind(pub Kind);

impl DataKind for OpaqueKind {
    fn kind(&self) -> Kind {
        self.0
    }

    fn serialize_payload(&self, payload: &Payload) -> Vec<u8> {
        let value = match payload {
            Payload::Opaque(o) => o.value.clone(),
            other => serde_json::json!({ "key": other.key() }),
        };
        serde_json::to_vec(&value).unwrap_or_default()
    }

    fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, ModelError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Deserialize(e.to_string()))?;
        Ok(Payload::Opaque(OpaquePayload {
            kind: self.0.name().to_owned(),
            value,
        }))
    }
}

/// Resolves the `DataKind` capability object for a [`Kind`].
pub fn data_kind_for(kind: Kind) -> Box<dyn DataKind> {
    match kind {
        Kind::FLAGS => Box::new(FlagKind),
        Kind::SEGMENTS => Box::new(SegmentKind),
        other => Box::new(OpaqueKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(key: &str, version: i64, prereqs: &[&str]) -> ItemDescriptor {
        ItemDescriptor::present(
            version,
            Payload::Flag(FlagPayload {
                key: key.to_owned(),
                prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
                rules: serde_json::json!({}),
            }),
        )
    }

    #[test]
    fn not_found_and_tombstone_are_distinct() {
        let nf = ItemDescriptor::not_found();
        let tomb = ItemDescriptor::tombstone(5);
        assert!(nf.is_not_found());
        assert!(!nf.is_tombstone());
        assert!(tomb.is_tombstone());
        assert!(!tomb.is_not_found());
    }

    #[test]
    fn flag_kind_round_trips_through_bytes() {
        let kind = FlagKind;
        let item = flag("a", 3, &["b", "c"]);
        let serialized = to_serialized(&kind, &item);
        assert!(!serialized.deleted);
        let back = from_serialized(&kind, &serialized).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn flag_kind_round_trips_tombstones() {
        let kind = FlagKind;
        let item = ItemDescriptor::tombstone(9);
        let serialized = to_serialized(&kind, &item);
        assert!(serialized.deleted);
        assert!(serialized.bytes.is_empty());
        let back = from_serialized(&kind, &serialized).unwrap();
        assert!(back.is_tombstone());
        assert_eq!(back.version, 9);
    }

    #[test]
    fn not_found_round_trips_without_touching_codec() {
        let kind = FlagKind;
        let serialized = SerializedItemDescriptor::not_found();
        let back = from_serialized(&kind, &serialized).unwrap();
        assert!(back.is_not_found());
    }

    #[test]
    fn flag_dependency_keys_reads_prerequisites() {
        let kind = FlagKind;
        let item = flag("a", 1, &["b", "c"]);
        assert_eq!(kind.dependency_keys(&item), vec!["b", "c"]);
    }

    #[test]
    fn segment_kind_has_no_dependency_keys() {
        let kind = SegmentKind;
        let item = ItemDescriptor::present(
            1,
            Payload::Segment(SegmentPayload {
                key: "s".to_owned(),
                rules: serde_json::json!({}),
            }),
        );
        assert!(kind.dependency_keys(&item).is_empty());
    }

    #[test]
    fn kind_equality_is_by_name() {
        assert_eq!(Kind::FLAGS, Kind::new("flag"));
        assert_ne!(Kind::FLAGS, Kind::SEGMENTS);
    }

    #[test]
    fn data_kind_for_unknown_kind_is_opaque() {
        let k = Kind::new("experiment");
        let dk = data_kind_for(k);
        assert_eq!(dk.kind(), k);
        let item = ItemDescriptor::present(
            1,
            Payload::Opaque(OpaquePayload {
                kind: "experiment".to_owned(),
                value: serde_json::json!({"key": "e1"}),
            }),
        );
        let serialized = to_serialized(dk.as_ref(), &item);
        let back = from_serialized(dk.as_ref(), &serialized).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn opaque_kind_serializes_just_the_value() {
        let dk = data_kind_for(Kind::new("experiment"));
        let item = ItemDescriptor::present(
            1,
            Payload::Opaque(OpaquePayload {
                kind: "experiment".to_owned(),
                value: serde_json::json!({"a": 1}),
            }),
        );
        let serialized = to_serialized(dk.as_ref(), &item);
        assert_eq!(serialized.bytes, serde_json::to_vec(&serde_json::json!({"a": 1})).unwrap());
    }
}
