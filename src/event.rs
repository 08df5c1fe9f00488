//! The canonical event shape, id derivation, and timestamp stamping
//! (spec.md §3, §4.2).

use sha2::{Digest, Sha256};

use crate::hlc::Timestamp;

/// An immutable, persisted domain event.
///
/// Once handed to a provider a record is not shared mutably again: the
/// façade only ever constructs new records, it never mutates persisted
/// ones (spec.md §3 "Ownership").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Globally unique id, derived from `(stream, type, created)`.
    pub id: String,
    /// Opaque stream identifier; the unit of serialization.
    pub stream: String,
    /// Short string naming the event kind; must be registered.
    pub r#type: String,
    /// Type-specific payload, canonically JSON.
    pub data: serde_json::Value,
    /// Type-specific envelope (originator, causation, ...), canonically JSON.
    pub meta: serde_json::Value,
    /// HLC timestamp assigned by the originating node when first minted.
    pub created: String,
    /// HLC timestamp assigned when accepted by the local store. Equal to
    /// `created` for locally minted events.
    pub recorded: String,
}

/// Input to [`make_record`]: an event not yet stamped or persisted.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub stream: Option<String>,
    pub r#type: String,
    pub data: serde_json::Value,
    pub meta: serde_json::Value,
}

/// Computes the deterministic id for `(stream, type, created)`. Identical
/// submissions (same triple) always yield the same id, which is what
/// makes `push` idempotent (spec.md §3 invariants, §8 property 1).
pub fn derive_id(stream: &str, r#type: &str, created: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stream.as_bytes());
    hasher.update(b"|");
    hasher.update(r#type.as_bytes());
    hasher.update(b"|");
    hasher.update(created.as_bytes());

    let digest = hasher.finalize();
    // 128 bits of a collision-resistant hash suffice per spec.md §3.
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(&mut out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Builds an unsent record from [`NewRecord`], generating a stream id if
/// absent and stamping `created`/`recorded` from the given timestamp
/// (spec.md §4.2). `recorded` starts out equal to `created`; the push
/// pipeline may later overwrite it for hydrated events (spec.md §4.9).
pub fn make_record(input: NewRecord, created: Timestamp) -> Record {
    let stream = input.stream.unwrap_or_else(generate_stream_id);
    let created_key = created.to_key();
    let id = derive_id(&stream, &input.r#type, &created_key);

    Record {
        id,
        stream,
        r#type: input.r#type,
        data: input.data,
        meta: input.meta,
        recorded: created_key.clone(),
        created: created_key,
    }
}

/// Generates an opaque stream id when the caller didn't supply one.
pub fn generate_stream_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
