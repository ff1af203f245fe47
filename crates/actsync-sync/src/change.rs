//! Content hashing and write classification.

use std::collections::BTreeMap;

use actsync_core::{ActivityContent, StoredActivity};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

fn timestamp_value(value: Option<DateTime<Utc>>) -> JsonValue {
    value
        .map(|dt| JsonValue::from(dt.to_rfc3339_opts(SecondsFormat::Micros, true)))
        .unwrap_or(JsonValue::Null)
}

/// Canonical field map; `BTreeMap` keeps the keys sorted.
pub fn canonical_fields(content: &ActivityContent) -> BTreeMap<&'static str, JsonValue> {
    BTreeMap::from([
        ("api_endpoint_id", JsonValue::from(content.api_endpoint_id)),
        ("canceled", JsonValue::from(content.canceled)),
        ("cover_picture", JsonValue::from(content.cover_picture.clone())),
        ("description", JsonValue::from(content.description.clone())),
        ("end_date", timestamp_value(content.end_date)),
        ("latitude", JsonValue::from(content.latitude)),
        ("level_id", JsonValue::from(content.level_id)),
        ("location", JsonValue::from(content.location.clone())),
        ("longitude", JsonValue::from(content.longitude)),
        ("name", JsonValue::from(content.name.clone())),
        ("rt_type", JsonValue::from(content.rt_type.clone())),
        ("rt_visibility", JsonValue::from(content.rt_visibility.clone())),
        ("start_date", timestamp_value(content.start_date)),
        ("type", JsonValue::from(content.kind.clone())),
    ])
}

/// SHA-256 hex digest of the canonical fields.
pub fn content_hash(content: &ActivityContent) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in canonical_fields(content) {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Updated,
    Restored,
    Unchanged,
}

/// Row to write for `incoming`, or `None` when nothing changed.
///
/// A retired row is always written so its `deleted_at` is cleared; its
/// `updated_at` only moves when the content hash differs.
pub fn plan_write(
    id: i64,
    existing: Option<&StoredActivity>,
    incoming: ActivityContent,
    now: DateTime<Utc>,
) -> (ChangeKind, Option<StoredActivity>) {
    let Some(existing) = existing else {
        let row = StoredActivity {
            id,
            content: incoming,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        return (ChangeKind::New, Some(row));
    };

    let changed = content_hash(&existing.content) != content_hash(&incoming);
    let kind = match (existing.is_retired(), changed) {
        (true, _) => ChangeKind::Restored,
        (false, true) => ChangeKind::Updated,
        (false, false) => return (ChangeKind::Unchanged, None),
    };
    let row = StoredActivity {
        id,
        content: incoming,
        created_at: existing.created_at,
        updated_at: if changed { now } else { existing.updated_at },
        deleted_at: None,
    };
    (kind, Some(row))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub new: usize,
    pub updated: usize,
    pub restored: usize,
    pub unchanged: usize,
}

/// Accumulates the rows of one upsert batch.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub rows: Vec<StoredActivity>,
    pub counts: ChangeCounts,
}

impl ChangeSet {
    pub fn push(
        &mut self,
        id: i64,
        existing: Option<&StoredActivity>,
        incoming: ActivityContent,
        now: DateTime<Utc>,
    ) -> ChangeKind {
        let (kind, row) = plan_write(id, existing, incoming, now);
        match kind {
            ChangeKind::New => self.counts.new += 1,
            ChangeKind::Updated => self.counts.updated += 1,
            ChangeKind::Restored => self.counts.restored += 1,
            ChangeKind::Unchanged => self.counts.unchanged += 1,
        }
        self.rows.extend(row);
        kind
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
