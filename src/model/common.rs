use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type BranchId = Uuid;

/// A complete attribute snapshot of one logical object. Snapshots are always
/// full attribute sets, never partial deltas.
pub type SnapshotData = serde_json::Map<String, serde_json::Value>;

/// Stable identity of a logical object: its type plus its numeric id within
/// a namespace. Snapshots reference other objects by this identity, never by
/// embedded object graphs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub object_type: String,
    pub object_id: i64,
}

impl ObjectKey {
    pub fn new(object_type: impl Into<String>, object_id: i64) -> Self {
        Self {
            object_type: object_type.into(),
            object_id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

pub fn generate_branch_id() -> BranchId {
    Uuid::new_v4()
}

/// Generate a random alphanumeric schema identifier. Immutable once assigned
/// to a branch; the isolated namespace name is derived from it.
pub fn generate_schema_id() -> String {
    const SCHEMA_ID_LENGTH: usize = 8;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..SCHEMA_ID_LENGTH)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Shallow comparison of two attribute maps: the sorted set of attribute
/// names whose values differ between the two (missing counts as null).
pub fn changed_attr_names(a: &SnapshotData, b: &SnapshotData) -> Vec<String> {
    let mut names: Vec<String> = a
        .keys()
        .chain(b.keys())
        .filter(|k| a.get(*k) != b.get(*k))
        .cloned()
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_ids_are_lowercase_alphanumeric() {
        let id = generate_schema_id();
        assert_eq!(id.len(), 8);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn changed_attr_names_covers_both_sides() {
        let mut a = SnapshotData::new();
        a.insert("name".into(), json!("dc1"));
        a.insert("status".into(), json!("active"));
        let mut b = SnapshotData::new();
        b.insert("name".into(), json!("dc1"));
        b.insert("status".into(), json!("planned"));
        b.insert("comment".into(), json!("new"));

        assert_eq!(changed_attr_names(&a, &b), vec!["comment", "status"]);
    }
}
