use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ObjectKey, SnapshotData};

/// Declaration of one branchable object type: its table name, the attribute
/// sets covered by uniqueness constraints, the attributes that reference
/// other objects by identity, and whether the type forms a hierarchy whose
/// derived closure data must be rebuilt after replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTypeDef {
    pub name: String,
    #[serde(default)]
    pub unique_attrs: Vec<Vec<String>>,
    /// attribute name -> referenced object type
    #[serde(default)]
    pub references: BTreeMap<String, String>,
    #[serde(default)]
    pub hierarchical: bool,
}

impl ObjectTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_attrs: Vec::new(),
            references: BTreeMap::new(),
            hierarchical: false,
        }
    }

    pub fn with_unique(mut self, attrs: &[&str]) -> Self {
        self.unique_attrs
            .push(attrs.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn with_reference(mut self, attr: &str, target: &str) -> Self {
        self.references.insert(attr.to_string(), target.to_string());
        self
    }

    pub fn hierarchical(mut self) -> Self {
        self.hierarchical = true;
        self
    }

    /// The self-referencing attribute that defines the hierarchy, if any.
    pub fn parent_attr(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|(_, target)| **target == self.name)
            .map(|(attr, _)| attr.as_str())
    }
}

/// The explicit, validated enumeration of branchable object types, checked
/// once at startup. Exempt types exist in the data store but are never
/// replicated into branch namespaces and never replayed.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<String, ObjectTypeDef>,
    exempt: BTreeSet<String>,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl TypeRegistry {
    /// Build and validate the registry. Rejects duplicate or non-identifier
    /// names (type and attribute names are interpolated into SQL
    /// identifiers), references to exempt or unknown types (branching
    /// consistency among related types is all-or-nothing), and hierarchical
    /// types without a self-reference.
    pub fn new(types: Vec<ObjectTypeDef>, exempt: Vec<String>) -> Result<Self> {
        let exempt: BTreeSet<String> = exempt.into_iter().collect();
        let mut registry = BTreeMap::new();

        for def in types {
            if !is_identifier(&def.name) {
                bail!("object type name {:?} is not a valid identifier", def.name);
            }
            if exempt.contains(&def.name) {
                bail!(
                    "object type {:?} is declared both branchable and exempt",
                    def.name
                );
            }
            for attrs in &def.unique_attrs {
                if attrs.is_empty() {
                    bail!("object type {:?} declares an empty unique attribute set", def.name);
                }
                for attr in attrs {
                    if !is_identifier(attr) {
                        bail!(
                            "unique attribute {:?} of type {:?} is not a valid identifier",
                            attr,
                            def.name
                        );
                    }
                }
            }
            for attr in def.references.keys() {
                if !is_identifier(attr) {
                    bail!(
                        "reference attribute {:?} of type {:?} is not a valid identifier",
                        attr,
                        def.name
                    );
                }
            }
            if def.hierarchical && def.parent_attr().is_none() {
                bail!(
                    "hierarchical type {:?} has no self-referencing attribute",
                    def.name
                );
            }
            if registry.contains_key(&def.name) {
                bail!("object type {:?} is registered twice", def.name);
            }
            registry.insert(def.name.clone(), def);
        }

        // A branchable type referencing a type outside the branched set
        // would let a replayed change point at a row the branch cannot see.
        for def in registry.values() {
            for (attr, target) in &def.references {
                if exempt.contains(target) {
                    bail!(
                        "type {:?} references exempt type {:?} via {:?}; \
                         related types must be branched together",
                        def.name,
                        target,
                        attr
                    );
                }
                if !registry.contains_key(target) {
                    bail!(
                        "type {:?} references unregistered type {:?} via {:?}",
                        def.name,
                        target,
                        attr
                    );
                }
            }
        }

        Ok(Self {
            types: registry,
            exempt,
        })
    }

    pub fn empty() -> Self {
        Self {
            types: BTreeMap::new(),
            exempt: BTreeSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ObjectTypeDef> {
        self.types.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&ObjectTypeDef> {
        self.types
            .get(name)
            .ok_or_else(|| anyhow!("unknown object type {:?}", name))
    }

    pub fn is_branchable(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn is_exempt(&self, name: &str) -> bool {
        self.exempt.contains(name)
    }

    /// Tables replicated into each branch namespace, in stable order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|s| s.as_str())
    }

    pub fn types(&self) -> impl Iterator<Item = &ObjectTypeDef> {
        self.types.values()
    }

    pub fn hierarchical_types(&self) -> impl Iterator<Item = &ObjectTypeDef> {
        self.types.values().filter(|t| t.hierarchical)
    }

    /// Identity references a snapshot holds to other objects, resolved
    /// through the registry's reference declarations. Null and non-numeric
    /// values are ignored.
    pub fn snapshot_references(&self, object_type: &str, data: &SnapshotData) -> Vec<ObjectKey> {
        let Some(def) = self.types.get(object_type) else {
            return Vec::new();
        };
        def.references
            .iter()
            .filter_map(|(attr, target)| {
                data.get(attr)
                    .and_then(|v| v.as_i64())
                    .map(|id| ObjectKey::new(target.clone(), id))
            })
            .collect()
    }
}
