use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::Result;
use crate::core::types::{AttributeId, AttributeMask, RoleId};
use crate::record::record::Record;
use crate::record::schema::Schema;

/// Attribute sets one role may search and refine on. Attribute ids are kept
/// sorted for deterministic serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleAttributes {
    pub searchable: BTreeSet<u8>,
    pub refining: BTreeSet<u8>,
}

/// Role → attribute access overlay, consulted per search to build the
/// attribute filter bitmap. Attributes not flagged `acl_controlled` in the
/// schema are always accessible.
#[derive(Debug, Default)]
pub struct AttributeAcl {
    roles: RwLock<HashMap<RoleId, RoleAttributes>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AclFileEntry {
    role: String,
    #[serde(default)]
    searchable: Vec<String>,
    #[serde(default)]
    refining: Vec<String>,
}

impl AttributeAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the given attributes to a role, keeping existing grants.
    pub fn append(&self, role: &RoleId, searchable: &[AttributeId], refining: &[u8]) {
        let mut roles = self.roles.write();
        let entry = roles.entry(role.clone()).or_default();
        entry.searchable.extend(searchable.iter().map(|a| a.0));
        entry.refining.extend(refining.iter().copied());
    }

    /// Revoke the given attributes from a role.
    pub fn delete_attrs(&self, role: &RoleId, searchable: &[AttributeId], refining: &[u8]) {
        let mut roles = self.roles.write();
        if let Some(entry) = roles.get_mut(role) {
            for attr in searchable {
                entry.searchable.remove(&attr.0);
            }
            for attr in refining {
                entry.refining.remove(attr);
            }
            if entry.searchable.is_empty() && entry.refining.is_empty() {
                roles.remove(role);
            }
        }
    }

    /// Make the given roles the only holders of the given attributes: first
    /// revoke the attributes everywhere, then grant them to each listed role.
    pub fn replace(&self, roles: &[RoleId], searchable: &[AttributeId], refining: &[u8]) {
        let mut table = self.roles.write();
        table.retain(|_, entry| {
            for attr in searchable {
                entry.searchable.remove(&attr.0);
            }
            for attr in refining {
                entry.refining.remove(attr);
            }
            !(entry.searchable.is_empty() && entry.refining.is_empty())
        });
        for role in roles {
            let entry = table.entry(role.clone()).or_default();
            entry.searchable.extend(searchable.iter().map(|a| a.0));
            entry.refining.extend(refining.iter().copied());
        }
    }

    pub fn role_attributes(&self, role: &RoleId) -> Option<RoleAttributes> {
        self.roles.read().get(role).cloned()
    }

    /// Attribute filter bitmap for one caller: non-ACL attributes plus the
    /// ACL attributes granted to the role. Without a role only the open
    /// attributes remain.
    pub fn searchable_mask(&self, schema: &Schema, role: Option<&RoleId>) -> AttributeMask {
        let mut mask: AttributeMask = 0;
        for (i, attr) in schema.searchable.iter().enumerate() {
            if !attr.acl_controlled {
                mask |= 1u64 << i;
            }
        }
        if let Some(role) = role {
            if let Some(entry) = self.roles.read().get(role) {
                for &attr in &entry.searchable {
                    if (attr as usize) < schema.searchable.len() {
                        mask |= 1u64 << attr;
                    }
                }
            }
        }
        mask
    }

    /// Record-level check: a record without an access list is public; one
    /// with a list requires the caller's role to intersect it.
    pub fn record_visible(record: &Record, role: Option<&RoleId>) -> bool {
        match (&record.access_roles, role) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(allowed), Some(role)) => allowed.contains(role),
        }
    }

    /// Bulk load role grants from a JSON file (list of
    /// `{role, searchable: [names], refining: [names]}` objects) or a CSV
    /// file (`role,attribute` per line) at boot.
    pub fn load_from_file(&self, path: impl AsRef<Path>, schema: &Schema) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<AclFileEntry> = if path.extension().and_then(|e| e.to_str()) == Some("json")
        {
            serde_json::from_str(&content)?
        } else {
            parse_csv_grants(&content)
        };

        let mut loaded = 0;
        for entry in entries {
            let role = RoleId::new(entry.role);
            let searchable: Vec<AttributeId> = entry
                .searchable
                .iter()
                .filter_map(|name| schema.searchable_id(name))
                .collect();
            let refining: Vec<u8> = entry
                .refining
                .iter()
                .filter_map(|name| schema.refining_id(name))
                .collect();
            if searchable.is_empty() && refining.is_empty() {
                continue;
            }
            self.append(&role, &searchable, &refining);
            loaded += 1;
        }
        info!(path = %path.display(), roles = loaded, "loaded attribute acl");
        Ok(loaded)
    }
}

fn parse_csv_grants(content: &str) -> Vec<AclFileEntry> {
    let mut by_role: HashMap<String, AclFileEntry> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let (Some(role), Some(attr)) = (parts.next(), parts.next()) else {
            continue;
        };
        by_role
            .entry(role.trim().to_string())
            .or_insert_with(|| AclFileEntry {
                role: role.trim().to_string(),
                searchable: Vec::new(),
                refining: Vec::new(),
            })
            .searchable
            .push(attr.trim().to_string());
    }
    by_role.into_values().collect()
}

/// The position-hit gate used by postings iteration: at least one of the
/// hit's attributes must be visible to the caller.
pub fn is_valid_term_position_hit(attribute_mask: AttributeMask, filter: AttributeMask) -> bool {
    attribute_mask & filter != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::schema::{IndexType, SearchableAttribute};

    fn schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::Keyword);
        for (name, acl) in [("title", false), ("salary", true), ("notes", true)] {
            schema
                .add_searchable(SearchableAttribute {
                    name: name.to_string(),
                    boost: 1.0,
                    multi_valued: false,
                    highlight: false,
                    acl_controlled: acl,
                })
                .unwrap();
        }
        schema.commit().unwrap();
        schema
    }

    #[test]
    fn mask_includes_open_attributes() {
        let acl = AttributeAcl::new();
        let schema = schema();
        assert_eq!(acl.searchable_mask(&schema, None), 0b001);

        let hr = RoleId::new("hr");
        acl.append(&hr, &[AttributeId(1)], &[]);
        assert_eq!(acl.searchable_mask(&schema, Some(&hr)), 0b011);
    }

    #[test]
    fn replace_revokes_other_roles() {
        let acl = AttributeAcl::new();
        let hr = RoleId::new("hr");
        let audit = RoleId::new("audit");
        acl.append(&hr, &[AttributeId(1)], &[]);
        acl.append(&audit, &[AttributeId(1), AttributeId(2)], &[]);

        acl.replace(&[hr.clone()], &[AttributeId(1)], &[]);
        let schema = schema();
        assert_eq!(acl.searchable_mask(&schema, Some(&hr)), 0b011);
        // audit kept attribute 2 but lost attribute 1.
        assert_eq!(acl.searchable_mask(&schema, Some(&audit)), 0b101);
    }

    #[test]
    fn delete_attrs_prunes_empty_roles() {
        let acl = AttributeAcl::new();
        let hr = RoleId::new("hr");
        acl.append(&hr, &[AttributeId(1)], &[0]);
        acl.delete_attrs(&hr, &[AttributeId(1)], &[0]);
        assert!(acl.role_attributes(&hr).is_none());
    }

    #[test]
    fn record_level_acl() {
        let schema = schema();
        let mut record = Record::new("r-1", &schema);
        assert!(AttributeAcl::record_visible(&record, None));

        record.access_roles = Some(vec![RoleId::new("hr")]);
        assert!(!AttributeAcl::record_visible(&record, None));
        assert!(!AttributeAcl::record_visible(
            &record,
            Some(&RoleId::new("audit"))
        ));
        assert!(AttributeAcl::record_visible(
            &record,
            Some(&RoleId::new("hr"))
        ));
    }

    #[test]
    fn position_hit_gate() {
        assert!(is_valid_term_position_hit(0b0110, 0b0010));
        assert!(!is_valid_term_position_hit(0b0110, 0b1001));
    }

    #[test]
    fn csv_bulk_load() {
        let acl = AttributeAcl::new();
        let schema = schema();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.csv");
        std::fs::write(&path, "hr,salary\nhr,notes\naudit,notes\n").unwrap();

        let loaded = acl.load_from_file(&path, &schema).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(
            acl.searchable_mask(&schema, Some(&RoleId::new("hr"))),
            0b111
        );
        assert_eq!(
            acl.searchable_mask(&schema, Some(&RoleId::new("audit"))),
            0b101
        );
    }
}
