use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::AttributeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    Keyword,
    KeywordGeo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionIndexMode {
    /// Store no position information in the forward lists.
    None,
    /// Store token positions, enabling phrase search.
    WordPositions,
    /// Store token positions and character offsets, enabling highlighting.
    WordAndCharPositions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefiningType {
    Text,
    Int,
    Long,
    Float,
    Double,
    Time,
}

/// Definition of one searchable (full-text) attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchableAttribute {
    pub name: String,
    /// Boost in [1, 100]; contributes to the sum-of-field-boosts factor of
    /// the text relevance.
    pub boost: f32,
    pub multi_valued: bool,
    pub highlight: bool,
    pub acl_controlled: bool,
}

/// Definition of one refining (filter/sort) attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefiningAttribute {
    pub name: String,
    pub refining_type: RefiningType,
    pub default_value: String,
    pub multi_valued: bool,
    pub acl_controlled: bool,
}

/// Immutable after `commit`. At most 64 searchable attributes so that an
/// attribute set fits an u64 bitmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub primary_key: String,
    pub searchable: Vec<SearchableAttribute>,
    pub refining: Vec<RefiningAttribute>,
    pub latitude_attribute: Option<String>,
    pub longitude_attribute: Option<String>,
    pub index_type: IndexType,
    pub position_mode: PositionIndexMode,
    committed: bool,
}

impl Schema {
    pub fn new(primary_key: impl Into<String>, index_type: IndexType) -> Self {
        Schema {
            primary_key: primary_key.into(),
            searchable: Vec::new(),
            refining: Vec::new(),
            latitude_attribute: None,
            longitude_attribute: None,
            index_type,
            position_mode: PositionIndexMode::WordPositions,
            committed: false,
        }
    }

    pub fn add_searchable(&mut self, attr: SearchableAttribute) -> Result<AttributeId> {
        if self.committed {
            return Err(Error::new(ErrorKind::InvalidState, "schema already committed"));
        }
        if self.searchable.len() >= 64 {
            return Err(Error::new(
                ErrorKind::CapacityExceeded,
                "at most 64 searchable attributes",
            ));
        }
        if !(1.0..=100.0).contains(&attr.boost) {
            return Err(Error::validation(format!(
                "boost {} for '{}' outside [1, 100]",
                attr.boost, attr.name
            )));
        }
        let id = AttributeId(self.searchable.len() as u8);
        self.searchable.push(attr);
        Ok(id)
    }

    pub fn add_refining(&mut self, attr: RefiningAttribute) -> Result<()> {
        if self.committed {
            return Err(Error::new(ErrorKind::InvalidState, "schema already committed"));
        }
        self.refining.push(attr);
        Ok(())
    }

    pub fn set_geo_attributes(&mut self, latitude: impl Into<String>, longitude: impl Into<String>) {
        self.latitude_attribute = Some(latitude.into());
        self.longitude_attribute = Some(longitude.into());
    }

    /// Seal the schema. Must be called before the first record is ingested.
    pub fn commit(&mut self) -> Result<()> {
        if self.searchable.is_empty() {
            return Err(Error::validation("schema has no searchable attributes"));
        }
        if self.index_type == IndexType::KeywordGeo
            && (self.latitude_attribute.is_none() || self.longitude_attribute.is_none())
        {
            return Err(Error::validation(
                "geo index requires latitude and longitude attribute names",
            ));
        }
        self.committed = true;
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn searchable_id(&self, name: &str) -> Option<AttributeId> {
        self.searchable
            .iter()
            .position(|a| a.name == name)
            .map(|i| AttributeId(i as u8))
    }

    pub fn refining_id(&self, name: &str) -> Option<u8> {
        self.refining.iter().position(|a| a.name == name).map(|i| i as u8)
    }

    pub fn sum_of_field_boosts(&self, mask: u64) -> f32 {
        self.searchable
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1u64 << i) != 0)
            .map(|(_, a)| a.boost)
            .sum()
    }

    /// Compare against a deserialized schema; used by the load-time
    /// consistency check.
    pub fn matches(&self, other: &Schema) -> bool {
        self.primary_key == other.primary_key
            && self.index_type == other.index_type
            && self.searchable.len() == other.searchable.len()
            && self
                .searchable
                .iter()
                .zip(&other.searchable)
                .all(|(a, b)| a.name == b.name && a.multi_valued == b.multi_valued)
            && self.refining.len() == other.refining.len()
            && self
                .refining
                .iter()
                .zip(&other.refining)
                .all(|(a, b)| a.name == b.name && a.refining_type == b.refining_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_attr(name: &str, boost: f32) -> SearchableAttribute {
        SearchableAttribute {
            name: name.to_string(),
            boost,
            multi_valued: false,
            highlight: false,
            acl_controlled: false,
        }
    }

    #[test]
    fn commit_seals_schema() {
        let mut schema = Schema::new("id", IndexType::Keyword);
        schema.add_searchable(text_attr("title", 2.0)).unwrap();
        schema.commit().unwrap();

        let err = schema.add_searchable(text_attr("body", 1.0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn boost_range_is_checked() {
        let mut schema = Schema::new("id", IndexType::Keyword);
        assert!(schema.add_searchable(text_attr("title", 0.5)).is_err());
        assert!(schema.add_searchable(text_attr("title", 101.0)).is_err());
        assert!(schema.add_searchable(text_attr("title", 100.0)).is_ok());
    }

    #[test]
    fn geo_schema_requires_coordinates() {
        let mut schema = Schema::new("id", IndexType::KeywordGeo);
        schema.add_searchable(text_attr("title", 1.0)).unwrap();
        assert!(schema.commit().is_err());

        schema.set_geo_attributes("lat", "lng");
        assert!(schema.commit().is_ok());
    }

    #[test]
    fn field_boost_sum_uses_mask() {
        let mut schema = Schema::new("id", IndexType::Keyword);
        schema.add_searchable(text_attr("title", 2.0)).unwrap();
        schema.add_searchable(text_attr("body", 1.0)).unwrap();
        schema.commit().unwrap();

        assert_eq!(schema.sum_of_field_boosts(0b01), 2.0);
        assert_eq!(schema.sum_of_field_boosts(0b11), 3.0);
    }
}
