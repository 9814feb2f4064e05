use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, Result};
use crate::core::types::RoleId;
use crate::geo::shapes::Point;
use crate::record::schema::{IndexType, RefiningType, Schema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefiningValue {
    Text(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Seconds since the epoch.
    Time(i64),
    MultiText(Vec<String>),
}

/// One ingested document. Searchable values keep schema order; entry i holds
/// the value sequence of searchable attribute i (one entry for single-valued
/// attributes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub primary_key: String,
    pub searchable_values: Vec<Vec<String>>,
    pub refining_values: Vec<Option<RefiningValue>>,
    pub location: Option<Point>,
    pub record_boost: f32,
    /// Roles allowed to see this record; `None` means unrestricted.
    pub access_roles: Option<Vec<RoleId>>,
    /// Opaque blob returned verbatim in results.
    pub stored_blob: Option<Vec<u8>>,
}

impl Record {
    pub fn new(primary_key: impl Into<String>, schema: &Schema) -> Self {
        Record {
            primary_key: primary_key.into(),
            searchable_values: vec![Vec::new(); schema.searchable.len()],
            refining_values: vec![None; schema.refining.len()],
            location: None,
            record_boost: 1.0,
            access_roles: None,
            stored_blob: None,
        }
    }

    pub fn set_searchable(&mut self, attr_index: usize, value: impl Into<String>) {
        self.searchable_values[attr_index].push(value.into());
    }

    /// Parse a JSON object into a record, validating it against the schema.
    /// Nothing touches the index on failure.
    pub fn from_json(json: &str, schema: &Schema) -> Result<Record> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("malformed JSON record: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::validation("record must be a JSON object"))?;

        let primary_key = match object.get(&schema.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(Error::validation("primary key must be a string or number")),
            None => {
                return Err(Error::validation(format!(
                    "record missing primary key attribute '{}'",
                    schema.primary_key
                )))
            }
        };

        let mut record = Record::new(primary_key, schema);

        for (key, field) in object {
            if key == &schema.primary_key {
                continue;
            }
            if let Some(attr_id) = schema.searchable_id(key) {
                record.searchable_values[attr_id.0 as usize] = json_text_values(field)?;
            } else if let Some(refining_id) = schema.refining_id(key) {
                let attr = &schema.refining[refining_id as usize];
                record.refining_values[refining_id as usize] =
                    Some(parse_refining(field, attr.refining_type, key)?);
            } else if Some(key.as_str()) == schema.latitude_attribute.as_deref()
                || Some(key.as_str()) == schema.longitude_attribute.as_deref()
            {
                // handled below once both coordinates are known
            } else {
                return Err(Error::validation(format!("unknown attribute '{}'", key)));
            }
        }

        if schema.index_type == IndexType::KeywordGeo {
            let latitude = geo_coordinate(object, schema.latitude_attribute.as_deref())?;
            let longitude = geo_coordinate(object, schema.longitude_attribute.as_deref())?;
            match (latitude, longitude) {
                (Some(x), Some(y)) => {
                    let point = Point { x, y };
                    if !point.in_world_bounds() {
                        return Err(Error::validation(format!(
                            "geo coordinates ({}, {}) out of range",
                            x, y
                        )));
                    }
                    record.location = Some(point);
                }
                (None, None) => {}
                _ => return Err(Error::validation("record has only one geo coordinate")),
            }
        }

        Ok(record)
    }

    pub fn to_json(&self, schema: &Schema) -> Result<String> {
        let mut object = serde_json::Map::new();
        object.insert(
            schema.primary_key.clone(),
            Value::String(self.primary_key.clone()),
        );
        for (i, attr) in schema.searchable.iter().enumerate() {
            let values = &self.searchable_values[i];
            if values.is_empty() {
                continue;
            }
            let value = if attr.multi_valued {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            } else {
                Value::String(values[0].clone())
            };
            object.insert(attr.name.clone(), value);
        }
        if let (Some(point), Some(lat), Some(lng)) = (
            self.location,
            schema.latitude_attribute.as_ref(),
            schema.longitude_attribute.as_ref(),
        ) {
            object.insert(lat.clone(), json_number(point.x));
            object.insert(lng.clone(), json_number(point.y));
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn json_text_values(field: &Value) -> Result<Vec<String>> {
    match field {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Number(n) => Ok(vec![n.to_string()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(Error::validation(format!(
                    "searchable value must be text, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(Error::validation(format!(
            "searchable value must be text, got {}",
            other
        ))),
    }
}

fn parse_refining(field: &Value, refining_type: RefiningType, name: &str) -> Result<RefiningValue> {
    let type_error = || Error::validation(format!("attribute '{}' has the wrong type", name));
    match refining_type {
        RefiningType::Text => match field {
            Value::String(s) => Ok(RefiningValue::Text(s.clone())),
            Value::Array(items) => Ok(RefiningValue::MultiText(
                items
                    .iter()
                    .map(|i| i.as_str().map(str::to_string).ok_or_else(type_error))
                    .collect::<Result<_>>()?,
            )),
            _ => Err(type_error()),
        },
        RefiningType::Int => field
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(RefiningValue::Int)
            .ok_or_else(type_error),
        RefiningType::Long => field.as_i64().map(RefiningValue::Long).ok_or_else(type_error),
        RefiningType::Float => field
            .as_f64()
            .map(|v| RefiningValue::Float(v as f32))
            .ok_or_else(type_error),
        RefiningType::Double => field.as_f64().map(RefiningValue::Double).ok_or_else(type_error),
        RefiningType::Time => field.as_i64().map(RefiningValue::Time).ok_or_else(type_error),
    }
}

fn geo_coordinate(
    object: &serde_json::Map<String, Value>,
    attribute: Option<&str>,
) -> Result<Option<f64>> {
    let Some(name) = attribute else {
        return Ok(None);
    };
    match object.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::validation(format!("geo coordinate '{}' is not a number", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::schema::SearchableAttribute;

    fn test_schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::KeywordGeo);
        schema
            .add_searchable(SearchableAttribute {
                name: "title".to_string(),
                boost: 2.0,
                multi_valued: false,
                highlight: true,
                acl_controlled: false,
            })
            .unwrap();
        schema
            .add_searchable(SearchableAttribute {
                name: "tags".to_string(),
                boost: 1.0,
                multi_valued: true,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema.set_geo_attributes("lat", "lng");
        schema.commit().unwrap();
        schema
    }

    #[test]
    fn parses_valid_record() {
        let schema = test_schema();
        let record = Record::from_json(
            r#"{"id": "r-1", "title": "coffee house", "tags": ["cafe", "wifi"], "lat": 33.6, "lng": -117.8}"#,
            &schema,
        )
        .unwrap();
        assert_eq!(record.primary_key, "r-1");
        assert_eq!(record.searchable_values[0], vec!["coffee house"]);
        assert_eq!(record.searchable_values[1].len(), 2);
        assert!(record.location.is_some());
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let schema = test_schema();
        let err = Record::from_json(r#"{"title": "no id"}"#, &schema).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Validation);
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let schema = test_schema();
        let err =
            Record::from_json(r#"{"id": "r-1", "bogus": "value"}"#, &schema).unwrap_err();
        assert!(err.context.contains("unknown attribute"));
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let schema = test_schema();
        let err = Record::from_json(
            r#"{"id": "r-1", "title": "x", "lat": 500.0, "lng": 0.0}"#,
            &schema,
        )
        .unwrap_err();
        assert!(err.context.contains("out of range"));
    }
}
