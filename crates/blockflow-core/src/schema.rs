//! Three-tier schema model.
//!
//! Every block carries a *nominal* schema (what its producer declared), an
//! *inferred* schema (what its data actually looks like, computed once) and a
//! *realized* schema (what consumers see). [`reconcile`] is the single place
//! realized schemas are derived.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::Records;

/// Key of the schema that accepts anything.
pub const ANY_SCHEMA_KEY: &str = "core.Any";

/// Namespace generated schemas are registered under.
pub const GENERATED_NAMESPACE: &str = "_generated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Text,
    DateTime,
    Json,
    Unknown,
}

impl FieldType {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(n) if n.is_f64() => Some(Self::Float),
            Value::Number(_) => Some(Self::Integer),
            Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => Some(Self::DateTime),
            Value::String(_) => Some(Self::Text),
            Value::Array(_) | Value::Object(_) => Some(Self::Json),
        }
    }

    /// Narrowest type that can hold values of both `self` and `other`.
    fn widen(self, other: Self) -> Self {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Unknown, b) => b,
            (a, Unknown) => a,
            (Integer, Float) | (Float, Integer) => Float,
            (DateTime, Text) | (Text, DateTime) => Text,
            (Json, _) | (_, Json) => Json,
            _ => Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub key: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Schema {
    pub fn new(key: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            key: key.into(),
            fields,
            description: None,
        }
    }

    pub fn any() -> Self {
        Self {
            key: ANY_SCHEMA_KEY.to_string(),
            fields: vec![],
            description: Some("Accepts data of any structure".to_string()),
        }
    }

    pub fn is_any(&self) -> bool {
        is_any_key(Some(&self.key))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.split_once('.').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.key.rsplit('.').next().unwrap_or(&self.key)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn fields_summary(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{}:{:?}", f.name, f.field_type))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether `self` has every field of `other` (types ignored).
    pub fn covers(&self, other: &Schema) -> bool {
        other.fields.iter().all(|f| self.field(&f.name).is_some())
    }
}

/// `None`, `"Any"` and `"core.Any"` all mean "no expectation".
pub fn is_any_key(key: Option<&str>) -> bool {
    matches!(key, None | Some("Any") | Some(ANY_SCHEMA_KEY) | Some(""))
}

fn generated_key(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}.{}{}", GENERATED_NAMESPACE, prefix, &id[..12])
}

/// Infer a schema from the structure of `records`.
///
/// Fields are ordered by first appearance; a field present in any row is
/// part of the schema.
pub fn infer_schema(records: &Records) -> Schema {
    let mut fields: Vec<Field> = Vec::new();
    for record in records {
        for (name, value) in record {
            let observed = FieldType::of(value).unwrap_or(FieldType::Unknown);
            match fields.iter_mut().find(|f| &f.name == name) {
                Some(field) => field.field_type = field.field_type.widen(observed),
                None => fields.push(Field::new(name.clone(), observed)),
            }
        }
    }
    Schema::new(generated_key("Inferred"), fields)
}

/// Derive the realized schema from an inferred schema and an optional
/// nominal one.
///
/// With no concrete nominal schema the inferred schema is used as-is.
/// Otherwise nominal fields keep their declared types, and inferred fields
/// the nominal schema lacks are appended, so realized schemas only grow.
pub fn reconcile(nominal: Option<&Schema>, inferred: &Schema) -> Schema {
    let nominal = match nominal {
        Some(n) if !n.is_any() => n,
        _ => return inferred.clone(),
    };
    if nominal.covers(inferred) {
        return nominal.clone();
    }
    let mut fields = nominal.fields.clone();
    for field in &inferred.fields {
        if nominal.field(&field.name).is_none() {
            fields.push(field.clone());
        }
    }
    let mut realized = Schema::new(generated_key(&format!("{}Realized", nominal.name())), fields);
    realized.description = Some(format!("Realized from {}", nominal.key));
    realized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(rows: Vec<Value>) -> Records {
        rows.into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_infer_schema_types() {
        let rs = records(vec![
            json!({"name": "a", "n": 1, "x": 1.5, "ok": true, "at": "2000-01-01T00:00:00Z"}),
            json!({"name": "b", "n": 2, "x": 2, "meta": {"idx": 1}}),
        ]);
        let s = infer_schema(&rs);
        assert!(s.key.starts_with("_generated.Inferred"));
        assert_eq!(s.field_names(), vec!["name", "n", "x", "ok", "at", "meta"]);
        assert_eq!(s.field("n").unwrap().field_type, FieldType::Integer);
        assert_eq!(s.field("x").unwrap().field_type, FieldType::Float);
        assert_eq!(s.field("at").unwrap().field_type, FieldType::DateTime);
        assert_eq!(s.field("meta").unwrap().field_type, FieldType::Json);
    }

    #[test]
    fn test_infer_null_only_field_is_unknown() {
        let rs = records(vec![json!({"a": null}), json!({"a": null})]);
        let s = infer_schema(&rs);
        assert_eq!(s.field("a").unwrap().field_type, FieldType::Unknown);
    }

    #[test]
    fn test_reconcile_any_uses_inferred() {
        let inferred = Schema::new("_generated.I1", vec![Field::new("a", FieldType::Text)]);
        assert_eq!(reconcile(None, &inferred), inferred);
        assert_eq!(reconcile(Some(&Schema::any()), &inferred), inferred);
    }

    #[test]
    fn test_reconcile_nominal_covers_inferred() {
        let nominal = Schema::new(
            "shop.Customer",
            vec![
                Field::new("name", FieldType::Text),
                Field::new("joined", FieldType::DateTime),
            ],
        );
        let inferred = Schema::new("_generated.I2", vec![Field::new("name", FieldType::Integer)]);
        let realized = reconcile(Some(&nominal), &inferred);
        assert_eq!(realized.key, "shop.Customer");
        assert_eq!(realized.field("name").unwrap().field_type, FieldType::Text);
    }

    #[test]
    fn test_reconcile_grows_with_extra_fields() {
        let nominal = Schema::new("shop.Customer", vec![Field::new("name", FieldType::Text)]);
        let inferred = Schema::new(
            "_generated.I3",
            vec![
                Field::new("name", FieldType::Text),
                Field::new("new_field", FieldType::Text),
            ],
        );
        let realized = reconcile(Some(&nominal), &inferred);
        assert_ne!(realized.key, nominal.key);
        assert_eq!(realized.field_names(), vec!["name", "new_field"]);
    }

    #[test]
    fn test_is_any_key() {
        assert!(is_any_key(None));
        assert!(is_any_key(Some("Any")));
        assert!(is_any_key(Some(ANY_SCHEMA_KEY)));
        assert!(!is_any_key(Some("shop.Customer")));
    }
}
