//! Rows and the snake_case ↔ PascalCase field name mapping.
//!
//! Every row the core hands out carries a stable `id` field; drivers that read
//! back-ends without a natural key generate one on first load.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use serde_json::Value;

/// An ordered map from field name to value. Field order follows the back-end
/// (column order, JSON key order, CSV header order).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    pub fields: IndexMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// The stable row id, stringified. Empty when the row has none yet.
    pub fn id(&self) -> String {
        self.get("id").map(value_to_string).unwrap_or_default()
    }

    pub fn ensure_id(&mut self, generate: impl FnOnce() -> String) {
        let missing = match self.get("id") {
            None | Some(Value::Null) => true,
            Some(v) => value_to_string(v).is_empty(),
        };

        if missing {
            let id = generate();
            self.fields.insert("id".into(), Value::String(id));
            // Keep `id` first so positional consumers (CSV, tables) stay stable.
            self.fields.move_index(self.fields.len() - 1, 0);
        }
    }

    /// Look a field up by its PascalCase template name (`AssignedTo` → `assigned_to`).
    /// Matching is case-insensitive on the underscore-split form, so `ID` and `Id`
    /// both reach `id`.
    pub fn template_get(&self, pascal: &str) -> Option<&Value> {
        if let Some(v) = self.fields.get(pascal) {
            return Some(v);
        }

        let wanted = pascal.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|(name, _)| field_to_template(name).to_ascii_lowercase() == wanted)
            .map(|(_, v)| v)
    }

    pub fn from_json_object(obj: serde_json::Map<String, Value>) -> Self {
        Self {
            fields: obj.into_iter().collect(),
        }
    }
}

/// `assigned_to` → `AssignedTo`. Total and deterministic: split on `_`,
/// uppercase each segment's first ASCII character, concatenate.
pub fn field_to_template(field: &str) -> String {
    field
        .split('_')
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// `AssignedTo` → `assigned_to`. Inverse of [`field_to_template`] for
/// all-lowercase snake_case inputs.
pub fn template_to_field(pascal: &str) -> String {
    let mut out = String::with_capacity(pascal.len() + 4);

    for (i, ch) in pascal.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }

    out
}

/// Stringify a value the way templates expect: strings unquoted, everything
/// else via its JSON rendering, null as the empty string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Boolean coercion used by conditionals and `toggle`: null, false, 0, "" and
/// empty collections are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Coerce an arbitrary JSON value into rows. Arrays of objects map 1:1;
/// scalar arrays become `{value, index}` rows; a single object becomes one row.
pub fn rows_from_json(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(obj) => Row::from_json_object(obj),
                scalar => {
                    let mut row = Row::new();
                    row.set("value", scalar);
                    row.set("index", Value::from(index));
                    row
                }
            })
            .collect(),
        Value::Object(obj) => vec![Row::from_json_object(obj)],
        Value::Null => Vec::new(),
        scalar => {
            let mut row = Row::new();
            row.set("value", scalar);
            vec![row]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pascal_mapping_round_trips() {
        assert_eq!(field_to_template("assigned_to"), "AssignedTo");
        assert_eq!(field_to_template("id"), "Id");
        assert_eq!(field_to_template("a_b_c"), "ABC");
        assert_eq!(template_to_field("AssignedTo"), "assigned_to");
        assert_eq!(template_to_field("Id"), "id");
    }

    #[test]
    fn template_get_folds_case() {
        let mut row = Row::new();
        row.set("assigned_to", json!("alice"));
        row.set("id", json!(3));

        assert_eq!(row.template_get("AssignedTo"), Some(&json!("alice")));
        assert_eq!(row.template_get("Id"), Some(&json!(3)));
        assert_eq!(row.template_get("Missing"), None);
    }

    #[test]
    fn ensure_id_generates_and_fronts() {
        let mut row = Row::new();
        row.set("text", json!("hello"));
        row.ensure_id(|| "r1".into());

        assert_eq!(row.id(), "r1");
        assert_eq!(row.fields.get_index(0).unwrap().0, "id");

        // An existing id is left alone.
        row.ensure_id(|| "r2".into());
        assert_eq!(row.id(), "r1");
    }

    #[test]
    fn json_coercion_shapes() {
        let rows = rows_from_json(json!([{"id": 1, "name": "A"}]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), "1");

        let rows = rows_from_json(json!(["x", "y"]));
        assert_eq!(rows[1].get("value"), Some(&json!("y")));
        assert_eq!(rows[1].get("index"), Some(&json!(1)));

        assert!(rows_from_json(Value::Null).is_empty());
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!("false")));
        assert!(truthy(&json!("no")));
        assert!(truthy(&json!(1.5)));
        assert!(!truthy(&json!([])));
    }
}
