use serde_json::{json, Value};

/// Keywords the upstream schema dialect rejects. Removed at every depth.
const STRIPPED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "additionalProperties",
    "propertyNames",
    "default",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "pattern",
    "format",
    "uniqueItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "const",
    "if",
    "then",
    "else",
    "not",
    "contentEncoding",
    "contentMediaType",
    "deprecated",
    "readOnly",
    "writeOnly",
    "examples",
    "$comment",
    "title",
    "nullable",
    "additionalItems",
    "unevaluatedItems",
    "unevaluatedProperties",
    "prefixItems",
    "contains",
    "minContains",
    "maxContains",
    "patternProperties",
    "dependentRequired",
    "dependentSchemas",
];

/// Recursively convert an arbitrary JSON Schema fragment into the dialect
/// the upstream accepts.
///
/// - strips unsupported keywords at every depth
/// - flattens `anyOf`/`oneOf`/`allOf` unions
/// - downgrades array `type`s to the first non-null element
/// - canonicalises the `type` token case (`uppercase_types` is the upstream
///   default; Claude-family models require lowercase)
///
/// Never fails: unconvertible nodes degrade to `{"type": "object"}` and
/// non-object schemas are returned untouched.
pub fn normalize_schema(value: &mut Value, uppercase_types: bool) {
    if value.is_object() {
        normalize_node(value, uppercase_types);
    }
}

fn canonical_type(token: &str, uppercase: bool) -> String {
    if uppercase {
        token.to_uppercase()
    } else {
        token.to_lowercase()
    }
}

fn normalize_node(value: &mut Value, uppercase: bool) {
    let Some(map) = value.as_object_mut() else {
        return;
    };

    for key in STRIPPED_KEYWORDS {
        map.remove(*key);
    }

    // anyOf / oneOf: lift the first non-null branch type, drop the union.
    for union_key in ["anyOf", "oneOf"] {
        if let Some(branches) = map.remove(union_key) {
            if !map.contains_key("type") {
                if let Some(lifted) = first_non_null_branch_type(&branches) {
                    map.insert("type".to_string(), Value::String(lifted));
                }
            }
        }
    }

    // allOf: union-merge child properties/required, backfill type.
    if let Some(Value::Array(branches)) = map.remove("allOf") {
        for branch in branches {
            let Some(branch_map) = branch.as_object() else {
                continue;
            };
            if let Some(Value::Object(props)) = branch_map.get("properties") {
                let merged = map
                    .entry("properties".to_string())
                    .or_insert_with(|| json!({}));
                if let Some(merged_map) = merged.as_object_mut() {
                    for (k, v) in props {
                        merged_map.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            if let Some(Value::Array(required)) = branch_map.get("required") {
                let merged = map
                    .entry("required".to_string())
                    .or_insert_with(|| json!([]));
                if let Some(merged_arr) = merged.as_array_mut() {
                    for r in required {
                        if !merged_arr.contains(r) {
                            merged_arr.push(r.clone());
                        }
                    }
                }
            }
            if !map.contains_key("type") {
                if let Some(t) = branch_map.get("type") {
                    map.insert("type".to_string(), t.clone());
                }
            }
        }
    }

    // type: array form picks the first non-null element; anything that is
    // not a string by now degrades to object.
    if let Some(type_val) = map.get_mut("type") {
        match type_val {
            Value::String(s) => {
                *type_val = Value::String(canonical_type(s, uppercase));
            }
            Value::Array(arr) => {
                let mut selected = "string".to_string();
                for item in arr.iter() {
                    if let Value::String(s) = item {
                        if s != "null" {
                            selected = s.clone();
                            break;
                        }
                    }
                }
                *type_val = Value::String(canonical_type(&selected, uppercase));
            }
            _ => {
                *type_val = Value::String(canonical_type("object", uppercase));
            }
        }
    }

    // Recurse into properties.*
    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for prop in props.values_mut() {
            if prop.is_object() {
                normalize_node(prop, uppercase);
            } else {
                // Property schemas must be objects upstream.
                *prop = json!({ "type": canonical_type("object", uppercase) });
            }
        }
    }

    // items: tuple form flattens to index 0, then recurse.
    if let Some(items) = map.get_mut("items") {
        if let Value::Array(arr) = items {
            let first = arr.first().cloned();
            *items =
                first.unwrap_or_else(|| json!({ "type": canonical_type("object", uppercase) }));
        }
        if items.is_object() {
            normalize_node(items, uppercase);
        } else {
            *items = json!({ "type": canonical_type("object", uppercase) });
        }
    }
}

fn first_non_null_branch_type(branches: &Value) -> Option<String> {
    let arr = branches.as_array()?;
    for branch in arr {
        if let Some(t) = branch.get("type") {
            match t {
                Value::String(s) if s != "null" => return Some(s.clone()),
                Value::Array(types) => {
                    for item in types {
                        if let Value::String(s) = item {
                            if s != "null" {
                                return Some(s.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_no_stripped_keywords(value: &Value) {
        match value {
            Value::Object(map) => {
                for key in STRIPPED_KEYWORDS {
                    assert!(
                        !map.contains_key(*key),
                        "stripped keyword `{}` survived in {}",
                        key,
                        value
                    );
                }
                assert!(!map.contains_key("anyOf"));
                assert!(!map.contains_key("oneOf"));
                assert!(!map.contains_key("allOf"));
                for v in map.values() {
                    assert_no_stripped_keywords(v);
                }
            }
            Value::Array(arr) => {
                for v in arr {
                    assert_no_stripped_keywords(v);
                }
            }
            _ => {}
        }
    }

    #[test]
    fn strips_keywords_at_every_depth() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "location": {
                    "type": "string",
                    "minLength": 1,
                    "pattern": "^[a-z]+$",
                    "format": "city"
                },
                "nested": {
                    "type": "object",
                    "properties": {
                        "flag": { "type": "boolean", "const": true, "deprecated": true }
                    },
                    "patternProperties": { "^x-": {} }
                }
            },
            "required": ["location"]
        });

        normalize_schema(&mut schema, true);
        assert_no_stripped_keywords(&schema);
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["location"]["type"], "STRING");
        assert_eq!(
            schema["properties"]["nested"]["properties"]["flag"]["type"],
            "BOOLEAN"
        );
        // required survives.
        assert_eq!(schema["required"][0], "location");
    }

    #[test]
    fn lowercase_for_claude_callers() {
        let mut schema = json!({"type": "Object", "properties": {"x": {"type": "INTEGER"}}});
        normalize_schema(&mut schema, false);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["x"]["type"], "integer");
    }

    #[test]
    fn any_of_lifts_first_non_null_type() {
        let mut schema = json!({
            "anyOf": [
                { "type": "null" },
                { "type": "integer" },
                { "type": "string" }
            ]
        });
        normalize_schema(&mut schema, true);
        assert_eq!(schema["type"], "INTEGER");
        assert!(schema.get("anyOf").is_none());

        // Existing type wins over the union.
        let mut schema = json!({
            "type": "string",
            "oneOf": [{ "type": "number" }]
        });
        normalize_schema(&mut schema, true);
        assert_eq!(schema["type"], "STRING");
    }

    #[test]
    fn all_of_merges_properties_and_required() {
        let mut schema = json!({
            "allOf": [
                {
                    "type": "object",
                    "properties": { "a": { "type": "string" } },
                    "required": ["a"]
                },
                {
                    "properties": { "b": { "type": "integer" } },
                    "required": ["b"]
                }
            ]
        });
        normalize_schema(&mut schema, true);
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["a"]["type"], "STRING");
        assert_eq!(schema["properties"]["b"]["type"], "INTEGER");
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")));
        assert!(required.contains(&json!("b")));
    }

    #[test]
    fn type_array_downgrades_to_first_non_null() {
        let mut schema = json!({"type": ["null", "string"]});
        normalize_schema(&mut schema, true);
        assert_eq!(schema["type"], "STRING");

        let mut schema = json!({"type": ["null"]});
        normalize_schema(&mut schema, false);
        assert_eq!(schema["type"], "string");
    }

    #[test]
    fn tuple_items_flatten_to_first() {
        let mut schema = json!({
            "type": "array",
            "items": [
                { "type": "integer" },
                { "type": "string" }
            ]
        });
        normalize_schema(&mut schema, true);
        assert_eq!(schema["items"]["type"], "INTEGER");
    }

    #[test]
    fn unconvertible_nodes_degrade_instead_of_failing() {
        let mut schema = json!({
            "type": 42,
            "properties": { "weird": "not-a-schema" },
            "items": true
        });
        normalize_schema(&mut schema, true);
        assert_eq!(schema["type"], "OBJECT");
        assert_eq!(schema["properties"]["weird"]["type"], "OBJECT");
        assert_eq!(schema["items"]["type"], "OBJECT");
    }

    #[test]
    fn non_object_schema_returned_as_is() {
        let mut schema = json!("string");
        normalize_schema(&mut schema, true);
        assert_eq!(schema, json!("string"));
    }
}
