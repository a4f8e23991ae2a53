use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Property type strings accepted by the validator.
pub const VALID_TYPES: &[&str] = &[
    "string", "number", "integer", "boolean", "array", "object", "null",
];

/// Root parameter schema of a tool. The root is always object-typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Tri-state: absent means additional properties are allowed.
    #[serde(
        rename = "additionalProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<bool>,
}

fn object_type() -> String {
    "object".to_string()
}

impl ToolSchema {
    /// An empty object schema accepting any properties.
    pub fn object() -> Self {
        Self {
            schema_type: object_type(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, prop: PropertySchema) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    pub fn with_required(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(ToString::to_string).collect();
        self
    }

    pub fn deny_additional(mut self) -> Self {
        self.additional_properties = Some(false);
        self
    }
}

/// A single property declaration with per-type constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub prop_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Byte-length bounds for strings; item-count bounds for arrays.
    #[serde(rename = "minLength", default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(rename = "maxLength", default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, PropertySchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    /// Advisory only; the validator never injects defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PropertySchema {
    pub fn typed(prop_type: impl Into<String>) -> Self {
        Self {
            prop_type: prop_type.into(),
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::typed("string")
    }

    pub fn number() -> Self {
        Self::typed("number")
    }

    pub fn integer() -> Self {
        Self::typed("integer")
    }

    pub fn boolean() -> Self {
        Self::typed("boolean")
    }

    pub fn array_of(items: PropertySchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array")
        }
    }
}

fn qualify(path: &str, reason: &str) -> String {
    if path.is_empty() {
        reason.to_string()
    } else {
        format!("{}: {}", path, reason)
    }
}

/// A single schema violation. The first violation found short-circuits
/// validation; the message always leads with the dotted path of the
/// offending value (empty only at the root).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", qualify(.path, .reason))]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn at(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn index_path(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate a parameter map against a tool schema.
///
/// Returns the first violation found. Iteration order over map keys is
/// unspecified, so multi-violation inputs may report any one of them.
pub fn validate(schema: &ToolSchema, params: &Value) -> Result<(), SchemaViolation> {
    let Some(map) = params.as_object() else {
        return Err(SchemaViolation::at("", "parameters must be an object"));
    };
    validate_object(
        "",
        &schema.properties,
        &schema.required,
        schema.additional_properties,
        map,
    )
}

fn validate_object(
    path: &str,
    properties: &HashMap<String, PropertySchema>,
    required: &[String],
    additional: Option<bool>,
    value: &serde_json::Map<String, Value>,
) -> Result<(), SchemaViolation> {
    if additional == Some(false) {
        for key in value.keys() {
            if !properties.contains_key(key) {
                return Err(SchemaViolation::at(
                    &child_path(path, key),
                    "additional property is not allowed",
                ));
            }
        }
    }

    for name in required {
        if !value.contains_key(name) {
            return Err(SchemaViolation::at(
                &child_path(path, name),
                "required property is missing",
            ));
        }
    }

    for (name, prop) in properties {
        if let Some(v) = value.get(name) {
            validate_property(&child_path(path, name), prop, v)?;
        }
    }
    Ok(())
}

fn validate_property(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    // A null value is only acceptable for the explicit null type.
    if value.is_null() && prop.prop_type != "null" {
        return Err(SchemaViolation::at(path, "value cannot be null"));
    }

    match prop.prop_type.as_str() {
        "string" => validate_string(path, prop, value),
        "number" => validate_number(path, prop, value),
        "integer" => validate_integer(path, prop, value),
        "boolean" => match value {
            Value::Bool(_) => Ok(()),
            other => Err(SchemaViolation::at(
                path,
                format!("value must be a boolean, got {}", type_name(other)),
            )),
        },
        "array" => validate_array(path, prop, value),
        "object" => validate_nested_object(path, prop, value),
        "null" => match value {
            Value::Null => Ok(()),
            other => Err(SchemaViolation::at(
                path,
                format!("value must be null, got {}", type_name(other)),
            )),
        },
        other => Err(SchemaViolation::at(
            path,
            format!("unsupported type \"{}\"", other),
        )),
    }
}

fn validate_string(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    let Value::String(s) = value else {
        return Err(SchemaViolation::at(
            path,
            format!("value must be a string, got {}", type_name(value)),
        ));
    };

    if let Some(enum_values) = &prop.enum_values {
        let found = enum_values
            .iter()
            .any(|v| v.as_str().is_some_and(|e| e == s));
        if !found {
            return Err(SchemaViolation::at(
                path,
                format!("value \"{}\" is not one of the allowed values", s),
            ));
        }
    }

    // Length bounds are inclusive and measured in UTF-8 bytes.
    let len = s.len();
    if let Some(min) = prop.min_length
        && len < min
    {
        return Err(SchemaViolation::at(
            path,
            format!("length must be at least {}", min),
        ));
    }
    if let Some(max) = prop.max_length
        && len > max
    {
        return Err(SchemaViolation::at(
            path,
            format!("length must be at most {}", max),
        ));
    }

    if let Some(pattern) = &prop.pattern {
        let re = regex::Regex::new(pattern).map_err(|_| {
            SchemaViolation::at(path, format!("invalid pattern \"{}\"", pattern))
        })?;
        if !re.is_match(s) {
            return Err(SchemaViolation::at(
                path,
                format!("value does not match pattern \"{}\"", pattern),
            ));
        }
    }

    if let Some(format) = &prop.format
        && !format_matches(format, s)
    {
        return Err(SchemaViolation::at(
            path,
            format!("value is not a valid {}", format),
        ));
    }
    Ok(())
}

fn validate_number(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    let Some(n) = value.as_f64() else {
        return Err(SchemaViolation::at(
            path,
            format!("value must be a number, got {}", type_name(value)),
        ));
    };

    if let Some(enum_values) = &prop.enum_values {
        #[allow(clippy::float_cmp)]
        let found = enum_values
            .iter()
            .any(|v| v.as_f64().is_some_and(|e| e == n));
        if !found {
            return Err(SchemaViolation::at(
                path,
                format!("value {} is not one of the allowed values", n),
            ));
        }
    }
    check_bounds(path, prop, n)
}

fn validate_integer(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    // Integer representations and whole-valued floats are accepted;
    // fractional floats are not.
    let int = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().and_then(|f| {
                    if f.fract() == 0.0 { Some(f as i64) } else { None }
                })
            }
        }
        _ => None,
    };
    let Some(i) = int else {
        return Err(SchemaViolation::at(
            path,
            format!("value must be an integer, got {}", type_name(value)),
        ));
    };

    if let Some(enum_values) = &prop.enum_values {
        let found = enum_values
            .iter()
            .any(|v| v.as_i64().is_some_and(|e| e == i));
        if !found {
            return Err(SchemaViolation::at(
                path,
                format!("value {} is not one of the allowed values", i),
            ));
        }
    }
    check_bounds(path, prop, i as f64)
}

fn check_bounds(path: &str, prop: &PropertySchema, n: f64) -> Result<(), SchemaViolation> {
    if let Some(min) = prop.minimum
        && n < min
    {
        return Err(SchemaViolation::at(
            path,
            format!("value must be at least {}", min),
        ));
    }
    if let Some(max) = prop.maximum
        && n > max
    {
        return Err(SchemaViolation::at(
            path,
            format!("value must be at most {}", max),
        ));
    }
    Ok(())
}

fn validate_array(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    let Value::Array(items) = value else {
        return Err(SchemaViolation::at(
            path,
            format!("value must be an array, got {}", type_name(value)),
        ));
    };

    // MinLength/MaxLength double as item-count bounds for arrays.
    if let Some(min) = prop.min_length
        && items.len() < min
    {
        return Err(SchemaViolation::at(
            path,
            format!("array must have at least {} items", min),
        ));
    }
    if let Some(max) = prop.max_length
        && items.len() > max
    {
        return Err(SchemaViolation::at(
            path,
            format!("array must have at most {} items", max),
        ));
    }

    // Absent Items leaves elements unconstrained.
    if let Some(item_schema) = &prop.items {
        for (i, item) in items.iter().enumerate() {
            validate_property(&index_path(path, i), item_schema, item)?;
        }
    }
    Ok(())
}

fn validate_nested_object(
    path: &str,
    prop: &PropertySchema,
    value: &Value,
) -> Result<(), SchemaViolation> {
    let Value::Object(map) = value else {
        return Err(SchemaViolation::at(
            path,
            format!("value must be an object, got {}", type_name(value)),
        ));
    };

    static EMPTY: &[String] = &[];
    let properties = prop.properties.as_ref();
    let required = prop.required.as_deref().unwrap_or(EMPTY);
    match properties {
        Some(props) => validate_object(path, props, required, None, map),
        None => {
            // No nested declaration; only required names are checked.
            for name in required {
                if !map.contains_key(name) {
                    return Err(SchemaViolation::at(
                        &child_path(path, name),
                        "required property is missing",
                    ));
                }
            }
            Ok(())
        }
    }
}

fn format_matches(format: &str, s: &str) -> bool {
    match format {
        "email" => {
            let mut parts = s.splitn(2, '@');
            let local = parts.next().unwrap_or_default();
            let domain = parts.next();
            match domain {
                Some(domain) => {
                    !local.is_empty()
                        && !domain.is_empty()
                        && !domain.contains('@')
                        && domain.contains('.')
                }
                None => false,
            }
        }
        "url" | "uri" => s.starts_with("http://") || s.starts_with("https://"),
        "date" => is_date(s.as_bytes()),
        "time" => is_time_prefix(s.as_bytes()),
        "date-time" => {
            let b = s.as_bytes();
            b.len() >= 19 && is_date(&b[..10]) && b[10] == b'T' && is_time_prefix(&b[11..])
        }
        "uuid" => is_uuid(s),
        // Unknown formats are accepted; the recognizers are intentionally lax.
        _ => true,
    }
}

fn is_date(b: &[u8]) -> bool {
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && [0, 1, 2, 3, 5, 6, 8, 9]
            .iter()
            .all(|&i| b[i].is_ascii_digit())
}

fn is_time_prefix(b: &[u8]) -> bool {
    b.len() >= 8
        && b[2] == b':'
        && b[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| b[i].is_ascii_digit())
}

fn is_uuid(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 36 {
        return false;
    }
    for (i, c) in b.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *c != b'-' {
                    return false;
                }
            }
            _ => {
                if !c.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}
