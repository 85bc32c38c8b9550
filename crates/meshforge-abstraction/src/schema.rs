//! Typed parameter schemas for generation backends.
//!
//! Every backend owns one immutable [`ModelParamSchema`]. Caller-supplied
//! parameters are checked against it once at the boundary; afterwards the
//! resolved map (defaults merged, foreign keys dropped) is consumed read-only.
//!
//! Validation never coerces: a JSON string `"1000"` is not an integer and a
//! float is not an integer. Integers are accepted for float fields because
//! JSON does not distinguish `7` from `7.0` at the source.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter map as received from callers.
pub type ParamMap = serde_json::Map<String, Value>;

/// Value type of a schema parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Enum,
    String,
}

/// Describes a single backend parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDescriptor {
    /// Parameter name as used in caller params.
    pub name: String,
    /// Expected value type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Value applied when the caller omits the parameter.
    pub default: Value,
    /// Inclusive lower bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Permitted values for enum parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    /// Maximum length in characters for string parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Short description shown by configuration UIs.
    #[serde(default)]
    pub description: String,
}

impl ParamDescriptor {
    fn base(name: &str, param_type: ParamType, default: Value) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            default,
            min: None,
            max: None,
            allowed_values: Vec::new(),
            max_length: None,
            description: String::new(),
        }
    }

    /// A boolean flag.
    pub fn boolean(name: &str, default: bool) -> Self {
        Self::base(name, ParamType::Bool, Value::Bool(default))
    }

    /// An integer bounded to `[min, max]`.
    pub fn int(name: &str, default: i64, min: i64, max: i64) -> Self {
        let mut descriptor = Self::base(name, ParamType::Int, Value::from(default));
        descriptor.min = Some(min as f64);
        descriptor.max = Some(max as f64);
        descriptor
    }

    /// A float bounded to `[min, max]`.
    pub fn float(name: &str, default: f64, min: f64, max: f64) -> Self {
        let mut descriptor = Self::base(name, ParamType::Float, Value::from(default));
        descriptor.min = Some(min);
        descriptor.max = Some(max);
        descriptor
    }

    /// One of a fixed set of JSON values.
    pub fn choice(name: &str, default: Value, allowed: Vec<Value>) -> Self {
        let mut descriptor = Self::base(name, ParamType::Enum, default);
        descriptor.allowed_values = allowed;
        descriptor
    }

    /// A free-form string, optionally length-limited.
    pub fn string(name: &str, default: &str, max_length: Option<usize>) -> Self {
        let mut descriptor = Self::base(name, ParamType::String, Value::from(default));
        descriptor.max_length = max_length;
        descriptor
    }

    /// Attaches a description.
    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Checks a caller-provided value against this descriptor.
    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        match self.param_type {
            ParamType::Bool => {
                if !value.is_boolean() {
                    return Err(self.type_mismatch("a boolean", value));
                }
            }
            ParamType::Int => {
                let n = if let Some(n) = value.as_i64() {
                    n as f64
                } else if let Some(n) = value.as_u64() {
                    n as f64
                } else {
                    return Err(self.type_mismatch("an integer", value));
                };
                self.check_range(n)?;
            }
            ParamType::Float => {
                let Some(n) = value.as_f64() else {
                    return Err(self.type_mismatch("a number", value));
                };
                self.check_range(n)?;
            }
            ParamType::Enum => {
                if !self.allowed_values.contains(value) {
                    let allowed: Vec<String> =
                        self.allowed_values.iter().map(Value::to_string).collect();
                    return Err(ValidationError::new(
                        &self.name,
                        format!("{} is not one of [{}]", value, allowed.join(", ")),
                    ));
                }
            }
            ParamType::String => {
                let Some(s) = value.as_str() else {
                    return Err(self.type_mismatch("a string", value));
                };
                if let Some(limit) = self.max_length {
                    if s.chars().count() > limit {
                        return Err(ValidationError::new(
                            &self.name,
                            format!("longer than {} characters", limit),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_range(&self, n: f64) -> Result<(), ValidationError> {
        if let Some(min) = self.min {
            if n < min {
                return Err(ValidationError::new(
                    &self.name,
                    format!("{} is below the minimum of {}", n, min),
                ));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(ValidationError::new(
                    &self.name,
                    format!("{} is above the maximum of {}", n, max),
                ));
            }
        }
        Ok(())
    }

    fn type_mismatch(&self, expected: &str, got: &Value) -> ValidationError {
        ValidationError::new(&self.name, format!("expected {}, got {}", expected, json_type(got)))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ordered, immutable parameter schema of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelParamSchema {
    params: Vec<ParamDescriptor>,
}

impl ModelParamSchema {
    /// Creates a schema from descriptors in presentation order.
    pub fn new(params: Vec<ParamDescriptor>) -> Self {
        Self { params }
    }

    /// Descriptors in schema order.
    pub fn descriptors(&self) -> &[ParamDescriptor] {
        &self.params
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validates the provided keys, in schema order, stopping at the first violation.
    ///
    /// Keys unknown to this schema are ignored.
    pub fn validate(&self, params: &ParamMap) -> Result<(), ValidationError> {
        for descriptor in &self.params {
            if let Some(value) = params.get(&descriptor.name) {
                descriptor.check(value)?;
            }
        }
        Ok(())
    }

    /// Every parameter at its default value.
    pub fn defaults(&self) -> ParamMap {
        self.params.iter().map(|p| (p.name.clone(), p.default.clone())).collect()
    }

    /// Validates `params` and merges them over the defaults.
    ///
    /// The result contains exactly the schema's keys; foreign keys are dropped.
    pub fn resolve(&self, params: &ParamMap) -> Result<ParamMap, ValidationError> {
        self.validate(params)?;
        Ok(self
            .params
            .iter()
            .map(|p| {
                let value = params.get(&p.name).unwrap_or(&p.default).clone();
                (p.name.clone(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ModelParamSchema {
        ModelParamSchema::new(vec![
            ParamDescriptor::int("faceLimit", 40_000, 1_000, 1_500_000),
            ParamDescriptor::float("ssGuidanceStrength", 7.5, 0.0, 10.0),
            ParamDescriptor::boolean("texturedMesh", true),
            ParamDescriptor::choice("textureSize", json!(1024), vec![json!(512), json!(1024), json!(2048)]),
            ParamDescriptor::string("prompt", "", Some(8)),
        ])
    }

    fn params(value: serde_json::Value) -> ParamMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_params_are_valid() {
        assert!(schema().validate(&ParamMap::new()).is_ok());
    }

    #[test]
    fn test_string_is_not_coerced_to_int() {
        let err = schema().validate(&params(json!({"faceLimit": "1000"}))).unwrap_err();
        assert_eq!(err.field, "faceLimit");
        assert!(err.reason.contains("expected an integer"));
    }

    #[test]
    fn test_float_rejected_for_int() {
        let err = schema().validate(&params(json!({"faceLimit": 5000.0}))).unwrap_err();
        assert_eq!(err.field, "faceLimit");
    }

    #[test]
    fn test_int_accepted_for_float() {
        assert!(schema().validate(&params(json!({"ssGuidanceStrength": 3}))).is_ok());
    }

    #[test]
    fn test_out_of_range_float() {
        let err = schema().validate(&params(json!({"ssGuidanceStrength": 15}))).unwrap_err();
        assert_eq!(err.field, "ssGuidanceStrength");
        assert!(err.reason.contains("maximum"));
    }

    #[test]
    fn test_enum_membership_is_strict() {
        assert!(schema().validate(&params(json!({"textureSize": 2048}))).is_ok());
        let err = schema().validate(&params(json!({"textureSize": "2048"}))).unwrap_err();
        assert_eq!(err.field, "textureSize");
    }

    #[test]
    fn test_null_is_a_type_error() {
        let err = schema().validate(&params(json!({"texturedMesh": null}))).unwrap_err();
        assert!(err.reason.contains("got null"));
    }

    #[test]
    fn test_string_length_limit() {
        let err = schema().validate(&params(json!({"prompt": "far too long"}))).unwrap_err();
        assert_eq!(err.field, "prompt");
    }

    #[test]
    fn test_first_violation_in_schema_order() {
        let err = schema()
            .validate(&params(json!({"texturedMesh": 1, "faceLimit": -1})))
            .unwrap_err();
        assert_eq!(err.field, "faceLimit");
    }

    #[test]
    fn test_resolve_merges_defaults_and_drops_unknown() {
        let resolved = schema()
            .resolve(&params(json!({"faceLimit": 2000, "octreeResolution": 512})))
            .unwrap();
        assert_eq!(resolved["faceLimit"], json!(2000));
        assert_eq!(resolved["ssGuidanceStrength"], json!(7.5));
        assert!(!resolved.contains_key("octreeResolution"));
        assert_eq!(resolved.len(), 5);
    }

    #[test]
    fn test_schema_serializes_as_array() {
        let value = serde_json::to_value(schema()).unwrap();
        let first = &value.as_array().unwrap()[0];
        assert_eq!(first["name"], json!("faceLimit"));
        assert_eq!(first["type"], json!("int"));
        assert_eq!(first["min"], json!(1000.0));
    }
}
