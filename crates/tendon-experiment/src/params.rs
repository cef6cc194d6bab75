//! Parameter schemas and raw test configurations.
//!
//! Every test kind publishes a list of [`ParamSpec`]s. A caller hands in a
//! loosely typed [`TestConfig`] (from a CLI, a file or a checkpoint);
//! [`validate`] checks it against the schema and fills in defaults, and the
//! protocol then reads its strongly typed configuration out of the resolved
//! map. Nothing here touches hardware.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a configuration was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Name not present in the schema.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    /// Value has the wrong type for the parameter.
    #[error("parameter `{name}` expects {expected}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// Human-readable expected type.
        expected: &'static str,
    },

    /// Numeric value outside the schema range.
    #[error("parameter `{name}` = {value} is outside {min}..={max}")]
    OutOfRange {
        /// Parameter name.
        name: String,
        /// Supplied value.
        value: f64,
        /// Inclusive minimum.
        min: f64,
        /// Inclusive maximum.
        max: f64,
    },

    /// Enum value not among the choices.
    #[error("parameter `{name}` = `{value}` is not one of {choices:?}")]
    InvalidChoice {
        /// Parameter name.
        name: String,
        /// Supplied value.
        value: String,
        /// Accepted values.
        choices: Vec<String>,
    },

    /// Values are individually valid but contradict each other or the rig.
    #[error("{0}")]
    Inconsistent(String),

    /// A `name=value` assignment could not be parsed.
    #[error("malformed assignment `{0}` (expected name=value)")]
    Malformed(String),
}

/// Type, range and default of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// Real number.
    Float {
        /// Inclusive minimum.
        min: f64,
        /// Inclusive maximum.
        max: f64,
        /// Default value.
        default: f64,
    },
    /// Integer.
    Int {
        /// Inclusive minimum.
        min: i64,
        /// Inclusive maximum.
        max: i64,
        /// Default value.
        default: i64,
    },
    /// One of a fixed set of strings.
    Enum {
        /// Accepted values.
        choices: &'static [&'static str],
        /// Default value.
        default: &'static str,
    },
    /// Flag.
    Bool {
        /// Default value.
        default: bool,
    },
}

/// Schema entry for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Parameter name as used in configs.
    pub name: &'static str,
    /// Type, range and default.
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Display unit, if any.
    pub unit: Option<&'static str>,
    /// One-line description.
    pub description: &'static str,
}

impl ParamSpec {
    /// Float parameter.
    pub const fn float(
        name: &'static str,
        min: f64,
        max: f64,
        default: f64,
        unit: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ParamKind::Float { min, max, default },
            unit: Some(unit),
            description,
        }
    }

    /// Integer parameter.
    pub const fn int(
        name: &'static str,
        min: i64,
        max: i64,
        default: i64,
        unit: Option<&'static str>,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ParamKind::Int { min, max, default },
            unit,
            description,
        }
    }

    /// Flag parameter.
    pub const fn flag(name: &'static str, default: bool, description: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Bool { default },
            unit: None,
            description,
        }
    }

    /// Default value.
    pub fn default_value(&self) -> ParamValue {
        match self.kind {
            ParamKind::Float { default, .. } => ParamValue::Float(default),
            ParamKind::Int { default, .. } => ParamValue::Int(default),
            ParamKind::Enum { default, .. } => ParamValue::Text(default.to_string()),
            ParamKind::Bool { default } => ParamValue::Bool(default),
        }
    }

    /// Check `value` and normalise it to this parameter's type.
    pub fn check(&self, value: &ParamValue) -> Result<ParamValue, ConfigValidationError> {
        let name = self.name.to_string();
        match (&self.kind, value) {
            (ParamKind::Float { min, max, .. }, ParamValue::Float(_) | ParamValue::Int(_)) => {
                let v = value.as_f64().unwrap_or(f64::NAN);
                if !v.is_finite() || v < *min || v > *max {
                    return Err(ConfigValidationError::OutOfRange {
                        name,
                        value: v,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(ParamValue::Float(v))
            }
            (ParamKind::Int { min, max, .. }, ParamValue::Int(v)) => {
                if v < min || v > max {
                    return Err(ConfigValidationError::OutOfRange {
                        name,
                        value: *v as f64,
                        min: *min as f64,
                        max: *max as f64,
                    });
                }
                Ok(ParamValue::Int(*v))
            }
            (ParamKind::Enum { choices, .. }, ParamValue::Text(v)) => {
                if choices.contains(&v.as_str()) {
                    Ok(ParamValue::Text(v.clone()))
                } else {
                    Err(ConfigValidationError::InvalidChoice {
                        name,
                        value: v.clone(),
                        choices: choices.iter().map(|c| c.to_string()).collect(),
                    })
                }
            }
            (ParamKind::Bool { .. }, ParamValue::Bool(v)) => Ok(ParamValue::Bool(*v)),
            (kind, _) => Err(ConfigValidationError::WrongType {
                name,
                expected: match kind {
                    ParamKind::Float { .. } => "a number",
                    ParamKind::Int { .. } => "an integer",
                    ParamKind::Enum { .. } => "one of the listed choices",
                    ParamKind::Bool { .. } => "true or false",
                },
            }),
        }
    }

    /// Parse a command-line string into a value of this parameter's type.
    pub fn parse(&self, text: &str) -> Result<ParamValue, ConfigValidationError> {
        let text = text.trim();
        let wrong = |expected| ConfigValidationError::WrongType {
            name: self.name.to_string(),
            expected,
        };
        let value = match self.kind {
            ParamKind::Float { .. } => {
                ParamValue::Float(text.parse().map_err(|_| wrong("a number"))?)
            }
            ParamKind::Int { .. } => {
                ParamValue::Int(text.parse().map_err(|_| wrong("an integer"))?)
            }
            ParamKind::Enum { .. } => ParamValue::Text(text.to_string()),
            ParamKind::Bool { .. } => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => ParamValue::Bool(true),
                "false" | "no" | "off" | "0" => ParamValue::Bool(false),
                _ => return Err(wrong("true or false")),
            },
        };
        self.check(&value)
    }
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Real number.
    Float(f64),
    /// Enum choice.
    Text(String),
}

impl ParamValue {
    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Parameter map as supplied by a caller, or as resolved by [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestConfig(BTreeMap<String, ParamValue>);

impl TestConfig {
    /// Empty configuration; every parameter takes its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set one parameter.
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    /// Raw value of one parameter.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Number of explicitly set parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply `name=value` assignments, parsing each value by its schema type.
    pub fn apply_assignments<'a>(
        &mut self,
        schema: &[ParamSpec],
        assignments: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigValidationError> {
        for assignment in assignments {
            let (name, text) = assignment
                .split_once('=')
                .ok_or_else(|| ConfigValidationError::Malformed(assignment.to_string()))?;
            let name = name.trim();
            let spec = schema
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| ConfigValidationError::UnknownParameter(name.to_string()))?;
            self.0.insert(name.to_string(), spec.parse(text)?);
        }
        Ok(())
    }

    /// Resolved float. Only meaningful on a validated config.
    pub fn float(&self, name: &str) -> Result<f64, ConfigValidationError> {
        self.get(name)
            .and_then(ParamValue::as_f64)
            .ok_or_else(|| missing(name, "a number"))
    }

    /// Resolved integer.
    pub fn int(&self, name: &str) -> Result<i64, ConfigValidationError> {
        match self.get(name) {
            Some(ParamValue::Int(v)) => Ok(*v),
            _ => Err(missing(name, "an integer")),
        }
    }

    /// Resolved flag.
    pub fn flag(&self, name: &str) -> Result<bool, ConfigValidationError> {
        match self.get(name) {
            Some(ParamValue::Bool(v)) => Ok(*v),
            _ => Err(missing(name, "true or false")),
        }
    }
}

fn missing(name: &str, expected: &'static str) -> ConfigValidationError {
    ConfigValidationError::WrongType {
        name: name.to_string(),
        expected,
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Check `raw` against `schema`, returning a config with every parameter set.
pub fn validate(
    schema: &[ParamSpec],
    raw: &TestConfig,
) -> Result<TestConfig, ConfigValidationError> {
    if let Some(unknown) = raw.0.keys().find(|k| !schema.iter().any(|s| s.name == *k)) {
        return Err(ConfigValidationError::UnknownParameter(unknown.clone()));
    }
    let mut resolved = BTreeMap::new();
    for spec in schema {
        let value = match raw.get(spec.name) {
            Some(value) => spec.check(value)?,
            None => spec.default_value(),
        };
        resolved.insert(spec.name.to_string(), value);
    }
    Ok(TestConfig(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[ParamSpec] = &[
        ParamSpec::float("hold_s", 0.5, 10.0, 2.0, "s", "Hold time"),
        ParamSpec::int("steps", 2, 100, 20, None, "Step count"),
        ParamSpec::flag("ramp_down", false, "Ramp back down"),
        ParamSpec {
            name: "mode",
            kind: ParamKind::Enum {
                choices: &["fast", "slow"],
                default: "slow",
            },
            unit: None,
            description: "Mode",
        },
    ];

    #[test]
    fn fills_defaults_and_widens_integers() {
        let raw = TestConfig::new().with("hold_s", 3_i64);
        let resolved = validate(SCHEMA, &raw).unwrap();
        assert_eq!(resolved.len(), 4);
        assert_eq!(resolved.get("hold_s"), Some(&ParamValue::Float(3.0)));
        assert_eq!(resolved.int("steps").unwrap(), 20);
        assert!(!resolved.flag("ramp_down").unwrap());
        assert_eq!(resolved.get("mode"), Some(&ParamValue::Text("slow".into())));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            TestConfig::new().with("hold_s", 11.0),
            TestConfig::new().with("hold_s", f64::NAN),
            TestConfig::new().with("steps", 1_i64),
            TestConfig::new().with("steps", 2.5),
            TestConfig::new().with("ramp_down", "yes"),
            TestConfig::new().with("mode", "medium"),
            TestConfig::new().with("speed", 1.0),
        ];
        for raw in &cases {
            assert!(validate(SCHEMA, raw).is_err(), "accepted {raw:?}");
        }
        assert!(matches!(
            validate(SCHEMA, &TestConfig::new().with("speed", 1.0)),
            Err(ConfigValidationError::UnknownParameter(name)) if name == "speed"
        ));
    }

    #[test]
    fn parses_command_line_assignments() {
        let mut raw = TestConfig::new();
        raw.apply_assignments(SCHEMA, ["steps=5", "ramp_down=on", "hold_s = 1.5"])
            .unwrap();
        let resolved = validate(SCHEMA, &raw).unwrap();
        assert_eq!(resolved.int("steps").unwrap(), 5);
        assert!(resolved.flag("ramp_down").unwrap());
        assert!((resolved.float("hold_s").unwrap() - 1.5).abs() < 1e-12);

        assert!(matches!(
            raw.apply_assignments(SCHEMA, ["steps"]),
            Err(ConfigValidationError::Malformed(_))
        ));
        assert!(raw.apply_assignments(SCHEMA, ["steps=many"]).is_err());
    }

    #[test]
    fn config_json_is_a_flat_map() {
        let raw: TestConfig =
            serde_json::from_str(r#"{"steps": 4, "hold_s": 1.25, "ramp_down": true}"#).unwrap();
        assert_eq!(raw.get("steps"), Some(&ParamValue::Int(4)));
        assert_eq!(raw.get("hold_s"), Some(&ParamValue::Float(1.25)));
        assert_eq!(raw.get("ramp_down"), Some(&ParamValue::Bool(true)));
    }
}
