//! Job parameters and their schemas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobError;

/// Declared type of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Str,
    Int,
    Bool,
}

/// Schema entry for one parameter of a job type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobParamDef {
    pub kind: ParamKind,
    pub required: bool,
}

impl JobParamDef {
    pub fn required(kind: ParamKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }

    pub fn optional(kind: ParamKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }
}

/// Bound parameters of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameters {
    /// Job type name.
    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl JobParameters {
    pub fn builder(ty: impl Into<String>) -> ParametersBuilder {
        ParametersBuilder {
            ty: ty.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// String value; `Err` when bound to a non-string.
    pub fn get_str(&self, name: &str) -> Result<Option<String>, JobError> {
        match self.parameters.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(JobError::InvalidParameter {
                name: name.to_string(),
                expected: "string".to_string(),
            }),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, JobError> {
        match self.parameters.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.as_i64()),
            Some(_) => Err(JobError::InvalidParameter {
                name: name.to_string(),
                expected: "integer".to_string(),
            }),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, JobError> {
        match self.parameters.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(JobError::InvalidParameter {
                name: name.to_string(),
                expected: "boolean".to_string(),
            }),
        }
    }

    /// Check the binding against a schema: required parameters must be
    /// bound and every bound value must convert.
    pub fn validate(&self, schema: &HashMap<String, JobParamDef>) -> Result<(), JobError> {
        for (name, def) in schema {
            let bound = matches!(self.parameters.get(name), Some(v) if !v.is_null());
            if def.required && !bound {
                return Err(JobError::MissingParameter {
                    ty: self.ty.clone(),
                    name: name.clone(),
                });
            }
            if bound {
                match def.kind {
                    ParamKind::Str => drop(self.get_str(name)?),
                    ParamKind::Int => drop(self.get_i64(name)?),
                    ParamKind::Bool => drop(self.get_bool(name)?),
                }
            }
        }
        Ok(())
    }
}

pub struct ParametersBuilder {
    ty: String,
    parameters: HashMap<String, Value>,
}

impl ParametersBuilder {
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            ty: self.ty,
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> HashMap<String, JobParamDef> {
        let mut schema = HashMap::new();
        schema.insert("cluster".to_string(), JobParamDef::required(ParamKind::Str));
        schema.insert("count".to_string(), JobParamDef::optional(ParamKind::Int));
        schema
    }

    #[test]
    fn test_typed_accessors() {
        let params = JobParameters::builder("t")
            .parameter("cluster", "prod")
            .parameter("count", 3)
            .parameter("enabled", true)
            .build();

        assert_eq!(params.get_str("cluster").unwrap().as_deref(), Some("prod"));
        assert_eq!(params.get_i64("count").unwrap(), Some(3));
        assert_eq!(params.get_bool("enabled").unwrap(), Some(true));
        assert_eq!(params.get_str("missing").unwrap(), None);
    }

    #[test]
    fn test_conversion_failure() {
        let params = JobParameters::builder("t").parameter("count", "three").build();
        assert!(matches!(
            params.get_i64("count"),
            Err(JobError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validate_missing_required() {
        let params = JobParameters::builder("t").build();
        let err = params.validate(&schema()).unwrap_err();
        assert!(matches!(err, JobError::MissingParameter { .. }));
    }

    #[test]
    fn test_validate_ok() {
        let params = JobParameters::builder("t").parameter("cluster", "prod").build();
        assert!(params.validate(&schema()).is_ok());
    }

    #[test]
    fn test_validate_bad_type() {
        let params = JobParameters::builder("t")
            .parameter("cluster", "prod")
            .parameter("count", "nope")
            .build();
        assert!(matches!(
            params.validate(&schema()),
            Err(JobError::InvalidParameter { .. })
        ));
    }
}
