//! Task definitions and their results
//!
//! A [`Task`] names a callable inside the target repository (`module:object`),
//! the arguments to call it with and a wall-clock limit. It is immutable once
//! built; its JSON definition is what the runner receives and its hash is what
//! the result cache keys on.

use crate::errors::{PinrunError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

fn dotted_identifier() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("static identifier pattern is valid")
    })
}

/// `module:object` reference, resolved by the runner inside the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub module_name: String,
    pub object_name: String,
}

impl EntryPoint {
    pub fn parse(reference: &str) -> Result<Self> {
        let (module_name, object_name) = reference.trim().split_once(':').ok_or_else(|| {
            PinrunError::TaskMisconfigured(format!(
                "Entry point '{}' must reference an object, not a module",
                reference
            ))
        })?;

        let module_name = module_name.trim();
        let object_name = object_name.trim();

        if !dotted_identifier().is_match(module_name) {
            return Err(PinrunError::TaskMisconfigured(format!(
                "Incorrectly defined entry point '{}': invalid module name",
                reference
            )));
        }
        if !dotted_identifier().is_match(object_name) {
            return Err(PinrunError::TaskMisconfigured(format!(
                "Incorrectly defined entry point '{}': invalid object name",
                reference
            )));
        }

        Ok(Self {
            module_name: module_name.to_string(),
            object_name: object_name.to_string(),
        })
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module_name, self.object_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    entry_point: EntryPoint,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timeout: u64,
}

impl Task {
    pub fn new(entry_point: &str) -> Result<Self> {
        Ok(Self {
            entry_point: EntryPoint::parse(entry_point)?,
            args: Vec::new(),
            kwargs: Map::new(),
            timeout: DEFAULT_TIMEOUT_SECONDS,
        })
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Result<Self> {
        if timeout < 1 {
            return Err(PinrunError::TaskMisconfigured(format!(
                "Timeout must be at least one second, got {}",
                timeout
            )));
        }
        self.timeout = timeout;
        Ok(self)
    }

    /// Builds a task from loosely typed values, e.g. parsed command-line JSON.
    pub fn from_json_parts(entry_point: &str, args: Value, kwargs: Value, timeout: u64) -> Result<Self> {
        let args = match args {
            Value::Null => Vec::new(),
            Value::Array(values) => values,
            other => {
                return Err(PinrunError::TaskMisconfigured(format!(
                    "Arguments must be a list, got {}",
                    other
                )))
            }
        };
        let kwargs = match kwargs {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(PinrunError::TaskMisconfigured(format!(
                    "Keyword arguments must be a mapping, got {}",
                    other
                )))
            }
        };

        Task::new(entry_point)?
            .with_args(args)
            .with_kwargs(kwargs)
            .with_timeout(timeout)
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry_point
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// The JSON document handed to the runner. Keys are emitted in sorted order.
    pub fn definition(&self) -> String {
        json!({
            "entry_point": {
                "module_name": self.entry_point.module_name,
                "object_name": self.entry_point.object_name,
            },
            "args": self.args,
            "kwargs": self.kwargs,
        })
        .to_string()
    }

    /// SHA-256 of [`Task::definition`]. The timeout is not part of it.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.definition().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.entry_point)
    }
}

/// Output of one execution together with the streams captured around the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_parsing() {
        let entry = EntryPoint::parse("library.module:Class.method").unwrap();
        assert_eq!(entry.module_name, "library.module");
        assert_eq!(entry.object_name, "Class.method");
        assert_eq!(entry.to_string(), "library.module:Class.method");
    }

    #[test]
    fn test_module_only_entry_point_rejected() {
        assert!(matches!(
            Task::new("library.module"),
            Err(PinrunError::TaskMisconfigured(_))
        ));
        assert!(Task::new("library.module:").is_err());
        assert!(Task::new(":func").is_err());
        assert!(Task::new("1mod:func").is_err());
        assert!(Task::new("mod:func-name").is_err());
    }

    #[test]
    fn test_timeout_validation() {
        let task = Task::new("mod:add").unwrap();
        assert_eq!(task.timeout(), DEFAULT_TIMEOUT_SECONDS);
        assert!(task.clone().with_timeout(0).is_err());
        assert_eq!(task.with_timeout(30).unwrap().timeout(), 30);
    }

    #[test]
    fn test_definition_shape() {
        let task = Task::new("mod:add")
            .unwrap()
            .with_args(vec![json!(2), json!(3)]);
        let definition: Value = serde_json::from_str(&task.definition()).unwrap();
        assert_eq!(definition["entry_point"]["module_name"], "mod");
        assert_eq!(definition["entry_point"]["object_name"], "add");
        assert_eq!(definition["args"], json!([2, 3]));
        assert_eq!(definition["kwargs"], json!({}));
    }

    #[test]
    fn test_hash_depends_on_arguments_not_timeout() {
        let base = Task::new("mod:add").unwrap().with_args(vec![json!(1)]);
        let slower = base.clone().with_timeout(60).unwrap();
        let other = Task::new("mod:add").unwrap().with_args(vec![json!(2)]);

        assert_eq!(base.hash(), slower.hash());
        assert_ne!(base.hash(), other.hash());
        assert_eq!(base.hash().len(), 64);
    }

    #[test]
    fn test_kwargs_order_does_not_change_hash() {
        let mut first = Map::new();
        first.insert("b".to_string(), json!(1));
        first.insert("a".to_string(), json!(2));
        let mut second = Map::new();
        second.insert("a".to_string(), json!(2));
        second.insert("b".to_string(), json!(1));

        let one = Task::new("mod:f").unwrap().with_kwargs(first);
        let two = Task::new("mod:f").unwrap().with_kwargs(second);
        assert_eq!(one.hash(), two.hash());
    }

    #[test]
    fn test_from_json_parts_rejects_wrong_shapes() {
        assert!(Task::from_json_parts("mod:f", json!({"a": 1}), Value::Null, 5).is_err());
        assert!(Task::from_json_parts("mod:f", Value::Null, json!([1]), 5).is_err());

        let task = Task::from_json_parts("mod:f", json!([1, "x"]), json!({"k": true}), 7).unwrap();
        assert_eq!(task.args().len(), 2);
        assert_eq!(task.kwargs()["k"], json!(true));
        assert_eq!(task.timeout(), 7);
    }
}
