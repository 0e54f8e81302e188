//! Argument extraction shared by the demo tools
//!
//! Arguments are validated against each tool's schema before a handler runs, so these helpers
//! only fail when a handler is invoked directly with arguments it did not declare.

use serde_json::Value;

use crate::{errors::ToolError, registry::Arguments};

pub fn integer_argument(arguments: &Arguments, name: &str) -> Result<i64, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| ToolError::new(format!("argument `{name}` must be an integer")))
}

pub fn number_argument(arguments: &Arguments, name: &str) -> Result<f64, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolError::new(format!("argument `{name}` must be a number")))
}

pub fn string_argument<'a>(arguments: &'a Arguments, name: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::new(format!("argument `{name}` must be a string")))
}
