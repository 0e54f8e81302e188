//! Demo tools: integer arithmetic, a greeting and a division that can fail

use serde_json::{json, Value};

use crate::domain::utils::{integer_argument, number_argument, string_argument};
use crate::errors::{McpError, ToolError};
use crate::registry::{Arguments, ParamType, Registry, ToolDescriptor};

pub fn register_tools(registry: &mut Registry) -> Result<(), McpError> {
    registry.register_tool(
        ToolDescriptor::new("add", "Add two numbers together")
            .param("a", ParamType::Integer)
            .param("b", ParamType::Integer),
        add,
    )?;
    registry.register_tool(
        ToolDescriptor::new("multiply", "Multiply two numbers")
            .param("a", ParamType::Integer)
            .param("b", ParamType::Integer),
        multiply,
    )?;
    registry.register_tool(
        ToolDescriptor::new("greet", "Greet someone by name").param("name", ParamType::String),
        greet,
    )?;
    registry.register_tool(
        ToolDescriptor::new("divide", "Divide a by b")
            .param("a", ParamType::Number)
            .param("b", ParamType::Number),
        divide,
    )?;
    Ok(())
}

pub fn add(arguments: Arguments) -> Result<Value, ToolError> {
    let a = integer_argument(&arguments, "a")?;
    let b = integer_argument(&arguments, "b")?;
    a.checked_add(b)
        .map(|sum| json!(sum))
        .ok_or_else(|| ToolError::new("integer overflow"))
}

pub fn multiply(arguments: Arguments) -> Result<Value, ToolError> {
    let a = integer_argument(&arguments, "a")?;
    let b = integer_argument(&arguments, "b")?;
    a.checked_mul(b)
        .map(|product| json!(product))
        .ok_or_else(|| ToolError::new("integer overflow"))
}

pub fn greet(arguments: Arguments) -> Result<Value, ToolError> {
    let name = string_argument(&arguments, "name")?;
    Ok(json!(format!("Hello, {name}!")))
}

pub fn divide(arguments: Arguments) -> Result<Value, ToolError> {
    let a = number_argument(&arguments, "a")?;
    let b = number_argument(&arguments, "b")?;
    if b == 0.0 {
        return Err(ToolError::new("division by zero"));
    }
    Ok(json!(a / b))
}
