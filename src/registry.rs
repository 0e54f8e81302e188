//! Catalog of the tools and resources one server instance exposes.
//!
//! A [`Registry`] is filled during server construction and then shared behind an
//! `Arc`; lookups take `&self` and never lock.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{McpError, ToolError};

pub type Arguments = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// `None` when a peer declares no type, or one outside [`ParamType`] such as
    /// `["string", "null"]`. Such properties accept any value.
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_param_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub param_type: Option<ParamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Remaining JSON-Schema keywords (`anyOf`, `enum`, ...), kept as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PropertySchema {
    pub fn typed(param_type: ParamType) -> Self {
        Self {
            param_type: Some(param_type),
            description: None,
            extra: Map::new(),
        }
    }
}

fn lenient_param_type<'de, D>(deserializer: D) -> Result<Option<ParamType>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Declared parameters of a tool, serialized as a JSON-Schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: IndexMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: object_type(),
            properties: IndexMap::new(),
            required: Vec::new(),
        }
    }
}

impl InputSchema {
    pub fn validate(&self, arguments: &Arguments) -> Result<(), String> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !arguments.contains_key(name.as_str()))
        {
            return Err(format!("missing required argument `{missing}`"));
        }

        for (name, value) in arguments {
            let Some(property) = self.properties.get(name) else {
                return Err(format!("unexpected argument `{name}`"));
            };
            if let Some(expected) = property.param_type {
                if !expected.matches(value) {
                    return Err(format!("argument `{name}` must be of type {expected}"));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: InputSchema,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::default(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        let name = name.into();
        self.input_schema.required.push(name.clone());
        self.input_schema
            .properties
            .insert(name, PropertySchema::typed(param_type));
        self
    }

    pub fn optional_param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.input_schema
            .properties
            .insert(name.into(), PropertySchema::typed(param_type));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Content produced by a resource provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceContent {
    Text(String),
    Binary(Vec<u8>),
}

impl ResourceContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Arguments) -> Result<Value, ToolError>;
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn read(&self) -> Result<ResourceContent, ToolError>;
}

struct FnTool<F>(F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(Arguments) -> Result<Value, ToolError> + Send + Sync,
{
    async fn call(&self, arguments: Arguments) -> Result<Value, ToolError> {
        (self.0)(arguments)
    }
}

struct FnResource<F>(F);

#[async_trait]
impl<F> ResourceProvider for FnResource<F>
where
    F: Fn() -> Result<ResourceContent, ToolError> + Send + Sync,
{
    async fn read(&self) -> Result<ResourceContent, ToolError> {
        (self.0)()
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Clone)]
pub struct RegisteredResource {
    pub descriptor: ResourceDescriptor,
    pub provider: Arc<dyn ResourceProvider>,
}

#[derive(Clone, Default)]
pub struct Registry {
    tools: IndexMap<String, RegisteredTool>,
    resources: IndexMap<String, RegisteredResource>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool<F>(
        &mut self,
        descriptor: ToolDescriptor,
        handler: F,
    ) -> Result<(), McpError>
    where
        F: Fn(Arguments) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register_tool_handler(descriptor, Arc::new(FnTool(handler)))
    }

    pub fn register_tool_handler(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), McpError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(McpError::DuplicateRegistration {
                kind: "tool",
                name: descriptor.name,
            });
        }

        debug!(tool = %descriptor.name, "registering tool");
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    pub fn register_resource<F>(
        &mut self,
        descriptor: ResourceDescriptor,
        provider: F,
    ) -> Result<(), McpError>
    where
        F: Fn() -> Result<ResourceContent, ToolError> + Send + Sync + 'static,
    {
        self.register_resource_provider(descriptor, Arc::new(FnResource(provider)))
    }

    pub fn register_resource_provider(
        &mut self,
        descriptor: ResourceDescriptor,
        provider: Arc<dyn ResourceProvider>,
    ) -> Result<(), McpError> {
        if self.resources.contains_key(&descriptor.uri) {
            return Err(McpError::DuplicateRegistration {
                kind: "resource",
                name: descriptor.uri,
            });
        }

        debug!(uri = %descriptor.uri, "registering resource");
        self.resources.insert(
            descriptor.uri.clone(),
            RegisteredResource {
                descriptor,
                provider,
            },
        );
        Ok(())
    }

    pub fn get_tool(&self, name: &str) -> Result<&RegisteredTool, McpError> {
        self.tools.get(name).ok_or_else(|| McpError::NotFound {
            kind: "tool",
            name: name.to_string(),
        })
    }

    pub fn get_resource(&self, uri: &str) -> Result<&RegisteredResource, McpError> {
        self.resources.get(uri).ok_or_else(|| McpError::NotFound {
            kind: "resource",
            name: uri.to_string(),
        })
    }

    pub fn snapshot_tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    pub fn snapshot_resources(&self) -> Vec<ResourceDescriptor> {
        self.resources
            .values()
            .map(|resource| resource.descriptor.clone())
            .collect()
    }
}
