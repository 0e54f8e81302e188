//! Demo resources under the `config://` scheme

use crate::errors::McpError;
use crate::registry::{Registry, ResourceContent, ResourceDescriptor};

pub const APP_CONFIG_URI: &str = "config://app";
pub const VERSION_URI: &str = "config://version";

pub fn register_resources(registry: &mut Registry) -> Result<(), McpError> {
    registry.register_resource(
        ResourceDescriptor::new(APP_CONFIG_URI, "get_config")
            .description("Get application configuration")
            .mime_type("text/plain"),
        || Ok(ResourceContent::text("App configuration data")),
    )?;
    registry.register_resource(
        ResourceDescriptor::new(VERSION_URI, "get_version")
            .description("Get server version")
            .mime_type("text/plain"),
        || Ok(ResourceContent::text("1.0.0")),
    )?;
    Ok(())
}
