//! The demo catalog served by the binary
//!
//! Tools and resources are ordinary registry entries; nothing in the protocol layer knows
//! about them.

pub mod resources;
pub mod tools;
pub mod utils;

use crate::errors::McpError;
use crate::registry::Registry;

pub fn demo_registry() -> Result<Registry, McpError> {
    let mut registry = Registry::new();
    tools::register_tools(&mut registry)?;
    resources::register_resources(&mut registry)?;
    Ok(registry)
}
