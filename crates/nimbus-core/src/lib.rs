//! nimbus-core: tool registry and weather tools
//!
//! Tools are named, schema-described capabilities with an async handler.
//! The registry is built once at start-up and shared read-only afterwards.

pub mod tools;
pub mod weather;

pub use tools::{RegistryError, ToolDefinition, ToolHandler, ToolRegistry, json_schema};
pub use weather::{NwsClient, WeatherConfig, WeatherSource, default_registry};
