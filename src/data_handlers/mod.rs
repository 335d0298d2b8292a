//! Business functions.
//!
//! Each logical operation calls into the [atlas engine](crate::engine) and returns response
//! [models](crate::models) as JSON. Operations take their arguments as a JSON object so that the
//! same function can run in-process or be shipped through the task queue by name.

pub mod atlases;
pub mod download;
pub mod features;
pub mod maps;
pub mod parcellations;
pub mod regions;
pub mod spaces;

use crate::dispatch::DispatchRegistry;
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Register every operation.
pub fn register_all(
    registry: &mut DispatchRegistry,
    engine: Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    atlases::register(registry, &engine)?;
    parcellations::register(registry, &engine)?;
    regions::register(registry, &engine)?;
    spaces::register(registry, &engine)?;
    maps::register(registry, &engine)?;
    features::register(registry, &engine)?;
    download::register(registry, &engine)?;
    tracing::debug!(operations = ?registry.names(), "registered operations");
    Ok(())
}

/// Deserialise the arguments of `operation`.
pub(crate) fn parse_args<T: DeserializeOwned>(operation: &str, args: Value) -> Result<T, ApiError> {
    serde_json::from_value(args).map_err(|source| ApiError::InvalidArguments {
        operation: operation.to_string(),
        source,
    })
}

pub(crate) fn to_value<T: Serialize>(value: T) -> Result<Value, ApiError> {
    Ok(serde_json::to_value(value)?)
}
