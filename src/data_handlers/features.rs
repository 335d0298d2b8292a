//! Multimodal features.
//!
//! Feature queries can touch large remote datasets, so they are registered as cooperative
//! operations: a server process polls for their result instead of holding a dispatch slot.

use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};
use crate::models::FeatureModel;

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("features.rs");

#[derive(Deserialize)]
struct FeaturesArgs {
    feature_type: String,
    #[serde(default)]
    parcellation_id: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
}

#[derive(Deserialize)]
struct FeatureArgs {
    feature_id: String,
}

/// Run an engine query off the async runtime.
async fn query<T, F>(engine: &Arc<dyn AtlasEngine>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn AtlasEngine) -> Result<T, ApiError> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(engine.as_ref())).await?
}

/// Names of the feature types.
pub async fn feature_types(engine: Arc<dyn AtlasEngine>) -> Result<Vec<String>, ApiError> {
    query(&engine, |engine| Ok(engine.feature_types()?)).await
}

/// Features of a type, optionally anchored to a region of a parcellation.
pub async fn all_features(
    engine: Arc<dyn AtlasEngine>,
    feature_type: String,
    parcellation_id: Option<String>,
    region_id: Option<String>,
) -> Result<Vec<FeatureModel>, ApiError> {
    query(&engine, move |engine| {
        if let (Some(parcellation), Some(region)) = (&parcellation_id, &region_id) {
            // Unknown regions are a 404 rather than an empty list.
            engine.region(parcellation, region)?;
        }
        let features = engine.features(
            &feature_type,
            parcellation_id.as_deref(),
            region_id.as_deref(),
        )?;
        Ok(features.iter().map(FeatureModel::from).collect())
    })
    .await
}

pub async fn single_feature(
    engine: Arc<dyn AtlasEngine>,
    feature_id: String,
) -> Result<FeatureModel, ApiError> {
    query(&engine, move |engine| {
        Ok(FeatureModel::from(&engine.feature(&feature_id)?))
    })
    .await
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register_async(
        DispatchTarget::cooperative("feature_types", move |_: Value| {
            let e = e.clone();
            async move { to_value(feature_types(e).await?) }
        })
        .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register_async(
        DispatchTarget::cooperative("all_features", move |args| {
            let e = e.clone();
            async move {
                let args: FeaturesArgs = parse_args("all_features", args)?;
                to_value(
                    all_features(e, args.feature_type, args.parcellation_id, args.region_id)
                        .await?,
                )
            }
        })
        .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register_async(
        DispatchTarget::cooperative("single_feature", move |args| {
            let e = e.clone();
            async move {
                let args: FeatureArgs = parse_args("single_feature", args)?;
                to_value(single_feature(e, args.feature_id).await?)
            }
        })
        .with_source(SOURCE),
    )
}
