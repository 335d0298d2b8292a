use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};
use crate::models::AtlasModel;

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("atlases.rs");

#[derive(Deserialize)]
struct AtlasArgs {
    atlas_id: String,
}

/// Every atlas known to the engine.
pub fn all_atlases(engine: &dyn AtlasEngine) -> Result<Vec<AtlasModel>, ApiError> {
    Ok(engine.atlases()?.iter().map(AtlasModel::from).collect())
}

pub fn single_atlas(engine: &dyn AtlasEngine, atlas_id: &str) -> Result<AtlasModel, ApiError> {
    Ok(AtlasModel::from(&engine.atlas(atlas_id)?))
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("all_atlases", move |_| to_value(all_atlases(e.as_ref())?))
            .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("single_atlas", move |args| {
            let args: AtlasArgs = parse_args("single_atlas", args)?;
            to_value(single_atlas(e.as_ref(), &args.atlas_id)?)
        })
        .with_source(SOURCE),
    )
}
