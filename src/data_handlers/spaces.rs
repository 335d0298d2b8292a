use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};
use crate::models::SpaceModel;

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("spaces.rs");

#[derive(Deserialize)]
struct SpaceArgs {
    space_id: String,
}

pub fn all_spaces(engine: &dyn AtlasEngine) -> Result<Vec<SpaceModel>, ApiError> {
    Ok(engine.spaces()?.iter().map(SpaceModel::from).collect())
}

pub fn single_space(engine: &dyn AtlasEngine, space_id: &str) -> Result<SpaceModel, ApiError> {
    Ok(SpaceModel::from(&engine.space(space_id)?))
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("all_spaces", move |_| to_value(all_spaces(e.as_ref())?))
            .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("single_space", move |args| {
            let args: SpaceArgs = parse_args("single_space", args)?;
            to_value(single_space(e.as_ref(), &args.space_id)?)
        })
        .with_source(SOURCE),
    )
}
