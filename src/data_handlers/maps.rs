use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::{AtlasEngine, MapType};
use crate::error::{ApiError, ConfigError};
use crate::models::MapModel;

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("maps.rs");

fn default_maptype() -> MapType {
    MapType::Labelled
}

#[derive(Deserialize)]
struct MapArgs {
    parcellation_id: String,
    space_id: String,
    #[serde(default = "default_maptype")]
    maptype: MapType,
}

/// The map of a parcellation in a reference space.
pub fn get_map(
    engine: &dyn AtlasEngine,
    parcellation_id: &str,
    space_id: &str,
    maptype: MapType,
) -> Result<MapModel, ApiError> {
    Ok(MapModel::from(
        &engine.get_map(parcellation_id, space_id, maptype)?,
    ))
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("get_map", move |args| {
            let args: MapArgs = parse_args("get_map", args)?;
            to_value(get_map(
                e.as_ref(),
                &args.parcellation_id,
                &args.space_id,
                args.maptype,
            )?)
        })
        .with_source(SOURCE),
    )
}
