use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};
use crate::models::ParcellationModel;

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("parcellations.rs");

#[derive(Deserialize)]
struct ParcellationArgs {
    parcellation_id: String,
}

pub fn all_parcellations(engine: &dyn AtlasEngine) -> Result<Vec<ParcellationModel>, ApiError> {
    Ok(engine
        .parcellations()?
        .iter()
        .map(ParcellationModel::from)
        .collect())
}

pub fn single_parcellation(
    engine: &dyn AtlasEngine,
    parcellation_id: &str,
) -> Result<ParcellationModel, ApiError> {
    Ok(ParcellationModel::from(&engine.parcellation(parcellation_id)?))
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("all_parcellations", move |_| {
            to_value(all_parcellations(e.as_ref())?)
        })
        .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("single_parcellation", move |args| {
            let args: ParcellationArgs = parse_args("single_parcellation", args)?;
            to_value(single_parcellation(e.as_ref(), &args.parcellation_id)?)
        })
        .with_source(SOURCE),
    )
}
