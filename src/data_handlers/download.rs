//! Atlas bundle download.
//!
//! Packaging a parcellation with its map and regions is the slowest operation of the API. When a
//! task queue is in use it is queued and the client polls for the bundle by task id.

use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::{AtlasEngine, MapType};
use crate::error::{ApiError, ConfigError};
use crate::models::{AtlasBundleModel, MapModel, ParcellationModel, RegionModel, SpaceModel};

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("download.rs");

#[derive(Deserialize)]
struct DownloadArgs {
    parcellation_id: String,
    space_id: String,
}

/// Everything needed to render `parcellation_id` in `space_id`.
pub fn atlas_download(
    engine: &dyn AtlasEngine,
    parcellation_id: &str,
    space_id: &str,
) -> Result<AtlasBundleModel, ApiError> {
    let parcellation = engine.parcellation(parcellation_id)?;
    let space = engine.space(space_id)?;
    let map = engine.get_map(parcellation_id, space_id, MapType::Labelled)?;
    let regions = parcellation
        .flattened_regions()
        .iter()
        .map(|entry| RegionModel::new(parcellation_id, entry))
        .collect();
    Ok(AtlasBundleModel {
        parcellation: ParcellationModel::from(&parcellation),
        space: SpaceModel::from(&space),
        map: MapModel::from(&map),
        regions,
    })
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    let target = DispatchTarget::blocking("atlas_download", move |args| {
        let args: DownloadArgs = parse_args("atlas_download", args)?;
        to_value(atlas_download(
            e.as_ref(),
            &args.parcellation_id,
            &args.space_id,
        )?)
    })
    .with_source(SOURCE);
    if registry.role().uses_queue() {
        registry.register_queued(target)
    } else {
        registry.register(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CatalogEngine;
    use crate::test_utils::test_catalog;

    #[test]
    fn bundle() {
        let engine = CatalogEngine::from_catalog(test_catalog());
        let bundle = atlas_download(&engine, "julich", "mni152").unwrap();
        assert_eq!(bundle.regions.len(), 4);
        assert_eq!(bundle.map.volumes.len(), 1);
        assert_eq!(bundle.space.id, "mni152");
    }

    #[test]
    fn bundle_of_unknown_space() {
        let engine = CatalogEngine::from_catalog(test_catalog());
        let err = atlas_download(&engine, "julich", "bigbrain").unwrap_err();
        assert_eq!(err.to_string(), "space bigbrain not found");
    }
}
