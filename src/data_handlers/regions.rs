use super::{parse_args, to_value};
use crate::dispatch::{DispatchRegistry, DispatchTarget};
use crate::engine::AtlasEngine;
use crate::error::{ApiError, ConfigError};
use crate::models::RegionModel;

use serde::Deserialize;
use std::sync::Arc;

pub const SOURCE: &str = include_str!("regions.rs");

#[derive(Deserialize)]
struct RegionsArgs {
    parcellation_id: String,
    #[serde(default)]
    find: Option<String>,
}

#[derive(Deserialize)]
struct RegionArgs {
    parcellation_id: String,
    region_id: String,
}

/// Regions of a parcellation, restricted to names containing `find` when given.
pub fn all_regions(
    engine: &dyn AtlasEngine,
    parcellation_id: &str,
    find: Option<&str>,
) -> Result<Vec<RegionModel>, ApiError> {
    let entries = match find {
        Some(query) => engine.find_regions(parcellation_id, query)?,
        None => engine.regions(parcellation_id)?,
    };
    Ok(entries
        .iter()
        .map(|entry| RegionModel::new(parcellation_id, entry))
        .collect())
}

pub fn single_region(
    engine: &dyn AtlasEngine,
    parcellation_id: &str,
    region_id: &str,
) -> Result<RegionModel, ApiError> {
    let entry = engine.region(parcellation_id, region_id)?;
    Ok(RegionModel::new(parcellation_id, &entry))
}

pub fn register(
    registry: &mut DispatchRegistry,
    engine: &Arc<dyn AtlasEngine>,
) -> Result<(), ConfigError> {
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("all_regions", move |args| {
            let args: RegionsArgs = parse_args("all_regions", args)?;
            to_value(all_regions(
                e.as_ref(),
                &args.parcellation_id,
                args.find.as_deref(),
            )?)
        })
        .with_source(SOURCE),
    )?;
    let e = engine.clone();
    registry.register(
        DispatchTarget::blocking("single_region", move |args| {
            let args: RegionArgs = parse_args("single_region", args)?;
            to_value(single_region(
                e.as_ref(),
                &args.parcellation_id,
                &args.region_id,
            )?)
        })
        .with_source(SOURCE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CatalogEngine;
    use crate::test_utils::test_catalog;

    #[test]
    fn find_narrows_regions() {
        let engine = CatalogEngine::from_catalog(test_catalog());
        assert_eq!(all_regions(&engine, "julich", None).unwrap().len(), 4);
        let found = all_regions(&engine, "julich", Some("45")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "julich/area-45");
        assert_eq!(found[0].parent.as_deref(), Some("frontal lobe"));
    }

    #[test]
    fn region_by_name() {
        let engine = CatalogEngine::from_catalog(test_catalog());
        let region = single_region(&engine, "julich", "Area 44").unwrap();
        assert_eq!(region.id, "minds/core/parcellationregion/v1.0.0/44");
        let err = single_region(&engine, "julich", "area 1").unwrap_err();
        assert_eq!(err.status().as_u16(), 404);
    }
}
