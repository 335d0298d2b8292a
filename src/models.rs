//! Response models and associated functions and methods
//!
//! These are the versioned JSON shapes served by the API. They are built from
//! [engine](crate::engine) entities and never handed back to the engine.

use crate::engine;
use crate::error::ApiError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Reference to another entity by id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IdRef {
    #[serde(rename = "@id")]
    pub id: String,
}

impl IdRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AtlasModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub name: String,
    pub species: String,
    pub parcellations: Vec<IdRef>,
    pub spaces: Vec<IdRef>,
}

impl From<&engine::Atlas> for AtlasModel {
    fn from(atlas: &engine::Atlas) -> Self {
        Self {
            id: atlas.id.clone(),
            type_: "juelich/iav/atlas/v1.0.0".to_string(),
            name: atlas.name.clone(),
            species: atlas.species.clone(),
            parcellations: atlas.parcellations.iter().map(IdRef::new).collect(),
            spaces: atlas.spaces.iter().map(IdRef::new).collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParcellationModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub name: String,
    pub shortname: Option<String>,
    pub version: Option<String>,
    pub modality: Option<String>,
    pub spaces: Vec<IdRef>,
}

impl From<&engine::Parcellation> for ParcellationModel {
    fn from(parcellation: &engine::Parcellation) -> Self {
        Self {
            id: parcellation.id.clone(),
            type_: "minds/core/parcellationatlas/v1.0.0".to_string(),
            name: parcellation.name.clone(),
            shortname: parcellation.shortname.clone(),
            version: parcellation.version.clone(),
            modality: parcellation.modality.clone(),
            spaces: parcellation.spaces.iter().map(IdRef::new).collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RegionModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub name: String,
    pub parcellation: IdRef,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

impl RegionModel {
    /// Build the model of `entry`, a region of `parcellation_id`.
    pub fn new(parcellation_id: &str, entry: &engine::RegionEntry) -> Self {
        let region = &entry.region;
        let id = region.ontology_id.clone().unwrap_or_else(|| {
            format!(
                "{}/{}",
                parcellation_id,
                region.name.to_lowercase().replace(' ', "-")
            )
        });
        Self {
            id,
            type_: "https://openminds.ebrains.eu/sands/ParcellationEntityVersion".to_string(),
            name: region.name.clone(),
            parcellation: IdRef::new(parcellation_id),
            parent: entry.parent.clone(),
            children: region.children.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SpaceModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub full_name: String,
    pub short_name: Option<String>,
    pub species: Option<String>,
    pub default_image: Option<String>,
}

impl From<&engine::Space> for SpaceModel {
    fn from(space: &engine::Space) -> Self {
        Self {
            id: space.id.clone(),
            type_: "https://openminds.ebrains.eu/sands/CommonCoordinateSpaceVersion".to_string(),
            full_name: space.name.clone(),
            short_name: space.shortname.clone(),
            species: space.species.clone(),
            default_image: space.template_url.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VolumeModel {
    pub url: String,
    pub format: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MapModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub parcellation: IdRef,
    pub space: IdRef,
    pub maptype: engine::MapType,
    pub volumes: Vec<VolumeModel>,
    pub indices: std::collections::BTreeMap<String, u32>,
}

impl From<&engine::ParcellationMap> for MapModel {
    fn from(map: &engine::ParcellationMap) -> Self {
        let maptype = match map.maptype {
            engine::MapType::Labelled => "labelled",
            engine::MapType::Statistical => "statistical",
        };
        Self {
            id: format!("{}/{}/{}", map.parcellation, map.space, maptype),
            type_: "siibra-0.4/map".to_string(),
            parcellation: IdRef::new(&map.parcellation),
            space: IdRef::new(&map.space),
            maptype: map.maptype,
            volumes: map
                .volumes
                .iter()
                .map(|v| VolumeModel {
                    url: v.url.clone(),
                    format: v.format.clone(),
                })
                .collect(),
            indices: map.indices.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeatureModel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub type_: String,
    pub name: String,
    pub description: String,
    pub anchor: Vec<String>,
    pub data: Value,
}

impl From<&engine::Feature> for FeatureModel {
    fn from(feature: &engine::Feature) -> Self {
        Self {
            id: feature.id.clone(),
            type_: format!("siibra-0.4/feature/{}", feature.feature_type),
            name: feature.name.clone(),
            description: feature.description.clone(),
            anchor: feature.regions.clone(),
            data: feature.data.clone(),
        }
    }
}

/// Everything needed to render a parcellation in a space, packaged by the download operation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AtlasBundleModel {
    pub parcellation: ParcellationModel,
    pub space: SpaceModel,
    pub map: MapModel,
    pub regions: Vec<RegionModel>,
}

/// State of a queued task.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskModel {
    pub task_id: String,
    pub status: String,
}

fn default_page() -> usize {
    1
}

fn default_size() -> usize {
    50
}

/// Pagination query parameters
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Validate)]
pub struct PageParams {
    /// One-based page number
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: usize,

    /// Number of items per page
    #[serde(default = "default_size")]
    #[validate(range(min = 1, max = 100))]
    pub size: usize,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            size: default_size(),
        }
    }
}

/// One page of a list response.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    /// Cut a page out of `items`.
    ///
    /// Pages beyond the end are empty rather than an error.
    pub fn paginate(items: Vec<T>, params: &PageParams) -> Self {
        let total = items.len();
        let pages = (total + params.size - 1) / params.size;
        let start = (params.page - 1).saturating_mul(params.size);
        let items = items.into_iter().skip(start).take(params.size).collect();
        Self {
            items,
            total,
            page: params.page,
            size: params.size,
            pages,
        }
    }
}

impl Page<Value> {
    /// Paginate the JSON array returned by an operation.
    pub fn from_value(value: Value, params: &PageParams) -> Result<Self, ApiError> {
        match value {
            Value::Array(items) => Ok(Self::paginate(items, params)),
            other => Err(ApiError::Internal(format!(
                "expected a list result, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
