//! Atlas engine adapter.
//!
//! The atlas engine owns the neuroscience domain model: atlases, parcellations with their region
//! hierarchies, reference spaces, parcellation maps and multimodal features. This crate consumes
//! it through the [AtlasEngine] object API and never reimplements its algorithms.
//!
//! [CatalogEngine] is the file-backed engine used in deployments. It reads a JSON catalog
//! exported from the engine into the shared storage directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised by the atlas engine.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// Entity lookup failed
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A data source of the engine cannot be reached
    #[error("{0}")]
    Unavailable(String),
}

fn not_found(kind: &'static str, id: &str) -> EngineError {
    EngineError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Atlas {
    pub id: String,
    pub name: String,
    pub species: String,
    #[serde(default)]
    pub parcellations: Vec<String>,
    #[serde(default)]
    pub spaces: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Parcellation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub shortname: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub spaces: Vec<String>,
    /// Root regions of the hierarchy
    #[serde(default)]
    pub regions: Vec<Region>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Region {
    pub name: String,
    #[serde(default)]
    pub ontology_id: Option<String>,
    #[serde(default)]
    pub children: Vec<Region>,
}

/// A region with its position in the hierarchy.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionEntry {
    pub region: Region,
    pub parent: Option<String>,
}

impl Parcellation {
    /// Every region of the hierarchy, parents before children.
    pub fn flattened_regions(&self) -> Vec<RegionEntry> {
        fn visit(region: &Region, parent: Option<&str>, out: &mut Vec<RegionEntry>) {
            out.push(RegionEntry {
                region: region.clone(),
                parent: parent.map(str::to_string),
            });
            for child in &region.children {
                visit(child, Some(&region.name), out);
            }
        }
        let mut out = Vec::new();
        for root in &self.regions {
            visit(root, None, &mut out);
        }
        out
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub shortname: Option<String>,
    #[serde(default)]
    pub species: Option<String>,
    /// URL of the template image
    #[serde(default)]
    pub template_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapType {
    Labelled,
    Statistical,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Volume {
    pub url: String,
    pub format: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParcellationMap {
    pub parcellation: String,
    pub space: String,
    pub maptype: MapType,
    pub volumes: Vec<Volume>,
    /// Region name to label index
    #[serde(default)]
    pub indices: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Feature {
    pub id: String,
    pub feature_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parcellation: Option<String>,
    /// Names of the regions the feature is anchored to
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Exported engine state.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Catalog {
    #[serde(default)]
    pub atlases: Vec<Atlas>,
    #[serde(default)]
    pub parcellations: Vec<Parcellation>,
    #[serde(default)]
    pub spaces: Vec<Space>,
    #[serde(default)]
    pub maps: Vec<ParcellationMap>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// The atlas engine object API.
pub trait AtlasEngine: Send + Sync {
    fn atlases(&self) -> Result<Vec<Atlas>, EngineError>;
    fn atlas(&self, id: &str) -> Result<Atlas, EngineError>;
    fn parcellations(&self) -> Result<Vec<Parcellation>, EngineError>;
    fn parcellation(&self, id: &str) -> Result<Parcellation, EngineError>;
    fn spaces(&self) -> Result<Vec<Space>, EngineError>;
    fn space(&self, id: &str) -> Result<Space, EngineError>;

    /// Every region of a parcellation.
    fn regions(&self, parcellation_id: &str) -> Result<Vec<RegionEntry>, EngineError>;

    /// Regions of a parcellation whose name contains `query`, ignoring case.
    fn find_regions(
        &self,
        parcellation_id: &str,
        query: &str,
    ) -> Result<Vec<RegionEntry>, EngineError>;

    /// A single region, matched by name ignoring case.
    fn region(&self, parcellation_id: &str, name: &str) -> Result<RegionEntry, EngineError>;

    fn get_map(
        &self,
        parcellation_id: &str,
        space_id: &str,
        maptype: MapType,
    ) -> Result<ParcellationMap, EngineError>;

    /// Sorted names of the available feature types.
    fn feature_types(&self) -> Result<Vec<String>, EngineError>;

    /// Features of a type, optionally restricted to a parcellation and region.
    fn features(
        &self,
        feature_type: &str,
        parcellation_id: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<Feature>, EngineError>;

    fn feature(&self, id: &str) -> Result<Feature, EngineError>;
}

/// Atlas engine backed by an exported JSON catalog.
#[derive(Debug)]
pub struct CatalogEngine {
    catalog: Result<Catalog, String>,
}

impl CatalogEngine {
    /// Load the catalog at `path`.
    ///
    /// A catalog that cannot be read leaves the engine unavailable rather than failing startup,
    /// so that the API answers 503 until the shared storage is populated.
    pub fn open(path: &Path) -> Self {
        let catalog = std::fs::read_to_string(path)
            .map_err(|err| format!("failed to read catalog {}: {}", path.display(), err))
            .and_then(|text| {
                serde_json::from_str::<Catalog>(&text)
                    .map_err(|err| format!("failed to parse catalog {}: {}", path.display(), err))
            });
        match &catalog {
            Ok(catalog) => tracing::info!(
                atlases = catalog.atlases.len(),
                parcellations = catalog.parcellations.len(),
                spaces = catalog.spaces.len(),
                features = catalog.features.len(),
                "loaded atlas catalog"
            ),
            Err(reason) => tracing::warn!("atlas engine unavailable: {}", reason),
        }
        Self { catalog }
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            catalog: Ok(catalog),
        }
    }

    fn catalog(&self) -> Result<&Catalog, EngineError> {
        self.catalog
            .as_ref()
            .map_err(|reason| EngineError::Unavailable(reason.clone()))
    }
}

impl AtlasEngine for CatalogEngine {
    fn atlases(&self) -> Result<Vec<Atlas>, EngineError> {
        Ok(self.catalog()?.atlases.clone())
    }

    fn atlas(&self, id: &str) -> Result<Atlas, EngineError> {
        self.catalog()?
            .atlases
            .iter()
            .find(|atlas| atlas.id == id)
            .cloned()
            .ok_or_else(|| not_found("atlas", id))
    }

    fn parcellations(&self) -> Result<Vec<Parcellation>, EngineError> {
        Ok(self.catalog()?.parcellations.clone())
    }

    fn parcellation(&self, id: &str) -> Result<Parcellation, EngineError> {
        self.catalog()?
            .parcellations
            .iter()
            .find(|parcellation| parcellation.id == id)
            .cloned()
            .ok_or_else(|| not_found("parcellation", id))
    }

    fn spaces(&self) -> Result<Vec<Space>, EngineError> {
        Ok(self.catalog()?.spaces.clone())
    }

    fn space(&self, id: &str) -> Result<Space, EngineError> {
        self.catalog()?
            .spaces
            .iter()
            .find(|space| space.id == id)
            .cloned()
            .ok_or_else(|| not_found("space", id))
    }

    fn regions(&self, parcellation_id: &str) -> Result<Vec<RegionEntry>, EngineError> {
        Ok(self.parcellation(parcellation_id)?.flattened_regions())
    }

    fn find_regions(
        &self,
        parcellation_id: &str,
        query: &str,
    ) -> Result<Vec<RegionEntry>, EngineError> {
        let query = query.to_lowercase();
        Ok(self
            .regions(parcellation_id)?
            .into_iter()
            .filter(|entry| entry.region.name.to_lowercase().contains(&query))
            .collect())
    }

    fn region(&self, parcellation_id: &str, name: &str) -> Result<RegionEntry, EngineError> {
        self.regions(parcellation_id)?
            .into_iter()
            .find(|entry| entry.region.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| not_found("region", name))
    }

    fn get_map(
        &self,
        parcellation_id: &str,
        space_id: &str,
        maptype: MapType,
    ) -> Result<ParcellationMap, EngineError> {
        // Surface unknown parcellations and spaces before a missing map.
        self.parcellation(parcellation_id)?;
        self.space(space_id)?;
        self.catalog()?
            .maps
            .iter()
            .find(|map| {
                map.parcellation == parcellation_id && map.space == space_id && map.maptype == maptype
            })
            .cloned()
            .ok_or_else(|| not_found("map", &format!("{parcellation_id} in {space_id}")))
    }

    fn feature_types(&self) -> Result<Vec<String>, EngineError> {
        let mut types: Vec<String> = self
            .catalog()?
            .features
            .iter()
            .map(|feature| feature.feature_type.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    fn features(
        &self,
        feature_type: &str,
        parcellation_id: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<Feature>, EngineError> {
        if let Some(parcellation_id) = parcellation_id {
            self.parcellation(parcellation_id)?;
        }
        Ok(self
            .catalog()?
            .features
            .iter()
            .filter(|feature| feature.feature_type == feature_type)
            .filter(|feature| match parcellation_id {
                Some(id) => feature.parcellation.as_deref() == Some(id),
                None => true,
            })
            .filter(|feature| match region {
                Some(name) => feature
                    .regions
                    .iter()
                    .any(|anchored| anchored.eq_ignore_ascii_case(name)),
                None => true,
            })
            .cloned()
            .collect())
    }

    fn feature(&self, id: &str) -> Result<Feature, EngineError> {
        self.catalog()?
            .features
            .iter()
            .find(|feature| feature.id == id)
            .cloned()
            .ok_or_else(|| not_found("feature", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_catalog;

    fn engine() -> CatalogEngine {
        CatalogEngine::from_catalog(test_catalog())
    }

    #[test]
    fn atlas_lookup() {
        let engine = engine();
        assert_eq!(engine.atlases().unwrap().len(), 1);
        assert_eq!(engine.atlas("human").unwrap().name, "Multilevel Human Atlas");
        assert_eq!(
            engine.atlas("mouse"),
            Err(EngineError::NotFound {
                kind: "atlas",
                id: "mouse".to_string()
            })
        );
    }

    #[test]
    fn flattened_regions_keep_parents() {
        let regions = engine().regions("julich").unwrap();
        let names: Vec<&str> = regions.iter().map(|e| e.region.name.as_str()).collect();
        assert_eq!(names, vec!["whole brain", "frontal lobe", "area 44", "area 45"]);
        assert_eq!(regions[0].parent, None);
        assert_eq!(regions[2].parent.as_deref(), Some("frontal lobe"));
    }

    #[test]
    fn find_regions_ignores_case() {
        let found = engine().find_regions("julich", "AREA").unwrap();
        assert_eq!(found.len(), 2);
        assert!(engine().find_regions("julich", "hippocampus").unwrap().is_empty());
    }

    #[test]
    fn region_lookup() {
        let engine = engine();
        assert_eq!(engine.region("julich", "Area 44").unwrap().region.name, "area 44");
        assert!(matches!(
            engine.region("julich", "area 99"),
            Err(EngineError::NotFound { kind: "region", .. })
        ));
        assert!(matches!(
            engine.region("unknown", "area 44"),
            Err(EngineError::NotFound {
                kind: "parcellation",
                ..
            })
        ));
    }

    #[test]
    fn map_lookup() {
        let engine = engine();
        let map = engine.get_map("julich", "mni152", MapType::Labelled).unwrap();
        assert_eq!(map.volumes.len(), 1);
        assert!(matches!(
            engine.get_map("julich", "mni152", MapType::Statistical),
            Err(EngineError::NotFound { kind: "map", .. })
        ));
        assert!(matches!(
            engine.get_map("julich", "colin", MapType::Labelled),
            Err(EngineError::NotFound { kind: "space", .. })
        ));
    }

    #[test]
    fn feature_filters() {
        let engine = engine();
        assert_eq!(
            engine.feature_types().unwrap(),
            vec!["ReceptorDensityFingerprint", "RegionalConnectivity"]
        );
        let all = engine
            .features("ReceptorDensityFingerprint", None, None)
            .unwrap();
        assert_eq!(all.len(), 2);
        let area_44 = engine
            .features("ReceptorDensityFingerprint", Some("julich"), Some("AREA 44"))
            .unwrap();
        assert_eq!(area_44.len(), 1);
        assert_eq!(engine.feature("fp-44").unwrap().regions, vec!["area 44"]);
    }

    #[test]
    fn missing_catalog_is_unavailable() {
        let engine = CatalogEngine::open(Path::new("/nonexistent/catalog.json"));
        assert!(matches!(engine.atlases(), Err(EngineError::Unavailable(_))));
        assert!(matches!(
            engine.feature("fp-44"),
            Err(EngineError::Unavailable(_))
        ));
    }

    #[test]
    fn catalog_file_is_loaded() {
        let path = std::env::temp_dir()
            .join(format!("siibra-api-catalog-{}.json", std::process::id()));
        let text = serde_json::to_vec(&crate::test_utils::test_catalog()).unwrap();
        std::fs::write(&path, text).unwrap();
        let engine = CatalogEngine::open(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(engine.atlas("human").unwrap().name, "Multilevel Human Atlas");
    }

    #[test]
    fn malformed_catalog_is_unavailable() {
        let path = std::env::temp_dir()
            .join(format!("siibra-api-malformed-{}.json", std::process::id()));
        std::fs::write(&path, b"{\"atlases\": 3}").unwrap();
        let engine = CatalogEngine::open(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(engine.atlases(), Err(EngineError::Unavailable(_))));
    }
}
