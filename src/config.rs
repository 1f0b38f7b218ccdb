use crate::core::frame_order::PolicyKind;
use crate::core::granule_select::SelectionStrategy;
use crate::core::grid::WEB_MERCATOR_EPSG;
use crate::core::measurement::MeasurementParams;
use crate::core::partition::PartitionParams;
use crate::types::{DispError, DispResult, OrbitDirection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Explicit catalog connection context threaded through every query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogContext {
    /// CMR `granules.umm_json` search endpoint
    pub endpoint: String,
    /// Collection short name
    pub short_name: String,
    pub provider: String,
    /// Earthdata bearer token
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub page_size: usize,
    pub timeout_secs: u64,
}

impl Default for CatalogContext {
    fn default() -> Self {
        Self {
            endpoint: "https://cmr.earthdata.nasa.gov/search/granules.umm_json".to_string(),
            short_name: "OPERA_L3_DISP-S1_V1".to_string(),
            provider: "ASF".to_string(),
            token: None,
            page_size: 2000,
            timeout_secs: 120,
        }
    }
}

/// Every tunable of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub catalog: CatalogContext,
    pub output_epsg: u32,
    /// Output pixel size in output projection units
    pub resolution: f64,
    /// Partition edge length in degrees
    pub partition_size: f64,
    pub max_concurrent_downloads: usize,
    /// Smallest fraction of valid observations for a velocity pixel
    pub min_valid_fraction: f64,
    pub selection: SelectionStrategy,
    pub policy: PolicyKind,
    pub orbit_direction: Option<OrbitDirection>,
    pub resume: bool,
    pub frame_index: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogContext::default(),
            output_epsg: WEB_MERCATOR_EPSG,
            resolution: 30.0,
            partition_size: 10.0,
            max_concurrent_downloads: 4,
            min_valid_fraction: 0.9,
            selection: SelectionStrategy::default(),
            policy: PolicyKind::default(),
            orbit_direction: None,
            resume: true,
            frame_index: None,
        }
    }
}

impl RunConfig {
    /// Load from JSON; missing keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> DispResult<Self> {
        let path = path.as_ref();
        log::info!("Loading run configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DispResult<()> {
        if !(self.resolution > 0.0) {
            return Err(DispError::InvalidFormat(format!("Resolution must be positive, got {}", self.resolution)));
        }
        if !(self.partition_size > 0.0) {
            return Err(DispError::InvalidFormat(format!(
                "Partition size must be positive, got {}",
                self.partition_size
            )));
        }
        if !(0.0..=1.0).contains(&self.min_valid_fraction) {
            return Err(DispError::InvalidFormat(format!(
                "Minimum valid fraction must be within [0, 1], got {}",
                self.min_valid_fraction
            )));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(DispError::InvalidFormat("At least one download worker is required".to_string()));
        }
        Ok(())
    }

    pub fn measurement_params(&self) -> MeasurementParams {
        MeasurementParams {
            min_valid_fraction: self.min_valid_fraction,
            ..MeasurementParams::default()
        }
    }

    pub fn partition_params(&self) -> PartitionParams {
        PartitionParams {
            partition_size: self.partition_size,
            output_epsg: self.output_epsg,
            resolution: self.resolution,
            orbit_direction: self.orbit_direction,
            policy: self.policy,
            resume: self.resume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"resolution": 90.0, "policy": "orbit_sweep", "orbit_direction": "ASCENDING"}"#)
                .unwrap();
        assert_eq!(config.resolution, 90.0);
        assert_eq!(config.policy, PolicyKind::OrbitSweep);
        assert_eq!(config.orbit_direction, Some(OrbitDirection::Ascending));
        assert_eq!(config.output_epsg, 3857);
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.selection, SelectionStrategy::Spanning);
        assert_eq!(config.catalog.page_size, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let mut config = RunConfig::default();
        config.catalog.token = Some("secret".to_string());
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = RunConfig { min_valid_fraction: 1.5, ..RunConfig::default() };
        assert!(config.validate().is_err());
        let config = RunConfig { resolution: 0.0, ..RunConfig::default() };
        assert!(config.validate().is_err());
    }
}
