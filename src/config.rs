use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::DataFormat;
use crate::error::PreloadError;

pub const DEFAULT_ENDPOINT: &str = "https://zenodo.org";
pub const DEFAULT_CONFIG_FILE: &str = "zenodo-preload.json";

const BUDGET_TOLERANCE: f64 = 1e-9;

/// Share of the unit progress interval owned by each pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressBudget {
    download: f64,
    decompress: f64,
    process: f64,
}

impl ProgressBudget {
    pub const DOWNLOAD_FRACTION: f64 = 0.4;
    pub const DECOMPRESS_FRACTION: f64 = 0.1;
    pub const PROCESS_FRACTION: f64 = 0.5;

    pub fn new(download: f64, decompress: f64, process: f64) -> Result<Self, PreloadError> {
        let fractions = [download, decompress, process];
        if fractions
            .iter()
            .any(|value| !value.is_finite() || *value < 0.0)
        {
            return Err(PreloadError::InvalidParameter(format!(
                "progress fractions must be non-negative, got {download}/{decompress}/{process}"
            )));
        }
        let total = download + decompress + process;
        if (total - 1.0).abs() > BUDGET_TOLERANCE {
            return Err(PreloadError::InvalidParameter(format!(
                "progress fractions must sum to 1.0, got {total}"
            )));
        }
        Ok(Self {
            download,
            decompress,
            process,
        })
    }

    pub fn download(&self) -> f64 {
        self.download
    }

    pub fn decompress(&self) -> f64 {
        self.decompress
    }

    pub fn process(&self) -> f64 {
        self.process
    }

    pub fn download_progress(&self, written: u64, total: u64) -> f64 {
        self.download * ratio(written, total)
    }

    /// Progress reached once the archive has been extracted.
    pub fn unpacked(&self) -> f64 {
        self.download + self.decompress
    }

    pub fn process_progress(&self, processed: u64, total: u64) -> f64 {
        self.unpacked() + self.process * ratio(processed, total)
    }
}

impl Default for ProgressBudget {
    fn default() -> Self {
        Self {
            download: Self::DOWNLOAD_FRACTION,
            decompress: Self::DECOMPRESS_FRACTION,
            process: Self::PROCESS_FRACTION,
        }
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0)
}

/// Options accepted by a preload request. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreloadParams {
    #[serde(default)]
    pub target_format: Option<DataFormat>,
    #[serde(default)]
    pub chunks: Option<Vec<usize>>,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default = "default_true")]
    pub silent: bool,
}

impl Default for PreloadParams {
    fn default() -> Self {
        Self {
            target_format: None,
            chunks: None,
            force: false,
            blocking: true,
            silent: true,
        }
    }
}

impl PreloadParams {
    pub fn from_json(value: Value) -> Result<Self, PreloadError> {
        let params: PreloadParams = serde_json::from_value(value)
            .map_err(|err| PreloadError::InvalidParameter(err.to_string()))?;
        params.validate()
    }

    /// Checks the option values and normalizes the target format.
    ///
    /// A raster target cannot be written, so it is remapped to zarr.
    pub fn validate(mut self) -> Result<Self, PreloadError> {
        if let Some(chunks) = &self.chunks {
            if chunks.is_empty() {
                return Err(PreloadError::InvalidParameter(
                    "chunks must name at least one dimension".to_string(),
                ));
            }
            if chunks.iter().any(|size| *size == 0) {
                return Err(PreloadError::InvalidParameter(format!(
                    "chunk sizes must be positive, got {chunks:?}"
                )));
            }
        }
        match self.target_format {
            None | Some(DataFormat::Zarr) | Some(DataFormat::NetCdf) => {}
            Some(format) if format.is_raster() => {
                warn!(
                    requested = %format,
                    "writing {format} is not supported; target format changed to zarr"
                );
                self.target_format = Some(DataFormat::Zarr);
            }
            Some(other) => {
                return Err(PreloadError::InvalidParameter(format!(
                    "target_format must be zarr or netcdf, got {other}"
                )));
            }
        }
        Ok(self)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub data_ids: Vec<String>,
    #[serde(default)]
    pub preload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub endpoint: String,
    pub cache_dir: Option<PathBuf>,
    pub data_ids: Vec<String>,
    pub params: PreloadParams,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads an explicit config file, or `zenodo-preload.json` from the
    /// current directory when present. Without either, defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PreloadError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PreloadError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PreloadError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PreloadError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let endpoint = config
            .endpoint
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let params = match config.preload {
            Some(value) => PreloadParams::from_json(value)?,
            None => PreloadParams::default(),
        };

        Ok(ResolvedConfig {
            schema_version,
            endpoint,
            cache_dir: config.cache_dir.map(PathBuf::from),
            data_ids: config.data_ids,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn default_budget_sums_to_one() {
        let budget = ProgressBudget::default();
        assert_eq!(budget.download() + budget.decompress() + budget.process(), 1.0);
        assert_eq!(budget.unpacked(), 0.5);
        assert_eq!(budget.process_progress(10, 10), 1.0);
    }

    #[test]
    fn budget_rejects_bad_partition() {
        let err = ProgressBudget::new(0.5, 0.5, 0.5).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
        let err = ProgressBudget::new(-0.1, 0.6, 0.5).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
        assert!(ProgressBudget::new(0.2, 0.2, 0.6).is_ok());
    }

    #[test]
    fn params_defaults() {
        let params = PreloadParams::from_json(json!({})).unwrap();
        assert_eq!(params, PreloadParams::default());
        assert!(params.blocking);
        assert!(params.silent);
        assert!(!params.force);
    }

    #[test]
    fn params_reject_unknown_keys() {
        let err = PreloadParams::from_json(json!({ "merge": true })).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
    }

    #[test]
    fn params_reject_zero_chunks() {
        let err = PreloadParams::from_json(json!({ "chunks": [2048, 0] })).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
        let err = PreloadParams::from_json(json!({ "chunks": [] })).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
    }

    #[test]
    fn raster_target_becomes_zarr() {
        let params = PreloadParams::from_json(json!({ "target_format": "geotiff" })).unwrap();
        assert_eq!(params.target_format, Some(DataFormat::Zarr));
        let err = PreloadParams::from_json(json!({ "target_format": "shapefile" })).unwrap_err();
        assert_matches!(err, PreloadError::InvalidParameter(_));
    }
}
