use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::DataFormat;
use crate::error::PreloadError;

/// Variable attributes that point at a grid mapping variable. They dangle
/// once a dataset has been rechunked and rewritten, so they are dropped.
pub const GRID_MAPPING_ATTRS: &[&str] = &["grid_mapping", "crs_wkt_ref"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: usize,
    #[serde(default)]
    pub chunk: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

/// Handle on an opened dataset: its layout plus the location its values are
/// read from. Decoding and encoding the values is left to the adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub source: Utf8PathBuf,
    pub format: DataFormat,
    pub dims: Vec<Dimension>,
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl Dataset {
    /// Removes grid mapping references from every variable and returns how
    /// many attributes were dropped.
    pub fn strip_grid_mappings(&mut self) -> usize {
        let mut removed = 0;
        for variable in &mut self.variables {
            for key in GRID_MAPPING_ATTRS {
                if variable.attrs.remove(*key).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Applies one chunk size per dimension, in dimension order. Sizes are
    /// capped at the dimension length.
    pub fn rechunk(&mut self, chunks: &[usize]) -> Result<(), PreloadError> {
        if chunks.len() > self.dims.len() {
            return Err(PreloadError::Conversion {
                leaf: self.source.to_string(),
                reason: format!(
                    "{} chunk sizes given for {} dimensions",
                    chunks.len(),
                    self.dims.len()
                ),
            });
        }
        for (dim, size) in self.dims.iter_mut().zip(chunks) {
            dim.chunk = Some((*size).min(dim.size.max(1)));
        }
        Ok(())
    }
}

/// Opens and writes datasets of one format.
pub trait FormatAdapter: Send + Sync {
    fn format(&self) -> DataFormat;

    /// Cheap check whether `path` looks like something `open` can read.
    fn can_open(&self, path: &Utf8Path) -> bool;

    fn open(&self, path: &Utf8Path) -> Result<Dataset, PreloadError>;

    fn write(&self, dataset: &Dataset, destination: &Utf8Path) -> Result<(), PreloadError>;
}

/// Recognizes leaves of a format without being able to decode them. Enough
/// for preloads that copy datasets verbatim.
pub struct PassthroughAdapter {
    format: DataFormat,
}

impl PassthroughAdapter {
    pub fn new(format: DataFormat) -> Self {
        Self { format }
    }
}

impl FormatAdapter for PassthroughAdapter {
    fn format(&self) -> DataFormat {
        self.format
    }

    fn can_open(&self, path: &Utf8Path) -> bool {
        let std_path = path.as_std_path();
        if self.format.is_directory() {
            return std_path.is_dir();
        }
        std_path
            .metadata()
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    fn open(&self, path: &Utf8Path) -> Result<Dataset, PreloadError> {
        Err(PreloadError::Conversion {
            leaf: path.to_string(),
            reason: format!("no {} decoder registered", self.format),
        })
    }

    fn write(&self, dataset: &Dataset, _destination: &Utf8Path) -> Result<(), PreloadError> {
        Err(PreloadError::Conversion {
            leaf: dataset.source.to_string(),
            reason: format!("no {} encoder registered", self.format),
        })
    }
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<DataFormat, Arc<dyn FormatAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a `PassthroughAdapter` for every data format.
    pub fn passthrough() -> Self {
        let mut registry = Self::new();
        for format in [
            DataFormat::Zarr,
            DataFormat::Levels,
            DataFormat::NetCdf,
            DataFormat::GeoTiff,
            DataFormat::Shapefile,
            DataFormat::GeoJson,
        ] {
            registry.register(Arc::new(PassthroughAdapter::new(format)));
        }
        registry
    }

    /// Registers `adapter`, replacing any adapter for the same format.
    pub fn register(&mut self, adapter: Arc<dyn FormatAdapter>) -> &mut Self {
        self.adapters.insert(adapter.format(), adapter);
        self
    }

    pub fn get(&self, format: DataFormat) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.get(&format).cloned()
    }

    pub fn require(&self, format: DataFormat) -> Result<Arc<dyn FormatAdapter>, PreloadError> {
        self.get(format)
            .ok_or_else(|| PreloadError::UnsupportedFormat(format!("no adapter for {format}")))
    }

    pub fn is_openable(&self, path: &Utf8Path, format: DataFormat) -> bool {
        self.get(format)
            .map(|adapter| adapter.can_open(path))
            .unwrap_or(false)
    }
}

/// Decides whether a directory is a single dataset group rather than a
/// folder to descend into.
pub trait GroupPredicate: Send + Sync {
    fn group_format(&self, dir: &Utf8Path) -> Option<DataFormat>;
}

/// Marks a directory as a group when it contains one of the marker files.
#[derive(Debug, Clone)]
pub struct SentinelGroups {
    markers: Vec<(String, DataFormat)>,
}

impl SentinelGroups {
    pub fn new(markers: Vec<(String, DataFormat)>) -> Self {
        Self { markers }
    }
}

impl Default for SentinelGroups {
    fn default() -> Self {
        Self::new(vec![
            (".zgroup".to_string(), DataFormat::Zarr),
            ("zarr.json".to_string(), DataFormat::Zarr),
        ])
    }
}

impl GroupPredicate for SentinelGroups {
    fn group_format(&self, dir: &Utf8Path) -> Option<DataFormat> {
        if !dir.as_std_path().is_dir() {
            return None;
        }
        self.markers
            .iter()
            .find(|(marker, _)| dir.join(marker).as_std_path().is_file())
            .map(|(_, format)| *format)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    fn sample() -> Dataset {
        let mut attrs = BTreeMap::new();
        attrs.insert("grid_mapping".to_string(), json!("spatial_ref"));
        attrs.insert("units".to_string(), json!("m"));
        Dataset {
            source: Utf8PathBuf::from("/tmp/a.tif"),
            format: DataFormat::GeoTiff,
            dims: vec![
                Dimension {
                    name: "y".to_string(),
                    size: 4096,
                    chunk: None,
                },
                Dimension {
                    name: "x".to_string(),
                    size: 1000,
                    chunk: None,
                },
            ],
            variables: vec![Variable {
                name: "band_1".to_string(),
                dims: vec!["y".to_string(), "x".to_string()],
                attrs,
            }],
            attrs: BTreeMap::new(),
        }
    }

    #[test]
    fn strips_grid_mapping_references() {
        let mut dataset = sample();
        assert_eq!(dataset.strip_grid_mappings(), 1);
        assert!(dataset.variables[0].attrs.contains_key("units"));
        assert!(!dataset.variables[0].attrs.contains_key("grid_mapping"));
    }

    #[test]
    fn rechunk_caps_at_dimension_size() {
        let mut dataset = sample();
        dataset.rechunk(&[2048, 2048]).unwrap();
        assert_eq!(dataset.dims[0].chunk, Some(2048));
        assert_eq!(dataset.dims[1].chunk, Some(1000));
        assert!(dataset.rechunk(&[1, 1, 1]).is_err());
    }

    #[test]
    fn sentinel_marks_groups() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("valid_zarr")).unwrap();
        fs::write(root.join("valid_zarr/.zgroup"), b"{}").unwrap();
        fs::create_dir_all(root.join("invalid_zarr")).unwrap();
        fs::write(root.join("invalid_zarr/random_file.txt"), b"").unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();

        let groups = SentinelGroups::default();
        assert_eq!(
            groups.group_format(&root.join("valid_zarr")),
            Some(DataFormat::Zarr)
        );
        assert_eq!(groups.group_format(&root.join("invalid_zarr")), None);
        assert_eq!(groups.group_format(&root.join("empty")), None);
        assert_eq!(groups.group_format(&root.join("non_existent")), None);
    }

    #[test]
    fn passthrough_recognizes_but_cannot_decode() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("a.nc")).unwrap();
        fs::write(&path, b"CDF").unwrap();
        let registry = AdapterRegistry::passthrough();
        assert!(registry.is_openable(&path, DataFormat::NetCdf));
        assert!(!registry.is_openable(&path, DataFormat::Zarr));
        let adapter = registry.require(DataFormat::NetCdf).unwrap();
        assert!(adapter.open(&path).is_err());
    }
}
