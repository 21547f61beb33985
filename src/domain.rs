use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PreloadError;

/// Formats a dataset can be opened from or written to without unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Zarr,
    Levels,
    #[value(name = "netcdf")]
    NetCdf,
    #[value(name = "geotiff")]
    GeoTiff,
    Shapefile,
    #[value(name = "geojson")]
    GeoJson,
}

impl DataFormat {
    /// Canonical suffix used when a dataset is written in this format.
    pub fn suffix(self) -> &'static str {
        match self {
            DataFormat::Zarr => "zarr",
            DataFormat::Levels => "levels",
            DataFormat::NetCdf => "nc",
            DataFormat::GeoTiff => "tif",
            DataFormat::Shapefile => "shp",
            DataFormat::GeoJson => "geojson",
        }
    }

    pub fn is_raster(self) -> bool {
        matches!(self, DataFormat::GeoTiff)
    }

    /// Formats stored as a directory tree rather than a single file.
    pub fn is_directory(self) -> bool {
        matches!(self, DataFormat::Zarr | DataFormat::Levels)
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Zarr => write!(f, "zarr"),
            DataFormat::Levels => write!(f, "levels"),
            DataFormat::NetCdf => write!(f, "netcdf"),
            DataFormat::GeoTiff => write!(f, "geotiff"),
            DataFormat::Shapefile => write!(f, "shapefile"),
            DataFormat::GeoJson => write!(f, "geojson"),
        }
    }
}

impl FromStr for DataFormat {
    type Err = PreloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "zarr" => Ok(DataFormat::Zarr),
            "levels" => Ok(DataFormat::Levels),
            "netcdf" | "nc" => Ok(DataFormat::NetCdf),
            "geotiff" | "tif" | "tiff" => Ok(DataFormat::GeoTiff),
            "shapefile" | "shp" => Ok(DataFormat::Shapefile),
            "geojson" => Ok(DataFormat::GeoJson),
            _ => Err(PreloadError::UnsupportedFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Zip,
    Tar,
    #[serde(rename = "tar.gz")]
    TarGz,
    Rar,
}

impl ContainerFormat {
    pub fn suffix(self) -> &'static str {
        match self {
            ContainerFormat::Zip => "zip",
            ContainerFormat::Tar => "tar",
            ContainerFormat::TarGz => "tar.gz",
            ContainerFormat::Rar => "rar",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Data(DataFormat),
    Container(ContainerFormat),
}

/// Resolves the format of a file name or data id from its suffix.
///
/// Multi-part suffixes (`.tar.gz`, `.tgz`) are checked before the last
/// extension so that gzip tarballs are not mistaken for anything else.
pub fn identify_format(name: &str) -> Option<FileFormat> {
    let lowered = name.trim_end_matches('/').to_lowercase();
    if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
        return Some(FileFormat::Container(ContainerFormat::TarGz));
    }
    let (_, ext) = lowered.rsplit_once('.')?;
    let format = match ext {
        "zarr" => FileFormat::Data(DataFormat::Zarr),
        "levels" => FileFormat::Data(DataFormat::Levels),
        "nc" => FileFormat::Data(DataFormat::NetCdf),
        "tif" | "tiff" | "geotiff" => FileFormat::Data(DataFormat::GeoTiff),
        "shp" => FileFormat::Data(DataFormat::Shapefile),
        "geojson" => FileFormat::Data(DataFormat::GeoJson),
        "zip" => FileFormat::Container(ContainerFormat::Zip),
        "tar" => FileFormat::Container(ContainerFormat::Tar),
        "rar" => FileFormat::Container(ContainerFormat::Rar),
        _ => return None,
    };
    Some(format)
}

pub fn identify_data_format(name: &str) -> Option<DataFormat> {
    match identify_format(name)? {
        FileFormat::Data(format) => Some(format),
        FileFormat::Container(_) => None,
    }
}

pub fn identify_container_format(name: &str) -> Option<ContainerFormat> {
    match identify_format(name)? {
        FileFormat::Container(format) => Some(format),
        FileFormat::Data(_) => None,
    }
}

/// True when the data id names a container that has to be preloaded
/// before its content can be opened.
pub fn is_archive(data_id: &str) -> bool {
    identify_container_format(data_id).is_some()
}

/// Splits a file name into stem and suffix, treating `.tar.gz` as one suffix.
pub fn split_suffix(name: &str) -> (&str, Option<&str>) {
    const TAR_GZ: &str = ".tar.gz";
    if name.len() > TAR_GZ.len() {
        let cut = name.len() - TAR_GZ.len();
        if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(TAR_GZ) {
            return (&name[..cut], Some(&name[cut + 1..]));
        }
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// A `{record}/{filename}` data id pointing at a file in a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveIdentifier {
    raw: String,
    split: usize,
}

impl ArchiveIdentifier {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn record(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn filename(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn format(&self) -> Option<FileFormat> {
        identify_format(self.filename())
    }

    pub fn container(&self) -> Option<ContainerFormat> {
        identify_container_format(self.filename())
    }

    pub fn is_archive(&self) -> bool {
        self.container().is_some()
    }

    /// File name without its container suffix (`andorra.zip` -> `andorra`).
    pub fn stem(&self) -> &str {
        split_suffix(self.filename()).0
    }

    /// `{record}/{stem}`, the prefix every cache entry of this archive shares.
    pub fn stem_id(&self) -> String {
        format!("{}/{}", self.record(), self.stem())
    }

    /// Whether `cache_id` was materialized from this archive: either the
    /// stem with one suffix, or any id nested below `{record}/{stem}/`.
    pub fn owns(&self, cache_id: &str) -> bool {
        let stem_id = self.stem_id();
        if cache_id == stem_id {
            return true;
        }
        if let Some(rest) = cache_id.strip_prefix(stem_id.as_str()) {
            if let Some(nested) = rest.strip_prefix('/') {
                return !nested.is_empty();
            }
            if let Some(ext) = rest.strip_prefix('.') {
                return !ext.is_empty() && !ext.contains('.') && !ext.contains('/');
            }
        }
        false
    }
}

impl fmt::Display for ArchiveIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ArchiveIdentifier {
    type Err = PreloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_matches('/');
        let split = normalized
            .find('/')
            .ok_or_else(|| PreloadError::InvalidIdentifier(value.to_string()))?;
        let (record, filename) = (&normalized[..split], &normalized[split + 1..]);
        if filename.is_empty() || !is_plain_segment(record) {
            return Err(PreloadError::InvalidIdentifier(value.to_string()));
        }
        if !filename.split('/').all(is_plain_segment) {
            return Err(PreloadError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self {
            raw: normalized.to_string(),
            split,
        })
    }
}

/// A single path component that stays where it is joined.
fn is_plain_segment(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\'])
}

impl TryFrom<String> for ArchiveIdentifier {
    type Error = PreloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArchiveIdentifier> for String {
    fn from(value: ArchiveIdentifier) -> Self {
        value.raw
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn identify_container_formats() {
        assert_eq!(identify_container_format("1234567/test.tif"), None);
        assert_eq!(
            identify_container_format("1234567/test.zip"),
            Some(ContainerFormat::Zip)
        );
        assert_eq!(
            identify_container_format("1234567/test.tar"),
            Some(ContainerFormat::Tar)
        );
        assert_eq!(
            identify_container_format("1234567/test.tar.gz"),
            Some(ContainerFormat::TarGz)
        );
        assert_eq!(
            identify_container_format("1234567/TEST.RAR"),
            Some(ContainerFormat::Rar)
        );
    }

    #[test]
    fn archive_detection() {
        assert!(is_archive("1234567/test.zip"));
        assert!(is_archive("1234567/test.tgz"));
        assert!(!is_archive("1234567/test.zarr"));
        assert!(!is_archive("1234567/README"));
    }

    #[test]
    fn identifier_parts() {
        let id: ArchiveIdentifier = "13333034/andorra.tar.gz".parse().unwrap();
        assert_eq!(id.record(), "13333034");
        assert_eq!(id.filename(), "andorra.tar.gz");
        assert_eq!(id.stem(), "andorra");
        assert_eq!(id.stem_id(), "13333034/andorra");
        assert_eq!(id.container(), Some(ContainerFormat::TarGz));
    }

    #[test]
    fn identifier_rejects_missing_record() {
        let err = "andorra.zip".parse::<ArchiveIdentifier>().unwrap_err();
        assert_matches!(err, PreloadError::InvalidIdentifier(_));
        let err = "1234/../x.zip".parse::<ArchiveIdentifier>().unwrap_err();
        assert_matches!(err, PreloadError::InvalidIdentifier(_));
        for escaping in ["../evil.zip", "./evil.zip", "..\\x/evil.zip", "1/a\\..\\b.zip"] {
            let err = escaping.parse::<ArchiveIdentifier>().unwrap_err();
            assert_matches!(err, PreloadError::InvalidIdentifier(_));
        }
    }

    #[test]
    fn ownership_of_cache_ids() {
        let id: ArchiveIdentifier = "13333034/andorra.zip".parse().unwrap();
        assert!(id.owns("13333034/andorra.zarr"));
        assert!(id.owns("13333034/andorra/tile_1.zarr"));
        assert!(!id.owns("13333034/andorra.v2.zarr"));
        assert!(!id.owns("13333034/andorra_extra.zarr"));
        assert!(!id.owns("9999/andorra.zarr"));
    }
}
