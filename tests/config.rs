use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use zenodo_preload::config::{Config, ConfigLoader, DEFAULT_ENDPOINT};
use zenodo_preload::domain::DataFormat;
use zenodo_preload::error::PreloadError;

#[test]
fn resolve_config_defaults() {
    let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.endpoint, DEFAULT_ENDPOINT);
    assert!(resolved.cache_dir.is_none());
    assert!(resolved.data_ids.is_empty());
    assert!(resolved.params.blocking);
    assert!(resolved.params.silent);
}

#[test]
fn resolve_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("zenodo-preload.json");
    let content = json!({
        "schema_version": 1,
        "endpoint": "https://sandbox.zenodo.org/",
        "cache_dir": "/var/cache/cubes",
        "data_ids": ["13333034/andorra.zip"],
        "preload": {"target_format": "netcdf", "chunks": [512, 512], "force": true}
    });
    fs::write(&path, content.to_string()).unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.endpoint, "https://sandbox.zenodo.org");
    assert_eq!(resolved.data_ids, vec!["13333034/andorra.zip".to_string()]);
    assert_eq!(resolved.params.target_format, Some(DataFormat::NetCdf));
    assert_eq!(resolved.params.chunks, Some(vec![512, 512]));
    assert!(resolved.params.force);
}

#[test]
fn explicit_config_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let result = ConfigLoader::resolve(path.to_str());
    assert_matches!(result, Err(PreloadError::ConfigRead(_)));
}

#[test]
fn unknown_preload_option_is_rejected() {
    let config = Config {
        preload: Some(json!({"blocking": true, "retries": 3})),
        ..Config::default()
    };
    let result = ConfigLoader::resolve_config(config);
    assert_matches!(result, Err(PreloadError::InvalidParameter(_)));
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("zenodo-preload.json");
    fs::write(&path, "{not json").unwrap();
    let result = ConfigLoader::resolve(path.to_str());
    assert_matches!(result, Err(PreloadError::ConfigParse(_)));
}
