use std::io::{self, Write};

use serde::Serialize;

use crate::preload::{DroppedId, PreloadHandle};
use crate::progress::PreloadState;

#[derive(Debug, Clone, Serialize)]
pub struct PreloadReport {
    pub cache_root: String,
    pub finished_at: String,
    pub items: Vec<PreloadState>,
    pub dropped: Vec<DroppedId>,
}

impl PreloadReport {
    pub fn from_handle(cache_root: &str, handle: &PreloadHandle) -> Self {
        Self {
            cache_root: cache_root.to_string(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            items: handle.states(),
            dropped: handle.dropped().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListReport {
    pub cache_root: String,
    pub data_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub cleared: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_preload(report: &PreloadReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_list(report: &ListReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_clear(report: &ClearReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
