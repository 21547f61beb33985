use std::fs::{self, File};
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::config::ProgressBudget;
use crate::error::PreloadError;
use crate::progress::{CancelToken, ItemProgress, PreloadStatus};
use crate::transport::Transport;

pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Streams `uri` into `destination`, reporting download progress after
/// every chunk. A partially written file is removed on any error.
pub fn fetch_archive(
    transport: &dyn Transport,
    uri: &str,
    destination: &Utf8Path,
    budget: &ProgressBudget,
    item: &ItemProgress,
    cancel: &CancelToken,
) -> Result<u64, PreloadError> {
    item.update(
        PreloadStatus::Downloading,
        Some(0.0),
        "Download started.",
    );
    info!(%uri, %destination, "downloading archive");

    let result = stream_to_file(transport, uri, destination, budget, item, cancel);
    if result.is_err() && destination.as_std_path().exists() {
        if let Err(err) = fs::remove_file(destination.as_std_path()) {
            warn!(%destination, error = %err, "failed to remove partial download");
        }
    }
    let written = result?;

    item.update(
        PreloadStatus::Downloading,
        Some(budget.download()),
        "Download finished.",
    );
    debug!(%destination, bytes = written, "download finished");
    Ok(written)
}

fn stream_to_file(
    transport: &dyn Transport,
    uri: &str,
    destination: &Utf8Path,
    budget: &ProgressBudget,
    item: &ItemProgress,
    cancel: &CancelToken,
) -> Result<u64, PreloadError> {
    let mut body = transport.get(uri)?;
    let total = body.content_length.filter(|size| *size > 0);

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
    }
    let mut file = File::create(destination.as_std_path())
        .map_err(|err| PreloadError::Filesystem(format!("create {destination}: {err}")))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(PreloadError::Cancelled);
        }
        let filled = read_chunk(&mut body.reader, &mut buffer)?;
        if filled == 0 {
            break;
        }
        file.write_all(&buffer[..filled])
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        written += filled as u64;
        let progress = total.map(|total| budget.download_progress(written, total));
        item.update(PreloadStatus::Downloading, progress, "Downloading.");
    }
    file.flush()
        .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
    Ok(written)
}

/// Fills `buffer` as far as the body allows so that progress is reported
/// per full chunk rather than per socket read.
fn read_chunk(reader: &mut dyn Read, buffer: &mut [u8]) -> Result<usize, PreloadError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(PreloadError::Transport(err.to_string())),
        }
    }
    Ok(filled)
}

/// Scratch location of a downloaded archive: `{scratch}/{record}/{filename}`.
pub fn scratch_archive_path(scratch_root: &Utf8Path, record: &str, filename: &str) -> Utf8PathBuf {
    scratch_root.join(record).join(filename)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;

    use super::*;
    use crate::progress::{PreloadObserver, PreloadState};
    use crate::transport::RemoteBody;

    struct StaticTransport {
        payload: Vec<u8>,
        content_length: Option<u64>,
    }

    impl Transport for StaticTransport {
        fn get(&self, _uri: &str) -> Result<RemoteBody, PreloadError> {
            Ok(RemoteBody {
                content_length: self.content_length,
                reader: Box::new(Cursor::new(self.payload.clone())),
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PreloadState>>);

    impl PreloadObserver for Recorder {
        fn notify(&self, state: &PreloadState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    fn temp_target() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("1234/data.zip")).unwrap();
        (temp, path)
    }

    #[test]
    fn download_reports_chunked_progress() {
        let (_temp, destination) = temp_target();
        let payload = vec![7u8; CHUNK_SIZE * 2 + 10];
        let transport = StaticTransport {
            content_length: Some(payload.len() as u64),
            payload,
        };
        let item = ItemProgress::new("1234/data.zip");
        let recorder = Arc::new(Recorder::default());
        item.subscribe(recorder.clone());

        let written = fetch_archive(
            &transport,
            "mem://1234/data.zip",
            &destination,
            &ProgressBudget::default(),
            &item,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(written, (CHUNK_SIZE * 2 + 10) as u64);
        assert_eq!(fs::metadata(&destination).unwrap().len(), written);
        let seen = recorder.0.lock().unwrap();
        let progress: Vec<f64> = seen.iter().filter_map(|state| state.progress).collect();
        assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(progress.last().copied(), Some(0.4));
        // start, three chunks, finish
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn missing_content_length_is_indeterminate() {
        let (_temp, destination) = temp_target();
        let transport = StaticTransport {
            payload: vec![1u8; 32],
            content_length: None,
        };
        let item = ItemProgress::new("1234/data.zip");
        let recorder = Arc::new(Recorder::default());
        item.subscribe(recorder.clone());

        fetch_archive(
            &transport,
            "mem://x",
            &destination,
            &ProgressBudget::default(),
            &item,
            &CancelToken::new(),
        )
        .unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen[1].progress, None);
    }

    #[test]
    fn cancelled_download_leaves_no_file() {
        let (_temp, destination) = temp_target();
        let transport = StaticTransport {
            payload: vec![1u8; 64],
            content_length: Some(64),
        };
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = fetch_archive(
            &transport,
            "mem://x",
            &destination,
            &ProgressBudget::default(),
            &ItemProgress::new("1234/data.zip"),
            &cancel,
        )
        .unwrap_err();

        assert_matches!(err, PreloadError::Cancelled);
        assert!(!destination.as_std_path().exists());
    }
}
