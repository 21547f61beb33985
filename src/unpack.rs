use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use camino::Utf8Path;
use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::ProgressBudget;
use crate::domain::ContainerFormat;
use crate::error::PreloadError;
use crate::progress::{ItemProgress, PreloadStatus};

/// Extracts `archive` into `target_dir` and deletes the archive afterwards.
///
/// On failure the partially extracted tree is removed and the archive is
/// left in place for the close path to clean up.
pub fn unpack_archive(
    archive: &Utf8Path,
    format: ContainerFormat,
    target_dir: &Utf8Path,
    budget: &ProgressBudget,
    item: &ItemProgress,
) -> Result<(), PreloadError> {
    item.update(
        PreloadStatus::Decompressing,
        Some(budget.download()),
        "Decompression started.",
    );
    info!(%archive, %format, %target_dir, "extracting archive");

    fs::create_dir_all(target_dir.as_std_path())
        .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
    let result = match format {
        ContainerFormat::Zip => extract_zip(archive.as_std_path(), target_dir.as_std_path()),
        ContainerFormat::Tar => extract_tar(archive.as_std_path(), target_dir.as_std_path(), false),
        ContainerFormat::TarGz => {
            extract_tar(archive.as_std_path(), target_dir.as_std_path(), true)
        }
        ContainerFormat::Rar => extract_rar(archive.as_std_path(), target_dir.as_std_path()),
    };
    if let Err(err) = result {
        if let Err(cleanup) = fs::remove_dir_all(target_dir.as_std_path()) {
            warn!(%target_dir, error = %cleanup, "failed to remove partial extraction");
        }
        return Err(err);
    }

    fs::remove_file(archive.as_std_path())
        .map_err(|err| PreloadError::Filesystem(format!("remove {archive}: {err}")))?;
    item.update(
        PreloadStatus::Decompressing,
        Some(budget.unpacked()),
        "Decompression finished.",
    );
    debug!(%archive, "archive extracted and removed");
    Ok(())
}

fn extraction_error(archive: &Path, reason: impl ToString) -> PreloadError {
    PreloadError::Extraction {
        archive: archive.display().to_string(),
        reason: reason.to_string(),
    }
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), PreloadError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| extraction_error(zip_path, format!("open zip: {err}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| extraction_error(zip_path, err))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| extraction_error(zip_path, err))?;
        if entry.is_symlink() {
            return Err(extraction_error(
                zip_path,
                format!("symlink entry rejected: {}", entry.name()),
            ));
        }
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(extraction_error(
                    zip_path,
                    "zip entry path traversal detected",
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| extraction_error(zip_path, err))?;
    }
    Ok(())
}

/// Extracts a (optionally gzip compressed) tarball. Only regular files and
/// directories with relative, non-escaping paths are accepted.
pub fn extract_tar(tar_path: &Path, target_dir: &Path, gzip: bool) -> Result<(), PreloadError> {
    let file = fs::File::open(tar_path)
        .map_err(|err| extraction_error(tar_path, format!("open tar: {err}")))?;
    if gzip {
        unpack_tar_entries(tar::Archive::new(GzDecoder::new(file)), tar_path, target_dir)
    } else {
        unpack_tar_entries(tar::Archive::new(file), tar_path, target_dir)
    }
}

fn unpack_tar_entries<R: io::Read>(
    mut archive: tar::Archive<R>,
    tar_path: &Path,
    target_dir: &Path,
) -> Result<(), PreloadError> {
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    for entry in archive
        .entries()
        .map_err(|err| extraction_error(tar_path, err))?
    {
        let mut entry = entry.map_err(|err| extraction_error(tar_path, err))?;
        let path = entry
            .path()
            .map_err(|err| extraction_error(tar_path, err))?
            .into_owned();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            EntryType::XGlobalHeader | EntryType::XHeader => {
                debug!(entry = %path.display(), "skipping pax metadata entry");
                continue;
            }
            other => {
                return Err(extraction_error(
                    tar_path,
                    format!("entry type {other:?} rejected: {}", path.display()),
                ));
            }
        }
        if !is_safe_relative(&path) {
            return Err(extraction_error(
                tar_path,
                format!("tar entry path traversal detected: {}", path.display()),
            ));
        }

        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| extraction_error(tar_path, err))?;
        if !unpacked {
            return Err(extraction_error(
                tar_path,
                format!("tar entry escapes target: {}", path.display()),
            ));
        }
    }
    Ok(())
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// RAR archives cannot be read lazily, so every entry is extracted up front.
pub fn extract_rar(rar_path: &Path, target_dir: &Path) -> Result<(), PreloadError> {
    let mut at_header = unrar::Archive::new(rar_path)
        .open_for_processing()
        .map_err(|err| extraction_error(rar_path, err))?;

    let mut extracted = 0usize;
    loop {
        let at_file = match at_header.read_header() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => return Err(extraction_error(rar_path, err)),
        };

        let header = at_file.entry();
        if is_link_attr(header.file_attr) {
            return Err(extraction_error(
                rar_path,
                format!("rar entry is a link: {}", header.filename.display()),
            ));
        }
        let sanitized = Path::new(&header.filename)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<PathBuf>();

        if sanitized.as_os_str().is_empty() || header.is_directory() {
            at_header = at_file
                .skip()
                .map_err(|err| extraction_error(rar_path, err))?;
            continue;
        }

        let file_path = target_dir.join(&sanitized);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        at_header = at_file
            .extract_to(&file_path)
            .map_err(|err| extraction_error(rar_path, err))?;
        extracted += 1;
    }

    debug!(archive = %rar_path.display(), extracted, "RAR extraction finished");
    Ok(())
}

/// RAR stores the unix mode for archives made on unix and the Windows
/// attribute bits otherwise.
fn is_link_attr(attr: u32) -> bool {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;
    match attr & S_IFMT {
        0 => attr & FILE_ATTRIBUTE_REPARSE_POINT != 0,
        kind => kind == S_IFLNK,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn utf8(path: PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn zip_extraction_removes_archive() {
        let temp = tempfile::tempdir().unwrap();
        let archive = utf8(temp.path().join("data.zip"));
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
        writer
            .start_file("inner/cube.nc", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"netcdf").unwrap();
        writer.finish().unwrap();

        let target = utf8(temp.path().join("data"));
        let item = ItemProgress::new("1/data.zip");
        unpack_archive(
            &archive,
            ContainerFormat::Zip,
            &target,
            &ProgressBudget::default(),
            &item,
        )
        .unwrap();

        assert!(!archive.as_std_path().exists());
        assert_eq!(
            fs::read(target.join("inner/cube.nc")).unwrap(),
            b"netcdf".to_vec()
        );
        assert_eq!(item.snapshot().progress, Some(0.5));
    }

    #[test]
    fn gzip_tar_extraction() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("data.tar.gz");
        let encoder = flate2::write::GzEncoder::new(
            fs::File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        let payload = b"tiff bytes";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "tiles/a.tif", &payload[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let target = temp.path().join("data");
        fs::create_dir_all(&target).unwrap();
        extract_tar(&archive, &target, true).unwrap();
        assert_eq!(fs::read(target.join("tiles/a.tif")).unwrap(), payload.to_vec());
    }

    #[test]
    fn pax_global_header_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("repo.tar");
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let comment = b"18 comment=abcdef\n";
        let mut global = tar::Header::new_ustar();
        global.set_entry_type(EntryType::XGlobalHeader);
        global.set_size(comment.len() as u64);
        global.set_mode(0o644);
        global.set_cksum();
        builder
            .append_data(&mut global, "pax_global_header", &comment[..])
            .unwrap();
        let payload = b"netcdf";
        let mut header = tar::Header::new_ustar();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "repo/cube.nc", &payload[..])
            .unwrap();
        builder.finish().unwrap();

        let target = temp.path().join("repo");
        fs::create_dir_all(&target).unwrap();
        extract_tar(&archive, &target, false).unwrap();
        assert_eq!(fs::read(target.join("repo/cube.nc")).unwrap(), payload.to_vec());
        assert!(!target.join("pax_global_header").exists());
    }

    #[test]
    fn tar_symlink_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("links.tar");
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "passwd", "/etc/passwd")
            .unwrap();
        builder.finish().unwrap();

        let target = temp.path().join("links");
        fs::create_dir_all(&target).unwrap();
        let err = extract_tar(&archive, &target, false).unwrap_err();
        assert_matches!(err, PreloadError::Extraction { .. });
        assert!(!target.join("passwd").exists());
    }

    #[test]
    fn tar_traversal_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("evil.tar");
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let payload = b"owned";
        let mut header = tar::Header::new_old();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(payload.len() as u64);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &payload[..]).unwrap();
        builder.finish().unwrap();

        let target = temp.path().join("evil");
        fs::create_dir_all(&target).unwrap();
        let err = extract_tar(&archive, &target, false).unwrap_err();
        assert_matches!(err, PreloadError::Extraction { .. });
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn corrupt_archive_fails_and_keeps_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let archive = utf8(temp.path().join("broken.zip"));
        fs::write(&archive, b"definitely not a zip").unwrap();
        let target = utf8(temp.path().join("broken"));

        let err = unpack_archive(
            &archive,
            ContainerFormat::Zip,
            &target,
            &ProgressBudget::default(),
            &ItemProgress::new("1/broken.zip"),
        )
        .unwrap_err();

        assert_matches!(err, PreloadError::Extraction { .. });
        assert!(!target.as_std_path().exists());
    }

    #[test]
    fn corrupt_rar_is_an_extraction_error() {
        let temp = tempfile::tempdir().unwrap();
        let archive = utf8(temp.path().join("broken.rar"));
        fs::write(&archive, b"Rar! but not really").unwrap();
        let target = utf8(temp.path().join("broken"));

        let err = unpack_archive(
            &archive,
            ContainerFormat::Rar,
            &target,
            &ProgressBudget::default(),
            &ItemProgress::new("1/broken.rar"),
        )
        .unwrap_err();

        assert_matches!(err, PreloadError::Extraction { .. });
        assert!(!target.as_std_path().exists());
    }

    #[test]
    fn rar_link_attributes() {
        assert!(is_link_attr(0o120777));
        assert!(!is_link_attr(0o100644));
        assert!(!is_link_attr(0o040755));
        assert!(is_link_attr(0x400 | 0x20));
        assert!(!is_link_attr(0x20));
    }
}
