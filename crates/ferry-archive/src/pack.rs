use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tempfile::TempPath;
use time::OffsetDateTime;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

#[derive(Clone, Debug)]
pub struct PackOptions {
    /// Added to each file's mtime before truncating to the two-second zip resolution, so the
    /// stored time never precedes the real one on filesystems with coarser timestamps.
    pub timestamp_round_up: Duration,
    /// Directory the temporary archive is created in (system temp dir when `None`).
    pub temp_dir: Option<PathBuf>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            timestamp_round_up: Duration::from_millis(1999),
            temp_dir: None,
        }
    }
}

/// A temporary archive produced by [`pack_directory`].
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct PackedArchive {
    path: TempPath,
    entry_count: usize,
}

impl PackedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

/// Count files under `dir`, recursively, including symlinks to files.
pub fn count_files(dir: &Path) -> anyhow::Result<usize> {
    let mut count = 0;
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if file_metadata(&entry).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Metadata of the file `entry` names, following a symlink to a file. Directory symlinks
/// are not descended into, and dangling links are skipped.
fn file_metadata(entry: &walkdir::DirEntry) -> Option<std::fs::Metadata> {
    let file_type = entry.file_type();
    if file_type.is_file() {
        return entry.metadata().ok();
    }
    if !file_type.is_symlink() {
        return None;
    }
    match std::fs::metadata(entry.path()) {
        Ok(meta) if meta.is_file() => Some(meta),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(
                target: "ferry.archive",
                path = %entry.path().display(),
                error = %err,
                "skipping dangling symlink"
            );
            None
        }
    }
}

/// Pack every file under `dir` into a new temporary zip archive.
///
/// Symlinks to files are packed as the file they point to. Entries are named by their path relative to `dir` with `/` separators and are written in
/// sorted order. If packing fails the partial archive is removed.
pub fn pack_directory(dir: &Path, options: &PackOptions) -> anyhow::Result<PackedArchive> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("ferry-pack-").suffix(".jar");
    let tmp = match &options.temp_dir {
        Some(temp_dir) => builder.tempfile_in(temp_dir),
        None => builder.tempfile(),
    }
    .context("failed to create temporary archive")?;

    let mut writer = ZipWriter::new(tmp);
    let mut entry_count = 0usize;

    for entry in walkdir::WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        let Some(meta) = file_metadata(&entry) else {
            continue;
        };

        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} is not under {}", entry.path().display(), dir.display()))?;
        let name = entry_name(rel);
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);

        let file_options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_timestamp(modified, options.timestamp_round_up))
            .unix_permissions(0o644);
        writer
            .start_file(name.as_str(), file_options)
            .with_context(|| format!("failed to add {name}"))?;
        let mut source = File::open(entry.path())
            .with_context(|| format!("failed to open {}", entry.path().display()))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("failed to pack {}", entry.path().display()))?;
        entry_count += 1;
    }

    let tmp = writer.finish().context("failed to finish archive")?;
    tmp.as_file()
        .sync_all()
        .context("failed to sync archive")?;

    tracing::debug!(
        target: "ferry.archive",
        dir = %dir.display(),
        archive = %tmp.path().display(),
        entries = entry_count,
        "packed directory"
    );

    Ok(PackedArchive {
        path: tmp.into_temp_path(),
        entry_count,
    })
}

pub(crate) fn entry_name(rel: &Path) -> String {
    let mut name = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(&part.to_string_lossy());
        }
    }
    name
}

/// Convert a modification time into a zip timestamp, rounding up by `round_up` and then
/// truncating to an even second. Times before 1980 clamp to the zip epoch.
pub fn zip_timestamp(modified: SystemTime, round_up: Duration) -> DateTime {
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    let rounded = since_epoch.saturating_add(round_up);
    let mut secs = rounded.as_secs();
    secs -= secs % 2;

    let Ok(secs) = i64::try_from(secs) else {
        return DateTime::default();
    };
    let Ok(utc) = OffsetDateTime::from_unix_timestamp(secs) else {
        return DateTime::default();
    };
    let Ok(year) = u16::try_from(utc.year()) else {
        return DateTime::default();
    };
    DateTime::from_date_and_time(
        year,
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
    )
    .unwrap_or_default()
}
