//! Safe extraction of uploaded project archives.
//!
//! Uploads are untrusted. Every entry is resolved against the workspace lexically and
//! dropped if it would land outside it; links are never materialized. A bad entry is
//! skipped with a warning while the rest of the archive is still extracted. Only an
//! archive that cannot be opened at all fails the extraction.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::{PipelineError, PipelineResult};

/// Container formats accepted for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from the leading magic bytes.
    pub fn detect(bytes: &[u8]) -> PipelineResult<Self> {
        match bytes {
            [b'P', b'K', 3, 4, ..] | [b'P', b'K', 5, 6, ..] => Ok(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
            _ => Err(PipelineError::ArchiveCorrupt(
                "unrecognized archive format (expected zip or tar.gz)".into(),
            )),
        }
    }
}

/// Outcome of an extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    /// Root folder removed from every entry, e.g. `proj/`.
    pub stripped_root: Option<String>,
    pub files_written: usize,
    pub dirs_created: usize,
    /// Original names of entries that were not extracted.
    pub skipped: Vec<String>,
}

/// Bounds on how much an upload may expand to on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    /// Larger entries are skipped.
    pub max_entry_bytes: u64,
    /// Exceeding this fails the whole extraction.
    pub max_total_bytes: u64,
}

pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 256 * 1024 * 1024;

impl Default for ExtractLimits {
    fn default() -> Self {
        ExtractLimits::with_total(DEFAULT_MAX_EXTRACTED_BYTES)
    }
}

impl ExtractLimits {
    pub fn with_total(max_total_bytes: u64) -> Self {
        ExtractLimits {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES.min(max_total_bytes),
            max_total_bytes,
        }
    }
}

enum EntryKind<'r> {
    Dir,
    File(&'r mut dyn Read),
    Link,
    Unreadable(String),
}

enum Written {
    File,
    Dir,
    Nothing,
}

/// Extract `bytes` into `workspace` under the default limits, creating it if needed.
pub fn extract(bytes: &[u8], workspace: &Path) -> PipelineResult<ExtractReport> {
    extract_with_limits(bytes, workspace, ExtractLimits::default())
}

/// Extract `bytes` into `workspace`, streaming each entry to disk.
///
/// The common root is decided from entry names first, so no entry content is held in memory.
pub fn extract_with_limits(
    bytes: &[u8],
    workspace: &Path,
    limits: ExtractLimits,
) -> PipelineResult<ExtractReport> {
    let format = ArchiveFormat::detect(bytes)?;
    std::fs::create_dir_all(workspace)?;

    let mut sink = match format {
        ArchiveFormat::Zip => {
            let mut archive = ZipArchive::new(Cursor::new(bytes))
                .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;
            let mut sink = Sink::new(workspace, limits, zip_file_names(&mut archive));
            write_zip(&mut archive, &mut sink)?;
            sink
        }
        ArchiveFormat::TarGz => {
            let names = tar_file_names(bytes, limits)?;
            let mut sink = Sink::new(workspace, limits, names);
            write_tar_gz(bytes, &mut sink)?;
            sink
        }
    };

    let report = std::mem::take(&mut sink.report);
    debug!(
        files = report.files_written,
        dirs = report.dirs_created,
        skipped = report.skipped.len(),
        bytes = sink.total_bytes,
        "archive extracted"
    );
    Ok(report)
}

/// Writes entries below the workspace root while tracking the size budget.
struct Sink {
    root: PathBuf,
    prefix: Option<String>,
    limits: ExtractLimits,
    total_bytes: u64,
    exhausted: bool,
    report: ExtractReport,
}

impl Sink {
    fn new(workspace: &Path, limits: ExtractLimits, file_names: Vec<String>) -> Self {
        let prefix = common_root(file_names.iter().map(String::as_str));
        if let Some(p) = &prefix {
            info!(prefix = %p, "removing common root prefix");
        }
        Sink {
            root: normalize_lexically(workspace),
            prefix: prefix.clone(),
            limits,
            total_bytes: 0,
            exhausted: false,
            report: ExtractReport {
                stripped_root: prefix,
                ..Default::default()
            },
        }
    }

    /// Place one entry. Only running out of the total budget is fatal.
    fn place(&mut self, name: &str, kind: EntryKind<'_>) -> PipelineResult<()> {
        match self.write_entry(name, kind) {
            Ok(Written::File) => self.report.files_written += 1,
            Ok(Written::Dir) => self.report.dirs_created += 1,
            Ok(Written::Nothing) => {}
            Err(e) if self.exhausted => return Err(e),
            Err(e) => {
                warn!(entry = %name, "failed to extract entry: {e}");
                self.report.skipped.push(name.to_string());
            }
        }
        Ok(())
    }

    fn write_entry(&mut self, name: &str, kind: EntryKind<'_>) -> PipelineResult<Written> {
        let stripped = match &self.prefix {
            Some(p) => name.strip_prefix(p.as_str()).unwrap_or(name),
            None => name,
        };
        let stripped = stripped.trim_end_matches('/');
        if stripped.is_empty() {
            return Ok(Written::Nothing);
        }

        let target = resolve_within(&self.root, stripped).ok_or_else(|| {
            PipelineError::UnsafeArchiveEntry {
                entry: name.to_string(),
            }
        })?;

        match kind {
            EntryKind::Dir => {
                std::fs::create_dir_all(&target)?;
                Ok(Written::Dir)
            }
            EntryKind::File(reader) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.write_file(&target, reader)?;
                Ok(Written::File)
            }
            EntryKind::Link => Err(PipelineError::UnsafeArchiveEntry {
                entry: name.to_string(),
            }),
            EntryKind::Unreadable(reason) => Err(PipelineError::ArchiveCorrupt(reason)),
        }
    }

    fn write_file(&mut self, target: &Path, reader: &mut dyn Read) -> PipelineResult<()> {
        let remaining = self.limits.max_total_bytes.saturating_sub(self.total_bytes);
        let allowance = self.limits.max_entry_bytes.min(remaining);

        let mut file = File::create(target)?;
        let copied = match io::copy(&mut reader.take(allowance.saturating_add(1)), &mut file) {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(target);
                return Err(e.into());
            }
        };
        if copied <= allowance {
            self.total_bytes += copied;
            return Ok(());
        }

        drop(file);
        let _ = std::fs::remove_file(target);
        if allowance < self.limits.max_entry_bytes {
            self.exhausted = true;
            return Err(PipelineError::ArchiveCorrupt(format!(
                "archive expands beyond {} bytes",
                self.limits.max_total_bytes
            )));
        }
        Err(PipelineError::ArchiveCorrupt(format!(
            "entry expands beyond {} bytes",
            self.limits.max_entry_bytes
        )))
    }
}

/// The single top-level folder shared by every file entry, with its trailing slash.
///
/// Only considered when the first file entry is nested; a lone top-level file, an empty
/// archive, or any file outside the candidate folder disables stripping.
pub fn common_root<'a>(mut file_names: impl Iterator<Item = &'a str>) -> Option<String> {
    let first = file_names.next()?;
    let (segment, rest) = first.split_once('/')?;
    if rest.is_empty() || segment.is_empty() || segment == "." || segment == ".." {
        return None;
    }
    let candidate = format!("{segment}/");
    if file_names.all(|name| name.starts_with(&candidate)) {
        Some(candidate)
    } else {
        None
    }
}

/// Join `relative` onto `root` and return it only if the result stays strictly inside `root`.
pub fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let joined = normalize_lexically(&root.join(relative));
    if joined.starts_with(root) && joined != root {
        Some(joined)
    } else {
        None
    }
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

type UploadZip<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Names of every non-directory entry, read from the central directory without inflating.
fn zip_file_names(archive: &mut UploadZip<'_>) -> Vec<String> {
    (0..archive.len())
        .filter_map(|i| match archive.by_index_raw(i) {
            Ok(file) if file.is_dir() => None,
            Ok(file) => Some(file.name().to_string()),
            Err(_) => Some(format!("#{i}")),
        })
        .collect()
}

fn write_zip(archive: &mut UploadZip<'_>, sink: &mut Sink) -> PipelineResult<()> {
    for i in 0..archive.len() {
        let mut file = match archive.by_index(i) {
            Ok(f) => f,
            Err(e) => {
                sink.place(&format!("#{i}"), EntryKind::Unreadable(e.to_string()))?;
                continue;
            }
        };
        let name = file.name().to_string();
        let is_link = file
            .unix_mode()
            .map(|mode| mode & 0o170000 == 0o120000)
            .unwrap_or(false);
        if file.is_dir() {
            sink.place(&name, EntryKind::Dir)?;
        } else if is_link {
            sink.place(&name, EntryKind::Link)?;
        } else if file.size() > sink.limits.max_entry_bytes {
            let reason = format!("entry declares {} bytes", file.size());
            sink.place(&name, EntryKind::Unreadable(reason))?;
        } else {
            sink.place(&name, EntryKind::File(&mut file))?;
        }
    }
    Ok(())
}

/// First pass over a tar.gz: names of the entries that will be placed.
///
/// Tar headers carry exact sizes, so an archive over the total budget is refused here.
fn tar_file_names(bytes: &[u8], limits: ExtractLimits) -> PipelineResult<Vec<String>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let iter = archive
        .entries()
        .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;

    let mut names = Vec::new();
    let mut declared: u64 = 0;
    for (index, entry) in iter.enumerate() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if index == 0 => return Err(PipelineError::ArchiveCorrupt(e.to_string())),
            Err(_) => break,
        };
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                declared = declared.saturating_add(entry.size());
                if declared > limits.max_total_bytes {
                    return Err(PipelineError::ArchiveCorrupt(format!(
                        "archive expands beyond {} bytes",
                        limits.max_total_bytes
                    )));
                }
            }
            EntryType::Symlink | EntryType::Link => {}
            _ => continue,
        }
        names.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
    }
    Ok(names)
}

fn write_tar_gz(bytes: &[u8], sink: &mut Sink) -> PipelineResult<()> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let iter = archive
        .entries()
        .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;

    for (index, entry) in iter.enumerate() {
        // A broken header ends the stream; keep what was written so far.
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if index == 0 {
                    return Err(PipelineError::ArchiveCorrupt(e.to_string()));
                }
                warn!("truncated tar stream: {e}");
                break;
            }
        };
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        match entry.header().entry_type() {
            EntryType::Directory => sink.place(&name, EntryKind::Dir)?,
            EntryType::Regular | EntryType::Continuous => {
                sink.place(&name, EntryKind::File(&mut entry))?
            }
            EntryType::Symlink | EntryType::Link => sink.place(&name, EntryKind::Link)?,
            other => debug!(entry = %name, kind = ?other, "ignoring special tar entry"),
        }
    }
    Ok(())
}
