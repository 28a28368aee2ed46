//! Where the external tools leave their files.
//!
//! Stages talk to each other only through the filesystem, so the expected layout lives
//! here, apart from the sequencing logic:
//!
//! - the project root is the directory holding `Nargo.toml`
//! - compiled circuits (`*.json`) and witnesses (`*.gz`) land in `<root>/target/`
//! - `Prover.toml` sits at `<root>`
//!
//! When several files match a suffix the first candidate under the configured
//! [`SelectionRule`] is used. The default, `ListingOrder`, follows `read_dir` order, which is
//! filesystem dependent; a warning is logged whenever there is more than one candidate.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{PipelineError, PipelineResult};

pub const MANIFEST_FILE: &str = "Nargo.toml";
pub const PROVER_CONFIG_FILE: &str = "Prover.toml";
pub const TARGET_DIR: &str = "target";

/// How to pick one file among several matching candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionRule {
    /// First entry as returned by the directory listing.
    #[default]
    ListingOrder,
    /// Smallest file name.
    Lexicographic,
    /// Most recently modified file; ties fall back to the smaller name.
    MostRecent,
}

impl std::str::FromStr for SelectionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listing-order" => Ok(SelectionRule::ListingOrder),
            "lexicographic" => Ok(SelectionRule::Lexicographic),
            "most-recent" => Ok(SelectionRule::MostRecent),
            other => Err(format!(
                "unknown selection rule '{other}' (expected listing-order, lexicographic or most-recent)"
            )),
        }
    }
}

/// A rule locating one or more files relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A fixed relative path.
    Exact(String),
    /// One file in `dir` whose name ends with `suffix`.
    FirstWithSuffix { dir: String, suffix: String },
    /// Every file in `dir` whose name ends with `suffix`, sorted by name.
    AllWithSuffix { dir: String, suffix: String },
    /// Every file below `dir`, recursively, sorted by relative path.
    AllUnder(String),
}

/// A file found by a [`Locator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub path: PathBuf,
    /// Name relative to the locator's directory (`/`-separated).
    pub name: String,
}

impl Locator {
    pub fn first_with_suffix(dir: &str, suffix: &str) -> Self {
        Locator::FirstWithSuffix {
            dir: dir.to_string(),
            suffix: suffix.to_string(),
        }
    }

    pub fn all_with_suffix(dir: &str, suffix: &str) -> Self {
        Locator::AllWithSuffix {
            dir: dir.to_string(),
            suffix: suffix.to_string(),
        }
    }

    /// Directory (relative to the root) where this locator looks.
    pub fn dir(&self) -> &str {
        match self {
            Locator::Exact(path) => path.rsplit_once('/').map(|(d, _)| d).unwrap_or(""),
            Locator::FirstWithSuffix { dir, .. }
            | Locator::AllWithSuffix { dir, .. }
            | Locator::AllUnder(dir) => dir,
        }
    }

    /// Evaluate against `root`. A missing directory yields no matches.
    pub fn locate(&self, root: &Path, rule: SelectionRule) -> PipelineResult<Vec<Located>> {
        match self {
            Locator::Exact(rel) => {
                let path = root.join(rel);
                if path.is_file() {
                    let name = rel.rsplit('/').next().unwrap_or(rel).to_string();
                    Ok(vec![Located { path, name }])
                } else {
                    Ok(Vec::new())
                }
            }
            Locator::FirstWithSuffix { dir, suffix } => {
                let candidates = files_with_suffix(&root.join(dir), suffix)?;
                Ok(select(candidates, rule).map(located).into_iter().collect())
            }
            Locator::AllWithSuffix { dir, suffix } => {
                let mut candidates = files_with_suffix(&root.join(dir), suffix)?;
                candidates.sort();
                Ok(candidates.into_iter().map(located).collect())
            }
            Locator::AllUnder(dir) => files_under(&root.join(dir)),
        }
    }
}

fn located(path: PathBuf) -> Located {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Located { path, name }
}

/// Files directly in `dir` whose name ends with `suffix`, in listing order.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> PipelineResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(suffix))
            .unwrap_or(false);
        if matches && path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

/// Pick one candidate according to `rule`.
pub fn select(mut candidates: Vec<PathBuf>, rule: SelectionRule) -> Option<PathBuf> {
    if candidates.len() > 1 {
        warn!(
            count = candidates.len(),
            rule = ?rule,
            "several files match, picking one: {:?}",
            candidates
        );
    }
    match rule {
        SelectionRule::ListingOrder => {}
        SelectionRule::Lexicographic => candidates.sort(),
        SelectionRule::MostRecent => {
            candidates.sort_by(|a, b| modified(b).cmp(&modified(a)).then_with(|| a.cmp(b)));
        }
    }
    candidates.into_iter().next()
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Every regular file below `dir`, sorted by relative path.
pub fn files_under(dir: &Path) -> PipelineResult<Vec<Located>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| PipelineError::Message(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| PipelineError::Message(e.to_string()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(Located {
            path: entry.path().to_path_buf(),
            name,
        });
    }
    Ok(out)
}

/// Directory containing the project manifest: the shallowest `Nargo.toml`, ties broken by path.
pub fn find_manifest_root(workspace: &Path) -> PipelineResult<PathBuf> {
    let found = WalkDir::new(workspace)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .min_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path().cmp(b.path())));

    match found.and_then(|e| e.path().parent().map(Path::to_path_buf)) {
        Some(root) => {
            debug!(root = %root.display(), "project root located");
            Ok(root)
        }
        None => Err(PipelineError::ManifestNotFound {
            manifest: MANIFEST_FILE.to_string(),
        }),
    }
}
