//! Dependency declarations and their reconciliation
//!
//! A [`RequirementsSet`] is what a repository declares it needs, reduced to
//! its entries and a content hash. The hash never involves paths, so two
//! repositories with byte-identical declarations share environments and
//! images.

use crate::errors::{PinrunError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Hash of a repository that declares nothing.
pub const NO_REQUIREMENTS: &str = "no_requirements";

/// What to do when a task needs more than a shared runtime provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequirementsStrategy {
    /// Fail before running anything.
    #[default]
    Raise,
    /// Run with the base set only.
    Ignore,
    /// Install the missing entries into the runtime first.
    InstallExtra,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementsSet {
    source_files: Vec<SourceFile>,
    entries: Vec<String>,
    declaration: String,
    resolved_hash: String,
    extras: Vec<String>,
}

impl RequirementsSet {
    pub fn empty() -> Self {
        Self {
            source_files: Vec::new(),
            entries: Vec::new(),
            declaration: String::new(),
            resolved_hash: NO_REQUIREMENTS.to_string(),
            extras: Vec::new(),
        }
    }

    /// Parses declaration text. `lockfile` bytes, when given, refine the hash.
    pub fn from_declaration(declaration: &str, lockfile: Option<&[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(declaration.as_bytes());
        if let Some(lock) = lockfile {
            hasher.update(lock);
        }

        Self {
            source_files: Vec::new(),
            entries: parse_entries(declaration),
            declaration: declaration.to_string(),
            resolved_hash: format!("{:x}", hasher.finalize()),
            extras: Vec::new(),
        }
    }

    /// Reads a declaration from an arbitrary path, e.g. the one describing the caller's runtime.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            PinrunError::Configuration(format!(
                "Failed to read requirements {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut set = Self::from_declaration(&String::from_utf8_lossy(&content), None);
        set.source_files.push(SourceFile {
            path: path.to_path_buf(),
            content_hash: sha256_hex(&content),
        });
        Ok(set)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Entries that are not part of the base runtime and must be installed.
    pub fn extras(&self) -> &[String] {
        &self.extras
    }

    pub fn source_files(&self) -> &[SourceFile] {
        &self.source_files
    }

    /// Text an installer is fed, one requirement per line.
    pub fn declaration(&self) -> &str {
        &self.declaration
    }

    pub fn resolved_hash(&self) -> &str {
        &self.resolved_hash
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interchangeable sets have the same hash, whatever their origin.
    pub fn interchangeable_with(&self, other: &RequirementsSet) -> bool {
        self.resolved_hash == other.resolved_hash
    }
}

/// Locates and hashes the declaration of the working copy at `root`.
/// An absent declaration is the empty set.
pub async fn resolve(
    root: &Path,
    location: Option<&Path>,
    lockfile: Option<&Path>,
) -> Result<RequirementsSet> {
    let location = match location {
        Some(location) => root.join(location),
        None => {
            log::debug!("No requirements location configured");
            return Ok(RequirementsSet::empty());
        }
    };

    if !location.is_file() {
        log::debug!("No requirements at {}, using the empty set", location.display());
        return Ok(RequirementsSet::empty());
    }

    let declaration = tokio::fs::read(&location).await?;
    let lock = match lockfile.map(|lock| root.join(lock)) {
        Some(lock) if lock.is_file() => Some((tokio::fs::read(&lock).await?, lock)),
        _ => None,
    };

    let mut set = RequirementsSet::from_declaration(
        &String::from_utf8_lossy(&declaration),
        lock.as_ref().map(|(bytes, _)| bytes.as_slice()),
    );
    set.source_files.push(SourceFile {
        path: location,
        content_hash: sha256_hex(&declaration),
    });
    if let Some((bytes, path)) = lock {
        set.source_files.push(SourceFile {
            path,
            content_hash: sha256_hex(&bytes),
        });
    }

    log::debug!("Requirements hash {}", set.resolved_hash);
    Ok(set)
}

/// Fits `target` onto the `base` runtime according to `strategy`.
pub fn reconcile(
    base: &RequirementsSet,
    target: &RequirementsSet,
    strategy: RequirementsStrategy,
) -> Result<RequirementsSet> {
    let known: HashSet<String> = base.entries.iter().map(|entry| normalize(entry)).collect();
    let extras: Vec<String> = target
        .entries
        .iter()
        .filter(|entry| !known.contains(&normalize(entry)))
        .cloned()
        .collect();

    if extras.is_empty() {
        return Ok(base.clone());
    }

    match strategy {
        RequirementsStrategy::Raise => Err(PinrunError::RequirementsMismatch { extras }),
        RequirementsStrategy::Ignore => {
            log::info!("Ignoring extra requirements: {}", extras.join(", "));
            Ok(base.clone())
        }
        RequirementsStrategy::InstallExtra => {
            let mut union = base.entries.clone();
            union.extend(extras.iter().cloned());
            let mut set = RequirementsSet::from_declaration(&union.join("\n"), None);
            set.source_files = base
                .source_files
                .iter()
                .chain(target.source_files.iter())
                .cloned()
                .collect();
            set.extras = extras;
            Ok(set)
        }
    }
}

fn parse_entries(declaration: &str) -> Vec<String> {
    declaration
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn normalize(entry: &str) -> String {
    entry
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
