//! Install media catalog.
//!
//! Lists ISO images in the configured search directories and the OS variant
//! ids `virt-install` understands. Both are best-effort: missing or unreadable
//! directories and absent tools become warnings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::types::Listing;

/// Most OS variant lines returned.
const MAX_OS_VARIANT_LINES: usize = 100;

/// An install image found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoImage {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    /// Size in GiB rounded to two decimals
    pub size_gib: f64,
}

/// OS variant ids reported by the host tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsVariants {
    /// Tool that produced the list
    pub source: String,
    pub lines: Vec<String>,
    /// Lines dropped beyond the limit
    pub truncated: usize,
}

pub struct MediaCatalog {
    dirs: Vec<PathBuf>,
}

impl MediaCatalog {
    /// Search `dirs` in order; duplicates are ignored.
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut unique: Vec<PathBuf> = Vec::new();
        for dir in dirs.into_iter().map(Into::into) {
            if !unique.contains(&dir) {
                unique.push(dir);
            }
        }
        Self { dirs: unique }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// `.iso` files (case-insensitive) directly inside each directory, sorted by path.
    #[instrument(skip(self))]
    pub async fn list_isos(&self) -> Listing<IsoImage> {
        let mut listing = Listing::default();

        for dir in &self.dirs {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping media directory");
                    listing.warnings.push(format!("{}: {}", dir.display(), e));
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        listing.warnings.push(format!("{}: {}", dir.display(), e));
                        break;
                    }
                };
                let path = entry.path();
                let is_iso = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("iso"));
                if !is_iso {
                    continue;
                }
                match entry.metadata().await {
                    Ok(meta) if meta.is_file() => {
                        let size_bytes = meta.len();
                        listing.items.push(IsoImage {
                            name: entry.file_name().to_string_lossy().into_owned(),
                            path: path.display().to_string(),
                            size_bytes,
                            size_gib: (size_bytes as f64 / 1_073_741_824.0 * 100.0).round() / 100.0,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => listing.warnings.push(format!("{}: {}", path.display(), e)),
                }
            }
        }

        listing.items.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = listing.items.len(), "Listed install media");
        listing
    }

    /// OS variant ids from `virt-install --os-variant list`, falling back to
    /// `osinfo-query os`.
    #[instrument(skip(self, runner))]
    pub async fn list_os_variants(&self, runner: &dyn CommandRunner, timeout: Duration) -> Result<OsVariants> {
        let attempts = [
            CommandSpec::new("virt-install", timeout).args(["--os-variant", "list"]),
            CommandSpec::new("osinfo-query", timeout).args(["os", "--fields=short-id,name"]),
        ];

        let mut failures = Vec::new();
        for spec in attempts {
            let program = spec.program.clone();
            match runner.run(spec).await {
                Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                    let all: Vec<String> = output
                        .stdout
                        .lines()
                        .map(str::trim_end)
                        .filter(|l| !l.trim().is_empty())
                        .map(str::to_string)
                        .collect();
                    let truncated = all.len().saturating_sub(MAX_OS_VARIANT_LINES);
                    return Ok(OsVariants {
                        source: program,
                        lines: all.into_iter().take(MAX_OS_VARIANT_LINES).collect(),
                        truncated,
                    });
                }
                Ok(output) => failures.push(format!(
                    "{} exited with {}: {}",
                    program,
                    output.exit_code,
                    output.stderr.trim()
                )),
                Err(e) => failures.push(e.to_string()),
            }
            debug!(program = %program, "OS variant source unavailable");
        }

        Err(HypervisorError::ProvisioningFailed {
            tool: "os-variant listing".to_string(),
            detail: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_isos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("debian.iso"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("WIN11.ISO"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested.iso")).unwrap();

        let missing = dir.path().join("missing");
        let catalog = MediaCatalog::new([dir.path().to_path_buf(), missing, dir.path().to_path_buf()]);
        assert_eq!(catalog.dirs().len(), 2);

        let listing = catalog.list_isos().await;
        let names: Vec<_> = listing.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["WIN11.ISO", "debian.iso"]);
        assert_eq!(listing.items[1].size_bytes, 1024);
        assert_eq!(listing.items[1].size_gib, 0.0);
        assert_eq!(listing.warnings.len(), 1);
    }
}
