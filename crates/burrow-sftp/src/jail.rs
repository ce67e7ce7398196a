//! Path confinement
//!
//! Every client path is resolved against a single root directory. The
//! lexical pass handles `.`/`..` and relative paths; the canonical pass asks
//! the OS to resolve symlinks and checks the result again, so a link inside
//! the root cannot be used to reach anything outside it.

use crate::{Error, Result, files};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Root directory every client path is confined to
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// Create a jail rooted at `root`
    ///
    /// The root is canonicalized once here so later prefix checks compare
    /// like with like.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the root does not exist or is not a
    /// directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|e| {
            Error::Config(format!("Cannot resolve root directory {}: {e}", root.display()))
        })?;

        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Root path is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// The canonical root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically resolve a client path inside the root
    ///
    /// Paths already under the root are taken as-is; anything else is
    /// joined onto the root, which is also the working directory. An empty
    /// path means the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfJail`] when the normalized path leaves the root.
    pub fn resolve(&self, client_path: &str) -> Result<PathBuf> {
        if client_path.contains('\0') {
            return Err(Error::OutOfJail(client_path.replace('\0', "\\0")));
        }

        let requested = Path::new(client_path);
        let joined = if requested.starts_with(&self.root) {
            requested.to_path_buf()
        } else {
            let relative: PathBuf = requested
                .components()
                .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                .collect();
            self.root.join(relative)
        };

        let resolved = normalize(&joined);
        self.check(&resolved, client_path)?;
        Ok(resolved)
    }

    /// Resolve a client path and follow every symlink in it
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfJail`] if either the lexical or the canonical
    /// path leaves the root, or [`Error::Filesystem`] if the path does not
    /// exist.
    pub async fn resolve_canonical(&self, client_path: &str) -> Result<PathBuf> {
        let lexical = self.resolve(client_path)?;
        self.confine(&lexical, client_path).await
    }

    /// Resolve a client path, following symlinks in the parent directories
    /// but not in the final component
    ///
    /// Used by lstat, which must be able to describe a link without
    /// following it out of the root.
    ///
    /// # Errors
    ///
    /// As for [`Jail::resolve_canonical`].
    pub async fn resolve_no_follow(&self, client_path: &str) -> Result<PathBuf> {
        let lexical = self.resolve(client_path)?;

        match (lexical.parent(), lexical.file_name()) {
            (Some(parent), Some(name)) if lexical != self.root => {
                let parent = self.confine(parent, client_path).await?;
                Ok(parent.join(name))
            }
            _ => self.confine(&lexical, client_path).await,
        }
    }

    /// Canonicalize an already-lexical path and re-check it
    async fn confine(&self, path: &Path, client_path: &str) -> Result<PathBuf> {
        let canonical = files::canonicalize(path).await?;
        self.check(&canonical, client_path)?;
        Ok(canonical)
    }

    fn check(&self, path: &Path, client_path: &str) -> Result<()> {
        // Component-wise: /srv/data2 does not start with /srv/data
        if path.starts_with(&self.root) {
            Ok(())
        } else {
            warn!(
                event = "path_escape_rejected",
                requested = %client_path,
                resolved = ?path,
                "Path resolves outside the root directory"
            );
            Err(Error::OutOfJail(client_path.to_string()))
        }
    }
}

/// Collapse `.` and `..` without touching the filesystem
///
/// `..` at the top of an absolute path stays at `/`, so a path that climbs
/// above the root simply ends up somewhere the prefix check rejects.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
