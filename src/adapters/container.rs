//! Group containers as directories under a shared root.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::domain::ports::GroupContainerProvider;
use crate::error::{Error, Result};

/// Maps each entitled group to `<root>/<group>`.
///
/// Processes that share a root and an entitlement share the container.
#[derive(Debug)]
pub struct DirectoryContainerProvider {
    root: PathBuf,
    entitled: RwLock<HashSet<String>>,
    /// Every syntactically valid group is entitled
    allow_any: bool,
}

impl DirectoryContainerProvider {
    /// Provider with no entitlements yet.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            entitled: RwLock::new(HashSet::new()),
            allow_any: false,
        }
    }

    /// Provider that entitles every group.
    pub fn permissive(root: impl AsRef<Path>) -> Self {
        Self {
            allow_any: true,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entitle(&self, group: impl Into<String>) {
        self.entitled.write().insert(group.into());
    }

    pub fn revoke(&self, group: &str) -> bool {
        self.entitled.write().remove(group)
    }

    fn is_entitled(&self, group: &str) -> bool {
        // group ids become directory names
        let well_formed = !group.is_empty()
            && group != "."
            && group != ".."
            && !group.contains(['/', '\\']);
        well_formed && (self.allow_any || self.entitled.read().contains(group))
    }
}

impl GroupContainerProvider for DirectoryContainerProvider {
    fn container_for(&self, group: &str) -> Result<PathBuf> {
        if !self.is_entitled(group) {
            return Err(Error::NotEntitled {
                group: group.to_string(),
            });
        }
        let container = self.root.join(group);
        fs::create_dir_all(&container)?;
        debug!(group, container = %container.display(), "Resolved group container");
        Ok(container)
    }
}
