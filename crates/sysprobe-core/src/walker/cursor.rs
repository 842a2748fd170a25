use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

/// The single shared "current target".
///
/// Written only by the walker thread, read by every worker. An empty path means
/// nothing is published. Every lock attempt is bounded, so a stuck holder costs an
/// iteration rather than a hang.
#[derive(Debug, Default)]
pub struct TraversalCursor {
    current: Mutex<PathBuf>,
}

impl TraversalCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published path. Returns `false` if the lock wait timed out.
    pub fn publish(&self, path: &Path, wait: Duration) -> bool {
        let Some(mut current) = self.current.try_lock_for(wait) else {
            return false;
        };
        let buf = current.as_mut_os_string();
        buf.clear();
        buf.push(path.as_os_str());
        true
    }

    /// Copy the published path into `out`.
    ///
    /// `None` on lock timeout, otherwise whether a target is published.
    pub fn snapshot_into(&self, out: &mut PathBuf, wait: Duration) -> Option<bool> {
        let current = self.current.try_lock_for(wait)?;
        let buf = out.as_mut_os_string();
        buf.clear();
        buf.push(current.as_os_str());
        Some(!buf.is_empty())
    }

    /// Reset to the empty sentinel. Returns `false` on lock timeout.
    pub fn clear(&self, wait: Duration) -> bool {
        let Some(mut current) = self.current.try_lock_for(wait) else {
            return false;
        };
        current.as_mut_os_string().clear();
        true
    }

    /// The published path, if any and if the lock could be taken in time.
    #[must_use]
    pub fn last_published(&self, wait: Duration) -> Option<PathBuf> {
        let current = self.current.try_lock_for(wait)?;
        (!current.as_os_str().is_empty()).then(|| current.clone())
    }
}
