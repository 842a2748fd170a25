//! Directory scanning, ordering and eligibility.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Group/other permission bits; a node with none of them is skipped.
pub const SHARED_ACCESS_BITS: u32 =
    (libc::S_IRGRP | libc::S_IWGRP | libc::S_IROTH | libc::S_IWOTH) as u32;

/// Rolling shift-add hash of `name`, seeded with `mixup`.
#[must_use]
pub fn path_sum(name: &[u8], mixup: u32) -> u32 {
    name.iter()
        .fold(mixup, |sum, c| (sum << 1).wrapping_add(u32::from(*c)))
}

#[must_use]
pub fn is_shared_access(mode: u32) -> bool {
    mode & SHARED_ACCESS_BITS != 0
}

/// Paths known to misbehave when probed.
///
/// Each rule is a set of fragments that must all occur in the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denylist {
    rules: Vec<Vec<String>>,
}

impl Default for Denylist {
    /// Hyper-V VMBus devices under the PCI host bridge hang on read.
    fn default() -> Self {
        Self::empty().with_rule(&["PNP0A03", "VMBUS"])
    }
}

impl Denylist {
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with_rule<S: AsRef<str>>(mut self, fragments: &[S]) -> Self {
        if !fragments.is_empty() {
            self.rules
                .push(fragments.iter().map(|f| f.as_ref().to_owned()).collect());
        }
        self
    }

    #[must_use]
    pub fn is_denied(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.rules
            .iter()
            .any(|rule| rule.iter().all(|fragment| text.contains(fragment.as_str())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Eligible children of `dir`, ordered by [`path_sum`] under `mixup`.
///
/// Symlinks and special files are ignored. Unreadable directories yield nothing.
#[must_use]
pub fn scan_dir(dir: &Path, mixup: u32, denylist: &Denylist) -> Vec<Entry> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut keyed: Vec<(u32, Entry)> = read_dir
        .filter_map(Result::ok)
        .filter_map(|dirent| {
            let file_type = dirent.file_type().ok()?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                return None;
            };
            let path = dirent.path();
            if denylist.is_denied(&path) {
                return None;
            }
            let mode = dirent.metadata().ok()?.mode();
            if !is_shared_access(mode) {
                return None;
            }
            let key = path_sum(dirent.file_name().as_bytes(), mixup);
            Some((key, Entry { path, kind }))
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
    keyed.into_iter().map(|(_, entry)| entry).collect()
}
