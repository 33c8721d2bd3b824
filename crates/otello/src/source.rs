use alloc::string::String;
use alloc::vec::Vec;

use core::hash::{Hash, Hasher};

use hashbrown::DefaultHashBuilder;
use indexmap::set::IndexSet;

use log::debug;

use serde::Serialize;

use crate::macros::set;

/// The file every application must ship as its entrypoint.
pub const ENTRYPOINT: &str = "main.py";

/// Paths never tracked for replacement and never deleted between
/// adaptations.
///
/// They cover the entrypoint, the core runtime file, and the core
/// configuration of an end node.
pub const IGNORED_PATHS: &[&str] = &["main.py", "boot.py", "config.json"];

/// Path prefixes that must never be deleted recursively.
pub const PROTECTED_PREFIXES: &[&str] = &["core/", "config/"];

/// Checks whether a path belongs to [`IGNORED_PATHS`].
#[must_use]
pub fn is_ignored(path: &str) -> bool {
    IGNORED_PATHS.contains(&path)
}

/// Checks whether a path falls under a [`PROTECTED_PREFIXES`] entry.
#[must_use]
pub fn is_protected(path: &str) -> bool {
    PROTECTED_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// A single application source file.
///
/// Its content integrity is verified by the fetch layer that produced it;
/// from here on the file is treated as immutable.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct SourceFile {
    /// Destination path on the end node.
    pub path: String,
    /// URL the content was fetched from.
    pub origin: String,
    /// File content.
    pub content: Vec<u8>,
    /// Content hash computed by the fetch layer.
    pub checksum: String,
}

impl SourceFile {
    /// Creates a [`SourceFile`].
    #[must_use]
    #[inline]
    pub fn new(
        path: impl Into<String>,
        origin: impl Into<String>,
        content: Vec<u8>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            origin: origin.into(),
            content,
            checksum: checksum.into(),
        }
    }
}

// Two source files are the same file when they target the same path.
impl PartialEq for SourceFile {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for SourceFile {}

impl Hash for SourceFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

set! {
    /// A collection of [`SourceFile`]s, keyed by destination path.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
    pub struct SourceFiles(IndexSet<SourceFile, DefaultHashBuilder>);
}

/// The target file set of an adaptation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct AppSource {
    /// The files shipped to the end node.
    pub files: SourceFiles,
}

impl AppSource {
    /// Creates an [`AppSource`] from its [`SourceFiles`].
    #[must_use]
    #[inline]
    pub const fn new(files: SourceFiles) -> Self {
        Self { files }
    }

    /// Checks whether the [`ENTRYPOINT`] is part of the source.
    #[must_use]
    pub fn has_entrypoint(&self) -> bool {
        self.contains_path(ENTRYPOINT)
    }

    /// Checks whether a file targets the given path.
    #[must_use]
    pub fn contains_path(&self, path: &str) -> bool {
        self.files.iter().any(|file| file.path == path)
    }

    /// Returns an iterator over the destination paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|file| file.path.as_str())
    }
}

/// The insertion-ordered record of paths written by previous adaptations.
///
/// Paths in [`IGNORED_PATHS`] are never tracked, so the entrypoint and core
/// files of an end node can never become deletion candidates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct ReplaceSet(IndexSet<String, DefaultHashBuilder>);

impl Default for ReplaceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplaceSet {
    /// Creates an empty [`ReplaceSet`].
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self(IndexSet::with_hasher(DefaultHashBuilder::default()))
    }

    /// Records a written path.
    ///
    /// Returns whether the path is now tracked; ignored paths are skipped.
    pub fn record(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if is_ignored(&path) {
            debug!("Path `{path}` is not tracked for replacement");
            return false;
        }
        let _ = self.0.insert(path);
        true
    }

    /// Forgets a deleted path, preserving the order of the remaining ones.
    pub fn forget(&mut self, path: &str) -> bool {
        self.0.shift_remove(path)
    }

    /// Checks whether the given path is tracked.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }

    /// Returns the number of tracked paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether no path is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the tracked paths.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns the tracked paths that the given source no longer ships.
    ///
    /// These are the paths a new adaptation must delete before writing.
    #[must_use]
    pub fn stale_paths(&self, source: &AppSource) -> Vec<String> {
        self.0
            .iter()
            .filter(|path| !source.contains_path(path))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use alloc::borrow::ToOwned;
    use alloc::vec;
    use alloc::vec::Vec;

    use super::{AppSource, ReplaceSet, SourceFile, SourceFiles, is_ignored, is_protected};

    pub(crate) fn file(path: &str) -> SourceFile {
        SourceFile::new(
            path,
            alloc::format!("http://apps.local/demo/{path}"),
            path.as_bytes().to_vec(),
            "0f3a",
        )
    }

    pub(crate) fn source(paths: &[&str]) -> AppSource {
        let mut files = SourceFiles::new();
        for path in paths {
            files.add(file(path));
        }
        AppSource::new(files)
    }

    #[test]
    fn entrypoint_detection() {
        assert!(source(&["main.py", "lib/util.py"]).has_entrypoint());
        assert!(!source(&["lib/util.py"]).has_entrypoint());
    }

    #[test]
    fn files_keyed_by_path() {
        let mut files = SourceFiles::new();
        files.add(file("lib/a.py"));
        files.add(SourceFile::new("lib/a.py", "http://other", vec![1], "ffff"));

        assert_eq!(files.len(), 1);
    }

    #[test]
    fn ignored_paths_never_tracked() {
        let mut replace_set = ReplaceSet::new();

        assert!(!replace_set.record("main.py"));
        assert!(!replace_set.record("boot.py"));
        assert!(!replace_set.record("config.json"));
        assert!(replace_set.record("lib/a.py"));

        assert_eq!(replace_set.len(), 1);
        assert!(!replace_set.contains("main.py"));
        assert!(replace_set.contains("lib/a.py"));
    }

    #[test]
    fn stale_paths_are_tracked_minus_fresh() {
        let mut replace_set = ReplaceSet::new();
        let _ = replace_set.record("lib/a.py");
        let _ = replace_set.record("lib/b.py");
        let _ = replace_set.record("assets/logo.bin");

        let fresh = source(&["main.py", "lib/a.py"]);

        assert_eq!(
            replace_set.stale_paths(&fresh),
            vec!["lib/b.py".to_owned(), "assets/logo.bin".to_owned()]
        );
    }

    #[test]
    fn forget_preserves_order() {
        let mut replace_set = ReplaceSet::new();
        let _ = replace_set.record("lib/a.py");
        let _ = replace_set.record("lib/b.py");
        let _ = replace_set.record("lib/c.py");

        assert!(replace_set.forget("lib/b.py"));
        assert!(!replace_set.forget("lib/b.py"));

        assert_eq!(replace_set.iter().collect::<Vec<_>>(), ["lib/a.py", "lib/c.py"]);
    }

    #[test]
    fn protected_prefixes() {
        assert!(is_protected("core/runtime.py"));
        assert!(is_protected("config/net.json"));
        assert!(!is_protected("lib/core/fake.py"));

        assert!(is_ignored("boot.py"));
        assert!(!is_ignored("lib/boot.py"));
    }
}
