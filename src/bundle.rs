use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::hash::Tth;
use crate::path::ListPath;
use crate::tree::DirId;
use crate::tree::Tree;
use crate::utils::is_release_name;

/// Separator of bundle-relative paths and targets.
pub const TARGET_SEPARATOR: char = '/';

/// One file of a bundle.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleFileInfo {
    /// Path relative to the bundle target.
    pub path: String,
    /// Content hash.
    pub tth: Tth,
    /// Size in bytes.
    pub size: u64,
}

/// A directory to hand to the download queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    /// Name of the downloaded directory.
    pub name: String,
    /// Local target directory, ending with [`TARGET_SEPARATOR`].
    pub target: String,
    /// Files, directories first, each level sorted by name.
    pub files: Vec<BundleFileInfo>,
    /// Remote date of the directory.
    pub remote_date: Option<DateTime<Utc>>,
}

impl BundleRequest {
    /// Returns true when there is nothing worth queueing: no files at all,
    /// or only empty files when `skip_zero_byte` is set.
    pub fn is_empty(&self, skip_zero_byte: bool) -> bool {
        self.files.is_empty() || (skip_zero_byte && self.files.iter().all(|f| f.size == 0))
    }
}

/// Kind of a file list request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Only the requested directory level.
    pub partial: bool,
    /// The whole subtree below the requested directory.
    pub recursive: bool,
    /// Open the first NFO file once the list arrives.
    pub view_nfo: bool,
}

/// Outcome of matching a listing against the download queue.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMatch {
    /// Queued files found in the listing.
    pub matching_files: usize,
    /// Sources added to queued files.
    pub new_files: usize,
    /// Bundles the new sources belong to.
    pub bundles: usize,
}

impl Display for QueueMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.matching_files == 0 {
            return write!(f, "No matching files");
        }
        write!(
            f,
            "{} matching files, {} new sources added to {} bundles",
            self.matching_files, self.new_files, self.bundles
        )
    }
}

/// The download queue.
pub trait QueueManager: Send + Sync {
    /// Creates a bundle of `files` below `target` and returns its token.
    fn add_files(
        &self,
        target: &str,
        files: &[BundleFileInfo],
        remote_date: Option<DateTime<Utc>>,
    ) -> Result<String, Error>;

    /// Queues a file list download of `path` from the peer of the listing.
    fn add_list_request(&self, path: &ListPath, request: ListRequest) -> Result<(), Error>;

    /// Downloads a single file to a temporary location and opens it.
    fn open_file(&self, file: &BundleFileInfo) -> Result<(), Error>;

    /// Adds the peer as a source for queued files present in `tree`.
    fn match_listing(&self, tree: &Tree) -> QueueMatch;
}

/// Appends every file below `id` to `out`, subdirectories first and each
/// level sorted case-insensitively. Paths are prefixed with `prefix`.
pub fn collect_files(tree: &mut Tree, id: DirId, prefix: &str, out: &mut Vec<BundleFileInfo>) {
    tree.sort_children(id);
    let children = tree[id].directories().to_vec();
    for child in children {
        let prefix = format!("{prefix}{}{TARGET_SEPARATOR}", tree[child].name());
        collect_files(tree, child, &prefix, out);
    }
    out.extend(tree[id].files().iter().map(|f| BundleFileInfo {
        path: format!("{prefix}{}", f.name),
        tth: f.tth,
        size: f.size,
    }));
}

fn request(tree: &mut Tree, id: DirId, target: String) -> BundleRequest {
    let mut files = Vec::new();
    collect_files(tree, id, "", &mut files);
    let dir = &tree[id];
    BundleRequest {
        name: dir.name().to_string(),
        target,
        files,
        remote_date: dir.remote_date(),
    }
}

/// Plans the download of `id` into `target`.
///
/// An umbrella directory that is not a release itself, has no files and
/// only release-named subdirectories is split into one request per
/// subdirectory.
pub fn plan_bundles(tree: &mut Tree, id: DirId, target: &str) -> Vec<BundleRequest> {
    let mut target = target.to_string();
    if !target.ends_with(TARGET_SEPARATOR) {
        target.push(TARGET_SEPARATOR);
    }

    let dir = &tree[id];
    let split = !is_release_name(dir.name())
        && dir.files().is_empty()
        && !dir.directories().is_empty()
        && dir
            .directories()
            .iter()
            .all(|d| is_release_name(tree[*d].name()));

    if split {
        tree.sort_children(id);
        tree[id]
            .directories()
            .to_vec()
            .into_iter()
            .map(|d| {
                let sub_target = format!("{target}{}{TARGET_SEPARATOR}", tree[d].name());
                request(tree, d, sub_target)
            })
            .collect()
    } else {
        vec![request(tree, id, target)]
    }
}
