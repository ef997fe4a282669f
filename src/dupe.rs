#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::hash::Tth;
use crate::path::ListPath;
use crate::tree::DirId;
use crate::tree::Tree;

/// Dupe classification of a file or directory.
///
/// Files only ever carry `None`, `FullShare` or `FullQueue`; the partial and
/// mixed states are produced for directories by [`propagate`].
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DupeType {
    /// Not present locally.
    #[default]
    None,
    /// Everything is shared.
    FullShare,
    /// Some of the content is shared.
    PartialShare,
    /// Everything is queued.
    FullQueue,
    /// Some of the content is queued.
    PartialQueue,
    /// Both shared and queued content.
    Mixed,
}

impl DupeType {
    /// `FullShare` or `PartialShare`.
    pub fn is_share(&self) -> bool {
        matches!(self, DupeType::FullShare | DupeType::PartialShare)
    }

    /// `FullQueue` or `PartialQueue`.
    pub fn is_queue(&self) -> bool {
        matches!(self, DupeType::FullQueue | DupeType::PartialQueue)
    }
}

/// Content-addressed index of local share and queue content.
pub trait DupeIndex: Send + Sync {
    /// Classifies a file by content hash.
    fn lookup(&self, tth: &Tth) -> DupeType;

    /// Classifies a directory whose content is not loaded yet, from its path
    /// and the size estimate sent by the peer.
    fn lookup_directory(&self, _path: &ListPath, _size: u64) -> DupeType {
        DupeType::None
    }
}

/// Folds the status of a child directory into its parent's status.
fn fold_directory(dupe: DupeType, result: DupeType, first: bool) -> DupeType {
    use DupeType::*;
    if dupe == None && first {
        result
    } else if result == FullShare && dupe == None && !first {
        PartialShare
    } else if result == PartialShare && (dupe == None || dupe == FullShare) && !first {
        PartialShare
    } else if result == FullQueue && dupe == None && !first {
        PartialQueue
    } else if result == PartialQueue && (dupe == None || dupe == FullQueue) && !first {
        PartialQueue
    } else if (dupe.is_share() && result.is_queue()) || (dupe.is_queue() && result.is_share()) {
        Mixed
    } else if result == Mixed {
        Mixed
    } else {
        dupe
    }
}

/// Folds the status of a non-empty file into its directory's status.
fn fold_file(dupe: DupeType, file: DupeType, has_dirs: bool, first: bool) -> DupeType {
    use DupeType::*;
    let shared = file == FullShare;
    let queued = file == FullQueue;
    if dupe == None && first && !has_dirs && shared {
        FullShare
    } else if dupe == None && first && !has_dirs && queued {
        FullQueue
    } else if dupe == None && first && has_dirs && shared {
        PartialShare
    } else if dupe == None && first && has_dirs && queued {
        PartialQueue
    } else if dupe == None && !first && shared {
        PartialShare
    } else if dupe == None && !first && queued {
        PartialQueue
    } else if dupe == FullShare && !shared {
        PartialShare
    } else if dupe == FullQueue && !queued {
        PartialQueue
    } else if (dupe.is_share() && queued) || (dupe.is_queue() && shared) {
        Mixed
    } else {
        dupe
    }
}

/// Classifies `id` and everything below it, children first, and returns
/// the status of `id`.
///
/// The folds are evaluated in child order and are not commutative: a child
/// that is fully shared after a non-dupe sibling yields a partial status,
/// while the reverse order keeps the full status.
pub fn classify(tree: &mut Tree, id: DirId) -> DupeType {
    let children = tree[id].directories().to_vec();
    let has_dirs = !children.is_empty();
    let mut dupe = tree[id].dupe();

    let mut first = true;
    for child in children {
        let result = classify(tree, child);
        dupe = fold_directory(dupe, result, first);
        first = false;
    }

    // zero byte files would mark lots of directories as partial dupes
    first = true;
    for f in tree[id].files().iter().filter(|f| f.size > 0) {
        dupe = fold_file(dupe, f.dupe, has_dirs, first);
        first = false;
    }

    tree[id].set_dupe(dupe);
    dupe
}

/// Classifies the whole tree. The root is never shown as a dupe.
pub fn propagate(tree: &mut Tree) {
    let root = tree.root();
    classify(tree, root);
    tree[root].set_dupe(DupeType::None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DirType;
    use crate::tree::Directory;
    use crate::tree::File;

    fn file(name: &str, size: u64, dupe: DupeType) -> File {
        let mut f = File::new(name, size, Tth::default());
        f.dupe = dupe;
        f
    }

    fn dir_with(tree: &mut Tree, parent: DirId, name: &str, files: &[(u64, DupeType)]) -> DirId {
        let id = tree.add_directory(parent, Directory::new(name, DirType::Normal));
        for (i, (size, dupe)) in files.iter().enumerate() {
            tree.add_file(id, file(&format!("f{i}"), *size, *dupe));
        }
        id
    }

    #[test]
    fn files_only() {
        let mut tree = Tree::new();
        let root = tree.root();
        let full = dir_with(&mut tree, root, "full", &[(1, DupeType::FullShare); 2]);
        let partial = dir_with(
            &mut tree,
            root,
            "partial",
            &[(1, DupeType::FullShare), (1, DupeType::None)],
        );
        let late = dir_with(
            &mut tree,
            root,
            "late",
            &[(1, DupeType::None), (1, DupeType::FullQueue)],
        );
        let mixed = dir_with(
            &mut tree,
            root,
            "mixed",
            &[(1, DupeType::FullShare), (1, DupeType::FullQueue)],
        );
        propagate(&mut tree);
        assert_eq!(tree[full].dupe(), DupeType::FullShare);
        assert_eq!(tree[partial].dupe(), DupeType::PartialShare);
        assert_eq!(tree[late].dupe(), DupeType::PartialQueue);
        // a full share dupe meeting a queued file is downgraded first
        assert_eq!(tree[mixed].dupe(), DupeType::PartialShare);
        assert_eq!(tree[root].dupe(), DupeType::None);
    }

    #[test]
    fn zero_byte_files_are_ignored() {
        let mut tree = Tree::new();
        let root = tree.root();
        let d = dir_with(
            &mut tree,
            root,
            "d",
            &[(0, DupeType::None), (5, DupeType::FullShare)],
        );
        propagate(&mut tree);
        assert_eq!(tree[d].dupe(), DupeType::FullShare);
    }

    #[test]
    fn child_order_matters() {
        let mut tree = Tree::new();
        let root = tree.root();
        let none_first = tree.add_directory(root, Directory::new("a", DirType::Normal));
        dir_with(&mut tree, none_first, "x", &[(1, DupeType::None)]);
        dir_with(&mut tree, none_first, "y", &[(1, DupeType::FullShare)]);

        let full_first = tree.add_directory(root, Directory::new("b", DirType::Normal));
        dir_with(&mut tree, full_first, "y", &[(1, DupeType::FullShare)]);
        dir_with(&mut tree, full_first, "x", &[(1, DupeType::None)]);

        propagate(&mut tree);
        assert_eq!(tree[none_first].dupe(), DupeType::PartialShare);
        assert_eq!(tree[full_first].dupe(), DupeType::FullShare);
    }

    #[test]
    fn share_and_queue_children_mix() {
        let mut tree = Tree::new();
        let root = tree.root();
        let parent = tree.add_directory(root, Directory::new("p", DirType::Normal));
        dir_with(&mut tree, parent, "s", &[(1, DupeType::FullShare)]);
        dir_with(&mut tree, parent, "q", &[(1, DupeType::FullQueue)]);
        propagate(&mut tree);
        assert_eq!(tree[parent].dupe(), DupeType::Mixed);
    }

    #[test]
    fn files_next_to_dupe_dirs_are_partial() {
        let mut tree = Tree::new();
        let root = tree.root();
        let parent = tree.add_directory(root, Directory::new("p", DirType::Normal));
        dir_with(&mut tree, parent, "s", &[(1, DupeType::FullShare)]);
        tree.add_file(parent, file("extra", 3, DupeType::None));
        propagate(&mut tree);
        assert_eq!(tree[parent].dupe(), DupeType::PartialShare);
    }

    #[test]
    fn mixed_child_propagates() {
        let mut tree = Tree::new();
        let root = tree.root();
        let top = tree.add_directory(root, Directory::new("top", DirType::Normal));
        let mid = tree.add_directory(top, Directory::new("mid", DirType::Normal));
        dir_with(&mut tree, mid, "s", &[(1, DupeType::FullShare)]);
        dir_with(&mut tree, mid, "q", &[(1, DupeType::FullQueue)]);
        dir_with(&mut tree, top, "plain", &[(1, DupeType::None)]);
        propagate(&mut tree);
        assert_eq!(tree[mid].dupe(), DupeType::Mixed);
        assert_eq!(tree[top].dupe(), DupeType::Mixed);
    }
}
