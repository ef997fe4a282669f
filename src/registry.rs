use std::collections::HashMap;

use crate::path::ListPath;
use crate::tree::DirId;
use crate::tree::DirType;
use crate::tree::Tree;

/// One registered directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// The directory. May be stale if the directory was pruned since.
    pub dir: DirId,
    /// Set when the content of the directory was loaded, not just announced.
    pub visited: bool,
}

/// Lowercase network path to directory map.
///
/// Every directory materialized by a partial load is recorded together with
/// a `visited` flag. A second payload for a visited path replaces the old
/// content instead of being merged into it.
#[derive(Debug, Default, Clone)]
pub struct PathRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl PathRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry registered under `key` (see [`ListPath::registry_key`]).
    pub fn get(&self, key: &str) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    /// Live directory registered under `key`.
    pub fn lookup(&self, tree: &Tree, key: &str) -> Option<DirId> {
        self.entries
            .get(key)
            .map(|e| e.dir)
            .filter(|d| tree.contains(*d))
    }

    /// Returns true when the content under `key` has been loaded.
    pub fn is_visited(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.visited)
    }

    /// Registers `dir` under `key`, replacing any earlier entry.
    pub fn insert(&mut self, key: impl Into<String>, dir: DirId, visited: bool) {
        self.entries
            .insert(key.into(), RegistryEntry { dir, visited });
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops the entries strictly below `key`; the entry of `key` itself
    /// stays.
    pub fn remove_below(&mut self, key: &str) {
        self.entries
            .retain(|k, _| !(k.len() > key.len() && k.starts_with(key)));
    }
}

/// Prepares the tree for a partial payload rooted at `base`.
///
/// Returns true when the payload replaces earlier content, either because
/// `reload_all` is set or because `base` was visited before. In that case
/// the old content is dropped first: the whole tree and registry for
/// `reload_all`, otherwise the children of `base` and the registry entries
/// below it.
pub fn prepare_partial(
    tree: &mut Tree,
    registry: &mut PathRegistry,
    base: &ListPath,
    reload_all: bool,
) -> bool {
    let key = base.registry_key();
    let reloading = reload_all || registry.is_visited(&key);
    if !reloading {
        return false;
    }

    if reload_all {
        registry.clear();
        let root = tree.root();
        tree.clear_all(root);
        tree[root].set_type(DirType::IncompleteWithChildren);
    } else if let Some(dir) = tree.find_directory(base) {
        let d = &tree[dir];
        if !d.directories().is_empty() || !d.files().is_empty() {
            tree.clear_all(dir);
            registry.remove_below(&key);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Tth;
    use crate::tree::Directory;
    use crate::tree::File;

    fn path(s: &str) -> ListPath {
        ListPath::from_adc(s).unwrap()
    }

    #[test]
    fn remove_below_keeps_the_base() {
        let tree = Tree::new();
        let mut reg = PathRegistry::new();
        for key in ["/a/", "/a/b/", "/a/b/c/", "/ab/"] {
            reg.insert(key, tree.root(), true);
        }
        reg.remove_below("/a/");
        assert!(reg.get("/a/").is_some());
        assert!(reg.get("/a/b/").is_none());
        assert!(reg.get("/a/b/c/").is_none());
        assert!(reg.get("/ab/").is_some());
    }

    #[test]
    fn stale_entries_do_not_resolve() {
        let mut tree = Tree::new();
        let root = tree.root();
        let a = tree.add_directory(root, Directory::new("A", DirType::Normal));
        let mut reg = PathRegistry::new();
        reg.insert("/a/", a, true);
        assert_eq!(reg.lookup(&tree, "/a/"), Some(a));
        tree.remove_directory(a);
        assert_eq!(reg.lookup(&tree, "/a/"), None);
    }

    #[test]
    fn unvisited_base_merges() {
        let mut tree = Tree::new();
        let mut reg = PathRegistry::new();
        let root = tree.root();
        let a = tree.add_directory(root, Directory::new("A", DirType::IncompleteWithChildren));
        reg.insert("/a/", a, false);
        assert!(!prepare_partial(&mut tree, &mut reg, &path("/A/"), false));
        assert!(tree.contains(a));
    }

    #[test]
    fn visited_base_is_cleared() {
        let mut tree = Tree::new();
        let mut reg = PathRegistry::new();
        let root = tree.root();
        let a = tree.add_directory(root, Directory::new("A", DirType::Normal));
        let b = tree.add_directory(a, Directory::new("B", DirType::Normal));
        tree.add_file(a, File::new("f", 1, Tth::default()));
        reg.insert("/a/", a, true);
        reg.insert("/a/b/", b, true);

        assert!(prepare_partial(&mut tree, &mut reg, &path("/A/"), false));
        assert!(tree.contains(a));
        assert!(!tree.contains(b));
        assert_eq!(tree[a].file_count(), 0);
        assert!(reg.get("/a/b/").is_none());
        assert!(reg.get("/a/").is_some());
    }

    #[test]
    fn reload_all_resets_everything() {
        let mut tree = Tree::new();
        let mut reg = PathRegistry::new();
        let root = tree.root();
        let a = tree.add_directory(root, Directory::new("A", DirType::Normal));
        reg.insert("/a/", a, true);
        assert!(prepare_partial(&mut tree, &mut reg, &ListPath::root(), true));
        assert!(reg.is_empty());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[root].dir_type(), DirType::IncompleteWithChildren);
    }
}
