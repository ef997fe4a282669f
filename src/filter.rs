use std::collections::HashSet;

use crate::hash::Tth;
use crate::tree::DirId;
use crate::tree::Tree;

/// Removes from `id` every file whose hash is in `hashes`, bottom-up.
///
/// Directories left without files and subdirectories are removed as well,
/// which cascades towards `id`. When `skip_below` is set, directories left
/// with fewer than two files also lose the files smaller than that many
/// bytes.
pub fn filter_list(tree: &mut Tree, id: DirId, hashes: &HashSet<Tth>, skip_below: Option<u64>) {
    let children = tree[id].directories().to_vec();
    for child in children {
        filter_list(tree, child, hashes, skip_below);
    }

    tree.remove_children_where(id, |tree, child| {
        let d = &tree[child];
        d.file_count() + d.directories().len() == 0
    });

    let files = tree[id].files_mut();
    files.retain(|f| !hashes.contains(&f.tth));
    if let Some(limit) = skip_below {
        if files.len() < 2 {
            files.retain(|f| f.size >= limit);
        }
    }
}

/// Filters `subject` against every hash of `reference`.
pub fn diff(subject: &mut Tree, reference: &Tree, skip_below: Option<u64>) {
    let hashes = reference.hash_set(reference.root());
    let root = subject.root();
    filter_list(subject, root, &hashes, skip_below);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DirType;
    use crate::tree::Directory;
    use crate::tree::File;

    fn tth(n: u8) -> Tth {
        Tth::from_bytes([n; 24])
    }

    fn subject() -> (Tree, DirId, DirId) {
        let mut tree = Tree::new();
        let root = tree.root();
        let a = tree.add_directory(root, Directory::new("A", DirType::Normal));
        tree.add_file(a, File::new("f1", 10, tth(1)));
        let b = tree.add_directory(a, Directory::new("B", DirType::Normal));
        tree.add_file(b, File::new("f2", 20, tth(2)));
        (tree, a, b)
    }

    #[test]
    fn emptied_directories_cascade() {
        let (mut tree, a, b) = subject();
        let hashes: HashSet<_> = [tth(1), tth(2)].into();
        let root = tree.root();
        filter_list(&mut tree, root, &hashes, None);
        assert!(!tree.contains(a));
        assert!(!tree.contains(b));
        assert!(tree[root].directories().is_empty());
        assert_eq!(tree[root].file_count(), 0);
    }

    #[test]
    fn unrelated_content_survives() {
        let (mut tree, a, b) = subject();
        let hashes: HashSet<_> = [tth(2)].into();
        let root = tree.root();
        filter_list(&mut tree, root, &hashes, None);
        assert!(tree.contains(a));
        assert!(!tree.contains(b));
        assert_eq!(tree[a].file_count(), 1);
    }

    #[test]
    fn small_stragglers_are_dropped() {
        let mut tree = Tree::new();
        let root = tree.root();
        let lone = tree.add_directory(root, Directory::new("lone", DirType::Normal));
        tree.add_file(lone, File::new("big", 10_000, tth(1)));
        tree.add_file(lone, File::new("small.nfo", 100, tth(2)));
        let many = tree.add_directory(root, Directory::new("many", DirType::Normal));
        tree.add_file(many, File::new("a", 100, tth(3)));
        tree.add_file(many, File::new("b", 100, tth(4)));

        let hashes: HashSet<_> = [tth(1)].into();
        filter_list(&mut tree, root, &hashes, Some(1024));
        // the small straggler goes, then the emptied directory
        assert!(!tree.contains(lone));
        assert_eq!(tree[many].file_count(), 2);
    }

    #[test]
    fn diff_against_superset_empties_root() {
        let (mut tree, _, _) = subject();
        let (reference, _, _) = subject();
        diff(&mut tree, &reference, None);
        let root = tree.root();
        assert_eq!(tree[root].file_count(), 0);
        assert!(tree[root].directories().is_empty());
    }
}
