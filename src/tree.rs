use std::collections::HashSet;
use std::ops::Index;
use std::ops::IndexMut;

use chrono::DateTime;
use chrono::Utc;
#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::dupe::DupeType;
use crate::errors::Error;
use crate::hash::Tth;
use crate::path::ListPath;
use crate::path::is_valid_component;

/// Handle of a directory inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId {
    index: u32,
    generation: u32,
}

/// How much of a directory's content is known.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum DirType {
    /// Content is exact and fully loaded.
    Normal,
    /// Content was not sent and the peer reported no subdirectories.
    #[default]
    IncompleteNoChildren,
    /// Content was not sent but the peer reported subdirectories.
    IncompleteWithChildren,
}

impl DirType {
    /// Completeness as declared by the `Incomplete` and `Children` attributes.
    pub fn from_flags(incomplete: bool, children: bool) -> Self {
        match (incomplete, children) {
            (false, _) => DirType::Normal,
            (true, true) => DirType::IncompleteWithChildren,
            (true, false) => DirType::IncompleteNoChildren,
        }
    }
}

/// A file entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Content hash. Empty when the peer runs in compatibility mode.
    pub tth: Tth,
    /// Modification date reported by the peer.
    pub remote_date: Option<DateTime<Utc>>,
    /// Classification against local content.
    pub dupe: DupeType,
    /// Directory the file really lives in when this is a synthetic copy.
    pub adls_source: Option<ListPath>,
}

impl File {
    /// Creates a regular file entry.
    pub fn new(name: impl Into<String>, size: u64, tth: Tth) -> Self {
        Self {
            name: name.into(),
            size,
            tth,
            remote_date: None,
            dupe: DupeType::None,
            adls_source: None,
        }
    }

    /// Returns true for copies made by the synthetic-directory rules.
    pub fn is_adls(&self) -> bool {
        self.adls_source.is_some()
    }
}

/// A directory node. Created through [`Tree::add_directory`].
#[derive(Debug, Clone)]
pub struct Directory {
    name: String,
    parent: Option<DirId>,
    directories: Vec<DirId>,
    files: Vec<File>,
    dir_type: DirType,
    partial_size: u64,
    remote_date: Option<DateTime<Utc>>,
    update_date: Option<DateTime<Utc>>,
    loading: bool,
    dupe: DupeType,
    adls_source: Option<ListPath>,
}

impl Directory {
    /// Creates a detached directory.
    pub fn new(name: impl Into<String>, dir_type: DirType) -> Self {
        Self {
            name: name.into(),
            parent: None,
            directories: Vec::new(),
            files: Vec::new(),
            dir_type,
            partial_size: 0,
            remote_date: None,
            update_date: None,
            loading: false,
            dupe: DupeType::None,
            adls_source: None,
        }
    }

    /// Sets the size estimate sent for an incomplete directory.
    pub fn with_partial_size(mut self, size: u64) -> Self {
        self.partial_size = size;
        self
    }

    /// Sets the remote date.
    pub fn with_remote_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        self.remote_date = date;
        self
    }

    /// Sets the local fetch date.
    pub fn with_update_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        self.update_date = date;
        self
    }

    /// Marks the directory as synthetic, mirroring the directory at `source`.
    pub fn with_adls_source(mut self, source: ListPath) -> Self {
        self.adls_source = Some(source);
        self
    }

    /// Directory name (a single path segment; empty for the root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent directory, `None` for the root.
    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }

    /// Child directories in insertion order (see [`Tree::sort_children`]).
    pub fn directories(&self) -> &[DirId] {
        &self.directories
    }

    /// Files of this directory.
    pub fn files(&self) -> &[File] {
        &self.files
    }

    /// Mutable access to the files.
    pub fn files_mut(&mut self) -> &mut Vec<File> {
        &mut self.files
    }

    /// Completeness state.
    pub fn dir_type(&self) -> DirType {
        self.dir_type
    }

    /// Returns true when the content is exact.
    pub fn is_complete(&self) -> bool {
        self.dir_type == DirType::Normal
    }

    /// Size estimate sent by the peer for an incomplete directory.
    pub fn partial_size(&self) -> u64 {
        self.partial_size
    }

    /// Modification date reported by the peer.
    pub fn remote_date(&self) -> Option<DateTime<Utc>> {
        self.remote_date
    }

    /// When the content was last fetched.
    pub fn update_date(&self) -> Option<DateTime<Utc>> {
        self.update_date
    }

    /// Returns true while a fetch for this directory is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Classification against local content.
    pub fn dupe(&self) -> DupeType {
        self.dupe
    }

    /// Returns true for directories made by the synthetic-directory rules.
    pub fn is_adls(&self) -> bool {
        self.adls_source.is_some()
    }

    /// Real location of a synthetic directory.
    pub fn adls_source(&self) -> Option<&ListPath> {
        self.adls_source.as_ref()
    }

    /// Number of own files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of own file sizes.
    pub fn files_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Marks the content as exact.
    pub fn set_complete(&mut self) {
        self.dir_type = DirType::Normal;
    }

    /// Replaces the completeness state.
    pub fn set_type(&mut self, dir_type: DirType) {
        self.dir_type = dir_type;
    }

    /// Updates the remote date.
    pub fn set_remote_date(&mut self, date: Option<DateTime<Utc>>) {
        self.remote_date = date;
    }

    /// Updates the fetch date.
    pub fn set_update_date(&mut self, date: Option<DateTime<Utc>>) {
        self.update_date = date;
    }

    /// Flags an in-flight fetch.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// Sets the dupe classification.
    pub fn set_dupe(&mut self, dupe: DupeType) {
        self.dupe = dupe;
    }
}

struct Slot {
    generation: u32,
    dir: Option<Directory>,
}

/// Arena holding every directory of one listing.
///
/// Each directory owns its child list and its files; the parent link is a
/// plain id used to rebuild paths and is never followed to free anything.
/// Ids carry a generation so an id that survived the removal of its
/// directory resolves to `None` instead of to a recycled slot.
pub struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: DirId,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Creates a tree with an empty, incomplete root.
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: DirId {
                index: 0,
                generation: 0,
            },
        };
        tree.root = tree.alloc(Directory::new("", DirType::IncompleteNoChildren));
        tree
    }

    fn alloc(&mut self, dir: Directory) -> DirId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.dir = Some(dir);
            DirId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                dir: Some(dir),
            });
            DirId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// The root directory.
    pub fn root(&self) -> DirId {
        self.root
    }

    /// Number of live directories, root included.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Returns true when only the root exists and it has no files.
    pub fn is_empty(&self) -> bool {
        self.len() == 1 && self[self.root].files.is_empty()
    }

    /// Resolves an id; `None` when the directory was removed.
    pub fn get(&self, id: DirId) -> Option<&Directory> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dir.as_ref())
    }

    /// Mutable variant of [`Tree::get`].
    pub fn get_mut(&mut self, id: DirId) -> Option<&mut Directory> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dir.as_mut())
    }

    /// Returns true while `id` refers to a live directory.
    pub fn contains(&self, id: DirId) -> bool {
        self.get(id).is_some()
    }

    /// Appends `dir` as the last child of `parent`.
    ///
    /// The name must be a single path segment: not empty, not `.` or `..`
    /// and without `/` or `\`. Loaders drop entries that break this.
    pub fn add_directory(&mut self, parent: DirId, mut dir: Directory) -> DirId {
        debug_assert!(is_valid_component(&dir.name), "{}", dir.name);
        dir.parent = Some(parent);
        let id = self.alloc(dir);
        self[parent].directories.push(id);
        id
    }

    /// Makes room for `dirs` more directories, and `files` more files in
    /// `dir`, failing with [`Error::OutOfMemory`] instead of aborting.
    pub fn try_reserve(&mut self, dir: DirId, dirs: usize, files: usize) -> Result<(), Error> {
        self.slots.try_reserve(dirs)?;
        self[dir].directories.try_reserve(dirs)?;
        self[dir].files.try_reserve(files)?;
        Ok(())
    }

    /// Appends a file to `dir`.
    pub fn add_file(&mut self, dir: DirId, file: File) {
        self[dir].files.push(file);
    }

    /// Detaches `id` from its parent and frees the whole subtree. The root
    /// cannot be removed.
    pub fn remove_directory(&mut self, id: DirId) {
        if id == self.root || !self.contains(id) {
            return;
        }
        if let Some(parent) = self[id].parent {
            self[parent].directories.retain(|d| *d != id);
        }
        self.free_subtree(id);
    }

    fn free_subtree(&mut self, id: DirId) {
        let children = std::mem::take(&mut self[id].directories);
        for child in children {
            self.free_subtree(child);
        }
        let slot = &mut self.slots[id.index as usize];
        slot.dir = None;
        self.free.push(id.index);
    }

    /// Drops every child directory and file of `id`, keeping `id` itself.
    pub fn clear_all(&mut self, id: DirId) {
        let children = std::mem::take(&mut self[id].directories);
        for child in children {
            self.free_subtree(child);
        }
        self[id].files.clear();
    }

    /// Removes `id`'s children for which `pred` returns true.
    pub fn remove_children_where<F>(&mut self, id: DirId, mut pred: F)
    where
        F: FnMut(&Tree, DirId) -> bool,
    {
        let children = self[id].directories.clone();
        for child in children {
            if pred(self, child) {
                self.remove_directory(child);
            }
        }
    }

    /// Removes synthetic child directories of `id`.
    pub fn clear_adls(&mut self, id: DirId) {
        self.remove_children_where(id, |tree, child| tree[child].is_adls());
    }

    /// Path from the root to `id`.
    pub fn get_path(&self, id: DirId) -> ListPath {
        let mut names = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let Some(dir) = self.get(c) else { break };
            if dir.parent.is_some() {
                names.push(dir.name.as_str());
            }
            cur = dir.parent;
        }
        names.reverse();
        ListPath::from_tree_names(&names)
    }

    /// Child of `parent` named `name`, compared case-insensitively.
    pub fn find_child(&self, parent: DirId, name: &str) -> Option<DirId> {
        let lower = name.to_lowercase();
        self.get(parent)?
            .directories
            .iter()
            .copied()
            .find(|d| self[*d].name.to_lowercase() == lower)
    }

    /// Child of `parent` named exactly `name`.
    pub fn find_child_exact(&self, parent: DirId, name: &str) -> Option<DirId> {
        self.get(parent)?
            .directories
            .iter()
            .copied()
            .find(|d| self[*d].name == name)
    }

    /// Descends from `from` one segment at a time.
    pub fn find_directory_from(&self, path: &ListPath, from: DirId) -> Option<DirId> {
        let mut cur = from;
        for comp in path.components() {
            cur = self.find_child(cur, comp)?;
        }
        Some(cur)
    }

    /// Descends from the root.
    pub fn find_directory(&self, path: &ListPath) -> Option<DirId> {
        self.find_directory_from(path, self.root)
    }

    /// Aggregate size of `id`.
    ///
    /// Incomplete directories report the peer's estimate. Synthetic subtrees
    /// count only when `include_adls` is set or when the walk already started
    /// inside one.
    pub fn total_size(&self, id: DirId, include_adls: bool) -> u64 {
        let dir = &self[id];
        if !dir.is_complete() {
            return dir.partial_size;
        }
        if !include_adls && dir.is_adls() {
            return 0;
        }
        let mut x = dir.files_size();
        for d in &dir.directories {
            if !include_adls && self[*d].is_adls() {
                continue;
            }
            x += self.total_size(*d, dir.is_adls());
        }
        x
    }

    /// Recursive file count of `id`, with the same synthetic rules as
    /// [`Tree::total_size`].
    pub fn total_file_count(&self, id: DirId, include_adls: bool) -> usize {
        let dir = &self[id];
        if !include_adls && dir.is_adls() {
            return 0;
        }
        let mut x = dir.file_count();
        for d in &dir.directories {
            if !include_adls && self[*d].is_adls() {
                continue;
            }
            x += self.total_file_count(*d, dir.is_adls());
        }
        x
    }

    /// Returns true when `id` or anything below it is incomplete.
    pub fn find_incomplete(&self, id: DirId) -> bool {
        let dir = &self[id];
        !dir.is_complete() || dir.directories.iter().any(|d| self.find_incomplete(*d))
    }

    /// Orders child directories and files of `id` by case-insensitive name.
    pub fn sort_children(&mut self, id: DirId) {
        let mut dirs = std::mem::take(&mut self[id].directories);
        dirs.sort_by_cached_key(|d| self[*d].name.to_lowercase());
        let dir = &mut self[id];
        dir.directories = dirs;
        dir.files.sort_by_cached_key(|f| f.name.to_lowercase());
    }

    /// Collects every content hash below `id`.
    pub fn hash_set(&self, id: DirId) -> HashSet<Tth> {
        let mut set = HashSet::new();
        self.collect_hashes(id, &mut set);
        set
    }

    fn collect_hashes(&self, id: DirId, set: &mut HashSet<Tth>) {
        let dir = &self[id];
        for d in &dir.directories {
            self.collect_hashes(*d, set);
        }
        set.extend(dir.files.iter().map(|f| f.tth));
    }

    /// Visits `id` and every directory below it, parents first.
    pub fn walk<F>(&self, id: DirId, f: &mut F)
    where
        F: FnMut(DirId, &Directory),
    {
        let dir = &self[id];
        f(id, dir);
        for d in &dir.directories {
            self.walk(*d, f);
        }
    }
}

impl Index<DirId> for Tree {
    type Output = Directory;

    /// Panics on a stale id; use [`Tree::get`] for ids of unknown liveness.
    fn index(&self, id: DirId) -> &Directory {
        match self.get(id) {
            Some(dir) => dir,
            None => panic!("stale directory id {id:?}"),
        }
    }
}

impl IndexMut<DirId> for Tree {
    fn index_mut(&mut self, id: DirId) -> &mut Directory {
        match self.get_mut(id) {
            Some(dir) => dir,
            None => panic!("stale directory id {id:?}"),
        }
    }
}
