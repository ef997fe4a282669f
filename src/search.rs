use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::config::ListingSettings;
use crate::errors::Error;
use crate::path::ListPath;
use crate::tree::DirId;
use crate::tree::Tree;

/// How the size of a query is compared.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SizeMode {
    /// Any size matches.
    #[default]
    DontCare,
    /// Size must be at least the query size.
    AtLeast,
    /// Size must be at most the query size.
    AtMost,
    /// Size must equal the query size.
    Exact,
}

/// Kind of entries a query matches.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemType {
    /// Files and directories.
    #[default]
    Any,
    /// Files only.
    File,
    /// Directories only.
    Directory,
}

/// A name search.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    /// Lowercase terms that must all appear in the name.
    pub include: Vec<String>,
    /// Lowercase terms that must not appear in the name.
    pub exclude: Vec<String>,
    /// Lowercase file extensions without the dot. Empty means any.
    pub extensions: Vec<String>,
    /// Size to compare against.
    pub size: u64,
    /// Size comparison.
    pub size_mode: SizeMode,
    /// Kind of matched entries.
    pub item_type: ItemType,
    /// Local searches stop once this many paths were collected.
    pub max_results: usize,
}

impl SearchQuery {
    /// Parses a whitespace separated pattern. Terms starting with `-` are
    /// exclusions.
    pub fn new(pattern: &str) -> Self {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for term in pattern.split_whitespace() {
            match term.strip_prefix('-') {
                Some(t) if !t.is_empty() => exclude.push(t.to_lowercase()),
                _ => include.push(term.to_lowercase()),
            }
        }
        Self {
            include,
            exclude,
            extensions: Vec::new(),
            size: 0,
            size_mode: SizeMode::DontCare,
            item_type: ItemType::Any,
            max_results: 100,
        }
    }

    /// Restricts the size.
    pub fn with_size(mut self, size: u64, mode: SizeMode) -> Self {
        self.size = size;
        self.size_mode = mode;
        self
    }

    /// Restricts file matches to these extensions.
    pub fn with_extensions<S: AsRef<str>>(mut self, extensions: &[S]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Restricts the kind of matched entries.
    pub fn with_item_type(mut self, item_type: ItemType) -> Self {
        self.item_type = item_type;
        self
    }

    /// Caps the number of collected paths.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn matches_name(&self, name: &str) -> bool {
        if self.include.is_empty() && self.extensions.is_empty() {
            return false;
        }
        let lower = name.to_lowercase();
        self.include.iter().all(|t| lower.contains(t.as_str()))
            && !self.exclude.iter().any(|t| lower.contains(t.as_str()))
    }

    fn matches_extension(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match name.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }

    /// Returns true when `size` satisfies the size filter.
    pub fn matches_size(&self, size: u64) -> bool {
        match self.size_mode {
            SizeMode::DontCare => true,
            SizeMode::AtLeast => size >= self.size,
            SizeMode::AtMost => size <= self.size,
            SizeMode::Exact => size == self.size,
        }
    }

    /// Returns true when a directory called `name` matches. Queries with
    /// extensions only match files.
    pub fn matches_directory(&self, name: &str) -> bool {
        self.item_type != ItemType::File && self.extensions.is_empty() && self.matches_name(name)
    }

    /// Returns true when a file matches.
    pub fn matches_file(&self, name: &str, size: u64) -> bool {
        self.item_type != ItemType::Directory
            && self.matches_name(name)
            && self.matches_extension(name)
            && self.matches_size(size)
    }
}

/// Collects into `results` the directories below `id` that hold a match.
///
/// A matching directory contributes its parent's path, a matching file the
/// path of its directory. Synthetic directories are skipped.
pub fn search_tree(tree: &Tree, id: DirId, query: &SearchQuery, results: &mut BTreeSet<ListPath>) {
    let dir = &tree[id];
    if dir.is_adls() {
        return;
    }

    if query.matches_directory(dir.name()) {
        let path = dir
            .parent()
            .map(|p| tree.get_path(p))
            .unwrap_or_default();
        if !results.contains(&path) && query.matches_size(tree.total_size(id, false)) {
            results.insert(path);
        }
    }

    if dir.files().iter().any(|f| query.matches_file(&f.name, f.size)) {
        results.insert(tree.get_path(id));
    }

    for child in dir.directories() {
        search_tree(tree, *child, query, results);
        if results.len() >= query.max_results {
            return;
        }
    }
}

/// Peer side of a listing: presence and the direct search transport.
pub trait PeerClient: Send + Sync {
    /// Display name of the peer.
    fn nick(&self) -> String;

    /// Returns true while the peer is connected.
    fn is_online(&self) -> bool;

    /// Returns true when the peer can search its own share on request.
    fn supports_direct_search(&self) -> bool;

    /// Sends `query` restricted to `dir` and returns the token that tags the
    /// results.
    fn send_search(&self, query: &SearchQuery, dir: &ListPath) -> Result<String, Error>;
}

/// Why a distributed search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEnd {
    /// The expected result count was reached or results stopped arriving.
    Converged,
    /// Nothing arrived within the idle window.
    TimedOut,
}

/// Collects the results of one distributed search.
#[derive(Debug)]
pub struct SearchAggregator {
    token: String,
    results: BTreeSet<ListPath>,
    expected: Option<usize>,
    last_result: Instant,
    idle_timeout: Duration,
    result_idle: Duration,
    ended: bool,
}

impl SearchAggregator {
    /// Starts collecting results tagged with `token` at `now`.
    pub fn new(token: impl Into<String>, settings: &ListingSettings, now: Instant) -> Self {
        Self {
            token: token.into(),
            results: BTreeSet::new(),
            expected: None,
            last_result: now,
            idle_timeout: settings.search_idle_timeout(),
            result_idle: settings.search_result_idle(),
            ended: false,
        }
    }

    /// Token of the search.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Collected paths.
    pub fn results(&self) -> &BTreeSet<ListPath> {
        &self.results
    }

    /// Consumes the aggregator, returning the collected paths.
    pub fn into_results(self) -> BTreeSet<ListPath> {
        self.results
    }

    /// Returns true once an end was reported.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn finish(&mut self, end: SearchEnd) -> Option<SearchEnd> {
        self.ended = true;
        Some(end)
    }

    fn expected_reached(&self) -> bool {
        self.expected == Some(self.results.len())
    }

    /// Records a hit. Hits with a foreign token or arriving after the end
    /// are ignored.
    pub fn add_result(&mut self, token: &str, path: ListPath, now: Instant) -> Option<SearchEnd> {
        if self.ended || token != self.token {
            return None;
        }
        self.last_result = now;
        self.results.insert(path);
        if self.expected_reached() {
            return self.finish(SearchEnd::Converged);
        }
        None
    }

    /// Records the result count announced by the peer.
    pub fn set_expected(&mut self, token: &str, count: usize) -> Option<SearchEnd> {
        if self.ended || token != self.token {
            return None;
        }
        self.expected = Some(count);
        if self.expected_reached() {
            return self.finish(SearchEnd::Converged);
        }
        None
    }

    /// Convergence check, called periodically.
    pub fn tick(&mut self, now: Instant) -> Option<SearchEnd> {
        if self.ended {
            return None;
        }
        let idle = now.saturating_duration_since(self.last_result);
        if self.results.is_empty() {
            if idle > self.idle_timeout {
                return self.finish(SearchEnd::TimedOut);
            }
        } else if idle > self.result_idle {
            return self.finish(SearchEnd::Converged);
        }
        None
    }
}

/// Position inside the ordered result set of the last search.
#[derive(Debug, Default, Clone)]
pub struct SearchCursor {
    results: Vec<ListPath>,
    pos: usize,
}

impl SearchCursor {
    /// Places the cursor on the first result.
    pub fn new(results: BTreeSet<ListPath>) -> Self {
        Self {
            results: results.into_iter().collect(),
            pos: 0,
        }
    }

    /// Returns true when there are no results.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// All results in order.
    pub fn results(&self) -> &[ListPath] {
        &self.results
    }

    /// The selected result.
    pub fn current(&self) -> Option<&ListPath> {
        self.results.get(self.pos)
    }

    /// Moves one step and returns the new selection, `None` at either end.
    pub fn step(&mut self, prev: bool) -> Option<&ListPath> {
        if prev {
            if self.pos == 0 {
                return None;
            }
            self.pos -= 1;
        } else {
            if self.pos + 1 >= self.results.len() {
                return None;
            }
            self.pos += 1;
        }
        self.results.get(self.pos)
    }

    /// Returns true when `path` is the selected result.
    pub fn is_current(&self, path: &ListPath) -> bool {
        self.current() == Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Tth;
    use crate::tree::DirType;
    use crate::tree::Directory;
    use crate::tree::File;

    fn path(s: &str) -> ListPath {
        ListPath::from_adc(s).unwrap()
    }

    fn sample() -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree[root].set_complete();
        let a = tree.add_directory(root, Directory::new("A", DirType::Normal));
        tree.add_file(a, File::new("f1", 10, Tth::default()));
        tree.add_file(a, File::new("f1.nfo", 1, Tth::default()));
        let b = tree.add_directory(a, Directory::new("B", DirType::Normal));
        tree.add_file(b, File::new("f2", 20, Tth::default()));
        tree
    }

    #[test]
    fn file_match_records_its_directory() {
        let tree = sample();
        let mut results = BTreeSet::new();
        search_tree(&tree, tree.root(), &SearchQuery::new("f1"), &mut results);
        assert_eq!(results.into_iter().collect::<Vec<_>>(), [path("/A/")]);
    }

    #[test]
    fn directory_match_records_its_parent() {
        let tree = sample();
        let mut results = BTreeSet::new();
        search_tree(&tree, tree.root(), &SearchQuery::new("b"), &mut results);
        assert_eq!(results.into_iter().collect::<Vec<_>>(), [path("/A/")]);
    }

    #[test]
    fn results_are_unique_and_capped() {
        let mut tree = Tree::new();
        let root = tree.root();
        for i in 0..10 {
            let d = tree.add_directory(root, Directory::new(format!("dir{i}"), DirType::Normal));
            tree.add_file(d, File::new("match", 1, Tth::default()));
            tree.add_file(d, File::new("match again", 1, Tth::default()));
        }
        let mut results = BTreeSet::new();
        let query = SearchQuery::new("match").with_max_results(3);
        search_tree(&tree, root, &query, &mut results);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn query_filters() {
        let q = SearchQuery::new("f1 -nfo");
        assert!(q.matches_file("f1.mkv", 1));
        assert!(!q.matches_file("f1.nfo", 1));

        let q = SearchQuery::new("").with_extensions(&[".NFO"]);
        assert!(q.matches_file("readme.nfo", 1));
        assert!(!q.matches_file("readme.txt", 1));
        assert!(!q.matches_directory("nfo"));

        let q = SearchQuery::new("x").with_size(10, SizeMode::AtLeast);
        assert!(q.matches_file("x", 10));
        assert!(!q.matches_file("x", 9));

        let q = SearchQuery::new("x").with_item_type(ItemType::Directory);
        assert!(!q.matches_file("x", 1));
        assert!(q.matches_directory("x"));
    }

    #[test]
    fn expected_count_ends_immediately() {
        let start = Instant::now();
        let mut agg = SearchAggregator::new("t", &ListingSettings::default(), start);
        assert_eq!(agg.set_expected("t", 3), None);
        assert_eq!(agg.add_result("t", path("/a/"), start), None);
        assert_eq!(agg.add_result("other", path("/x/"), start), None);
        assert_eq!(agg.add_result("t", path("/b/"), start), None);
        assert_eq!(
            agg.add_result("t", path("/c/"), start),
            Some(SearchEnd::Converged)
        );
        assert!(agg.is_ended());
        assert_eq!(agg.results().len(), 3);
    }

    #[test]
    fn silent_peer_times_out() {
        let start = Instant::now();
        let mut agg = SearchAggregator::new("t", &ListingSettings::default(), start);
        assert_eq!(agg.tick(start + Duration::from_millis(4000)), None);
        assert_eq!(agg.tick(start + Duration::from_millis(5000)), None);
        assert_eq!(
            agg.tick(start + Duration::from_millis(5001)),
            Some(SearchEnd::TimedOut)
        );
        assert_eq!(agg.tick(start + Duration::from_millis(9000)), None);
    }

    #[test]
    fn results_converge_after_short_idle() {
        let start = Instant::now();
        let mut agg = SearchAggregator::new("t", &ListingSettings::default(), start);
        let hit = start + Duration::from_millis(3000);
        agg.add_result("t", path("/a/"), hit);
        assert_eq!(agg.tick(hit + Duration::from_millis(900)), None);
        assert_eq!(
            agg.tick(hit + Duration::from_millis(1100)),
            Some(SearchEnd::Converged)
        );
    }

    #[test]
    fn cursor_steps_both_ways() {
        let set: BTreeSet<_> = [path("/a/"), path("/b/"), path("/c/")].into();
        let mut cursor = SearchCursor::new(set);
        assert!(cursor.is_current(&path("/a/")));
        assert_eq!(cursor.step(true), None);
        assert_eq!(cursor.step(false), Some(&path("/b/")));
        assert_eq!(cursor.step(false), Some(&path("/c/")));
        assert_eq!(cursor.step(false), None);
        assert_eq!(cursor.step(true), Some(&path("/b/")));
    }
}
