use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use quick_xml::escape::escape;

use crate::bundle::BundleFileInfo;
use crate::bundle::ListRequest;
use crate::bundle::QueueManager;
use crate::bundle::QueueMatch;
use crate::dupe::DupeIndex;
use crate::dupe::DupeType;
use crate::errors::Error;
use crate::hash::TTH_BYTES;
use crate::hash::Tth;
use crate::path::ListPath;
use crate::search::PeerClient;
use crate::search::SearchQuery;
use crate::tree::Tree;

/// Deterministic, non-empty hash number `n`.
pub fn tth_for(n: u64) -> Tth {
    let mut bytes = [0u8; TTH_BYTES];
    bytes[..8].copy_from_slice(&(n + 1).to_be_bytes());
    bytes[TTH_BYTES - 1] = 0xa5;
    Tth::from_bytes(bytes)
}

/// Builder of file list documents.
///
/// Directories opened with [`TestListing::dir`] are closed by
/// [`TestListing::end`]; whatever is still open when the document is
/// rendered gets closed automatically. Files get distinct hashes unless one
/// is given explicitly.
#[derive(Debug, Clone)]
pub struct TestListing {
    base: String,
    base_date: Option<i64>,
    body: String,
    depth: usize,
    next_tth: u64,
}

impl TestListing {
    /// A document whose `Base` is `base` (network notation).
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            base_date: None,
            body: String::new(),
            depth: 0,
            next_tth: 0,
        }
    }

    /// Sets the `BaseDate` attribute, in seconds since the epoch.
    pub fn base_date(mut self, secs: i64) -> Self {
        self.base_date = Some(secs);
        self
    }

    fn indent(&mut self) {
        for _ in 0..=self.depth {
            self.body.push('\t');
        }
    }

    /// Opens a complete directory.
    pub fn dir(mut self, name: &str) -> Self {
        self.indent();
        let _ = writeln!(self.body, "<Directory Name=\"{}\">", escape(name));
        self.depth += 1;
        self
    }

    /// Opens a complete directory with a `Date` attribute.
    pub fn dated_dir(mut self, name: &str, secs: i64) -> Self {
        self.indent();
        let _ = writeln!(
            self.body,
            "<Directory Name=\"{}\" Date=\"{secs}\">",
            escape(name)
        );
        self.depth += 1;
        self
    }

    /// Closes the innermost open directory.
    pub fn end(mut self) -> Self {
        if self.depth > 0 {
            self.depth -= 1;
            self.indent();
            self.body.push_str("</Directory>\n");
        }
        self
    }

    /// Adds a directory whose content was not sent.
    pub fn incomplete_dir(mut self, name: &str, size: u64, children: bool) -> Self {
        self.indent();
        let children = if children { " Children=\"1\"" } else { "" };
        let _ = writeln!(
            self.body,
            "<Directory Name=\"{}\" Incomplete=\"1\"{children} Size=\"{size}\"/>",
            escape(name)
        );
        self
    }

    /// Adds a file with the next generated hash.
    pub fn file(mut self, name: &str, size: u64) -> Self {
        let tth = tth_for(self.next_tth);
        self.next_tth += 1;
        self.file_with_tth(name, size, &tth)
    }

    /// Adds a file with the given hash.
    pub fn file_with_tth(mut self, name: &str, size: u64, tth: &Tth) -> Self {
        self.indent();
        let _ = writeln!(
            self.body,
            "<File Name=\"{}\" Size=\"{size}\" TTH=\"{tth}\"/>",
            escape(name)
        );
        self
    }

    /// Renders the document.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
        let _ = write!(
            out,
            "<FileListing Version=\"1\" Base=\"{}\" Generator=\"test\"",
            escape(&self.base)
        );
        if let Some(date) = self.base_date {
            let _ = write!(out, " BaseDate=\"{date}\"");
        }
        out.push_str(">\n");
        out.push_str(&self.body);
        for depth in (0..self.depth).rev() {
            for _ in 0..=depth {
                out.push('\t');
            }
            out.push_str("</Directory>\n");
        }
        out.push_str("</FileListing>\n");
        out
    }
}

/// In-memory share and queue index.
#[derive(Debug, Default)]
pub struct MockDupeIndex {
    files: HashMap<Tth, DupeType>,
    directories: HashMap<String, DupeType>,
}

impl MockDupeIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies content `tth` as `dupe`.
    pub fn with_file(mut self, tth: Tth, dupe: DupeType) -> Self {
        self.files.insert(tth, dupe);
        self
    }

    /// Classifies the directory at `path` as `dupe`.
    pub fn with_directory(mut self, path: &ListPath, dupe: DupeType) -> Self {
        self.directories.insert(path.registry_key(), dupe);
        self
    }
}

impl DupeIndex for MockDupeIndex {
    fn lookup(&self, tth: &Tth) -> DupeType {
        self.files.get(tth).copied().unwrap_or_default()
    }

    fn lookup_directory(&self, path: &ListPath, _size: u64) -> DupeType {
        self.directories
            .get(&path.registry_key())
            .copied()
            .unwrap_or_default()
    }
}

/// A created bundle: target and files.
pub type QueuedBundle = (String, Vec<BundleFileInfo>);

#[derive(Debug, Default)]
struct QueueLog {
    bundles: Vec<QueuedBundle>,
    list_requests: Vec<(ListPath, ListRequest)>,
    opened: Vec<BundleFileInfo>,
    failure: Option<String>,
    match_result: QueueMatch,
}

/// Download queue that records what it is asked to do.
#[derive(Debug, Default)]
pub struct MockQueue {
    log: Mutex<QueueLog>,
}

impl MockQueue {
    fn log(&self) -> std::sync::MutexGuard<'_, QueueLog> {
        self.log.lock().unwrap()
    }

    /// Makes every following request fail with [`Error::Queue`].
    pub fn fail_with(&self, reason: &str) {
        self.log().failure = Some(reason.to_string());
    }

    /// Undoes [`MockQueue::fail_with`].
    pub fn succeed(&self) {
        self.log().failure = None;
    }

    /// Result returned by [`QueueManager::match_listing`].
    pub fn set_match_result(&self, result: QueueMatch) {
        self.log().match_result = result;
    }

    /// Bundles created so far.
    pub fn bundles(&self) -> Vec<QueuedBundle> {
        self.log().bundles.clone()
    }

    /// List requests received so far.
    pub fn list_requests(&self) -> Vec<(ListPath, ListRequest)> {
        self.log().list_requests.clone()
    }

    /// Files opened so far.
    pub fn opened(&self) -> Vec<BundleFileInfo> {
        self.log().opened.clone()
    }

    fn check(&self) -> Result<(), Error> {
        match &self.log().failure {
            Some(reason) => Err(Error::Queue(reason.clone())),
            None => Ok(()),
        }
    }
}

impl QueueManager for MockQueue {
    fn add_files(
        &self,
        target: &str,
        files: &[BundleFileInfo],
        _remote_date: Option<DateTime<Utc>>,
    ) -> Result<String, Error> {
        self.check()?;
        let mut log = self.log();
        log.bundles.push((target.to_string(), files.to_vec()));
        Ok(format!("bundle-{}", log.bundles.len()))
    }

    fn add_list_request(&self, path: &ListPath, request: ListRequest) -> Result<(), Error> {
        self.check()?;
        self.log().list_requests.push((path.clone(), request));
        Ok(())
    }

    fn open_file(&self, file: &BundleFileInfo) -> Result<(), Error> {
        self.check()?;
        self.log().opened.push(file.clone());
        Ok(())
    }

    fn match_listing(&self, _tree: &Tree) -> QueueMatch {
        self.log().match_result
    }
}

/// A peer whose presence and search support can be toggled.
#[derive(Debug)]
pub struct MockPeers {
    nick: String,
    online: AtomicBool,
    direct_search: AtomicBool,
    tokens: AtomicUsize,
    searches: Mutex<Vec<(SearchQuery, ListPath)>>,
}

impl MockPeers {
    /// An online peer without direct search support.
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            online: AtomicBool::new(true),
            direct_search: AtomicBool::new(false),
            tokens: AtomicUsize::new(0),
            searches: Mutex::new(Vec::new()),
        }
    }

    /// Sets the presence of the peer.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Sets whether the peer searches its own share.
    pub fn set_direct_search(&self, supported: bool) {
        self.direct_search.store(supported, Ordering::SeqCst);
    }

    /// Searches sent so far.
    pub fn searches(&self) -> Vec<(SearchQuery, ListPath)> {
        self.searches.lock().unwrap().clone()
    }

    /// Token of the most recent search.
    pub fn last_token(&self) -> String {
        format!("search-{}", self.tokens.load(Ordering::SeqCst))
    }
}

impl PeerClient for MockPeers {
    fn nick(&self) -> String {
        self.nick.clone()
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn supports_direct_search(&self) -> bool {
        self.direct_search.load(Ordering::SeqCst)
    }

    fn send_search(&self, query: &SearchQuery, dir: &ListPath) -> Result<String, Error> {
        if !self.is_online() {
            return Err(Error::Search(format!("{} is offline", self.nick)));
        }
        self.searches
            .lock()
            .unwrap()
            .push((query.clone(), dir.clone()));
        let n = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("search-{n}"))
    }
}

#[cfg(feature = "test_utils")]
pub use on_disk::TestListFile;
#[cfg(feature = "test_utils")]
pub use on_disk::xml_diff;

#[cfg(feature = "test_utils")]
mod on_disk {
    use std::path::PathBuf;

    use similar::ChangeTag;
    use similar::TextDiff;
    use tempdir::TempDir;

    /// A list file named `[nick].[CID].xml` in a temporary directory.
    #[derive(Debug)]
    pub struct TestListFile {
        /// Directory holding the file, removed on drop.
        pub root: TempDir,
        path: PathBuf,
    }

    impl TestListFile {
        /// Writes `xml` as the list of `nick`.
        pub fn new(nick: &str, xml: &str) -> Result<Self, std::io::Error> {
            Self::with_extension(nick, xml, "xml")
        }

        /// Writes `xml` with a custom extension.
        pub fn with_extension(nick: &str, xml: &str, extension: &str) -> Result<Self, std::io::Error> {
            let root = TempDir::new("filelist")?;
            let cid = "A".repeat(39);
            let path = root.path().join(format!("{nick}.{cid}.{extension}"));
            std::fs::write(&path, xml)?;
            Ok(Self { root, path })
        }

        /// Path of the list file.
        pub fn path(&self) -> PathBuf {
            self.path.clone()
        }
    }

    /// Line diff of two documents, `None` when they are equal.
    pub fn xml_diff(expected: &str, actual: &str) -> Option<String> {
        let diff = TextDiff::from_lines(expected, actual);
        let mut diffs = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => continue,
            };
            diffs.push_str(&format!("{sign}{change}"));
        }
        (!diffs.is_empty()).then_some(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ListLoader;
    use crate::registry::PathRegistry;

    #[test]
    fn generated_documents_load() {
        let xml = TestListing::new("/")
            .dir("A")
            .file("f1", 10)
            .dir("B")
            .file("f2", 20)
            .to_xml();
        let mut tree = Tree::new();
        let mut registry = PathRegistry::new();
        let closing = AtomicBool::new(false);
        let dirs = ListLoader::new(&mut tree, &mut registry, &closing)
            .load_str(&xml)
            .unwrap();
        assert_eq!(dirs, 2);
        let root = tree.root();
        assert_eq!(tree.total_size(root, false), 30);
        assert_ne!(tth_for(0), tth_for(1));
        assert!(!tth_for(0).is_empty());
    }

    #[test]
    fn mock_queue_failure_toggle() {
        let queue = MockQueue::default();
        queue.fail_with("nope");
        assert_eq!(
            queue.add_files("/dl/", &[], None),
            Err(Error::Queue("nope".into()))
        );
        queue.succeed();
        assert_eq!(queue.add_files("/dl/", &[], None), Ok("bundle-1".into()));
    }
}
