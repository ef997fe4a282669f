use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use derivative::Derivative;
#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::adls::AdlMatcher;
use crate::adls::AdlRule;
use crate::bundle::BundleFileInfo;
use crate::bundle::ListRequest;
use crate::bundle::QueueManager;
use crate::bundle::plan_bundles;
use crate::config::ListingSettings;
use crate::dispatcher::DispatchPolicy;
use crate::dispatcher::TaskQueue;
use crate::dupe;
use crate::dupe::DupeIndex;
use crate::errors::Error;
use crate::events::ListingEvent;
use crate::events::PeerEvent;
use crate::events::Subscribers;
use crate::filter;
use crate::loader::ListLoader;
use crate::path::ListPath;
use crate::registry;
use crate::registry::PathRegistry;
use crate::search::PeerClient;
use crate::search::SearchAggregator;
use crate::search::SearchCursor;
use crate::search::SearchEnd;
use crate::search::SearchQuery;
use crate::search::search_tree;
use crate::tree::DirId;
use crate::tree::DirType;
use crate::tree::File;
use crate::tree::Tree;
use crate::utils::is_nfo_name;
use crate::utils::nick_from_filename;
use crate::xml::ListWriter;

/// How [`Listing::change_directory`] treats content that is not loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadMode {
    /// Request content only for incomplete directories.
    #[default]
    None,
    /// Request the directory again even when it is complete.
    Dir,
    /// Request the directory and everything below it.
    All,
}

/// Summary of the directory observers are looking at.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentLocation {
    /// Path of the directory.
    pub path: ListPath,
    /// Number of direct subdirectories.
    pub directories: usize,
    /// Number of direct files.
    pub files: usize,
    /// Aggregate size, synthetic content excluded.
    pub total_size: u64,
    /// Content of the directory is exact.
    pub complete: bool,
    /// A list request for the directory is pending.
    pub loading: bool,
}

/// Configures and creates a [`Listing`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ListingBuilder {
    #[derivative(Debug = "ignore")]
    peer: Arc<dyn PeerClient>,
    #[derivative(Debug = "ignore")]
    queue: Arc<dyn QueueManager>,
    #[derivative(Debug = "ignore")]
    dupes: Option<Arc<dyn DupeIndex>>,
    settings: ListingSettings,
    adl_rules: Vec<AdlRule>,
    partial: bool,
    client_view: bool,
    file_name: Option<PathBuf>,
}

impl ListingBuilder {
    /// Starts a builder for a listing of `peer` whose downloads go to
    /// `queue`.
    pub fn new(peer: Arc<dyn PeerClient>, queue: Arc<dyn QueueManager>) -> Self {
        Self {
            peer,
            queue,
            dupes: None,
            settings: ListingSettings::default(),
            adl_rules: Vec::new(),
            partial: false,
            client_view: false,
            file_name: None,
        }
    }

    /// Index used to classify content as shared or queued.
    pub fn dupes(mut self, index: Arc<dyn DupeIndex>) -> Self {
        self.dupes = Some(index);
        self
    }

    /// Replaces the default settings.
    pub fn settings(mut self, settings: ListingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Synthetic directory rules.
    pub fn adl_rules(mut self, rules: Vec<AdlRule>) -> Self {
        self.adl_rules = rules;
        self
    }

    /// The listing is filled one directory at a time.
    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// The listing is shown to a user. Work then runs on a background
    /// worker and dupes are classified.
    pub fn client_view(mut self, client_view: bool) -> Self {
        self.client_view = client_view;
        self
    }

    /// File a full list is loaded from.
    pub fn file_name(mut self, file_name: impl Into<PathBuf>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Compiles the rules and starts the work queue.
    pub fn build(self) -> Result<Listing, Error> {
        let adls = AdlMatcher::new(&self.adl_rules)?;
        let policy = if self.client_view {
            DispatchPolicy::Background
        } else {
            DispatchPolicy::Sync
        };
        let nick = self.peer.nick();
        let tasks = TaskQueue::new(policy, &format!("filelist-{nick}"))?;
        log::debug!("Created listing of {nick} ({policy:?}, partial: {})", self.partial);

        let mut tree = Tree::new();
        let root = tree.root();
        if self.partial {
            tree[root].set_type(DirType::IncompleteWithChildren);
        }
        let location = CurrentLocation {
            path: ListPath::root(),
            complete: tree[root].is_complete(),
            ..Default::default()
        };

        Ok(Listing {
            inner: Arc::new(Inner {
                peer: self.peer,
                queue: self.queue,
                dupes: self.dupes,
                settings: self.settings,
                adls,
                file_name: self.file_name,
                client_view: self.client_view,
                partial: AtomicBool::new(self.partial),
                closing: AtomicBool::new(false),
                tree: Mutex::new(TreeState {
                    tree,
                    registry: PathRegistry::new(),
                }),
                search: Mutex::new(SearchState::default()),
                location: RwLock::new(location),
                subscribers: Subscribers::default(),
                tasks,
            }),
        })
    }
}

struct TreeState {
    tree: Tree,
    registry: PathRegistry,
}

#[derive(Default)]
struct SearchState {
    aggregator: Option<SearchAggregator>,
    cursor: SearchCursor,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Inner {
    #[derivative(Debug = "ignore")]
    peer: Arc<dyn PeerClient>,
    #[derivative(Debug = "ignore")]
    queue: Arc<dyn QueueManager>,
    #[derivative(Debug = "ignore")]
    dupes: Option<Arc<dyn DupeIndex>>,
    settings: ListingSettings,
    adls: AdlMatcher,
    file_name: Option<PathBuf>,
    client_view: bool,
    partial: AtomicBool,
    closing: AtomicBool,
    // lock order: tree before search
    #[derivative(Debug = "ignore")]
    tree: Mutex<TreeState>,
    #[derivative(Debug = "ignore")]
    search: Mutex<SearchState>,
    location: RwLock<CurrentLocation>,
    subscribers: Subscribers,
    tasks: TaskQueue,
}

/// Loads `path` into `tree`. Only `.xml` lists are understood.
fn load_list_file(
    path: &Path,
    tree: &mut Tree,
    registry: &mut PathRegistry,
    closing: &AtomicBool,
    lan_mode: bool,
    dupes: Option<&dyn DupeIndex>,
    peer: &str,
) -> Result<usize, Error> {
    let what = path.display().to_string();
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase);
    if extension.as_deref() != Some("xml") {
        return Err(Error::Read {
            what,
            how: "Unsupported file list format".into(),
        });
    }

    let file = fs::File::open(path).map_err(|e| Error::Read {
        what: what.clone(),
        how: e.to_string(),
    })?;
    let list_date = file
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    let mut loader = ListLoader::new(tree, registry, closing)
        .lan_mode(lan_mode)
        .list_date(list_date)
        .peer(peer);
    if let Some(index) = dupes {
        loader = loader.check_dupes(index, false);
    }
    let dirs = loader.load(BufReader::new(file))?;
    let root = tree.root();
    tree[root].set_update_date(list_date);
    log::debug!("Loaded {dirs} directories from {what}");
    Ok(dirs)
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TreeState> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn search_state(&self) -> MutexGuard<'_, SearchState> {
        self.search.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, event: ListingEvent) {
        self.subscribers.fire(event);
    }

    fn nick(&self) -> String {
        let nick = self.peer.nick();
        if !nick.is_empty() {
            return nick;
        }
        self.file_name
            .as_deref()
            .and_then(Path::file_name)
            .and_then(OsStr::to_str)
            .and_then(nick_from_filename)
            .unwrap_or_default()
    }

    fn is_partial(&self) -> bool {
        self.partial.load(Ordering::SeqCst)
    }

    fn check_closing(&self) -> Result<(), Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// The dupe index, when classification is wanted for this listing.
    fn dupe_index(&self) -> Option<&dyn DupeIndex> {
        if !self.client_view || !self.settings.dupes_in_filelist {
            return None;
        }
        self.dupes.as_deref()
    }

    fn match_adls(&self) -> bool {
        self.settings.use_adls && !self.is_partial() && !self.adls.is_empty()
    }

    /// Runs `f`, turning its failure into events.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&Inner) -> Result<(), Error>,
    {
        match f(self) {
            Ok(()) => {}
            Err(Error::Aborted) => self.fire(ListingEvent::LoadingFailed(String::new())),
            Err(Error::OutOfMemory) => {
                log::error!("Failed to load the list of {}: out of memory", self.nick());
                self.fire(ListingEvent::LoadingFailed("Out of memory".into()));
            }
            Err(e @ Error::Queue(_)) => self.fire(ListingEvent::StatusMessage(e.to_string())),
            Err(Error::Search(reason)) => {
                log::warn!("Failed to search from {}: {reason}", self.nick());
                self.fire(ListingEvent::SearchFailed { timed_out: false });
            }
            Err(e) => {
                let nick = self.nick();
                log::error!("Failed to load the list of {nick}: {e}");
                self.fire(ListingEvent::LoadingFailed(format!("{nick}: {e}")));
            }
        }
    }

    fn update_location(&self, tree: &Tree, id: DirId) {
        let dir = &tree[id];
        let location = CurrentLocation {
            path: tree.get_path(id),
            directories: dir.directories().len(),
            files: dir.file_count(),
            total_size: tree.total_size(id, false),
            complete: dir.is_complete(),
            loading: dir.is_loading(),
        };
        *self
            .location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = location;
    }

    fn on_loading_finished(
        &self,
        state: &mut TreeState,
        start: Instant,
        dir: &ListPath,
        reload: bool,
        change_dir: bool,
    ) {
        if self.match_adls() {
            self.fire(ListingEvent::StatusMessage("Matching ADL...".into()));
            self.adls.match_listing(&mut state.tree);
        }

        if self.dupe_index().is_some() {
            dupe::propagate(&mut state.tree);
        }

        if let Some(id) = state.tree.find_directory(dir) {
            state.tree[id].set_loading(false);
            self.update_location(&state.tree, id);
            self.fire(ListingEvent::StateChanged);
        }

        self.fire(ListingEvent::LoadingFinished {
            elapsed: start.elapsed(),
            dir: dir.clone(),
            reload,
            change_dir,
        });
    }

    fn load_file_impl(&self, initial_dir: &ListPath) -> Result<(), Error> {
        let start = Instant::now();
        self.partial.store(false, Ordering::SeqCst);
        let path = self.file_name.clone().ok_or_else(|| Error::Read {
            what: "file list".into(),
            how: "No file name was given".into(),
        })?;

        let mut state = self.state();
        let root = state.tree.root();
        let reloading = !state.tree[root].directories().is_empty();
        self.fire(ListingEvent::LoadingStarted { reloading });
        if reloading {
            state.tree.clear_all(root);
            state.registry.clear();
        }

        let TreeState { tree, registry } = &mut *state;
        load_list_file(
            &path,
            tree,
            registry,
            &self.closing,
            self.settings.lan_mode,
            self.dupe_index(),
            &self.nick(),
        )?;

        self.on_loading_finished(&mut state, start, initial_dir, reloading, true);
        Ok(())
    }

    fn load_partial_impl(
        &self,
        xml: &str,
        base: &ListPath,
        reload_all: bool,
        change_dir: bool,
    ) -> Result<(), Error> {
        if !self.is_partial() {
            log::debug!("Ignoring a partial list for the full listing of {}", self.nick());
            return Ok(());
        }
        let start = Instant::now();

        let mut state = self.state();
        let TreeState { tree, registry } = &mut *state;
        let reloading = registry::prepare_partial(tree, registry, base, reload_all);
        self.fire(ListingEvent::LoadingStarted { reloading });

        let mut loader = ListLoader::new(tree, registry, &self.closing)
            .updating(base.clone())
            .lan_mode(self.settings.lan_mode)
            .list_date(Some(Utc::now()))
            .peer(self.nick());
        if let Some(index) = self.dupe_index() {
            loader = loader.check_dupes(index, true);
        }
        let dirs = loader.load_str(xml)?;
        log::debug!("Merged {dirs} directories at {base}");

        let reload = reload_all || (reloading && base.is_root());
        self.on_loading_finished(&mut state, start, base, reload, change_dir);
        Ok(())
    }

    fn list_diff_impl(&self, other: &Path) -> Result<(), Error> {
        let start = Instant::now();
        self.check_closing()?;

        let mut reference = Tree::new();
        let mut reference_registry = PathRegistry::new();
        load_list_file(
            other,
            &mut reference,
            &mut reference_registry,
            &self.closing,
            self.settings.lan_mode,
            None,
            &self.nick(),
        )?;
        self.check_closing()?;

        let mut state = self.state();
        filter::diff(
            &mut state.tree,
            &reference,
            self.settings.skip_subtract_bytes(),
        );
        let root = state.tree.root();
        self.update_location(&state.tree, root);
        self.fire(ListingEvent::LoadingFinished {
            elapsed: start.elapsed(),
            dir: ListPath::root(),
            reload: false,
            change_dir: true,
        });
        Ok(())
    }

    fn match_adl_impl(&self) -> Result<(), Error> {
        let start = Instant::now();
        self.check_closing()?;
        let mut state = self.state();
        self.adls.match_listing(&mut state.tree);
        self.fire(ListingEvent::LoadingFinished {
            elapsed: start.elapsed(),
            dir: ListPath::root(),
            reload: false,
            change_dir: true,
        });
        Ok(())
    }

    fn match_queue_impl(&self) -> Result<(), Error> {
        let state = self.state();
        let result = self.queue.match_listing(&state.tree);
        self.fire(ListingEvent::QueueMatched(result.to_string()));
        Ok(())
    }

    fn search_impl(&self, query: SearchQuery, dir: &ListPath) -> Result<(), Error> {
        let mut state = self.state();
        let mut search = self.search_state();
        *search = SearchState::default();
        self.fire(ListingEvent::SearchStarted);

        let max_results = query.max_results.min(self.settings.max_search_results);
        let query = query.with_max_results(max_results);

        if self.is_partial() && self.peer.supports_direct_search() {
            let token = self.peer.send_search(&query, dir).map_err(|e| match e {
                Error::Search(_) => e,
                other => Error::Search(other.to_string()),
            })?;
            log::debug!("Sent search {token} to {}", self.nick());
            search.aggregator = Some(SearchAggregator::new(token, &self.settings, Instant::now()));
            return Ok(());
        }

        let mut results = BTreeSet::new();
        if let Some(id) = state.tree.find_directory(dir) {
            search_tree(&state.tree, id, &query, &mut results);
        }
        self.finish_search_locked(&mut state, &mut search, results, false);
        Ok(())
    }

    fn end_search(&self, end: SearchEnd) -> Result<(), Error> {
        let mut state = self.state();
        let mut search = self.search_state();
        let results = match search.aggregator.take() {
            Some(aggregator) if aggregator.is_ended() => aggregator.into_results(),
            // a newer search replaced the one that ended
            other => {
                search.aggregator = other;
                return Ok(());
            }
        };
        self.finish_search_locked(&mut state, &mut search, results, end == SearchEnd::TimedOut);
        Ok(())
    }

    fn finish_search_locked(
        &self,
        state: &mut TreeState,
        search: &mut SearchState,
        results: BTreeSet<ListPath>,
        timed_out: bool,
    ) {
        log::debug!("Search ended with {} results", results.len());
        search.aggregator = None;
        search.cursor = SearchCursor::new(results);
        if search.cursor.is_empty() {
            self.fire(ListingEvent::SearchFailed { timed_out });
            return;
        }

        self.fire(ListingEvent::SearchFinished {
            results: search.cursor.results().len(),
        });
        if let Some(first) = search.cursor.current().cloned() {
            if let Err(e) = self.change_directory_locked(state, &first, ReloadMode::None, true) {
                log::debug!("Search result is not part of the tree: {e}");
            }
        }
    }

    fn find_nfo_impl(&self, path: &ListPath, allow_queue_list: bool) -> Result<(), Error> {
        let state = self.state();
        let id = state
            .tree
            .find_directory(path)
            .ok_or_else(|| Error::NotFound(path.to_adc()))?;

        if state.tree.find_incomplete(id) {
            if !allow_queue_list {
                // a malformed list would be queued over and over again
                return Ok(());
            }
            let request = ListRequest {
                partial: true,
                recursive: true,
                view_nfo: true,
            };
            if let Err(e) = self.queue.add_list_request(path, request) {
                log::warn!("Failed to request {path} from {}: {e}", self.nick());
            }
            return Ok(());
        }

        let mut nfo: Option<File> = None;
        state.tree.walk(id, &mut |_, dir| {
            if nfo.is_none() {
                nfo = dir.files().iter().find(|f| is_nfo_name(&f.name)).cloned();
            }
        });

        match nfo {
            Some(f) => {
                let info = BundleFileInfo {
                    path: f.name,
                    tth: f.tth,
                    size: f.size,
                };
                if let Err(e) = self.queue.open_file(&info) {
                    log::warn!("Failed to open {}: {e}", info.path);
                }
            }
            None => self.fire(ListingEvent::StatusMessage(format!(
                "{}: No NFO file found",
                state.tree[id].name()
            ))),
        }
        Ok(())
    }

    fn change_directory_locked(
        &self,
        state: &mut TreeState,
        path: &ListPath,
        mode: ReloadMode,
        from_search: bool,
    ) -> Result<(), Error> {
        let id = state
            .tree
            .find_directory(path)
            .ok_or_else(|| Error::NotFound(path.to_adc()))?;

        let changed = ListingEvent::ChangeDirectory {
            path: path.clone(),
            from_search,
        };
        let dir = &state.tree[id];
        if !self.is_partial() || dir.is_loading() || (dir.is_complete() && mode == ReloadMode::None)
        {
            self.fire(changed);
        } else if self.peer.is_online() {
            state.tree[id].set_loading(true);
            self.fire(changed);
            let request = ListRequest {
                partial: true,
                recursive: mode == ReloadMode::All,
                view_nfo: false,
            };
            if let Err(e) = self.queue.add_list_request(path, request) {
                state.tree[id].set_loading(false);
                self.fire(ListingEvent::LoadingFailed(e.to_string()));
            }
        } else {
            self.fire(ListingEvent::StatusMessage("User offline".into()));
        }

        self.update_location(&state.tree, id);
        Ok(())
    }

    fn download_dir_impl(&self, path: &ListPath, target: &str) -> Result<bool, Error> {
        let mut state = self.state();
        let id = state
            .tree
            .find_directory(path)
            .ok_or_else(|| Error::NotFound(path.to_adc()))?;
        if state.tree.find_incomplete(id) {
            return Err(Error::InvalidArgument(format!(
                "{} is not fully loaded",
                path.to_adc()
            )));
        }

        let mut queued = false;
        for plan in plan_bundles(&mut state.tree, id, target) {
            if plan.is_empty(self.settings.skip_zero_byte) {
                self.fire(ListingEvent::StatusMessage(format!("Directory empty {}", plan.name)));
                continue;
            }
            match self.queue.add_files(&plan.target, &plan.files, plan.remote_date) {
                Ok(token) => {
                    log::debug!("Queued {} as bundle {token}", plan.target);
                    queued = true;
                }
                Err(e) => {
                    log::warn!("Failed to queue {} from {}: {e}", plan.target, self.nick());
                    self.fire(ListingEvent::StatusMessage(e.to_string()));
                }
            }
        }
        Ok(queued)
    }

    fn removed_queue_impl(&self, path: &ListPath) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(id) = state.tree.find_directory(path) {
            state.tree[id].set_loading(false);
            self.fire(ListingEvent::RemovedQueue(path.clone()));
            self.update_location(&state.tree, id);
            self.fire(ListingEvent::StateChanged);
        }
        Ok(())
    }
}

/// A peer's share listing.
///
/// Every operation that changes the tree is queued as a task and runs on
/// the work queue of the listing, one at a time. Listings shown to a user
/// run their tasks on a background thread; the others run them before the
/// submitting call returns. Progress and results are reported as
/// [`ListingEvent`]s to the receivers returned by [`Listing::subscribe`].
///
/// Cloning is cheap and yields a handle to the same listing.
#[derive(Debug, Clone)]
pub struct Listing {
    inner: Arc<Inner>,
}

impl Listing {
    /// Starts configuring a listing of `peer`.
    pub fn builder(peer: Arc<dyn PeerClient>, queue: Arc<dyn QueueManager>) -> ListingBuilder {
        ListingBuilder::new(peer, queue)
    }

    fn add_task<F>(&self, f: F)
    where
        F: FnOnce(&Inner) -> Result<(), Error> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner
            .tasks
            .add_task(Box::new(move || inner.dispatch(f)));
    }

    /// Registers an observer.
    pub fn subscribe(&self) -> UnboundedReceiver<ListingEvent> {
        self.inner.subscribers.subscribe()
    }

    /// Name of the peer, or the one encoded in the list file name.
    pub fn nick(&self) -> String {
        self.inner.nick()
    }

    /// Returns true while the listing is filled one directory at a time.
    pub fn is_partial(&self) -> bool {
        self.inner.is_partial()
    }

    /// Returns true for listings shown to a user.
    pub fn is_client_view(&self) -> bool {
        self.inner.client_view
    }

    /// Runs `f` on the tree. Blocks while a task is mutating it.
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.inner.state().tree)
    }

    /// Serializes the directory at `path`, with its whole subtree when
    /// `recursive` is set.
    pub fn write_list(&self, path: &ListPath, recursive: bool) -> Result<String, Error> {
        let state = self.inner.state();
        let id = state
            .tree
            .find_directory(path)
            .ok_or_else(|| Error::NotFound(path.to_adc()))?;
        ListWriter::new(&state.tree).recursive(recursive).write(id)
    }

    /// Aggregate size of the directory at `path`, zero when it is missing.
    pub fn dir_size(&self, path: &ListPath) -> u64 {
        let state = self.inner.state();
        state
            .tree
            .find_directory(path)
            .map_or(0, |id| state.tree.total_size(id, false))
    }

    /// Snapshot of the current location. Never waits for running tasks.
    pub fn current_location(&self) -> CurrentLocation {
        self.inner
            .location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Results of the last finished search.
    pub fn search_results(&self) -> Vec<ListPath> {
        self.inner.search_state().cursor.results().to_vec()
    }

    /// Loads the list file given to the builder, replacing all content, and
    /// asks observers to open `initial_dir`.
    pub fn add_full_list_task(&self, initial_dir: ListPath) {
        self.add_task(move |inner| inner.load_file_impl(&initial_dir));
    }

    /// Merges a partial list rooted at `base`.
    ///
    /// Content previously loaded at `base` is replaced. `reload_all` drops
    /// the whole tree first.
    pub fn add_partial_list_task(
        &self,
        xml: impl Into<String>,
        base: ListPath,
        reload_all: bool,
        change_dir: bool,
    ) {
        let xml = xml.into();
        self.add_task(move |inner| inner.load_partial_impl(&xml, &base, reload_all, change_dir));
    }

    /// Removes everything the list file `other` also contains.
    pub fn add_list_diff_task(&self, other: impl Into<PathBuf>) {
        let other = other.into();
        self.add_task(move |inner| inner.list_diff_impl(&other));
    }

    /// Rebuilds the synthetic directories.
    pub fn add_match_adl_task(&self) {
        self.add_task(|inner| inner.match_adl_impl());
    }

    /// Adds the peer as a source for queued files found in the listing.
    pub fn add_queue_match_task(&self) {
        self.add_task(|inner| inner.match_queue_impl());
    }

    /// Searches below `dir`, on the peer when the content is not resident.
    pub fn add_search_task(&self, query: SearchQuery, dir: ListPath) {
        self.add_task(move |inner| inner.search_impl(query, &dir));
    }

    /// Opens the first NFO file below `path`. Incomplete directories are
    /// requested recursively first when `allow_queue_list` is set.
    pub fn add_view_nfo_task(&self, path: ListPath, allow_queue_list: bool) {
        self.add_task(move |inner| inner.find_nfo_impl(&path, allow_queue_list));
    }

    /// Queued form of [`Listing::change_directory`]. Paths missing from
    /// the tree by the time the task runs are ignored.
    pub fn add_directory_change_task(&self, path: ListPath, mode: ReloadMode, from_search: bool) {
        self.add_task(move |inner| {
            let mut state = inner.state();
            match inner.change_directory_locked(&mut state, &path, mode, from_search) {
                Err(Error::NotFound(missing)) => {
                    log::debug!("Not changing to {missing}, it is not part of the tree");
                    Ok(())
                }
                other => other,
            }
        });
    }

    /// Moves observers to `path`, requesting its content when needed.
    ///
    /// Fails with [`Error::NotFound`] without changing anything when `path`
    /// is not in the tree. Waits for running work; callers that must not
    /// block use [`Listing::add_directory_change_task`].
    pub fn change_directory(
        &self,
        path: &ListPath,
        mode: ReloadMode,
        from_search: bool,
    ) -> Result<(), Error> {
        let mut state = self.inner.state();
        self.inner
            .change_directory_locked(&mut state, path, mode, from_search)
    }

    /// Queues the directory at `path` for download into `target`. Returns
    /// true when at least one bundle was created.
    ///
    /// Directories that are not fully loaded are refused. Queue failures
    /// are reported as status messages. Waits for running work; see
    /// [`Listing::add_download_task`] for the queued form.
    pub fn download_dir(&self, path: &ListPath, target: &str) -> Result<bool, Error> {
        self.inner.download_dir_impl(path, target)
    }

    /// Queued form of [`Listing::download_dir`]. Refusals are reported as
    /// status messages.
    pub fn add_download_task(&self, path: ListPath, target: String) {
        self.add_task(move |inner| {
            if let Err(e) = inner.download_dir_impl(&path, &target) {
                inner.fire(ListingEvent::StatusMessage(e.to_string()));
            }
            Ok(())
        });
    }

    /// Selects the next (or previous) search result. Returns false at
    /// either end of the results.
    pub fn next_result(&self, prev: bool) -> bool {
        let Some(path) = self.inner.search_state().cursor.step(prev).cloned() else {
            return false;
        };
        self.add_directory_change_task(path, ReloadMode::None, true);
        true
    }

    /// Returns true when `path` is the selected search result.
    pub fn is_current_search_path(&self, path: &ListPath) -> bool {
        self.inner.search_state().cursor.is_current(path)
    }

    /// A list request for `path` left the download queue. Unless it
    /// finished, the directory stops showing as loading.
    pub fn on_list_removed_queue(&self, path: ListPath, finished: bool) {
        if finished {
            return;
        }
        self.add_task(move |inner| inner.removed_queue_impl(&path));
    }

    /// Consumes an event of the peer side.
    pub fn handle_peer_event(&self, event: PeerEvent) {
        if matches!(event, PeerEvent::UserUpdated | PeerEvent::UserDisconnected) {
            self.inner.fire(ListingEvent::UserUpdated);
            return;
        }

        let end = {
            let mut search = self.inner.search_state();
            let Some(aggregator) = search.aggregator.as_mut() else {
                return;
            };
            match event {
                PeerEvent::SearchResult { token, path } => {
                    aggregator.add_result(&token, path, Instant::now())
                }
                PeerEvent::SearchEnded {
                    token,
                    result_count,
                } => aggregator.set_expected(&token, result_count),
                PeerEvent::Tick(now) => aggregator.tick(now),
                PeerEvent::UserUpdated | PeerEvent::UserDisconnected => None,
            }
        };
        // the tree lock is taken before the search lock, so finish on the queue
        if let Some(end) = end {
            self.add_task(move |inner| inner.end_search(end));
        }
    }

    /// Aborts running work, refuses new tasks and sends
    /// [`ListingEvent::Closed`] once the queued tasks have run.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        self.inner
            .tasks
            .stop(Box::new(move || inner.fire(ListingEvent::Closed)));
    }

    /// Waits for the background worker after [`Listing::close`].
    pub fn join(&self) {
        self.inner.tasks.join();
    }
}
