use std::io::BufRead;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;

use crate::dupe::DupeIndex;
use crate::errors::Error;
use crate::hash::Tth;
use crate::path::ListPath;
use crate::path::is_valid_component;
use crate::registry::PathRegistry;
use crate::tree::DirId;
use crate::tree::DirType;
use crate::tree::Directory;
use crate::tree::File;
use crate::tree::Tree;
use crate::utils::parse_unix_date;
use crate::xml;
use crate::xml::Attributes;
use crate::xml::TagHandler;

/// Streaming loader for one file list document.
///
/// A fresh load appends everything below the root. An update resolves the
/// `Base` of the document first, creating missing intermediate directories
/// as incomplete, and reuses directories already known to the registry.
pub struct ListLoader<'a> {
    tree: &'a mut Tree,
    registry: &'a mut PathRegistry,
    closing: &'a AtomicBool,
    cur: DirId,
    base: ListPath,
    base_lower: String,
    // one entry per open Directory tag, the accumulator length to restore
    prefix_stack: Vec<Option<usize>>,
    // open Directory tags inside a skipped subtree
    skip_depth: usize,
    in_listing: bool,
    updating: bool,
    partial_list: bool,
    lan_mode: bool,
    dupes: Option<&'a dyn DupeIndex>,
    list_date: Option<DateTime<Utc>>,
    peer: String,
    dirs_loaded: usize,
}

impl<'a> ListLoader<'a> {
    /// Creates a loader for a fresh load into `tree`.
    pub fn new(tree: &'a mut Tree, registry: &'a mut PathRegistry, closing: &'a AtomicBool) -> Self {
        let cur = tree.root();
        Self {
            tree,
            registry,
            closing,
            cur,
            base: ListPath::root(),
            base_lower: String::new(),
            prefix_stack: Vec::new(),
            skip_depth: 0,
            in_listing: false,
            updating: false,
            partial_list: false,
            lan_mode: false,
            dupes: None,
            list_date: None,
            peer: String::new(),
            dirs_loaded: 0,
        }
    }

    /// Merges the document into the existing tree at `base`.
    pub fn updating(mut self, base: ListPath) -> Self {
        self.updating = true;
        self.base = base;
        self
    }

    /// Classifies new files, and for partial lists new directories, against
    /// `index`.
    pub fn check_dupes(mut self, index: &'a dyn DupeIndex, partial_list: bool) -> Self {
        self.dupes = Some(index);
        self.partial_list = partial_list;
        self
    }

    /// Accepts file entries without a hash.
    pub fn lan_mode(mut self, lan_mode: bool) -> Self {
        self.lan_mode = lan_mode;
        self
    }

    /// Fetch date stamped on created directories.
    pub fn list_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        self.list_date = date;
        self
    }

    /// Peer name used in log messages.
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Parses the whole document and returns the number of directories that
    /// were created or merged.
    ///
    /// A malformed document stops the load but keeps what was merged so far;
    /// the error is logged and the count is returned. Closing the listing
    /// surfaces as [`Error::Aborted`] and a failed allocation as
    /// [`Error::OutOfMemory`].
    pub fn load<R: BufRead>(mut self, reader: R) -> Result<usize, Error> {
        match xml::parse(reader, &mut self) {
            Ok(()) => Ok(self.dirs_loaded),
            Err(e @ (Error::Aborted | Error::OutOfMemory)) => Err(e),
            Err(e) => {
                log::error!("Error in file list loading: {e}. User: [ {} ]", self.peer);
                Ok(self.dirs_loaded)
            }
        }
    }

    /// [`ListLoader::load`] over an in-memory document.
    pub fn load_str(self, xml: &str) -> Result<usize, Error> {
        self.load(xml.as_bytes())
    }

    fn start_listing(&mut self, attrs: &Attributes, simple: bool) -> Result<(), Error> {
        if self.updating {
            if let Some(declared) = attrs.non_empty(xml::ATTR_BASE) {
                if declared.starts_with('/') && declared.ends_with('/') {
                    let declared = ListPath::from_adc(declared)?;
                    if declared.registry_key() != self.base.registry_key() {
                        return Err(Error::parse(format!(
                            "The base directory specified in the file list ({}) doesn't match the expected base ({})",
                            declared.to_adc(),
                            self.base.to_adc()
                        )));
                    }
                }
            }

            let mut cur = self.tree.root();
            let mut path = ListPath::root();
            for name in self.base.components() {
                path.push(name);
                cur = match self.tree.find_child_exact(cur, name) {
                    Some(d) => d,
                    None => {
                        let mut dir = Directory::new(name.as_str(), DirType::IncompleteWithChildren)
                            .with_update_date(self.list_date);
                        if let Some(index) = self.dupes {
                            dir.set_dupe(index.lookup_directory(&path, 0));
                        }
                        self.tree.try_reserve(cur, 1, 0)?;
                        let d = self.tree.add_directory(cur, dir);
                        self.registry.insert(path.registry_key(), d, false);
                        d
                    }
                };
            }

            self.base_lower = self.base.registry_key();
            self.registry.insert(self.base_lower.clone(), cur, true);

            let base_date = attrs.get(xml::ATTR_BASE_DATE).and_then(parse_unix_date);
            let dir = &mut self.tree[cur];
            dir.set_update_date(self.list_date);
            dir.set_remote_date(base_date);
            self.cur = cur;
        }

        self.in_listing = true;
        if simple {
            self.end_tag(xml::TAG_FILE_LISTING)?;
        }
        Ok(())
    }

    fn start_file(&mut self, attrs: &Attributes) -> Result<(), Error> {
        let Some(name) = attrs.non_empty(xml::ATTR_NAME) else {
            log::debug!("Skipping file without a name");
            return Ok(());
        };
        if !is_valid_component(name) {
            log::debug!("Skipping file with invalid name {name}");
            return Ok(());
        }
        let Some(size) = attrs.non_empty(xml::ATTR_SIZE).and_then(|s| s.parse::<u64>().ok()) else {
            log::debug!("Skipping file {name} without a valid size");
            return Ok(());
        };
        let tth = match attrs.non_empty(xml::ATTR_TTH).map(str::parse::<Tth>) {
            Some(Ok(tth)) => tth,
            _ if self.lan_mode => Tth::default(),
            _ => {
                log::debug!("Skipping file {name} without a valid TTH");
                return Ok(());
            }
        };

        let mut file = File::new(name, size, tth);
        file.remote_date = attrs.get(xml::ATTR_DATE).and_then(parse_unix_date);
        if let Some(index) = self.dupes {
            if size > 0 {
                file.dupe = index.lookup(&file.tth);
            }
        }
        self.tree.try_reserve(self.cur, 0, 1)?;
        self.tree.add_file(self.cur, file);
        Ok(())
    }

    fn start_directory(&mut self, attrs: &Attributes, simple: bool) -> Result<(), Error> {
        let name = attrs
            .non_empty(xml::ATTR_NAME)
            .ok_or_else(|| Error::parse("Directory missing name attribute"))?
            .to_string();
        if !is_valid_component(&name) {
            log::debug!("Skipping directory with invalid name {name}. User: [ {} ]", self.peer);
            if !simple {
                self.skip_depth = 1;
            }
            return Ok(());
        }
        let incomplete = attrs.flag(xml::ATTR_INCOMPLETE);
        let children = attrs.flag(xml::ATTR_CHILDREN);
        let size = attrs
            .non_empty(xml::ATTR_SIZE)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let date = attrs.get(xml::ATTR_DATE).and_then(parse_unix_date);

        self.dirs_loaded += 1;
        let key = format!("{}{}/", self.base_lower, name.to_lowercase());
        let existing = if self.updating {
            self.registry.lookup(&*self.tree, &key)
        } else {
            None
        };

        let d = match existing {
            Some(d) => {
                let dir = &mut self.tree[d];
                if !incomplete {
                    dir.set_complete();
                }
                dir.set_remote_date(date);
                d
            }
            None => {
                let mut dir = Directory::new(name.as_str(), DirType::from_flags(incomplete, children))
                    .with_update_date(self.list_date)
                    .with_partial_size(size)
                    .with_remote_date(date);
                if let (Some(index), true) = (self.dupes, self.partial_list) {
                    let path = self.tree.get_path(self.cur).child(&name);
                    dir.set_dupe(index.lookup_directory(&path, size));
                }
                self.tree.try_reserve(self.cur, 1, 0)?;
                let d = self.tree.add_directory(self.cur, dir);
                if self.updating && !incomplete {
                    self.registry.insert(key, d, true);
                }
                d
            }
        };

        self.cur = d;
        if self.updating && self.tree[d].is_complete() {
            self.prefix_stack.push(Some(self.base_lower.len()));
            self.base_lower.push_str(&name.to_lowercase());
            self.base_lower.push('/');
        } else {
            self.prefix_stack.push(None);
        }

        if simple {
            self.end_tag(xml::TAG_DIRECTORY)?;
        }
        Ok(())
    }
}

impl TagHandler for ListLoader<'_> {
    fn start_tag(&mut self, name: &str, attrs: &Attributes, simple: bool) -> Result<(), Error> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(Error::Aborted);
        }

        if self.skip_depth > 0 {
            if name == xml::TAG_DIRECTORY && !simple {
                self.skip_depth += 1;
            }
        } else if self.in_listing {
            match name {
                xml::TAG_FILE => self.start_file(attrs)?,
                xml::TAG_DIRECTORY => self.start_directory(attrs, simple)?,
                _ => {}
            }
        } else if name == xml::TAG_FILE_LISTING {
            self.start_listing(attrs, simple)?;
        }
        Ok(())
    }

    fn end_tag(&mut self, name: &str) -> Result<(), Error> {
        if !self.in_listing {
            return Ok(());
        }
        if self.skip_depth > 0 {
            if name == xml::TAG_DIRECTORY {
                self.skip_depth -= 1;
            }
            return Ok(());
        }
        match name {
            xml::TAG_DIRECTORY => {
                if let Some(Some(len)) = self.prefix_stack.pop() {
                    self.base_lower.truncate(len);
                }
                if let Some(parent) = self.tree[self.cur].parent() {
                    self.cur = parent;
                }
            }
            xml::TAG_FILE_LISTING => {
                // the directory the document describes is exact only now
                self.tree[self.cur].set_complete();
                self.in_listing = false;
            }
            _ => {}
        }
        Ok(())
    }
}
