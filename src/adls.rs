use regex::Regex;
use regex::RegexBuilder;
#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::path::ListPath;
use crate::path::is_valid_component;
use crate::tree::DirId;
use crate::tree::DirType;
use crate::tree::Directory;
use crate::tree::File;
use crate::tree::Tree;

/// What a rule is matched against.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AdlSource {
    /// File names.
    #[default]
    FileName,
    /// Directory names.
    DirectoryName,
    /// Directory path plus file name, in the platform notation.
    FullPath,
}

/// A user-defined matching rule.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdlRule {
    /// Search terms, or a regular expression when `is_regex` is set.
    pub pattern: String,
    /// Matched entity.
    #[serde(default)]
    pub source: AdlSource,
    /// Name of the synthetic directory receiving the hits.
    pub destination: String,
    /// Interpret `pattern` as a case-insensitive regular expression.
    #[serde(default)]
    pub is_regex: bool,
    /// Smallest matching file size in bytes.
    #[serde(default)]
    pub min_size: Option<u64>,
    /// Largest matching file size in bytes.
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Disabled rules are ignored.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AdlRule {
    /// An active substring rule on file names.
    pub fn new(pattern: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            source: AdlSource::FileName,
            destination: destination.into(),
            is_regex: false,
            min_size: None,
            max_size: None,
            active: true,
        }
    }
}

enum Matcher {
    Regex(Regex),
    Terms(Vec<String>),
}

impl Matcher {
    fn is_match(&self, s: &str) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(s),
            Matcher::Terms(terms) => {
                let lower = s.to_lowercase();
                !terms.is_empty() && terms.iter().all(|t| lower.contains(t.as_str()))
            }
        }
    }
}

struct CompiledRule {
    rule: AdlRule,
    matcher: Matcher,
}

impl CompiledRule {
    fn size_ok(&self, size: u64) -> bool {
        self.rule.min_size.is_none_or(|min| size >= min)
            && self.rule.max_size.is_none_or(|max| size <= max)
    }
}

/// Compiled rule set.
///
/// Matching files are copied into a synthetic directory named after the
/// rule's destination below the root; matching directories are copied there
/// with their whole content. The copies are left out of sizes, counts,
/// searches and written lists.
#[derive(Default)]
pub struct AdlMatcher {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for AdlMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| &r.rule))
            .finish()
    }
}

impl AdlMatcher {
    /// Compiles the active rules. An invalid regular expression or a
    /// destination that is not a plain name is an [`Error::InvalidArgument`].
    pub fn new(rules: &[AdlRule]) -> Result<Self, Error> {
        let mut compiled = Vec::new();
        for rule in rules.iter().filter(|r| r.active) {
            if !is_valid_component(&rule.destination) {
                return Err(Error::InvalidArgument(format!(
                    "Rule {} has an invalid destination '{}'",
                    rule.pattern, rule.destination
                )));
            }
            let matcher = if rule.is_regex {
                let re = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::InvalidArgument(e.to_string()))?;
                Matcher::Regex(re)
            } else {
                Matcher::Terms(
                    rule.pattern
                        .split_whitespace()
                        .map(str::to_lowercase)
                        .collect(),
                )
            };
            compiled.push(CompiledRule {
                rule: rule.clone(),
                matcher,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Returns true when no rule is active.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Replaces the synthetic directories of `tree` with fresh matches and
    /// returns the number of copied entries.
    pub fn match_listing(&self, tree: &mut Tree) -> usize {
        let root = tree.root();
        tree.clear_adls(root);
        if self.rules.is_empty() {
            return 0;
        }

        // (rule index, directory, file index or None for the directory)
        let mut hits: Vec<(usize, DirId, Option<usize>)> = Vec::new();
        tree.walk(root, &mut |id, dir| {
            let is_root = dir.parent().is_none();
            for (ri, rule) in self.rules.iter().enumerate() {
                match rule.rule.source {
                    AdlSource::DirectoryName => {
                        if !is_root && rule.matcher.is_match(dir.name()) {
                            hits.push((ri, id, None));
                        }
                    }
                    AdlSource::FileName => {
                        for (fi, f) in dir.files().iter().enumerate() {
                            if rule.size_ok(f.size) && rule.matcher.is_match(&f.name) {
                                hits.push((ri, id, Some(fi)));
                            }
                        }
                    }
                    AdlSource::FullPath => {}
                }
            }
        });

        // full paths need the tree itself, so match them outside the walk
        let mut dirs = Vec::new();
        tree.walk(root, &mut |id, _| dirs.push(id));
        for (ri, rule) in self.rules.iter().enumerate() {
            if rule.rule.source != AdlSource::FullPath {
                continue;
            }
            for id in &dirs {
                let prefix = tree.get_path(*id).to_nmdc();
                for (fi, f) in tree[*id].files().iter().enumerate() {
                    if rule.size_ok(f.size) && rule.matcher.is_match(&format!("{prefix}{}", f.name)) {
                        hits.push((ri, *id, Some(fi)));
                    }
                }
            }
        }

        let mut copied = 0;
        for (ri, src, file) in hits {
            let dest = destination(tree, &self.rules[ri].rule.destination);
            let source = tree.get_path(src);
            match file {
                Some(fi) => {
                    let mut f: File = tree[src].files()[fi].clone();
                    f.adls_source = Some(source);
                    tree.add_file(dest, f);
                }
                None => copy_subtree(tree, src, dest, source),
            }
            copied += 1;
        }
        log::debug!("Synthetic directory rules copied {copied} entries");
        copied
    }
}

/// Synthetic directory called `name` below the root, created on first use.
fn destination(tree: &mut Tree, name: &str) -> DirId {
    let root = tree.root();
    let existing = tree[root]
        .directories()
        .iter()
        .copied()
        .find(|d| tree[*d].is_adls() && tree[*d].name() == name);
    match existing {
        Some(d) => d,
        None => tree.add_directory(
            root,
            Directory::new(name, DirType::Normal).with_adls_source(ListPath::root()),
        ),
    }
}

fn copy_subtree(tree: &mut Tree, src: DirId, dest_parent: DirId, source: ListPath) {
    let (copy, files, children) = {
        let d = &tree[src];
        let copy = Directory::new(d.name(), d.dir_type())
            .with_partial_size(d.partial_size())
            .with_remote_date(d.remote_date())
            .with_update_date(d.update_date())
            .with_adls_source(source.clone());
        (copy, d.files().to_vec(), d.directories().to_vec())
    };
    let id = tree.add_directory(dest_parent, copy);
    for mut f in files {
        f.adls_source = Some(source.clone());
        tree.add_file(id, f);
    }
    for child in children {
        let child_source = source.child(tree[child].name());
        copy_subtree(tree, child, id, child_source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Tth;

    fn sample() -> Tree {
        let mut tree = Tree::new();
        let root = tree.root();
        tree[root].set_complete();
        let music = tree.add_directory(root, Directory::new("Music", DirType::Normal));
        let album = tree.add_directory(music, Directory::new("Some.Album-GRP", DirType::Normal));
        tree.add_file(album, File::new("01-track.mp3", 5_000_000, Tth::default()));
        tree.add_file(album, File::new("album.nfo", 500, Tth::default()));
        tree
    }

    #[test]
    fn file_hits_are_copied_and_excluded_from_totals() {
        let mut tree = sample();
        let root = tree.root();
        let before = tree.total_size(root, false);
        let mut rule = AdlRule::new(r"\.nfo$", "NFOs");
        rule.is_regex = true;
        let matcher = AdlMatcher::new(&[rule]).unwrap();
        assert_eq!(matcher.match_listing(&mut tree), 1);

        let dest = tree.find_child(root, "NFOs").unwrap();
        assert!(tree[dest].is_adls());
        let f = &tree[dest].files()[0];
        assert_eq!(f.name, "album.nfo");
        assert_eq!(
            f.adls_source.as_ref().unwrap().to_adc(),
            "/Music/Some.Album-GRP/"
        );
        assert_eq!(tree.total_size(root, false), before);
        assert_eq!(tree.total_size(dest, true), 500);
    }

    #[test]
    fn directory_hits_copy_content() {
        let mut tree = sample();
        let mut rule = AdlRule::new("album grp", "Releases");
        rule.source = AdlSource::DirectoryName;
        let matcher = AdlMatcher::new(&[rule]).unwrap();
        matcher.match_listing(&mut tree);

        let root = tree.root();
        let dest = tree.find_child(root, "Releases").unwrap();
        let copy = tree[dest].directories()[0];
        assert_eq!(tree[copy].file_count(), 2);
        assert!(tree[copy].files().iter().all(File::is_adls));
    }

    #[test]
    fn rematching_replaces_old_copies() {
        let mut tree = sample();
        let rule = AdlRule::new("track", "Tracks");
        let matcher = AdlMatcher::new(&[rule]).unwrap();
        matcher.match_listing(&mut tree);
        matcher.match_listing(&mut tree);
        let root = tree.root();
        let dests: Vec<_> = tree[root]
            .directories()
            .iter()
            .filter(|d| tree[**d].is_adls())
            .collect();
        assert_eq!(dests.len(), 1);
        assert_eq!(tree[*dests[0]].file_count(), 1);
    }

    #[test]
    fn full_path_and_size_limits() {
        let mut tree = sample();
        let mut rule = AdlRule::new("music mp3", "Big");
        rule.source = AdlSource::FullPath;
        rule.min_size = Some(1_000_000);
        let mut small = AdlRule::new("music", "Small");
        small.source = AdlSource::FullPath;
        small.max_size = Some(1000);
        let matcher = AdlMatcher::new(&[rule, small]).unwrap();
        assert_eq!(matcher.match_listing(&mut tree), 2);
        let root = tree.root();
        let big = tree.find_child(root, "Big").unwrap();
        assert_eq!(tree[big].files()[0].name, "01-track.mp3");
        let small = tree.find_child(root, "Small").unwrap();
        assert_eq!(tree[small].files()[0].name, "album.nfo");
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut rule = AdlRule::new("(", "x");
        rule.is_regex = true;
        assert!(matches!(
            AdlMatcher::new(&[rule]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn destination_must_be_a_single_name() {
        for bad in ["", "..", "a/b"] {
            assert!(matches!(
                AdlMatcher::new(&[AdlRule::new("x", bad)]),
                Err(Error::InvalidArgument(_))
            ));
        }
    }
}
