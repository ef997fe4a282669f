//! An in-memory, partially loadable model of peer-to-peer share listings.
//!
//! A peer advertises its share as an XML file list. The list may arrive in
//! full, or one directory at a time as the user browses; this crate merges
//! either form into a [`Tree`], classifies its content against local
//! content, searches it, diffs it against other lists and turns directories
//! into download bundles. A [`Listing`] ties it together and serializes all
//! work on one listing through a task queue, reporting progress as
//! [`ListingEvent`]s.
//!
//! ```rust
//! # use std::collections::BTreeSet;
//! # use std::sync::atomic::AtomicBool;
//! # use filelist::ListLoader;
//! # use filelist::ListPath;
//! # use filelist::PathRegistry;
//! # use filelist::SearchQuery;
//! # use filelist::Tree;
//! # use filelist::search_tree;
//! let xml = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
//! <FileListing Version="1" Base="/" Generator="doc">
//!   <Directory Name="A">
//!     <File Name="f1" Size="10" TTH="LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"/>
//!     <Directory Name="B">
//!       <File Name="f2" Size="20" TTH="BAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/>
//!     </Directory>
//!   </Directory>
//! </FileListing>"#;
//!
//! let mut tree = Tree::new();
//! let mut registry = PathRegistry::new();
//! let closing = AtomicBool::new(false);
//! let dirs = ListLoader::new(&mut tree, &mut registry, &closing)
//!     .load_str(xml)
//!     .unwrap();
//! assert_eq!(dirs, 2);
//!
//! let a = tree.find_directory(&ListPath::from_adc("/A/").unwrap()).unwrap();
//! assert_eq!(tree.total_size(a, false), 30);
//!
//! let mut results = BTreeSet::new();
//! search_tree(&tree, tree.root(), &SearchQuery::new("f1"), &mut results);
//! let results: Vec<_> = results.iter().map(ListPath::to_adc).collect();
//! assert_eq!(results, ["/A/"]);
//! ```

mod adls;
mod bundle;
mod config;
mod dispatcher;
mod dupe;
mod errors;
mod events;
mod filter;
pub mod hash;
mod listing;
mod loader;
mod path;
mod registry;
mod search;
mod tree;
pub mod utils;
pub mod xml;

pub use adls::AdlMatcher;
pub use adls::AdlRule;
pub use adls::AdlSource;
pub use bundle::BundleFileInfo;
pub use bundle::BundleRequest;
pub use bundle::ListRequest;
pub use bundle::QueueManager;
pub use bundle::QueueMatch;
pub use bundle::TARGET_SEPARATOR;
pub use bundle::collect_files;
pub use bundle::plan_bundles;
pub use config::ListingSettings;
pub use dispatcher::DispatchPolicy;
pub use dispatcher::Task;
pub use dispatcher::TaskQueue;
pub use dupe::DupeIndex;
pub use dupe::DupeType;
pub use dupe::classify;
pub use dupe::propagate;
pub use errors::Error;
pub use events::ListingEvent;
pub use events::PeerEvent;
pub use events::Subscribers;
pub use filter::diff;
pub use filter::filter_list;
pub use hash::Tth;
pub use listing::CurrentLocation;
pub use listing::Listing;
pub use listing::ListingBuilder;
pub use listing::ReloadMode;
pub use loader::ListLoader;
pub use path::ADC_SEPARATOR;
pub use path::ListPath;
pub use path::NMDC_SEPARATOR;
pub use path::adc_to_nmdc;
pub use path::nmdc_to_adc;
pub use registry::PathRegistry;
pub use registry::RegistryEntry;
pub use registry::prepare_partial;
pub use search::ItemType;
pub use search::PeerClient;
pub use search::SearchAggregator;
pub use search::SearchCursor;
pub use search::SearchEnd;
pub use search::SearchQuery;
pub use search::SizeMode;
pub use search::search_tree;
pub use tree::DirId;
pub use tree::DirType;
pub use tree::Directory;
pub use tree::File;
pub use tree::Tree;
pub use xml::ListWriter;

#[cfg(any(test, feature = "test_utils"))]
pub(crate) mod test_utils;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::MockDupeIndex;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::MockPeers;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::MockQueue;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::QueuedBundle;
#[cfg(feature = "test_utils")]
pub use test_utils::TestListFile;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::TestListing;
#[cfg(feature = "test_utils")]
pub use test_utils::xml_diff;
#[cfg(any(test, feature = "test_utils"))]
pub use test_utils::tth_for;
