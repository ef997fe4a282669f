use std::borrow::Cow;
use std::fmt::Display;
use std::io::BufRead;

use chrono::DateTime;
use chrono::Utc;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::BytesDecl;
use quick_xml::events::BytesEnd;
use quick_xml::events::BytesStart;
use quick_xml::events::Event;

use crate::errors::Error;
use crate::tree::DirId;
use crate::tree::DirType;
use crate::tree::Tree;
use crate::utils::unix_from_date;

/// Root element.
pub const TAG_FILE_LISTING: &str = "FileListing";
/// Directory element.
pub const TAG_DIRECTORY: &str = "Directory";
/// File element.
pub const TAG_FILE: &str = "File";
/// Base path of a partial list (network notation).
pub const ATTR_BASE: &str = "Base";
/// Remote date of the base directory.
pub const ATTR_BASE_DATE: &str = "BaseDate";
/// Name of the client that generated the list.
pub const ATTR_GENERATOR: &str = "Generator";
/// Name of a directory or file.
pub const ATTR_NAME: &str = "Name";
/// `1` when the directory content was not sent.
pub const ATTR_INCOMPLETE: &str = "Incomplete";
/// `1` when an incomplete directory has subdirectories.
pub const ATTR_CHILDREN: &str = "Children";
/// Size of a file or estimated size of an incomplete directory.
pub const ATTR_SIZE: &str = "Size";
/// Content hash of a file.
pub const ATTR_TTH: &str = "TTH";
/// Unix modification date.
pub const ATTR_DATE: &str = "Date";

/// Attributes of one element, in document order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attributes {
    pairs: Vec<(String, String)>,
}

impl Attributes {
    /// Builds attributes from `(name, value)` pairs.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `name`, `None` if the attribute is missing.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value of `name` when present and not empty.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// Returns true when `name` equals `1`.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("1")
    }
}

/// Receiver of tag events.
pub trait TagHandler {
    /// Called for every start tag. `simple` is set for self-closing tags,
    /// which get no matching [`TagHandler::end_tag`] call.
    fn start_tag(&mut self, name: &str, attrs: &Attributes, simple: bool) -> Result<(), Error>;

    /// Called for every end tag.
    fn end_tag(&mut self, name: &str) -> Result<(), Error>;
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, Error> {
    std::str::from_utf8(bytes).map_err(|e| Error::Parse {
        what: what.to_string(),
        how: e.to_string(),
    })
}

fn read_attributes(start: &BytesStart<'_>) -> Result<Attributes, Error> {
    let mut pairs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = utf8(attr.key.as_ref(), "attribute name")?.to_string();
        let value: Cow<'_, str> = attr.unescape_value()?;
        pairs.push((key, value.into_owned()));
    }
    Ok(Attributes { pairs })
}

/// Feeds every tag of the document in `reader` to `handler`.
///
/// Parsing stops at the first error, whether raised by the document or by
/// the handler.
pub fn parse<R: BufRead>(reader: R, handler: &mut impl TagHandler) -> Result<(), Error> {
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let attrs = read_attributes(e)?;
                handler.start_tag(utf8(e.name().as_ref(), "tag name")?, &attrs, false)?;
            }
            Event::Empty(ref e) => {
                let attrs = read_attributes(e)?;
                handler.start_tag(utf8(e.name().as_ref(), "tag name")?, &attrs, true)?;
            }
            Event::End(ref e) => {
                handler.end_tag(utf8(e.name().as_ref(), "tag name")?)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Parses an in-memory document.
pub fn parse_str(xml: &str, handler: &mut impl TagHandler) -> Result<(), Error> {
    parse(xml.as_bytes(), handler)
}

fn write_err<E: Display>(e: E) -> Error {
    Error::Parse {
        what: "file list output".into(),
        how: e.to_string(),
    }
}

/// Serializes a tree, or part of one, into the file list format.
pub struct ListWriter<'a> {
    tree: &'a Tree,
    generator: String,
    recursive: bool,
}

impl<'a> ListWriter<'a> {
    /// Creates a writer that emits complete subtrees.
    pub fn new(tree: &'a Tree) -> Self {
        Self {
            tree,
            generator: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            recursive: true,
        }
    }

    /// When `false` only the first level below the base is written and
    /// subdirectories are sent as incomplete, like a partial list.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Writes the listing rooted at `base`. The `Base` attribute carries the
    /// network path of `base`.
    pub fn write(&self, base: DirId) -> Result<String, Error> {
        let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
            .map_err(write_err)?;

        let dir = self.tree.get(base).ok_or_else(|| Error::NotFound(format!("{base:?}")))?;
        let base_path = self.tree.get_path(base).to_adc();
        let base_date = unix_from_date(dir.remote_date()).to_string();
        let mut root = BytesStart::new(TAG_FILE_LISTING);
        root.push_attribute(("Version", "1"));
        root.push_attribute((ATTR_BASE, base_path.as_str()));
        root.push_attribute((ATTR_BASE_DATE, base_date.as_str()));
        root.push_attribute((ATTR_GENERATOR, self.generator.as_str()));
        writer.write_event(Event::Start(root)).map_err(write_err)?;

        self.write_content(&mut writer, base, true)?;

        writer
            .write_event(Event::End(BytesEnd::new(TAG_FILE_LISTING)))
            .map_err(write_err)?;
        String::from_utf8(writer.into_inner()).map_err(write_err)
    }

    fn write_content(&self, writer: &mut Writer<Vec<u8>>, id: DirId, expand: bool) -> Result<(), Error> {
        let dir = &self.tree[id];
        for child in dir.directories() {
            if self.tree[*child].is_adls() {
                continue;
            }
            self.write_directory(writer, *child, expand && self.recursive)?;
        }
        for f in dir.files() {
            let size = f.size.to_string();
            let tth = f.tth.to_base32();
            let date = date_attr(f.remote_date);
            let mut e = BytesStart::new(TAG_FILE);
            e.push_attribute((ATTR_NAME, f.name.as_str()));
            e.push_attribute((ATTR_SIZE, size.as_str()));
            if !f.tth.is_empty() {
                e.push_attribute((ATTR_TTH, tth.as_str()));
            }
            if let Some(date) = &date {
                e.push_attribute((ATTR_DATE, date.as_str()));
            }
            writer.write_event(Event::Empty(e)).map_err(write_err)?;
        }
        Ok(())
    }

    fn write_directory(&self, writer: &mut Writer<Vec<u8>>, id: DirId, expand: bool) -> Result<(), Error> {
        let dir = &self.tree[id];
        let date = date_attr(dir.remote_date());
        let mut e = BytesStart::new(TAG_DIRECTORY);
        e.push_attribute((ATTR_NAME, dir.name()));
        if let Some(date) = &date {
            e.push_attribute((ATTR_DATE, date.as_str()));
        }

        if dir.is_complete() && expand {
            if dir.directories().is_empty() && dir.files().is_empty() {
                writer.write_event(Event::Empty(e)).map_err(write_err)?;
            } else {
                writer.write_event(Event::Start(e)).map_err(write_err)?;
                self.write_content(writer, id, true)?;
                writer
                    .write_event(Event::End(BytesEnd::new(TAG_DIRECTORY)))
                    .map_err(write_err)?;
            }
            return Ok(());
        }

        let size = self.tree.total_size(id, false).to_string();
        e.push_attribute((ATTR_INCOMPLETE, "1"));
        let has_children = if dir.is_complete() {
            !dir.directories().is_empty()
        } else {
            dir.dir_type() == DirType::IncompleteWithChildren
        };
        if has_children {
            e.push_attribute((ATTR_CHILDREN, "1"));
        }
        e.push_attribute((ATTR_SIZE, size.as_str()));
        writer.write_event(Event::Empty(e)).map_err(write_err)?;
        Ok(())
    }
}

fn date_attr(date: Option<DateTime<Utc>>) -> Option<String> {
    date.map(|d| d.timestamp().to_string())
}
