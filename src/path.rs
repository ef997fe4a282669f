use std::fmt::Display;

#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de;

use crate::errors::Error;

/// Separator of the network-canonical (ADC) notation, e.g. `/Music/Album/`.
pub const ADC_SEPARATOR: char = '/';

/// Separator of the platform-style (NMDC) notation, e.g. `Music\Album\`.
pub const NMDC_SEPARATOR: char = '\\';

/// A custom deserializer function for a Vec<String> that checks for
/// separators and relative components.
fn deserialize_components<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let components = Vec::<String>::deserialize(deserializer)?;

    if let Some(bad) = components.iter().find(|c| !is_valid_component(c)) {
        Err(de::Error::custom(format!("Invalid path component: {bad}")))
    } else {
        Ok(components)
    }
}

/// Returns true when `s` can be a single directory or file name: not empty,
/// not `.` or `..`, and free of both separators.
pub(crate) fn is_valid_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains(ADC_SEPARATOR)
        && !s.contains(NMDC_SEPARATOR)
}

/// Location of a directory inside a listing, stored as its name segments
/// from the root. The root itself is the empty path.
///
/// Two textual notations exist at the boundary and both convert losslessly:
/// the network form `/A/B/` and the platform form `A\B\`.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Hash, Eq, PartialOrd, Ord)]
pub struct ListPath {
    /// The name segments of the path.
    #[serde(deserialize_with = "deserialize_components")]
    components: Vec<String>,
}

impl Display for ListPath {
    /// Formats the path in the platform notation, `A\B\`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for comp in &self.components {
            write!(f, "{comp}{NMDC_SEPARATOR}")?;
        }
        Ok(())
    }
}

impl ListPath {
    /// Creates the root path
    pub fn root() -> Self {
        Self { components: vec![] }
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Name segments from the root.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Returns the last segment, the directory's own name.
    pub fn basename(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<ListPath> {
        if self.components.is_empty() {
            None
        } else {
            let mut parent_components = self.components.clone();
            parent_components.pop();
            Some(ListPath {
                components: parent_components,
            })
        }
    }

    /// Appends a new segment to the end of the path.
    pub fn push(&mut self, component: &str) {
        self.components.push(component.to_owned());
    }

    /// Returns a new path with `component` appended.
    pub fn child(&self, component: &str) -> ListPath {
        let mut ret = self.clone();
        ret.push(component);
        ret
    }

    /// Builds a path from directory names of a tree. The tree only holds
    /// names accepted by [`is_valid_component`].
    pub(crate) fn from_tree_names(names: &[&str]) -> Self {
        debug_assert!(names.iter().all(|n| is_valid_component(n)));
        Self {
            components: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Parses the network notation. Leading and trailing separators are
    /// optional; `/` and the empty string are the root.
    pub fn from_adc(s: &str) -> Result<Self, Error> {
        Self::parse(s, ADC_SEPARATOR)
    }

    /// Parses the platform notation. A trailing separator is optional and the
    /// empty string is the root.
    pub fn from_nmdc(s: &str) -> Result<Self, Error> {
        Self::parse(s, NMDC_SEPARATOR)
    }

    fn parse(s: &str, separator: char) -> Result<Self, Error> {
        let components: Vec<&str> = s.split(separator).filter(|c| !c.is_empty()).collect();
        Self::try_from(components.as_slice())
    }

    /// Formats the path in the network notation, `/A/B/`.
    pub fn to_adc(&self) -> String {
        let mut ret = String::from(ADC_SEPARATOR);
        for comp in &self.components {
            ret.push_str(comp);
            ret.push(ADC_SEPARATOR);
        }
        ret
    }

    /// Formats the path in the platform notation, `A\B\`.
    pub fn to_nmdc(&self) -> String {
        self.to_string()
    }

    /// Lowercase network notation, the key used by the partial-list registry.
    pub fn registry_key(&self) -> String {
        self.to_adc().to_lowercase()
    }
}

impl<T> TryFrom<&[T]> for ListPath
where
    T: AsRef<str>,
{
    type Error = Error;

    /// Attempt to build a `ListPath` from a slice of segments.
    ///
    /// Each segment is validated to not contain either separator and to
    /// not equal `.` or `..`. Returns `Error::InvalidArgument` on invalid
    /// segments.
    fn try_from(components: &[T]) -> std::result::Result<Self, Self::Error> {
        let mut c = Vec::with_capacity(components.len());
        for comp in components {
            let s = comp.as_ref();
            if !is_valid_component(s) {
                return Err(Error::InvalidArgument(format!(
                    "Invalid path component: {s}"
                )));
            }
            c.push(s.to_string());
        }
        Ok(ListPath { components: c })
    }
}

/// Converts the network notation to the platform notation.
pub fn adc_to_nmdc(path: &str) -> Result<String, Error> {
    Ok(ListPath::from_adc(path)?.to_nmdc())
}

/// Converts the platform notation to the network notation.
pub fn nmdc_to_adc(path: &str) -> Result<String, Error> {
    Ok(ListPath::from_nmdc(path)?.to_adc())
}
