//! A collection of utility functions
use std::sync::OnceLock;

use chrono::DateTime;
use chrono::Utc;
use regex::Regex;

/// Converts a unix timestamp sent by a peer into a date. Zero and values
/// out of range mean "unknown".
pub fn date_from_unix(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

/// Parses the textual unix timestamp of a `Date`/`BaseDate` attribute.
pub fn parse_unix_date(s: &str) -> Option<DateTime<Utc>> {
    s.trim().parse::<i64>().ok().and_then(date_from_unix)
}

/// Unix timestamp of a date, zero for unknown.
pub fn unix_from_date(date: Option<DateTime<Utc>>) -> i64 {
    date.map(|d| d.timestamp()).unwrap_or(0)
}

/// Returns true when `name` looks like a scene-style release folder, e.g.
/// `Some.Artist-Some.Album-2015-GRP`.
///
/// Names must be free of whitespace, start with an uppercase letter or digit,
/// contain at least one letter and end in a `-GROUP` suffix of two or more
/// word characters.
pub fn is_release_name(name: &str) -> bool {
    static RELEASE_RE: OnceLock<Regex> = OnceLock::new();
    let re = RELEASE_RE
        .get_or_init(|| Regex::new(r"^[A-Z0-9]\S{3,}-[A-Za-z0-9_]{2,}$").expect("valid regex"));
    re.is_match(name) && name.chars().any(|c| c.is_ascii_alphabetic())
}

/// Returns true for `.nfo` info files.
pub fn is_nfo_name(name: &str) -> bool {
    static NFO_RE: OnceLock<Regex> = OnceLock::new();
    let re = NFO_RE.get_or_init(|| Regex::new(r"(?i)^.+\.nfo$").expect("valid regex"));
    re.is_match(name)
}

/// Strips a trailing `.bz2` and `.xml` (in that order) from a list file name.
fn strip_list_extensions(name: &str) -> &str {
    let mut name = name;
    for ext in [".bz2", ".xml"] {
        let cut = name.len().saturating_sub(ext.len());
        if name.len() >= ext.len()
            && name.get(cut..).is_some_and(|tail| tail.eq_ignore_ascii_case(ext))
        {
            name = &name[..cut];
        }
    }
    name
}

/// Extracts the nick from a list file named `[nick].[CID].xml[.bz2]`.
pub fn nick_from_filename(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = strip_list_extensions(base);
    stem.rfind('.').map(|i| stem[..i].to_string())
}
