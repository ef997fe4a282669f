use std::time::Duration;

#[cfg(feature = "json_schema")]
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Tunables for a listing. Missing fields deserialize to their defaults, so
/// a partial JSON/TOML document is a valid configuration.
#[cfg_attr(feature = "json_schema", derive(JsonSchema))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingSettings {
    /// Classify files and directories against the local share and queue.
    #[serde(default = "default_true")]
    pub dupes_in_filelist: bool,

    /// Accept file entries without a `TTH` attribute.
    #[serde(default)]
    pub lan_mode: bool,

    /// When diffing, drop files smaller than this many KiB from directories
    /// left with fewer than two files. Zero disables the filter.
    #[serde(default)]
    pub skip_subtract_kb: u64,

    /// Refuse to create bundles that only contain zero byte files.
    #[serde(default)]
    pub skip_zero_byte: bool,

    /// Run the synthetic-directory rules after every full load.
    #[serde(default)]
    pub use_adls: bool,

    /// A peer search with no results fails after this many milliseconds.
    #[serde(default = "default_search_idle_timeout_ms")]
    pub search_idle_timeout_ms: u64,

    /// A peer search with results finishes once no new result has arrived
    /// for this many milliseconds.
    #[serde(default = "default_search_result_idle_ms")]
    pub search_result_idle_ms: u64,

    /// Upper bound of collected search results.
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
}

fn default_true() -> bool {
    true
}

fn default_search_idle_timeout_ms() -> u64 {
    5000
}

fn default_search_result_idle_ms() -> u64 {
    1000
}

fn default_max_search_results() -> usize {
    100
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            dupes_in_filelist: default_true(),
            lan_mode: false,
            skip_subtract_kb: 0,
            skip_zero_byte: false,
            use_adls: false,
            search_idle_timeout_ms: default_search_idle_timeout_ms(),
            search_result_idle_ms: default_search_result_idle_ms(),
            max_search_results: default_max_search_results(),
        }
    }
}

impl ListingSettings {
    /// Size threshold of the diff straggler filter in bytes.
    pub fn skip_subtract_bytes(&self) -> Option<u64> {
        (self.skip_subtract_kb > 0).then(|| self.skip_subtract_kb * 1024)
    }

    /// Idle window of a peer search that has not produced any result.
    pub fn search_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.search_idle_timeout_ms)
    }

    /// Idle window after the most recent search result.
    pub fn search_result_idle(&self) -> Duration {
        Duration::from_millis(self.search_result_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ListingSettings::default();
        assert!(settings.dupes_in_filelist);
        assert!(!settings.lan_mode);
        assert_eq!(settings.search_idle_timeout(), Duration::from_secs(5));
        assert_eq!(settings.search_result_idle(), Duration::from_secs(1));
        assert_eq!(settings.skip_subtract_bytes(), None);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings: ListingSettings =
            serde_json::from_str(r#"{"lan_mode": true, "skip_subtract_kb": 4}"#).unwrap();
        assert!(settings.lan_mode);
        assert!(settings.dupes_in_filelist);
        assert_eq!(settings.skip_subtract_bytes(), Some(4096));
        assert_eq!(settings.max_search_results, 100);
    }
}
