use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

use crate::path::ListPath;

/// Notification sent to the observers of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingEvent {
    /// A load started. `reloading` is set when existing content is replaced.
    LoadingStarted {
        /// Existing content is being replaced rather than extended.
        reloading: bool,
    },
    /// A load, diff or rule match finished.
    LoadingFinished {
        /// Time spent.
        elapsed: Duration,
        /// Directory the load was about.
        dir: ListPath,
        /// The whole listing was replaced.
        reload: bool,
        /// Observers should navigate to `dir`.
        change_dir: bool,
    },
    /// A load failed. The reason is empty when the listing was closed.
    LoadingFailed(String),
    /// The current directory changed.
    ChangeDirectory {
        /// New location.
        path: ListPath,
        /// The change selects a search result.
        from_search: bool,
    },
    /// A search was started.
    SearchStarted,
    /// A search ended with results; the first one is selected next.
    SearchFinished {
        /// Number of distinct result directories.
        results: usize,
    },
    /// A search ended without results.
    SearchFailed {
        /// The peer stayed silent for the whole idle window.
        timed_out: bool,
    },
    /// The current location or a loading flag changed.
    StateChanged,
    /// Result of matching the listing against the download queue.
    QueueMatched(String),
    /// Presence or identity of the peer changed.
    UserUpdated,
    /// A pending list request for this directory was removed.
    RemovedQueue(ListPath),
    /// Informational text for the user.
    StatusMessage(String),
    /// The listing was closed and all pending work has run.
    Closed,
}

/// Events produced by collaborators of a listing. All of them are handled
/// at [`crate::Listing::handle_peer_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A hit for a direct search; `path` is the directory holding it.
    SearchResult {
        /// Token returned when the search was sent.
        token: String,
        /// Directory of the hit.
        path: ListPath,
    },
    /// The peer announced how many results it sent.
    SearchEnded {
        /// Token returned when the search was sent.
        token: String,
        /// Number of results.
        result_count: usize,
    },
    /// Periodic timer.
    Tick(Instant),
    /// The peer's information changed.
    UserUpdated,
    /// The peer disconnected.
    UserDisconnected,
}

/// Observer list of a listing.
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Mutex<Vec<UnboundedSender<ListingEvent>>>,
}

impl Subscribers {
    /// Registers a new observer.
    pub fn subscribe(&self) -> UnboundedReceiver<ListingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Sends `event` to every observer, forgetting those that went away.
    pub fn fire(&self, event: ListingEvent) {
        log::trace!("{event:?}");
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live observers.
    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when nobody listens.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
