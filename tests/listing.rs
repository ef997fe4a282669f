use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use filelist::AdlRule;
use filelist::DupeType;
use filelist::ListPath;
use filelist::Listing;
use filelist::ListingEvent;
use filelist::ListingSettings;
use filelist::MockDupeIndex;
use filelist::MockPeers;
use filelist::MockQueue;
use filelist::PeerEvent;
use filelist::ReloadMode;
use filelist::SearchQuery;
use filelist::TestListFile;
use filelist::TestListing;
use filelist::tth_for;
use filelist::utils::date_from_unix;
use tokio::sync::mpsc::UnboundedReceiver;

fn path(s: &str) -> ListPath {
    ListPath::from_adc(s).unwrap()
}

fn drain(rx: &mut UnboundedReceiver<ListingEvent>) -> Vec<ListingEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn partial(peer: Arc<MockPeers>) -> Listing {
    Listing::builder(peer, Arc::new(MockQueue::default()))
        .partial(true)
        .build()
        .unwrap()
}

fn browse_to_b(listing: &Listing) {
    listing.add_partial_list_task(
        TestListing::new("/").incomplete_dir("A", 30, true).to_xml(),
        ListPath::root(),
        false,
        true,
    );
    listing.add_partial_list_task(
        TestListing::new("/A/")
            .file("f1", 10)
            .incomplete_dir("B", 20, false)
            .to_xml(),
        path("/A/"),
        false,
        true,
    );
    listing.add_partial_list_task(
        TestListing::new("/A/B/")
            .base_date(1_500_000_000)
            .file_with_tth("f2", 20, &tth_for(100))
            .to_xml(),
        path("/A/B/"),
        false,
        true,
    );
}

#[test]
fn partial_browsing_builds_the_tree() {
    let listing = partial(Arc::new(MockPeers::new("peer")));
    browse_to_b(&listing);
    assert_eq!(listing.dir_size(&path("/A/")), 30);
    assert_eq!(listing.dir_size(&path("/A/B/")), 20);
    assert_eq!(listing.current_location().path, path("/A/B/"));
}

#[test]
fn reloading_a_visited_directory_replaces_its_content() {
    let listing = partial(Arc::new(MockPeers::new("peer")));
    browse_to_b(&listing);
    let b = path("/A/B/");
    let first_update = listing.with_tree(|t| t[t.find_directory(&b).unwrap()].update_date());

    let mut rx = listing.subscribe();
    listing.add_partial_list_task(
        TestListing::new("/A/B/")
            .base_date(1_600_000_000)
            .file_with_tth("f3", 5, &tth_for(200))
            .to_xml(),
        b.clone(),
        false,
        true,
    );
    assert_eq!(
        drain(&mut rx)[0],
        ListingEvent::LoadingStarted { reloading: true }
    );

    listing.with_tree(|t| {
        let id = t.find_directory(&b).unwrap();
        let names: Vec<_> = t[id].files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["f3"]);
        assert_eq!(t[id].remote_date(), date_from_unix(1_600_000_000));
        assert!(t[id].update_date() >= first_update);
        assert!(t[id].is_complete());
    });
    assert_eq!(listing.dir_size(&path("/A/")), 15);
}

#[test]
fn applying_a_payload_twice_changes_nothing() {
    let listing = partial(Arc::new(MockPeers::new("peer")));
    browse_to_b(&listing);
    let payload = TestListing::new("/A/")
        .file("f1", 10)
        .dir("C")
        .file("c1", 1)
        .end()
        .incomplete_dir("B", 20, false)
        .to_xml();

    listing.add_partial_list_task(payload.clone(), path("/A/"), false, true);
    let once = listing.write_list(&ListPath::root(), true).unwrap();
    listing.add_partial_list_task(payload, path("/A/"), false, true);
    let twice = listing.write_list(&ListPath::root(), true).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn reload_all_starts_from_scratch() {
    let listing = partial(Arc::new(MockPeers::new("peer")));
    browse_to_b(&listing);
    let mut rx = listing.subscribe();
    listing.add_partial_list_task(
        TestListing::new("/").incomplete_dir("Z", 1, false).to_xml(),
        ListPath::root(),
        true,
        true,
    );
    listing.with_tree(|t| {
        assert!(t.find_directory(&path("/A/")).is_none());
        assert!(t.find_directory(&path("/Z/")).is_some());
    });
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ListingEvent::LoadingFinished { reload: true, .. }
    )));
}

#[test]
fn direct_search_ends_when_all_results_arrived() {
    let peer = Arc::new(MockPeers::new("peer"));
    peer.set_direct_search(true);
    let listing = partial(peer.clone());
    let mut rx = listing.subscribe();
    listing.add_search_task(SearchQuery::new("f1"), ListPath::root());
    let token = peer.last_token();

    listing.handle_peer_event(PeerEvent::SearchEnded {
        token: token.clone(),
        result_count: 3,
    });
    for p in ["/X/", "/Y/"] {
        listing.handle_peer_event(PeerEvent::SearchResult {
            token: token.clone(),
            path: path(p),
        });
    }
    assert_eq!(drain(&mut rx), [ListingEvent::SearchStarted]);

    // hits of other searches do not count
    listing.handle_peer_event(PeerEvent::SearchResult {
        token: "other".into(),
        path: path("/W/"),
    });
    listing.handle_peer_event(PeerEvent::SearchResult {
        token,
        path: path("/Z/"),
    });
    assert_eq!(drain(&mut rx), [ListingEvent::SearchFinished { results: 3 }]);
    assert_eq!(
        listing.search_results(),
        [path("/X/"), path("/Y/"), path("/Z/")]
    );
}

#[test]
fn silent_peer_times_out() {
    let peer = Arc::new(MockPeers::new("peer"));
    peer.set_direct_search(true);
    let listing = partial(peer);
    let mut rx = listing.subscribe();
    listing.add_search_task(SearchQuery::new("nothing"), ListPath::root());
    drain(&mut rx);

    listing.handle_peer_event(PeerEvent::Tick(Instant::now() + Duration::from_secs(4)));
    assert!(drain(&mut rx).is_empty());
    listing.handle_peer_event(PeerEvent::Tick(Instant::now() + Duration::from_millis(5001)));
    assert_eq!(
        drain(&mut rx),
        [ListingEvent::SearchFailed { timed_out: true }]
    );
    assert!(listing.search_results().is_empty());
}

#[test]
fn results_converge_after_a_quiet_second() {
    let peer = Arc::new(MockPeers::new("peer"));
    peer.set_direct_search(true);
    let listing = partial(peer.clone());
    let mut rx = listing.subscribe();
    listing.add_search_task(SearchQuery::new("f1"), ListPath::root());
    listing.handle_peer_event(PeerEvent::SearchResult {
        token: peer.last_token(),
        path: path("/X/"),
    });
    drain(&mut rx);

    listing.handle_peer_event(PeerEvent::Tick(Instant::now() + Duration::from_millis(1100)));
    assert_eq!(drain(&mut rx), [ListingEvent::SearchFinished { results: 1 }]);
}

#[test]
fn full_list_from_disk() {
    let file = TestListFile::new(
        "somebody",
        &TestListing::new("/")
            .dir("A")
            .file("f1", 10)
            .dir("B")
            .file("f2", 20)
            .to_xml(),
    )
    .unwrap();
    let listing = Listing::builder(Arc::new(MockPeers::new("")), Arc::new(MockQueue::default()))
        .file_name(file.path())
        .build()
        .unwrap();
    assert_eq!(listing.nick(), "somebody");

    let mut rx = listing.subscribe();
    listing.add_full_list_task(path("/A/"));
    assert_eq!(listing.dir_size(&path("/A/")), 30);
    assert!(!listing.is_partial());

    let location = listing.current_location();
    assert_eq!(location.path, path("/A/"));
    assert_eq!(location.files, 1);
    assert_eq!(location.directories, 1);

    listing.add_search_task(SearchQuery::new("f1"), ListPath::root());
    assert_eq!(listing.search_results(), [path("/A/")]);
    let events = drain(&mut rx);
    assert_eq!(events[0], ListingEvent::LoadingStarted { reloading: false });
    assert!(events.contains(&ListingEvent::ChangeDirectory {
        path: path("/A/"),
        from_search: true
    }));
}

#[test]
fn unsupported_list_format_fails_the_load() {
    let file = TestListFile::with_extension("peer", "not a list", "bz2").unwrap();
    let listing = Listing::builder(Arc::new(MockPeers::new("peer")), Arc::new(MockQueue::default()))
        .file_name(file.path())
        .build()
        .unwrap();
    let mut rx = listing.subscribe();
    listing.add_full_list_task(ListPath::root());
    let events = drain(&mut rx);
    match events.last() {
        Some(ListingEvent::LoadingFailed(reason)) => {
            assert!(reason.starts_with("peer: "), "{reason}")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn diff_task_removes_shared_content() {
    let mine = TestListFile::new(
        "me",
        &TestListing::new("/").dir("A").file("f1", 10).to_xml(),
    )
    .unwrap();
    let theirs = TestListFile::new(
        "peer",
        &TestListing::new("/")
            .dir("A")
            .file("f1", 10)
            .end()
            .dir("New")
            .file_with_tth("n", 1, &tth_for(50))
            .to_xml(),
    )
    .unwrap();
    let listing = Listing::builder(Arc::new(MockPeers::new("peer")), Arc::new(MockQueue::default()))
        .file_name(theirs.path())
        .build()
        .unwrap();
    listing.add_full_list_task(ListPath::root());
    listing.add_list_diff_task(mine.path());
    listing.with_tree(|t| {
        assert!(t.find_directory(&path("/A/")).is_none());
        assert!(t.find_directory(&path("/New/")).is_some());
    });
}

#[test]
fn client_view_works_in_the_background() {
    let file = TestListFile::new(
        "peer",
        &TestListing::new("/")
            .dir("Shared")
            .file("s", 10)
            .end()
            .dir("Queued")
            .file("q", 10)
            .end()
            .dir("Music")
            .file("track.mp3", 10)
            .to_xml(),
    )
    .unwrap();
    let index = MockDupeIndex::new()
        .with_file(tth_for(0), DupeType::FullShare)
        .with_file(tth_for(1), DupeType::FullQueue);
    let settings = ListingSettings {
        use_adls: true,
        ..Default::default()
    };
    let listing = Listing::builder(Arc::new(MockPeers::new("peer")), Arc::new(MockQueue::default()))
        .dupes(Arc::new(index))
        .settings(settings)
        .adl_rules(vec![AdlRule::new("mp3", "Tracks")])
        .client_view(true)
        .file_name(file.path())
        .build()
        .unwrap();
    let mut rx = listing.subscribe();
    listing.add_full_list_task(ListPath::root());
    listing.close();
    listing.join();

    let events = drain(&mut rx);
    assert_eq!(events.last(), Some(&ListingEvent::Closed));
    assert!(events.contains(&ListingEvent::StatusMessage("Matching ADL...".into())));

    listing.with_tree(|t| {
        let dupe = |p: &str| t[t.find_directory(&path(p)).unwrap()].dupe();
        assert_eq!(dupe("/Shared/"), DupeType::FullShare);
        assert_eq!(dupe("/Queued/"), DupeType::FullQueue);
        assert_eq!(dupe("/Music/"), DupeType::None);
        assert_eq!(t[t.root()].dupe(), DupeType::None);

        let tracks = t.find_directory(&path("/Tracks/")).unwrap();
        assert!(t[tracks].is_adls());
        assert_eq!(t.total_size(t.root(), false), 30);
    });
    let written = listing.write_list(&ListPath::root(), true).unwrap();
    assert!(!written.contains("Tracks"));
}

#[test]
fn change_directory_with_reload_requests_again() {
    let listing = partial(Arc::new(MockPeers::new("peer")));
    browse_to_b(&listing);
    let mut rx = listing.subscribe();
    listing
        .change_directory(&path("/A/"), ReloadMode::Dir, false)
        .unwrap();
    assert!(listing.current_location().loading);
    assert_eq!(
        drain(&mut rx),
        [ListingEvent::ChangeDirectory {
            path: path("/A/"),
            from_search: false
        }]
    );
}

#[test]
fn background_events_can_be_awaited() {
    let listing = Listing::builder(Arc::new(MockPeers::new("peer")), Arc::new(MockQueue::default()))
        .partial(true)
        .client_view(true)
        .build()
        .unwrap();
    let mut rx = listing.subscribe();
    listing.add_partial_list_task(
        TestListing::new("/").dir("A").file("f1", 10).to_xml(),
        ListPath::root(),
        false,
        true,
    );

    let loaded = tokio_test::block_on(async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let finished = matches!(event, ListingEvent::LoadingFinished { .. });
            events.push(event);
            if finished {
                break;
            }
        }
        events
    });
    assert!(matches!(loaded[0], ListingEvent::LoadingStarted { .. }));
    assert_eq!(listing.dir_size(&path("/A/")), 10);

    listing.close();
    let closed = tokio_test::block_on(async {
        while let Some(event) = rx.recv().await {
            if event == ListingEvent::Closed {
                return true;
            }
        }
        false
    });
    assert!(closed);
    listing.join();
}
