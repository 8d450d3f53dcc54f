use std::{rc::Rc, time::Duration};

use assert_call::{call, CallRecorder};
use futures::executor::LocalPool;
use serde_json::{json, Value};

use crate::{
    test_helpers::{ManualClock, ManualFetch},
    CachePolicy, LoadError, Loader, MemoryCache, RequestStatus, RequestToken, Response, Settled,
};

fn setup() -> (LocalPool, ManualFetch, Loader<Value>) {
    let pool = LocalPool::new();
    let fetch = ManualFetch::default();
    let loader = Loader::new(fetch.clone(), pool.spawner());
    (pool, fetch, loader)
}

#[test]
fn load_then_success() {
    let (mut pool, fetch, loader) = setup();
    assert_eq!(loader.state("k").status, RequestStatus::Idle);

    let v = loader.load("k");
    assert!(v.is_loading);
    assert!(!v.has_error);
    assert!(v.data.is_none());

    fetch.ok("k", r#"{"id":1}"#);
    pool.run_until_stalled();

    let v = loader.load("k");
    assert!(!v.is_loading);
    assert_eq!(v.data.as_deref(), Some(&json!({ "id": 1 })));
    assert_eq!(loader.state("k").status, RequestStatus::Success);
}

#[test]
fn cache_hit_does_not_fetch() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    fetch.ok("k", "1");
    pool.run_until_stalled();
    let first = loader.load("k").data.unwrap();

    let second = loader.load("k").data.unwrap();
    pool.run_until_stalled();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(fetch.call_count("k"), 1);
}

#[test]
fn concurrent_loads_share_one_fetch() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    loader.load("k");
    loader.load("k");
    assert_eq!(fetch.call_count("k"), 1);
    assert_eq!(loader.pending_count(), 1);

    fetch.ok("k", "7");
    pool.run_until_stalled();
    assert_eq!(loader.load("k").data.as_deref(), Some(&json!(7)));
    assert_eq!(fetch.call_count("k"), 1);
    assert_eq!(loader.pending_count(), 0);
}

#[test]
fn resolve_shares_fetch_with_load() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    let a = loader.resolve("k");
    let b = loader.resolve("k");
    assert_eq!(fetch.call_count("k"), 1);

    fetch.ok("k", r#""v""#);
    let a = pool.run_until(a);
    let b = pool.run_until(b);
    for s in [a, b] {
        match s {
            Settled::Success(v) => assert_eq!(*v, json!("v")),
            s => panic!("unexpected {s:?}"),
        }
    }
}

#[test]
fn resolve_from_cache() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    fetch.ok("k", "1");
    pool.run_until_stalled();

    let s = pool.run_until(loader.resolve("k"));
    assert!(matches!(s, Settled::Success(v) if *v == json!(1)));
    assert_eq!(fetch.call_count("k"), 1);
}

#[test]
fn later_key_wins_over_late_response() {
    let (mut pool, fetch, loader) = setup();
    loader.load("a");
    loader.load("b");

    fetch.ok("b", r#""b""#);
    pool.run_until_stalled();
    fetch.ok("a", r#""a""#);
    pool.run_until_stalled();

    let (key, state) = loader.current().unwrap();
    assert_eq!(key.as_str(), "b");
    assert_eq!(state.data.as_deref(), Some(&json!("b")));
    assert_eq!(loader.load("b").data.as_deref(), Some(&json!("b")));
}

#[test]
fn superseded_response_is_discarded() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    let first = loader.resolve("k");
    loader.refresh("k");
    assert_eq!(fetch.call_count("k"), 2);

    fetch.respond_latest("k", Ok(Response::new(200, "OK", r#""new""#)));
    pool.run_until_stalled();
    fetch.respond("k", Ok(Response::new(200, "OK", r#""old""#)));
    pool.run_until_stalled();

    let state = loader.state("k");
    assert_eq!(state.data.as_deref(), Some(&json!("new")));
    assert!(matches!(pool.run_until(first), Settled::Superseded));

    // the cache holds the newer value too
    assert_eq!(loader.load("k").data.as_deref(), Some(&json!("new")));
    assert_eq!(fetch.call_count("k"), 2);
}

#[test]
fn resolve_of_previous_key_is_superseded() {
    let (mut pool, fetch, loader) = setup();
    let a = loader.resolve("a");
    let b = loader.resolve("b");

    fetch.ok("b", r#""b""#);
    assert!(matches!(pool.run_until(b), Settled::Success(v) if *v == json!("b")));
    fetch.ok("a", r#""a""#);
    assert!(matches!(pool.run_until(a), Settled::Superseded));

    // the late result is still kept for its own key
    assert_eq!(loader.state("a").data.as_deref(), Some(&json!("a")));
    assert_eq!(loader.current().unwrap().0.as_str(), "b");
}

#[test]
fn superseded_error_is_discarded() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    loader.refresh("k");

    fetch.respond_latest("k", Ok(Response::new(200, "OK", "2")));
    pool.run_until_stalled();
    fetch.status("k", 500, "Internal Server Error");
    pool.run_until_stalled();

    let v = loader.load("k");
    assert!(!v.has_error);
    assert_eq!(v.data.as_deref(), Some(&json!(2)));
}

#[test]
fn error_is_not_cached() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    fetch.status("k", 404, "Not Found");
    pool.run_until_stalled();

    let v = loader.load("k");
    assert_eq!(fetch.call_count("k"), 2);
    assert!(v.is_loading);

    fetch.ok("k", "1");
    pool.run_until_stalled();
    assert_eq!(loader.load("k").data.as_deref(), Some(&json!(1)));
}

#[test]
fn error_state() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    fetch.status("k", 404, "Not Found");
    pool.run_until_stalled();

    let state = loader.state("k");
    assert_eq!(state.status, RequestStatus::Error);
    let v = state.view();
    assert!(v.has_error);
    assert!(!v.is_loading);
    assert!(v.data.is_none());
    assert_eq!(
        v.error,
        Some(LoadError::Status {
            code: 404,
            message: "Not Found".into()
        })
    );
}

#[test]
fn transport_and_decode_errors() {
    let (mut pool, fetch, loader) = setup();
    loader.load("a");
    loader.load("b");
    fetch.respond("a", Err(LoadError::Transport("connection refused".into())));
    fetch.ok("b", "{ not json");
    pool.run_until_stalled();

    assert_eq!(
        loader.state("a").error,
        Some(LoadError::Transport("connection refused".into()))
    );
    assert!(matches!(loader.state("b").error, Some(LoadError::Decode(_))));
}

#[test]
fn tokens_increase_per_key() {
    let (mut pool, fetch, loader) = setup();
    loader.load("a");
    assert_eq!(loader.state("a").token.value(), 1);
    loader.load("b");
    assert_eq!(loader.state("b").token.value(), 1);

    fetch.status("a", 500, "Internal Server Error");
    pool.run_until_stalled();
    loader.load("a");
    assert_eq!(loader.state("a").token.value(), 2);
    assert_eq!(loader.state("unknown").token, RequestToken::NONE);
}

#[test]
fn invalidate_refetches() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    fetch.ok("k", "1");
    pool.run_until_stalled();

    assert!(loader.invalidate("k"));
    assert!(!loader.invalidate("k"));
    assert!(loader.load("k").is_loading);
    assert_eq!(fetch.call_count("k"), 2);
}

#[test]
fn cancel_discards_in_flight() {
    let (mut pool, fetch, loader) = setup();
    loader.load("k");
    loader.cancel("k");
    assert_eq!(loader.state("k").status, RequestStatus::Idle);
    assert!(!loader.is_pending("k"));

    fetch.ok("k", "1");
    pool.run_until_stalled();
    assert_eq!(loader.state("k").status, RequestStatus::Idle);

    // not cached: the next load fetches again
    assert!(loader.load("k").is_loading);
    assert_eq!(fetch.call_count("k"), 2);
}

#[test]
fn cancel_unknown_key_does_nothing() {
    let mut cr = CallRecorder::new();
    let (_pool, _fetch, loader) = setup();
    let _s = loader.subscribe(|e| call!("{} {}", e.key, e.state.status));

    loader.cancel("never-loaded");
    cr.verify(());
    assert_eq!(loader.state("never-loaded").token, RequestToken::NONE);
    assert_eq!(loader.state("never-loaded").status, RequestStatus::Idle);
}

#[test]
fn cancel_from_subscriber_keeps_order_for_others() {
    let mut cr = CallRecorder::new();
    let (_pool, _fetch, loader) = setup();
    let _a = loader.subscribe({
        let loader = loader.clone();
        move |e| {
            if e.key.as_str() == "k" && e.state.status == RequestStatus::Loading {
                loader.cancel("k");
            }
        }
    });
    let _b = loader.subscribe(|e| call!("{} {}", e.key, e.state.status));

    loader.load("k");
    cr.verify("k idle");
}

#[test]
fn ttl_expiry_refetches() {
    let mut pool = LocalPool::new();
    let fetch = ManualFetch::default();
    let clock = ManualClock::new();
    let loader: Loader<Value> = Loader::builder(fetch.clone(), pool.spawner())
        .policy(CachePolicy::new().with_ttl(Duration::from_secs(30)))
        .clock(clock.clone())
        .build();

    loader.load("k");
    fetch.ok("k", "1");
    pool.run_until_stalled();

    clock.advance(Duration::from_secs(10));
    assert!(!loader.load("k").is_loading);
    assert_eq!(fetch.call_count("k"), 1);

    clock.advance(Duration::from_secs(30));
    assert!(loader.load("k").is_loading);
    assert_eq!(fetch.call_count("k"), 2);
}

#[test]
fn custom_cache_store() {
    let mut pool = LocalPool::new();
    let fetch = ManualFetch::default();
    let loader: Loader<Value> = Loader::builder(fetch.clone(), pool.spawner())
        .cache(MemoryCache::new(CachePolicy::new().with_capacity(1)))
        .build();

    loader.load("a");
    fetch.ok("a", "1");
    pool.run_until_stalled();
    loader.load("b");
    fetch.ok("b", "2");
    pool.run_until_stalled();

    assert!(loader.load("a").is_loading);
    assert_eq!(fetch.call_count("a"), 2);
}

#[test]
fn subscribe_receives_transitions() {
    let mut cr = CallRecorder::new();
    let (mut pool, fetch, loader) = setup();
    let _s = loader.subscribe(|e| call!("{} {}", e.key, e.state.status));

    loader.load("k");
    cr.verify("k loading");
    loader.load("k");
    cr.verify(());

    fetch.ok("k", "1");
    pool.run_until_stalled();
    cr.verify("k success");

    loader.load("k");
    cr.verify(());
}

#[test]
fn load_from_subscriber_does_not_recurse() {
    let mut cr = CallRecorder::new();
    let (mut pool, fetch, loader) = setup();
    let _s = loader.subscribe({
        let loader = loader.clone();
        move |e| {
            call!("{}", e.state.status);
            loader.load(e.key.clone());
        }
    });
    loader.load("k");
    cr.verify("loading");
    fetch.ok("k", "1");
    pool.run_until_stalled();
    cr.verify("success");
}

#[test]
fn dropped_executor_reports_spawn_error() {
    let pool = LocalPool::new();
    let spawner = pool.spawner();
    drop(pool);
    let fetch = ManualFetch::default();
    let loader: Loader<Value> = Loader::new(fetch.clone(), spawner);

    let v = loader.load("k");
    assert!(v.has_error);
    assert!(matches!(v.error, Some(LoadError::Spawn(_))));
    assert!(!loader.is_pending("k"));
}
