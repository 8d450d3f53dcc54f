use std::{cell::RefCell, collections::HashMap, future::Future, rc::Rc};

use derive_ex::{derive_ex, Ex};
use futures::{
    future::FutureExt,
    task::{LocalSpawn, LocalSpawnExt},
};
use parse_display::Display;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::{
    Action, ActionType, AsyncAction, CachePolicy, CacheStore, Clock, MemoryCache, RequestKey,
    StoreError, SubscriberRegistry, Subscription, SystemClock,
};

mod coordinator;
mod fetch;

pub use coordinator::RequestToken;
pub use fetch::*;

use coordinator::{RequestCoordinator, SharedFetch};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, Display, Default, PartialEq, Eq, Hash)]
#[display(style = "snake_case")]
pub enum RequestStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Latest known state of the requests for one key.
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub struct RequestState<T> {
    pub status: RequestStatus,
    pub data: Option<Rc<T>>,
    pub error: Option<LoadError>,
    pub token: RequestToken,
}

impl<T> RequestState<T> {
    pub fn idle() -> Self {
        Self::idle_at(RequestToken::NONE)
    }
    fn idle_at(token: RequestToken) -> Self {
        Self {
            status: RequestStatus::Idle,
            data: None,
            error: None,
            token,
        }
    }
    fn loading(token: RequestToken) -> Self {
        Self {
            status: RequestStatus::Loading,
            ..Self::idle_at(token)
        }
    }
    fn success(data: Rc<T>, token: RequestToken) -> Self {
        Self {
            status: RequestStatus::Success,
            data: Some(data),
            ..Self::idle_at(token)
        }
    }
    fn failure(error: LoadError, token: RequestToken) -> Self {
        Self {
            status: RequestStatus::Error,
            error: Some(error),
            ..Self::idle_at(token)
        }
    }

    pub fn view(&self) -> LoadView<T> {
        LoadView {
            data: self.data.clone(),
            is_loading: self.status == RequestStatus::Loading,
            has_error: self.status == RequestStatus::Error,
            error: self.error.clone(),
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        let same_data = match (&self.data, &other.data) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.status == other.status
            && self.token == other.token
            && self.error == other.error
            && same_data
    }
}

/// Read-only view returned by [`Loader::load`].
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub struct LoadView<T> {
    pub data: Option<Rc<T>>,
    pub is_loading: bool,
    pub has_error: bool,
    pub error: Option<LoadError>,
}

/// Published each time the state of a key changes.
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub struct LoadEvent<T> {
    pub key: RequestKey,
    pub state: RequestState<T>,
}

/// Result of [`Loader::resolve`].
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub enum Settled<T> {
    Success(Rc<T>),
    Error(LoadError),
    /// A newer request for the same key was started before this one finished.
    Superseded,
}

enum Ensured<T> {
    Ready(Settled<T>),
    InFlight(RequestToken, SharedFetch<T>),
}

#[derive(Ex)]
#[derive_ex(Default)]
#[default(Self::new())]
pub struct LoaderOptions {
    pub policy: CachePolicy,
    pub clock: Rc<dyn Clock>,
}

impl LoaderOptions {
    pub fn new() -> Self {
        Self {
            policy: CachePolicy::default(),
            clock: Rc::new(SystemClock),
        }
    }
}

pub struct LoaderBuilder<T: 'static> {
    fetcher: Box<dyn Fetch>,
    spawner: Box<dyn LocalSpawn>,
    options: LoaderOptions,
    cache: Option<Box<dyn CacheStore<T>>>,
}

impl<T: DeserializeOwned + 'static> LoaderBuilder<T> {
    pub fn options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.options.policy = policy;
        self
    }
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.options.clock = Rc::new(clock);
        self
    }

    /// Uses `cache` instead of a [`MemoryCache`]. Cache policy and clock options are ignored.
    pub fn cache(mut self, cache: impl CacheStore<T>) -> Self {
        self.cache = Some(Box::new(cache));
        self
    }

    pub fn build(self) -> Loader<T> {
        let cache: Box<dyn CacheStore<T>> = match self.cache {
            Some(cache) => cache,
            None => Box::new(MemoryCache::with_clock(
                self.options.policy,
                self.options.clock,
            )),
        };
        Loader(Rc::new(LoaderNode {
            fetcher: self.fetcher,
            spawner: self.spawner,
            cache: RefCell::new(cache),
            coordinator: RefCell::new(RequestCoordinator::new()),
            states: RefCell::new(HashMap::new()),
            current: RefCell::new(None),
            subscribers: Rc::new(SubscriberRegistry::new()),
        }))
    }
}

/// Cached asynchronous loader.
///
/// Concurrent loads of the same key share one fetch, successful results are cached,
/// and results of superseded requests are discarded.
/// Fetches run on the local executor given at construction.
#[derive_ex(Clone, bound())]
pub struct Loader<T: 'static>(Rc<LoaderNode<T>>);

struct LoaderNode<T: 'static> {
    fetcher: Box<dyn Fetch>,
    spawner: Box<dyn LocalSpawn>,
    cache: RefCell<Box<dyn CacheStore<T>>>,
    coordinator: RefCell<RequestCoordinator<T>>,
    states: RefCell<HashMap<RequestKey, RequestState<T>>>,
    current: RefCell<Option<RequestKey>>,
    subscribers: Rc<SubscriberRegistry<LoadEvent<T>>>,
}

impl<T: DeserializeOwned + 'static> Loader<T> {
    pub fn new(fetcher: impl Fetch, spawner: impl LocalSpawn + 'static) -> Self {
        Self::builder(fetcher, spawner).build()
    }
    pub fn builder(fetcher: impl Fetch, spawner: impl LocalSpawn + 'static) -> LoaderBuilder<T> {
        LoaderBuilder {
            fetcher: Box::new(fetcher),
            spawner: Box::new(spawner),
            options: LoaderOptions::new(),
            cache: None,
        }
    }

    /// Returns the latest state of `key` and makes sure a request is in flight if needed.
    ///
    /// Makes `key` the current key. Cheap to call repeatedly: cached values are served
    /// without fetching and a pending request is shared rather than repeated.
    pub fn load(&self, key: impl Into<RequestKey>) -> LoadView<T> {
        let key = key.into();
        *self.0.current.borrow_mut() = Some(key.clone());
        self.ensure(&key, false);
        self.state(key.as_str()).view()
    }

    /// Like [`load`](Self::load), but ignores the cache and supersedes any request in flight.
    pub fn refresh(&self, key: impl Into<RequestKey>) -> LoadView<T> {
        let key = key.into();
        *self.0.current.borrow_mut() = Some(key.clone());
        self.ensure(&key, true);
        self.state(key.as_str()).view()
    }

    /// Resolves `key`, sharing the request with concurrent [`load`](Self::load) calls.
    ///
    /// Makes `key` the current key, like [`load`](Self::load).
    /// The request starts immediately, not when the returned future is first polled.
    /// The result is [`Settled::Superseded`] if a newer request for `key` was started,
    /// or if another key became current before it settled.
    pub fn resolve(&self, key: impl Into<RequestKey>) -> impl Future<Output = Settled<T>> + 'static {
        let key = key.into();
        *self.0.current.borrow_mut() = Some(key.clone());
        let ensured = self.ensure(&key, false);
        let this = self.clone();
        async move {
            let settled = match ensured {
                Ensured::Ready(settled) => settled,
                Ensured::InFlight(token, fetch) => {
                    let result = fetch.await;
                    if !this.0.coordinator.borrow().is_current(&key, token) {
                        return Settled::Superseded;
                    }
                    match result {
                        Ok(data) => Settled::Success(data),
                        Err(e) => Settled::Error(e),
                    }
                }
            };
            if !this.is_current_key(&key) {
                debug!(key = %key, "another key became current; result superseded");
                return Settled::Superseded;
            }
            settled
        }
    }

    /// Removes the cached value of `key`. Returns `true` if there was one.
    pub fn invalidate(&self, key: &str) -> bool {
        self.0.cache.borrow_mut().invalidate(&key.into())
    }
    pub fn clear_cache(&self) {
        self.0.cache.borrow_mut().clear();
    }

    /// Makes any request in flight for `key` stale and returns the key to idle.
    ///
    /// Does nothing for a key that was never requested.
    pub fn cancel(&self, key: impl Into<RequestKey>) {
        let key = key.into();
        if self.0.coordinator.borrow().current_token(&key) == RequestToken::NONE {
            return;
        }
        let token = self.0.coordinator.borrow_mut().supersede(&key);
        debug!(key = %key, token = %token, "request cancelled");
        self.publish(&key, RequestState::idle_at(token));
    }
}

impl<T: 'static> Loader<T> {
    pub fn state(&self, key: &str) -> RequestState<T> {
        self.0
            .states
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_else(RequestState::idle)
    }

    /// The most recently loaded key and its state.
    pub fn current(&self) -> Option<(RequestKey, RequestState<T>)> {
        let key = self.0.current.borrow().clone()?;
        let state = self.state(key.as_str());
        Some((key, state))
    }

    fn is_current_key(&self, key: &RequestKey) -> bool {
        self.0.current.borrow().as_ref() == Some(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.0.coordinator.borrow().in_flight(&key.into()).is_some()
    }
    pub fn pending_count(&self) -> usize {
        self.0.coordinator.borrow().pending_len()
    }

    /// Registers `f` to be called each time the state of a key changes.
    pub fn subscribe(&self, f: impl Fn(&LoadEvent<T>) + 'static) -> Subscription {
        self.0.subscribers.subscribe(f)
    }

    fn publish(&self, key: &RequestKey, state: RequestState<T>) {
        let changed = {
            let mut states = self.0.states.borrow_mut();
            let unchanged = states.get(key).is_some_and(|old| old.same_as(&state));
            if !unchanged {
                states.insert(key.clone(), state.clone());
            }
            !unchanged
        };
        if changed {
            let event = LoadEvent {
                key: key.clone(),
                state,
            };
            self.0.subscribers.notify_until(&event, || {
                !self.state(key.as_str()).same_as(&event.state)
            });
        }
    }

    fn settle(&self, key: &RequestKey, token: RequestToken, result: Result<Rc<T>, LoadError>) {
        let is_current = self.0.coordinator.borrow_mut().settle(key, token);
        if !is_current {
            debug!(key = %key, token = %token, "discarding superseded response");
            return;
        }
        match result {
            Ok(data) => {
                trace!(key = %key, token = %token, "request succeeded");
                self.0.cache.borrow_mut().set(key.clone(), data.clone());
                self.publish(key, RequestState::success(data, token));
            }
            Err(e) => {
                debug!(key = %key, token = %token, error = %e, "request failed");
                self.publish(key, RequestState::failure(e, token));
            }
        }
    }
}

impl<T: DeserializeOwned + 'static> Loader<T> {
    fn ensure(&self, key: &RequestKey, force: bool) -> Ensured<T> {
        if force {
            self.0.cache.borrow_mut().invalidate(key);
            return self.start(key);
        }
        let hit = self.0.cache.borrow_mut().get(key);
        if let Some(entry) = hit {
            debug!(key = %key, "serving from cache");
            let token = self.0.coordinator.borrow().current_token(key);
            self.publish(key, RequestState::success(entry.value.clone(), token));
            return Ensured::Ready(Settled::Success(entry.value));
        }
        let in_flight = self.0.coordinator.borrow().in_flight(key);
        if let Some((token, fetch)) = in_flight {
            trace!(key = %key, token = %token, "attaching to request in flight");
            return Ensured::InFlight(token, fetch);
        }
        self.start(key)
    }

    fn start(&self, key: &RequestKey) -> Ensured<T> {
        let response = self.0.fetcher.fetch(key.as_str());
        let fetch = async move {
            match response.await {
                Ok(response) if response.ok => response.json::<T>().map(Rc::new),
                Ok(response) => Err(LoadError::Status {
                    code: response.status,
                    message: response.status_text,
                }),
                Err(e) => Err(e),
            }
        }
        .boxed_local()
        .shared();
        let token = self.0.coordinator.borrow_mut().begin(key.clone(), fetch.clone());
        debug!(key = %key, token = %token, "starting request");
        self.publish(key, RequestState::loading(token));

        let node = Rc::downgrade(&self.0);
        let driver = {
            let key = key.clone();
            let fetch = fetch.clone();
            async move {
                let result = fetch.await;
                if let Some(node) = node.upgrade() {
                    Loader(node).settle(&key, token, result);
                }
            }
        };
        if let Err(e) = self.0.spawner.spawn_local(driver) {
            warn!(key = %key, error = %e, "failed to spawn request");
            let e = LoadError::Spawn(e.to_string());
            self.settle(key, token, Err(e.clone()));
            return Ensured::Ready(Settled::Error(e));
        }
        Ensured::InFlight(token, fetch)
    }
}

/// Create an [`AsyncAction`] that resolves `key` and dispatches the outcome.
///
/// On success `success` is dispatched with the data as payload,
/// on failure `failure` is dispatched with `{"code": ..., "message": ...}`.
/// Nothing is dispatched if the request was superseded, including when a later
/// `load_action` or [`Loader::load`] on the same loader made another key current.
///
/// The request starts when the action is dispatched.
pub fn load_action<S, T>(
    loader: &Loader<T>,
    key: impl Into<RequestKey>,
    success: impl Into<ActionType>,
    failure: impl Into<ActionType>,
) -> AsyncAction<S>
where
    S: 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    let loader = loader.clone();
    let key = key.into();
    let success = success.into();
    let failure = failure.into();
    AsyncAction::new(move |store| {
        let settled = loader.resolve(key.clone());
        async move {
            match settled.await {
                Settled::Success(data) => {
                    store.dispatch(Action::try_with_payload(success, &*data)?)?;
                }
                Settled::Error(e) => {
                    let payload = json!({ "code": e.code(), "message": e.message() });
                    store.dispatch(Action::with_payload(failure, payload))?;
                }
                Settled::Superseded => {
                    trace!(key = %key, "load superseded; nothing dispatched");
                }
            }
            Ok::<_, StoreError>(())
        }
    })
}
