use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::{
    future::{AbortHandle, Abortable, FutureExt, LocalBoxFuture, RemoteHandle},
    task::{LocalSpawn, LocalSpawnExt},
};
use slabmap::SlabMap;
use tracing::{debug, trace, warn};

use crate::{Dispatch, Store, StoreError};


/// Interceptor wrapping [`Store::dispatch`].
///
/// A middleware may inspect the dispatched value, dispatch other actions through `store`,
/// short-circuit by returning without calling `next`, or forward to `next`.
pub trait Middleware<S: 'static>: 'static {
    fn handle(
        &self,
        store: &Store<S>,
        dispatch: Dispatch<S>,
        next: Next<'_, S>,
    ) -> Result<Dispatched, StoreError>;
}

/// Create a [`Middleware`] from a function.
pub fn middleware_fn<S, F>(f: F) -> FnMiddleware<F>
where
    S: 'static,
    F: Fn(&Store<S>, Dispatch<S>, Next<'_, S>) -> Result<Dispatched, StoreError> + 'static,
{
    FnMiddleware(f)
}

pub struct FnMiddleware<F>(F);

impl<S, F> Middleware<S> for FnMiddleware<F>
where
    S: 'static,
    F: Fn(&Store<S>, Dispatch<S>, Next<'_, S>) -> Result<Dispatched, StoreError> + 'static,
{
    fn handle(
        &self,
        store: &Store<S>,
        dispatch: Dispatch<S>,
        next: Next<'_, S>,
    ) -> Result<Dispatched, StoreError> {
        (self.0)(store, dispatch, next)
    }
}

/// The rest of the middleware chain.
pub struct Next<'a, S: 'static> {
    store: &'a Store<S>,
    rest: &'a [Box<dyn Middleware<S>>],
}

impl<'a, S: 'static> Next<'a, S> {
    pub(crate) fn new(store: &'a Store<S>, rest: &'a [Box<dyn Middleware<S>>]) -> Self {
        Self { store, rest }
    }

    /// Passes `dispatch` to the next middleware, or to the reducer at the end of the chain.
    pub fn run(self, dispatch: Dispatch<S>) -> Result<Dispatched, StoreError> {
        match self.rest.split_first() {
            Some((first, rest)) => first.handle(self.store, dispatch, Next::new(self.store, rest)),
            None => self.store.reduce(dispatch),
        }
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug)]
pub enum Dispatched {
    /// The action reached the reducer.
    Reduced { changed: bool },
    /// An async action was started.
    Deferred(DeferredDispatch),
    /// A middleware consumed the action without forwarding it.
    Dropped,
}

impl Dispatched {
    pub fn changed(&self) -> bool {
        matches!(self, Dispatched::Reduced { changed: true })
    }
    pub fn into_deferred(self) -> Option<DeferredDispatch> {
        match self {
            Dispatched::Deferred(d) => Some(d),
            _ => None,
        }
    }
}

/// Completion of an async action.
///
/// Dropping this handle does not cancel the action.
pub struct DeferredDispatch(Option<RemoteHandle<Result<(), StoreError>>>);

impl DeferredDispatch {
    fn new(handle: RemoteHandle<Result<(), StoreError>>) -> Self {
        Self(Some(handle))
    }
}
impl Future for DeferredDispatch {
    type Output = Result<(), StoreError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.0 {
            Some(handle) => handle.poll_unpin(cx),
            None => Poll::Ready(Err(StoreError::Aborted)),
        }
    }
}
impl Drop for DeferredDispatch {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.forget();
        }
    }
}
impl fmt::Debug for DeferredDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredDispatch")
    }
}

/// Middleware running [`AsyncAction`](crate::AsyncAction)s on a local executor.
///
/// Plain actions are forwarded unchanged.
#[derive(Clone)]
pub struct AsyncMiddleware(Rc<AsyncMiddlewareNode>);

struct AsyncMiddlewareNode {
    spawner: Box<dyn LocalSpawn>,
    tasks: RefCell<SlabMap<AbortHandle>>,
}

impl AsyncMiddleware {
    pub fn new(spawner: impl LocalSpawn + 'static) -> Self {
        Self(Rc::new(AsyncMiddlewareNode {
            spawner: Box::new(spawner),
            tasks: RefCell::new(SlabMap::new()),
        }))
    }

    /// Number of async actions that have not finished yet.
    pub fn pending(&self) -> usize {
        self.0.tasks.borrow().len()
    }

    /// Aborts every running async action.
    ///
    /// Their [`DeferredDispatch`] resolves to [`StoreError::Aborted`].
    pub fn cancel_all(&self) {
        for abort in self.0.tasks.borrow().values() {
            abort.abort();
        }
    }

    fn spawn(
        &self,
        fut: LocalBoxFuture<'static, Result<(), StoreError>>,
    ) -> Result<DeferredDispatch, StoreError> {
        let (abort, registration) = AbortHandle::new_pair();
        let key = self.0.tasks.borrow_mut().insert(abort);
        let guard = TaskGuard {
            node: Rc::downgrade(&self.0),
            key,
        };
        let task = async move {
            let _guard = guard;
            Abortable::new(fut, registration)
                .await
                .unwrap_or(Err(StoreError::Aborted))
        };
        let (remote, handle) = task.remote_handle();
        if let Err(e) = self.0.spawner.spawn_local(remote) {
            warn!(error = %e, "failed to spawn async action");
            return Err(StoreError::Spawn(e.to_string()));
        }
        Ok(DeferredDispatch::new(handle))
    }
}

/// Unregisters a task when its future completes or is dropped unfinished.
struct TaskGuard {
    node: Weak<AsyncMiddlewareNode>,
    key: usize,
}
impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.tasks.borrow_mut().remove(self.key);
        }
    }
}

impl<S: 'static> Middleware<S> for AsyncMiddleware {
    fn handle(
        &self,
        store: &Store<S>,
        dispatch: Dispatch<S>,
        next: Next<'_, S>,
    ) -> Result<Dispatched, StoreError> {
        match dispatch {
            Dispatch::Async(action) => {
                trace!("starting async action");
                let fut = action.start(store.clone());
                self.spawn(fut).map(Dispatched::Deferred)
            }
            dispatch => next.run(dispatch),
        }
    }
}

/// Middleware logging every dispatch with `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMiddleware;

impl<S: 'static> Middleware<S> for LogMiddleware {
    fn handle(
        &self,
        _store: &Store<S>,
        dispatch: Dispatch<S>,
        next: Next<'_, S>,
    ) -> Result<Dispatched, StoreError> {
        let Some(kind) = dispatch.as_action().map(|a| a.kind().clone()) else {
            debug!("dispatching async action");
            return next.run(dispatch);
        };
        let result = next.run(dispatch);
        match &result {
            Ok(Dispatched::Reduced { changed }) => {
                debug!(action = %kind, changed = *changed, "action dispatched")
            }
            Ok(_) => debug!(action = %kind, "action consumed by middleware"),
            Err(e) => warn!(action = %kind, error = %e, "dispatch failed"),
        }
        result
    }
}
