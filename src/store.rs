use std::{cell::RefCell, rc::Rc};

use derive_ex::derive_ex;
use parse_display::Display;
use tracing::{trace, warn};

use crate::{
    Dispatch, Dispatched, Middleware, Next, Reducer, ReducerError, SubscriberRegistry,
    Subscription,
};


/// Container owning the canonical state.
///
/// State is replaced, never mutated: every committed transition stores a new `Rc<S>`,
/// so callers can compare snapshots with [`Rc::ptr_eq`].
#[derive_ex(Clone, bound())]
pub struct Store<S: 'static>(Rc<StoreNode<S>>);

struct StoreNode<S: 'static> {
    state: RefCell<Rc<S>>,
    reducer: Box<dyn Reducer<S>>,
    middlewares: Vec<Box<dyn Middleware<S>>>,
    subscribers: Rc<SubscriberRegistry<Rc<S>>>,
}

impl<S: 'static> Store<S> {
    /// Create a store without middleware.
    pub fn new(initial: S, reducer: impl Reducer<S>) -> Self {
        Self::builder(initial, reducer).build()
    }
    pub fn builder(initial: S, reducer: impl Reducer<S>) -> StoreBuilder<S> {
        StoreBuilder {
            initial,
            reducer: Box::new(reducer),
            middlewares: Vec::new(),
        }
    }

    /// Returns the current state snapshot.
    pub fn state(&self) -> Rc<S> {
        self.0.state.borrow().clone()
    }

    /// Runs `dispatch` through the middleware chain into the reducer.
    ///
    /// Plain actions are fully applied, and subscribers notified, before this returns.
    /// On error the state is left as it was.
    pub fn dispatch(&self, dispatch: impl Into<Dispatch<S>>) -> Result<Dispatched, StoreError> {
        let dispatch = dispatch.into();
        if let Dispatch::Action(action) = &dispatch {
            action.validate()?;
        }
        Next::new(self, &self.0.middlewares).run(dispatch)
    }

    /// Registers `f` to be called after each committed state transition.
    ///
    /// If a subscriber dispatches a change, the remaining subscribers of the outer cycle
    /// only see the newer state. No subscriber observes an older snapshot after a newer one.
    pub fn subscribe(&self, f: impl Fn(&Rc<S>) + 'static) -> Subscription {
        self.0.subscribers.subscribe(f)
    }
    pub fn subscriber_count(&self) -> usize {
        self.0.subscribers.len()
    }

    pub(crate) fn reduce(&self, dispatch: Dispatch<S>) -> Result<Dispatched, StoreError> {
        let action = match dispatch {
            Dispatch::Action(action) => action,
            Dispatch::Async(_) => return Err(StoreError::UnhandledAsync),
        };
        let current = self.state();
        let next = match self.0.reducer.reduce(&current, &action) {
            Ok(next) => next,
            Err(e) => {
                warn!(action = %action.kind(), error = %e, "reducer failed");
                return Err(StoreError::Reducer(e));
            }
        };
        if Rc::ptr_eq(&current, &next) {
            trace!(action = %action.kind(), "state unchanged");
            return Ok(Dispatched::Reduced { changed: false });
        }
        *self.0.state.borrow_mut() = next.clone();
        trace!(action = %action.kind(), "state committed");
        self.0
            .subscribers
            .notify_until(&next, || !Rc::ptr_eq(&next, &*self.0.state.borrow()));
        Ok(Dispatched::Reduced { changed: true })
    }
}
impl<S: std::fmt::Debug + 'static> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.state.try_borrow() {
            Ok(state) => std::fmt::Debug::fmt(&**state, f),
            Err(_) => write!(f, "<borrowed>"),
        }
    }
}

pub struct StoreBuilder<S: 'static> {
    initial: S,
    reducer: Box<dyn Reducer<S>>,
    middlewares: Vec<Box<dyn Middleware<S>>>,
}

impl<S: 'static> StoreBuilder<S> {
    /// Appends a middleware.
    ///
    /// The first middleware added is the outermost one and sees each dispatch first.
    pub fn middleware(mut self, middleware: impl Middleware<S>) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }
    pub fn build(self) -> Store<S> {
        Store(Rc::new(StoreNode {
            state: RefCell::new(Rc::new(self.initial)),
            reducer: self.reducer,
            middlewares: self.middlewares,
            subscribers: Rc::new(SubscriberRegistry::new()),
        }))
    }
}

#[derive(Display, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[display("malformed action: {0}")]
    MalformedAction(String),
    #[display("reducer failed: {0}")]
    Reducer(ReducerError),
    #[display("middleware failed: {0}")]
    Middleware(String),
    #[display("async action reached the reducer; no async middleware is installed")]
    UnhandledAsync,
    #[display("failed to spawn async action: {0}")]
    Spawn(String),
    #[display("async action was aborted")]
    Aborted,
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Reducer(e) => Some(e),
            _ => None,
        }
    }
}
impl From<ReducerError> for StoreError {
    fn from(e: ReducerError) -> Self {
        StoreError::Reducer(e)
    }
}
