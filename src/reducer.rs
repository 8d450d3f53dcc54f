use std::{collections::HashMap, rc::Rc};

use derive_ex::derive_ex;
use parse_display::Display;

use crate::{Action, ActionType};


/// Pure state transition function.
///
/// Returning the same `Rc` as `state` means the action did not change anything.
/// Stores use that identity to skip notifying subscribers.
pub trait Reducer<S>: 'static {
    fn reduce(&self, state: &Rc<S>, action: &Action) -> Result<Rc<S>, ReducerError>;
}

/// Create a [`Reducer`] from a function.
pub fn reducer_fn<S, F>(f: F) -> FnReducer<F>
where
    F: Fn(&Rc<S>, &Action) -> Result<Rc<S>, ReducerError> + 'static,
{
    FnReducer(f)
}

pub struct FnReducer<F>(F);

impl<S, F> Reducer<S> for FnReducer<F>
where
    F: Fn(&Rc<S>, &Action) -> Result<Rc<S>, ReducerError> + 'static,
{
    fn reduce(&self, state: &Rc<S>, action: &Action) -> Result<Rc<S>, ReducerError> {
        (self.0)(state, action)
    }
}

#[non_exhaustive]
#[derive(Display, Debug, Clone, PartialEq, Eq)]
#[display("{message}")]
pub struct ReducerError {
    message: String,
}

impl ReducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for ReducerError {}

type Reducers<S> = HashMap<ActionType, Vec<Rc<dyn Reducer<S>>>>;

/// Reducers keyed by the [`ActionType`] they handle.
pub struct ReducerRegistry<S: 'static> {
    reducers: Reducers<S>,
}

impl<S: 'static> ReducerRegistry<S> {
    pub fn new() -> Self {
        Self {
            reducers: HashMap::new(),
        }
    }

    /// Registers `f` for actions of type `kind`.
    ///
    /// Reducers registered for the same type run in registration order,
    /// each receiving the state returned by the previous one.
    pub fn register<F>(&mut self, kind: impl Into<ActionType>, f: F) -> &mut Self
    where
        F: Fn(&Rc<S>, &Action) -> Result<Rc<S>, ReducerError> + 'static,
    {
        self.register_reducer(kind, reducer_fn(f))
    }
    pub fn register_reducer(
        &mut self,
        kind: impl Into<ActionType>,
        reducer: impl Reducer<S>,
    ) -> &mut Self {
        self.reducers
            .entry(kind.into())
            .or_default()
            .push(Rc::new(reducer));
        self
    }
    pub fn with<F>(mut self, kind: impl Into<ActionType>, f: F) -> Self
    where
        F: Fn(&Rc<S>, &Action) -> Result<Rc<S>, ReducerError> + 'static,
    {
        self.register(kind, f);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.reducers.contains_key(kind)
    }

    /// Merges several registries into one root reducer.
    ///
    /// Registries are merged in iteration order.
    pub fn combine(registries: impl IntoIterator<Item = Self>) -> RootReducer<S> {
        let mut reducers = Reducers::new();
        for registry in registries {
            for (kind, mut list) in registry.reducers {
                reducers.entry(kind).or_default().append(&mut list);
            }
        }
        RootReducer(Rc::new(reducers))
    }
    pub fn into_root(self) -> RootReducer<S> {
        RootReducer(Rc::new(self.reducers))
    }
}
impl<S: 'static> Default for ReducerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reducer that routes each action to the reducers registered for its type.
///
/// Actions with no registered reducer leave the state untouched.
#[derive_ex(Clone, bound())]
pub struct RootReducer<S: 'static>(Rc<Reducers<S>>);

impl<S: 'static> Reducer<S> for RootReducer<S> {
    fn reduce(&self, state: &Rc<S>, action: &Action) -> Result<Rc<S>, ReducerError> {
        let Some(reducers) = self.0.get(action.kind()) else {
            return Ok(state.clone());
        };
        let mut next = state.clone();
        for reducer in reducers {
            next = reducer.reduce(&next, action)?;
        }
        Ok(next)
    }
}
