use std::{borrow::Borrow, borrow::Cow, fmt, future::Future};

use futures::future::{FutureExt, LocalBoxFuture};
use parse_display::Display;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{ReducerError, Store, StoreError};


/// Name of an [`Action`], used to select the reducers that handle it.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display("{0}")]
#[serde(transparent)]
pub struct ActionType(Cow<'static, str>);

impl ActionType {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl From<&'static str> for ActionType {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}
impl From<String> for ActionType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}
impl Borrow<str> for ActionType {
    fn borrow(&self) -> &str {
        &self.0
    }
}
impl PartialEq<str> for ActionType {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}
impl PartialEq<&str> for ActionType {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Data describing an intended state change.
///
/// Serializes as `{"type": "...", "payload": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl Action {
    /// Create an action without payload.
    pub fn new(kind: impl Into<ActionType>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    /// Create an action carrying `payload`.
    pub fn with_payload(kind: impl Into<ActionType>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: Some(payload.into()),
        }
    }

    /// Create an action whose payload is the serialized form of `payload`.
    pub fn try_with_payload<T>(kind: impl Into<ActionType>, payload: &T) -> Result<Self, StoreError>
    where
        T: Serialize + ?Sized,
    {
        let kind = kind.into();
        match serde_json::to_value(payload) {
            Ok(payload) => Ok(Self::with_payload(kind, payload)),
            Err(e) => Err(StoreError::MalformedAction(format!(
                "payload of `{kind}` cannot be serialized: {e}"
            ))),
        }
    }

    /// Parse an action from its JSON form.
    ///
    /// A missing or non-string `type` is rejected.
    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        let action: Self = serde_json::from_value(value)
            .map_err(|e| StoreError::MalformedAction(e.to_string()))?;
        action.validate()?;
        Ok(action)
    }

    pub fn kind(&self) -> &ActionType {
        &self.kind
    }
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Decodes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ReducerError> {
        let Some(payload) = &self.payload else {
            return Err(ReducerError::new(format!(
                "action `{}` has no payload",
                self.kind
            )));
        };
        T::deserialize(payload).map_err(|e| {
            ReducerError::new(format!("invalid payload for `{}`: {e}", self.kind))
        })
    }

    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.kind.is_empty() {
            return Err(StoreError::MalformedAction(
                "action type must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A value accepted by [`Store::dispatch`].
pub enum Dispatch<S: 'static> {
    Action(Action),
    Async(AsyncAction<S>),
}

impl<S: 'static> Dispatch<S> {
    pub fn as_action(&self) -> Option<&Action> {
        match self {
            Dispatch::Action(action) => Some(action),
            Dispatch::Async(_) => None,
        }
    }
    pub fn is_async(&self) -> bool {
        matches!(self, Dispatch::Async(_))
    }
}
impl<S: 'static> From<Action> for Dispatch<S> {
    fn from(action: Action) -> Self {
        Dispatch::Action(action)
    }
}
impl<S: 'static> From<AsyncAction<S>> for Dispatch<S> {
    fn from(action: AsyncAction<S>) -> Self {
        Dispatch::Async(action)
    }
}
impl<S: 'static> fmt::Debug for Dispatch<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Action(action) => action.fmt(f),
            Dispatch::Async(_) => write!(f, "<async action>"),
        }
    }
}

type AsyncActionFn<S> = dyn FnOnce(Store<S>) -> LocalBoxFuture<'static, Result<(), StoreError>>;

/// Deferred unit of work that may dispatch further actions.
///
/// Only runs when dispatched through a store that has an [`AsyncMiddleware`](crate::AsyncMiddleware).
pub struct AsyncAction<S: 'static>(Box<AsyncActionFn<S>>);

impl<S: 'static> AsyncAction<S> {
    pub fn new<Fut>(f: impl FnOnce(Store<S>) -> Fut + 'static) -> Self
    where
        Fut: Future<Output = Result<(), StoreError>> + 'static,
    {
        Self(Box::new(move |store| f(store).boxed_local()))
    }

    pub(crate) fn start(self, store: Store<S>) -> LocalBoxFuture<'static, Result<(), StoreError>> {
        (self.0)(store)
    }
}
