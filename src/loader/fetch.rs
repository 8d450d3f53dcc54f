use std::future::Future;

use futures::future::{FutureExt, LocalBoxFuture};
use parse_display::Display;
use serde::de::DeserializeOwned;

/// Network boundary used by [`Loader`](crate::Loader).
pub trait Fetch: 'static {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Response, LoadError>>;
}

/// Create a [`Fetch`] from a function.
pub fn fetch_fn<F, Fut>(f: F) -> FnFetch<F>
where
    F: Fn(&str) -> Fut + 'static,
    Fut: Future<Output = Result<Response, LoadError>> + 'static,
{
    FnFetch(f)
}

pub struct FnFetch<F>(F);

impl<F, Fut> Fetch for FnFetch<F>
where
    F: Fn(&str) -> Fut + 'static,
    Fut: Future<Output = Result<Response, LoadError>> + 'static,
{
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Response, LoadError>> {
        (self.0)(url).boxed_local()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

impl Response {
    /// `ok` is derived from `status` being in the 2xx range.
    pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            status_text: status_text.into(),
            body: body.into(),
        }
    }
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, LoadError> {
        serde_json::from_str(&self.body).map_err(|e| LoadError::Decode(e.to_string()))
    }
}

#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[display("{code} {message}")]
    Status { code: u16, message: String },
    #[display("transport error: {0}")]
    Transport(String),
    #[display("invalid response body: {0}")]
    Decode(String),
    #[display("failed to start request: {0}")]
    Spawn(String),
}

impl LoadError {
    /// HTTP status code, for errors caused by a non-success response.
    pub fn code(&self) -> Option<u16> {
        match self {
            LoadError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
    pub fn message(&self) -> &str {
        match self {
            LoadError::Status { message, .. } => message,
            LoadError::Transport(message)
            | LoadError::Decode(message)
            | LoadError::Spawn(message) => message,
        }
    }
}

impl std::error::Error for LoadError {}
