use std::{collections::HashMap, rc::Rc};

use futures::future::{LocalBoxFuture, Shared};
use parse_display::Display;

use crate::{LoadError, RequestKey};

/// Identifies one request for a key. Increases with every request started for that key.
#[derive(Clone, Copy, Debug, Display, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{0}")]
pub struct RequestToken(u64);

impl RequestToken {
    /// Token of a key no request was ever made for.
    pub const NONE: Self = Self(0);

    pub fn value(self) -> u64 {
        self.0
    }
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

pub(crate) type SharedFetch<T> = Shared<LocalBoxFuture<'static, Result<Rc<T>, LoadError>>>;

struct Pending<T> {
    token: RequestToken,
    fetch: SharedFetch<T>,
}

/// Per-key token counters and in-flight requests.
pub(crate) struct RequestCoordinator<T> {
    tokens: HashMap<RequestKey, RequestToken>,
    pending: HashMap<RequestKey, Pending<T>>,
}

impl<T> RequestCoordinator<T> {
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn current_token(&self, key: &RequestKey) -> RequestToken {
        self.tokens.get(key).copied().unwrap_or(RequestToken::NONE)
    }
    pub fn is_current(&self, key: &RequestKey, token: RequestToken) -> bool {
        self.current_token(key) == token
    }

    pub fn in_flight(&self, key: &RequestKey) -> Option<(RequestToken, SharedFetch<T>)> {
        let p = self.pending.get(key)?;
        Some((p.token, p.fetch.clone()))
    }

    /// Registers `fetch` as the latest request for `key`, superseding any request in flight.
    pub fn begin(&mut self, key: RequestKey, fetch: SharedFetch<T>) -> RequestToken {
        let token = self.supersede(&key);
        self.pending.insert(key, Pending { token, fetch });
        token
    }

    /// Advances the token of `key` so that every request in flight becomes stale.
    pub fn supersede(&mut self, key: &RequestKey) -> RequestToken {
        self.pending.remove(key);
        let token = self.tokens.entry(key.clone()).or_default();
        *token = token.next();
        *token
    }

    /// Clears the registration of `key` if `token` is still the latest.
    ///
    /// Returns `false` for superseded requests.
    pub fn settle(&mut self, key: &RequestKey, token: RequestToken) -> bool {
        if !self.is_current(key, token) {
            return false;
        }
        self.pending.remove(key);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
