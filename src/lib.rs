//! A unidirectional state container with middleware, and a cached asynchronous loader.
//!
//! [`Store`] owns an immutable state snapshot. [`Action`]s are dispatched through a chain of
//! [`Middleware`] into a [`Reducer`], and subscribers are notified after each real transition.
//!
//! [`Loader`] fetches resources by key on a local executor. Concurrent loads of one key share a
//! single fetch, successful results are cached, and stale responses are discarded by comparing
//! per-key [`RequestToken`]s. [`load_action`] connects the two.

mod action;
mod cache;
mod loader;
mod middleware;
mod reducer;
mod store;
mod subscriber;
mod subscription;

#[cfg(test)]
mod test_helpers;

pub use action::*;
pub use cache::*;
pub use loader::*;
pub use middleware::*;
pub use reducer::*;
pub use store::*;
pub use subscriber::*;
pub use subscription::*;
