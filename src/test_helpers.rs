use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use futures::{
    channel::oneshot,
    future::{FutureExt, LocalBoxFuture},
};

use crate::{Clock, Fetch, LoadError, Response};

#[derive(Clone)]
pub struct ManualClock(Rc<Cell<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }
    pub fn advance(&self, d: Duration) {
        self.0.set(self.0.get() + d);
    }
}
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

type Responder = oneshot::Sender<Result<Response, LoadError>>;

/// Fetcher whose responses are completed by the test, in any order.
#[derive(Clone, Default)]
pub struct ManualFetch(Rc<RefCell<ManualFetchData>>);

#[derive(Default)]
struct ManualFetchData {
    calls: Vec<String>,
    waiting: Vec<(String, Responder)>,
}

impl ManualFetch {
    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }
    pub fn call_count(&self, url: &str) -> usize {
        self.0.borrow().calls.iter().filter(|c| *c == url).count()
    }
    pub fn waiting(&self) -> usize {
        self.0.borrow().waiting.len()
    }

    /// Completes the oldest outstanding request for `url`.
    pub fn respond(&self, url: &str, response: Result<Response, LoadError>) {
        let index = self
            .0
            .borrow()
            .waiting
            .iter()
            .position(|(u, _)| u == url)
            .unwrap_or_else(|| panic!("no request waiting for `{url}`"));
        self.complete(index, response);
    }
    /// Completes the newest outstanding request for `url`.
    pub fn respond_latest(&self, url: &str, response: Result<Response, LoadError>) {
        let index = self
            .0
            .borrow()
            .waiting
            .iter()
            .rposition(|(u, _)| u == url)
            .unwrap_or_else(|| panic!("no request waiting for `{url}`"));
        self.complete(index, response);
    }
    pub fn ok(&self, url: &str, body: &str) {
        self.respond(url, Ok(Response::new(200, "OK", body)));
    }
    pub fn status(&self, url: &str, status: u16, status_text: &str) {
        self.respond(url, Ok(Response::new(status, status_text, "")));
    }

    fn complete(&self, index: usize, response: Result<Response, LoadError>) {
        let (_, tx) = self.0.borrow_mut().waiting.remove(index);
        let _ = tx.send(response);
    }
}

impl Fetch for ManualFetch {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Response, LoadError>> {
        let (tx, rx) = oneshot::channel();
        let mut d = self.0.borrow_mut();
        d.calls.push(url.to_owned());
        d.waiting.push((url.to_owned(), tx));
        async move {
            rx.await
                .unwrap_or_else(|_| Err(LoadError::Transport("request dropped".into())))
        }
        .boxed_local()
    }
}
