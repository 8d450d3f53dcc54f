use std::{
    mem::take,
    rc::{Rc, Weak},
};

/// Handle to a registered callback.
///
/// The callback is unregistered when [`unsubscribe`](Self::unsubscribe) is called or the handle is dropped.
#[derive(Default)]
#[must_use]
pub struct Subscription(RawSubscription);

impl Subscription {
    pub fn empty() -> Self {
        Subscription(RawSubscription::Empty)
    }
    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Subscription(RawSubscription::Fn(Box::new(f)))
    }
    pub fn from_weak_fn<T: 'static>(this: Weak<T>, unsubscribe: impl FnOnce(Rc<T>) + 'static) -> Self {
        Self::from_fn(move || {
            if let Some(this) = this.upgrade() {
                unsubscribe(this)
            }
        })
    }

    /// Unregisters the callback.
    ///
    /// Calling this more than once has no effect.
    pub fn unsubscribe(&mut self) {
        if let RawSubscription::Fn(f) = take(&mut self.0) {
            f()
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.0, RawSubscription::Fn(_))
    }

    /// Keeps the callback registered for as long as its owner lives.
    pub fn detach(mut self) {
        self.0 = RawSubscription::Empty;
    }
}
impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Default)]
enum RawSubscription {
    #[default]
    Empty,
    Fn(Box<dyn FnOnce() + 'static>),
}
