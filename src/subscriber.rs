use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use parse_display::Display;

use crate::Subscription;


#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("subscriber #{0}")]
pub struct SubscriberId(u64);

/// Observer list notified in registration order.
///
/// Each notification cycle works on the set of subscribers present when it starts:
/// callbacks added during a cycle wait for the next one,
/// callbacks removed during a cycle are not called for the rest of it.
pub struct SubscriberRegistry<E: ?Sized + 'static>(RefCell<RawRegistry<E>>);

struct RawRegistry<E: ?Sized + 'static> {
    next_id: u64,
    subscribers: BTreeMap<SubscriberId, Rc<dyn Fn(&E)>>,
}

impl<E: ?Sized + 'static> SubscriberRegistry<E> {
    pub fn new() -> Self {
        Self(RefCell::new(RawRegistry {
            next_id: 0,
            subscribers: BTreeMap::new(),
        }))
    }

    pub fn add(&self, f: impl Fn(&E) + 'static) -> SubscriberId {
        let mut d = self.0.borrow_mut();
        let id = SubscriberId(d.next_id);
        d.next_id += 1;
        d.subscribers.insert(id, Rc::new(f));
        id
    }

    /// Returns `false` if `id` was already removed.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.0.borrow_mut().subscribers.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.0.borrow().subscribers.contains_key(&id)
    }
    pub fn len(&self) -> usize {
        self.0.borrow().subscribers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `f` and returns a [`Subscription`] that removes it.
    pub fn subscribe(self: &Rc<Self>, f: impl Fn(&E) + 'static) -> Subscription {
        let id = self.add(f);
        Subscription::from_weak_fn(Rc::downgrade(self), move |this| {
            this.remove(id);
        })
    }

    pub fn notify_all(&self, event: &E) {
        self.notify_until(event, || false);
    }

    /// Like [`notify_all`](Self::notify_all), but abandons the cycle as soon as `is_stale`
    /// returns `true`.
    ///
    /// `is_stale` is checked before each callback. A callback that triggers a newer
    /// notification can use it to keep the remaining subscribers from seeing `event`
    /// after the newer one.
    pub fn notify_until(&self, event: &E, is_stale: impl Fn() -> bool) {
        let snapshot: Vec<_> = self
            .0
            .borrow()
            .subscribers
            .iter()
            .map(|(id, f)| (*id, f.clone()))
            .collect();
        for (id, f) in snapshot {
            if is_stale() {
                return;
            }
            if self.contains(id) {
                f(event);
            }
        }
    }
}
impl<E: ?Sized + 'static> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
