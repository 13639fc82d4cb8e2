/// Observer registration for platform signals (viewport resize, media-query
/// changes, orientation changes).
///
/// A `Subject` is owned by the platform side and notified from the event loop.
/// Listeners hold a `Subscription`; dropping it unregisters the listener, so a
/// component that stops observing cannot leak a callback into the subject.
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

pub type Listener = Rc<dyn Fn()>;

// ── Subject ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Subject {
    listeners: RefCell<Vec<(u64, Listener)>>,
    next_id: Cell<u64>,
}

impl Subject {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register `listener`. It stays registered until the returned guard drops.
    pub fn subscribe(self: &Rc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners.borrow_mut().push((id, listener));
        Subscription {
            subject: Rc::downgrade(self),
            id,
        }
    }

    /// Invoke every registered listener in registration order.
    pub fn notify(&self) {
        // Snapshot first: a listener may subscribe or drop a subscription.
        let snapshot: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in snapshot {
            listener();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
    }
}

// ── Subscription guard ────────────────────────────────────────────────────────

pub struct Subscription {
    subject: Weak<Subject>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subject) = self.subject.upgrade() {
            subject.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_reaches_all_listeners() {
        let subject = Subject::new();
        let hits = Rc::new(Cell::new(0));
        let h1 = Rc::clone(&hits);
        let h2 = Rc::clone(&hits);
        let _a = subject.subscribe(Rc::new(move || h1.set(h1.get() + 1)));
        let _b = subject.subscribe(Rc::new(move || h2.set(h2.get() + 10)));
        subject.notify();
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subject = Subject::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let sub = subject.subscribe(Rc::new(move || h.set(h.get() + 1)));
        assert_eq!(subject.listener_count(), 1);
        drop(sub);
        assert_eq!(subject.listener_count(), 0);
        subject.notify();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_subscription_outliving_subject_is_harmless() {
        let subject = Subject::new();
        let sub = subject.subscribe(Rc::new(|| {}));
        drop(subject);
        drop(sub);
    }
}
