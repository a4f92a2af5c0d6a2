//! Single-resolution async trigger.

use tokio::sync::watch;

/// A value that is resolved at most once and can be awaited by any number
/// of tasks. Waiters arriving after resolution return immediately.
#[derive(Debug)]
pub struct Trigger<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for Trigger<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Trigger<T> {
    /// Unresolved trigger.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Resolve with `value`. Only the first call has any effect; returns
    /// whether this call resolved the trigger.
    pub fn wake(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// True once resolved.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Suspend until resolved.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let value = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| slot.clone());
        match value {
            Some(v) => v,
            None => std::future::pending().await,
        }
    }
}
