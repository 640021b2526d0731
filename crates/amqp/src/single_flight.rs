//! A shared-future slot with generation-checked invalidation.
//!
//! The supervisor, the channel cache and the exchange initializer all follow
//! the same pattern: the first caller starts an operation and stores it as a
//! `Shared` future, every later caller clones that future (pending or
//! resolved), and a lifecycle callback clears the slot so the next caller
//! starts over.
//!
//! Each stored future gets a generation number. Invalidation names the
//! generation it wants to drop, so a late callback from an old connection or
//! channel can never clear a newer entry.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Shared future stored in a slot.
pub type SharedFuture<T> = Shared<BoxFuture<'static, T>>;

struct Entry<T: Clone> {
    generation: u64,
    future: SharedFuture<T>,
}

struct SlotState<T: Clone> {
    next_generation: u64,
    entry: Option<Entry<T>>,
}

/// Holds at most one in-flight or completed operation.
pub struct SingleFlight<T: Clone> {
    state: Mutex<SlotState<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                next_generation: 1,
                entry: None,
            }),
        }
    }

    // Callbacks never panic while holding the lock, but a poisoned slot is
    // still structurally valid.
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached future, or stores the one built by `start`.
    ///
    /// `start` receives the generation assigned to the new entry and runs
    /// under the slot lock, so it must only build the future, not poll it.
    /// The boolean is true when a new entry was created.
    pub fn get_or_start<F>(&self, start: F) -> (SharedFuture<T>, u64, bool)
    where
        F: FnOnce(u64) -> BoxFuture<'static, T>,
    {
        let mut state = self.lock();
        if let Some(entry) = &state.entry {
            return (entry.future.clone(), entry.generation, false);
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let future = start(generation).shared();
        state.entry = Some(Entry {
            generation,
            future: future.clone(),
        });
        (future, generation, true)
    }

    /// Clears the slot if it still holds `generation`.
    pub fn invalidate(&self, generation: u64) -> bool {
        let mut state = self.lock();
        match &state.entry {
            Some(entry) if entry.generation == generation => {
                state.entry = None;
                true
            }
            _ => false,
        }
    }

    /// Clears the slot whatever it holds.
    pub fn clear(&self) -> bool {
        self.lock().entry.take().is_some()
    }

    /// Clears the slot if its future has completed with an output matching `pred`.
    pub fn invalidate_if<P>(&self, pred: P) -> bool
    where
        P: FnOnce(&T) -> bool,
    {
        let mut state = self.lock();
        let matched = state
            .entry
            .as_ref()
            .and_then(|entry| entry.future.peek())
            .is_some_and(pred);
        if matched {
            state.entry = None;
        }
        matched
    }

    /// Generation of the current entry, if any.
    pub fn generation(&self) -> Option<u64> {
        self.lock().entry.as_ref().map(|entry| entry.generation)
    }

    /// Output of the current entry if it has already completed.
    pub fn peek(&self) -> Option<T> {
        self.lock()
            .entry
            .as_ref()
            .and_then(|entry| entry.future.peek().cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entry.is_none()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let slot = SingleFlight::<u32>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for _ in 0..5 {
            let runs = runs.clone();
            let (future, _, _) = slot.get_or_start(move |_| {
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    7
                }
                .boxed()
            });
            futures.push(future);
        }

        let results = futures_util::future::join_all(futures).await;
        assert_eq!(results, vec![7; 5]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_checks_generation() {
        let slot = SingleFlight::<u32>::new();
        let (_, first, created) = slot.get_or_start(|_| async { 1 }.boxed());
        assert!(created);

        assert!(slot.invalidate(first));
        let (_, second, created) = slot.get_or_start(|_| async { 2 }.boxed());
        assert!(created);
        assert_ne!(first, second);

        // a late callback for the first entry must not clear the second
        assert!(!slot.invalidate(first));
        assert_eq!(slot.generation(), Some(second));
    }

    #[tokio::test]
    async fn test_start_receives_entry_generation() {
        let slot = SingleFlight::<u64>::new();
        let (future, generation, _) = slot.get_or_start(|g| async move { g }.boxed());
        assert_eq!(future.await, generation);
    }

    #[tokio::test]
    async fn test_invalidate_if_only_on_completed_match() {
        let slot = SingleFlight::<Result<(), String>>::new();
        let (future, _, _) = slot.get_or_start(|_| async { Err("boom".to_string()) }.boxed());

        // not polled yet, nothing to match
        assert!(!slot.invalidate_if(|r| r.is_err()));
        assert!(future.await.is_err());

        assert_eq!(slot.peek(), Some(Err("boom".to_string())));
        assert!(!slot.invalidate_if(|r| r.is_ok()));
        assert!(slot.invalidate_if(|r| r.is_err()));
        assert!(slot.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let slot = SingleFlight::<u8>::new();
        assert!(!slot.clear());
        let _ = slot.get_or_start(|_| async { 0 }.boxed());
        assert!(slot.clear());
        assert!(slot.is_empty());
    }
}
