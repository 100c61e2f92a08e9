//! The ownership primitive: exactly one `Owned<T>`, N `Borrowed<T>`.
//!
//! Ported from the source framework's `Bricks/sync/owned_borrowed.h`. The
//! philosophy carries over unchanged: the scope that creates `Owned<T>` is
//! the master owner; everyone else borrows. When the master scope ends, it
//! signals every outstanding borrower (via whatever termination callback they
//! registered, if any) and blocks until they have all released the value.
//!
//! Four borrower shapes, matching the source:
//! - [`Borrowed`]: polls [`Borrowed::is_valid`]; no callback.
//! - [`BorrowedWithCallback`]: runs a callback synchronously as the `Owned`
//!   begins draining — typically used to wake a thread blocked elsewhere.
//! - [`BorrowedOfGuaranteedLifetime`]: asserts its scope ends strictly before
//!   the `Owned`'s. If the `Owned` ever tries to drain while one is still
//!   alive, the process aborts; there is no graceful path for that bug.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

struct Shared<T> {
    instance: T,
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    destructing: bool,
    next_key: u64,
    borrowers: HashMap<u64, Callback>,
}

impl State {
    fn new() -> Self {
        Self {
            destructing: false,
            next_key: 0,
            borrowers: HashMap::new(),
        }
    }
}

/// The sole writer/owner of a `T`. Dropping it blocks until every borrower
/// spawned from it has released the value.
pub struct Owned<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Owned<T> {
    pub fn new(instance: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance,
                state: Mutex::new(State::new()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Number of currently live borrowers (of any flavor).
    pub fn active_borrowers(&self) -> usize {
        self.shared.state.lock().unwrap().borrowers.len()
    }

    fn register(&self, callback: Callback) -> Borrowed<T> {
        let mut state = self.shared.state.lock().unwrap();
        let key = state.next_key;
        state.next_key += 1;
        state.borrowers.insert(key, callback);
        Borrowed {
            shared: Arc::clone(&self.shared),
            key,
        }
    }

    /// Spawns a plain borrower with no termination callback; it must poll
    /// `is_valid()` to notice the owner draining.
    pub fn borrow(&self) -> Borrowed<T> {
        self.register(Box::new(|| {}))
    }

    /// Spawns a borrower whose `on_terminate` callback fires synchronously,
    /// from inside `Owned::drop`, the instant draining begins.
    pub fn borrow_with_callback(
        &self,
        on_terminate: impl FnOnce() + Send + 'static,
    ) -> BorrowedWithCallback<T> {
        let inner = self.register(Box::new(on_terminate));
        BorrowedWithCallback { inner }
    }

    /// Spawns a borrower that asserts its scope ends before `Owned`'s. If the
    /// assertion is violated the process aborts immediately and loudly.
    pub fn borrow_of_guaranteed_lifetime(&self) -> BorrowedOfGuaranteedLifetime<T> {
        let inner = self.register(Box::new(|| {
            eprintln!(
                "fatal: Owned<T> began draining while a BorrowedOfGuaranteedLifetime<T> was still alive"
            );
            std::process::abort();
        }));
        BorrowedOfGuaranteedLifetime { inner }
    }
}

impl<T> std::ops::Deref for Owned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.shared.instance
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        let callbacks: Vec<Callback> = {
            let mut state = self.shared.state.lock().unwrap();
            state.destructing = true;
            state.borrowers.drain().map(|(_, cb)| cb).collect()
        };
        for cb in callbacks {
            cb();
        }
        let state = self.shared.state.lock().unwrap();
        let _unused = self
            .shared
            .cv
            .wait_while(state, |s| !s.borrowers.is_empty())
            .unwrap();
    }
}

fn unregister<T>(shared: &Shared<T>, key: u64) {
    let mut state = shared.state.lock().unwrap();
    state.borrowers.remove(&key);
    if state.borrowers.is_empty() {
        shared.cv.notify_all();
    }
}

/// A counted reference to a `T` owned elsewhere. Becomes invalid once the
/// owning `Owned<T>` starts draining.
pub struct Borrowed<T> {
    shared: Arc<Shared<T>>,
    key: u64,
}

impl<T> Borrowed<T> {
    pub fn is_valid(&self) -> bool {
        !self.shared.state.lock().unwrap().destructing
    }
}

impl<T> std::ops::Deref for Borrowed<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.shared.instance
    }
}

impl<T> Drop for Borrowed<T> {
    fn drop(&mut self) {
        unregister(&self.shared, self.key);
    }
}

/// Like [`Borrowed`], but the owner synchronously runs a caller-supplied
/// callback as it begins draining, instead of leaving the borrower to poll.
pub struct BorrowedWithCallback<T> {
    inner: Borrowed<T>,
}

impl<T> BorrowedWithCallback<T> {
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }
}

impl<T> std::ops::Deref for BorrowedWithCallback<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

/// A borrower whose scope is asserted to end strictly before the `Owned`'s.
/// Violating that assertion aborts the process.
pub struct BorrowedOfGuaranteedLifetime<T> {
    inner: Borrowed<T>,
}

impl<T> std::ops::Deref for BorrowedOfGuaranteedLifetime<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn borrowed_invalidates_on_drain() {
        let owned = Owned::new(42u32);
        let borrowed = owned.borrow();
        assert!(borrowed.is_valid());
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(borrowed);
        });
        drop(owned);
        handle.join().unwrap();
    }

    #[test]
    fn callback_fires_synchronously_on_drain() {
        let owned = Owned::new(7u32);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let _borrower = owned.borrow_with_callback(move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        assert!(!fired.load(Ordering::SeqCst));
        drop(owned);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn owned_drop_blocks_until_borrowers_release() {
        let owned = Owned::new(1u32);
        let borrowed = owned.borrow();
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = Arc::clone(&released);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            released_clone.store(true, Ordering::SeqCst);
            drop(borrowed);
        });
        drop(owned);
        assert!(released.load(Ordering::SeqCst));
        handle.join().unwrap();
    }
}
