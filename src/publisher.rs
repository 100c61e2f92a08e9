//! The single-writer state machine: `MasterHoldingPublisher` vs `Following`.
//!
//! There is no explicit state enum. As spec'd, the two states are
//! observable only through whether [`PublisherCell::get_publisher`]
//! succeeds — everything else is built from [`crate::owned::Owned`]/
//! [`crate::owned::Borrowed`]: `become_following` drains the current
//! `Owned<Publisher<E>>`, mints a fresh one, and hands the caller the sole
//! `Borrowed` of it.

use std::sync::{Arc, Mutex};

use crate::doorbell::Doorbell;
use crate::error::{Error, Result};
use crate::owned::{Borrowed, Owned};
use crate::persister::Persister;
use crate::types::{IndexTimestamp, StreamEntry};

/// A thin handle that forwards writes to the persister it was minted over,
/// ringing the stream's doorbell on every successful mutation so parked
/// subscriber threads wake up. Holding a `Borrowed<Publisher<E>>` is, by
/// construction, proof that no one else can publish concurrently — see
/// §4.2.
pub struct Publisher<E: StreamEntry> {
    persister: Arc<dyn Persister<E>>,
    doorbell: Arc<Doorbell>,
}

impl<E: StreamEntry> Publisher<E> {
    fn new(persister: Arc<dyn Persister<E>>, doorbell: Arc<Doorbell>) -> Self {
        Self { persister, doorbell }
    }

    pub fn publish(&self, payload: &E, us: i64) -> Result<IndexTimestamp> {
        let idxts = self.persister.publish(payload, us)?;
        self.doorbell.ring();
        Ok(idxts)
    }

    pub fn publish_unsafe(&self, raw_line: &str) -> Result<IndexTimestamp> {
        let idxts = self.persister.publish_unsafe(raw_line)?;
        self.doorbell.ring();
        Ok(idxts)
    }

    pub fn update_head(&self, us: i64) -> Result<()> {
        self.persister.update_head(us)?;
        self.doorbell.ring();
        Ok(())
    }
}

struct State<E: StreamEntry> {
    owned: Owned<Publisher<E>>,
    following: bool,
}

/// Owns the current `Publisher<E>` for a stream and mediates the
/// Master/Following transitions. A `Stream<E>` holds exactly one of these.
pub struct PublisherCell<E: StreamEntry> {
    persister: Arc<dyn Persister<E>>,
    doorbell: Arc<Doorbell>,
    state: Mutex<State<E>>,
}

impl<E: StreamEntry> PublisherCell<E> {
    pub fn new(persister: Arc<dyn Persister<E>>, doorbell: Arc<Doorbell>) -> Self {
        let owned = Owned::new(Publisher::new(Arc::clone(&persister), Arc::clone(&doorbell)));
        Self {
            persister,
            doorbell,
            state: Mutex::new(State { owned, following: false }),
        }
    }

    /// Borrows the current Publisher. Fails with `PublisherNotAvailable`
    /// while the stream is Following.
    pub fn get_publisher(&self) -> Result<Borrowed<Publisher<E>>> {
        let state = self.state.lock().unwrap();
        if state.following {
            return Err(Error::PublisherNotAvailable);
        }
        Ok(state.owned.borrow())
    }

    pub fn is_following(&self) -> bool {
        self.state.lock().unwrap().following
    }

    /// Drains every outstanding borrower of the current Publisher, mints a
    /// fresh one, marks the stream Following, and returns the sole
    /// `Borrowed` the caller is expected to hold and publish through.
    pub fn become_following(&self) -> Result<Borrowed<Publisher<E>>> {
        let mut state = self.state.lock().unwrap();
        if state.following {
            return Err(Error::StreamIsAlreadyFollowing);
        }
        let fresh = Owned::new(Publisher::new(Arc::clone(&self.persister), Arc::clone(&self.doorbell)));
        let draining = std::mem::replace(&mut state.owned, fresh);
        state.following = true;
        let borrowed = state.owned.borrow();
        drop(state);
        drop(draining); // blocks until every prior borrower released
        Ok(borrowed)
    }

    /// The inverse of `become_following`: drains the Following-era Publisher
    /// (in particular, the external caller's `Borrowed` returned from
    /// `become_following`) and mints a fresh one with `get_publisher`
    /// available again.
    pub fn become_master(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.following {
            return Err(Error::StreamIsAlreadyMaster);
        }
        let fresh = Owned::new(Publisher::new(Arc::clone(&self.persister), Arc::clone(&self.doorbell)));
        let draining = std::mem::replace(&mut state.owned, fresh);
        state.following = false;
        drop(state);
        drop(draining);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::MemoryPersister;
    use crate::types::SchemaInfo;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ev {
        x: i32,
    }

    impl StreamEntry for Ev {
        const ENTRY_NAME: &'static str = "Ev";
        fn schema_info() -> SchemaInfo {
            SchemaInfo::from_fields(&[("x", "i32")])
        }
    }

    fn cell() -> PublisherCell<Ev> {
        PublisherCell::new(Arc::new(MemoryPersister::<Ev>::new()), Arc::new(Doorbell::new()))
    }

    #[test]
    fn get_publisher_works_while_master() {
        let cell = cell();
        let publisher = cell.get_publisher().unwrap();
        publisher.publish(&Ev { x: 1 }, 10).unwrap();
    }

    #[test]
    fn get_publisher_fails_while_following() {
        let cell = cell();
        let follower_handle = cell.become_following().unwrap();
        assert!(matches!(cell.get_publisher(), Err(Error::PublisherNotAvailable)));
        follower_handle.publish(&Ev { x: 1 }, 10).unwrap();
    }

    #[test]
    fn become_following_twice_fails() {
        let cell = cell();
        let _handle = cell.become_following().unwrap();
        assert!(matches!(cell.become_following(), Err(Error::StreamIsAlreadyFollowing)));
    }

    #[test]
    fn become_master_restores_local_publishing() {
        let cell = cell();
        let handle = cell.become_following().unwrap();
        drop(handle);
        cell.become_master().unwrap();
        assert!(!cell.is_following());
        let publisher = cell.get_publisher().unwrap();
        publisher.publish(&Ev { x: 1 }, 10).unwrap();
    }

    #[test]
    fn become_master_while_already_master_fails() {
        let cell = cell();
        assert!(matches!(cell.become_master(), Err(Error::StreamIsAlreadyMaster)));
    }
}
