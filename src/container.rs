//! `Stream<E>`: binds one persister and one publisher cell, mints
//! subscriber threads, and hosts the signature used to detect schema drift.
//! Named to avoid colliding with the teacher's own `src/stream/` directory,
//! which this crate does not use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::doorbell::Doorbell;
use crate::error::Result;
use crate::owned::Borrowed;
use crate::persister::file::{FilePersister, FilePersisterConfig};
use crate::persister::memory::MemoryPersister;
use crate::persister::Persister;
use crate::publisher::{Publisher, PublisherCell};
use crate::subscription::{spawn_subscription, Subscription, SubscriberScope, SubscriptionMode};
use crate::types::{HeadAndMaybeLast, IndexTimestamp, Signature, StreamEntry};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub namespace_name: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            namespace_name: "default".to_string(),
        }
    }
}

impl StreamConfig {
    pub fn new(namespace_name: impl Into<String>) -> Self {
        Self {
            namespace_name: namespace_name.into(),
        }
    }
}

/// The Stream container: persister + publisher + schema metadata + the
/// doorbell and shutdown flag subscriber threads key off of.
pub struct Stream<E: StreamEntry> {
    persister: Arc<dyn Persister<E>>,
    publisher_cell: PublisherCell<E>,
    doorbell: Arc<Doorbell>,
    shutting_down: Arc<AtomicBool>,
    namespace_name: String,
}

impl<E: StreamEntry> Stream<E> {
    pub fn new(persister: Arc<dyn Persister<E>>, config: StreamConfig) -> Self {
        let doorbell = Arc::new(Doorbell::new());
        let publisher_cell = PublisherCell::new(Arc::clone(&persister), Arc::clone(&doorbell));
        Self {
            persister,
            publisher_cell,
            doorbell,
            shutting_down: Arc::new(AtomicBool::new(false)),
            namespace_name: config.namespace_name,
        }
    }

    pub fn in_memory(config: StreamConfig) -> Self {
        Self::new(Arc::new(MemoryPersister::new()), config)
    }

    pub fn open_file(file_config: FilePersisterConfig) -> Result<Self> {
        let namespace_name = file_config.namespace_name.clone();
        let persister = FilePersister::open(file_config)?;
        Ok(Self::new(Arc::new(persister), StreamConfig { namespace_name }))
    }

    pub fn get_publisher(&self) -> Result<Borrowed<Publisher<E>>> {
        self.publisher_cell.get_publisher()
    }

    pub fn become_following(&self) -> Result<Borrowed<Publisher<E>>> {
        self.publisher_cell.become_following()
    }

    pub fn become_master(&self) -> Result<()> {
        self.publisher_cell.become_master()
    }

    pub fn is_following(&self) -> bool {
        self.publisher_cell.is_following()
    }

    pub fn size(&self) -> u64 {
        self.persister.size()
    }

    pub fn empty(&self) -> bool {
        self.persister.empty()
    }

    pub fn current_head(&self) -> i64 {
        self.persister.current_head()
    }

    pub fn last_published(&self) -> Result<IndexTimestamp> {
        self.persister.last_published()
    }

    pub fn head_and_last(&self) -> HeadAndMaybeLast {
        self.persister.head_and_last()
    }

    pub fn index_range_by_timestamp_range(&self, from: i64, till: i64) -> (u64, u64) {
        self.persister.index_range_by_timestamp_range(from, till)
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.namespace_name.clone(), E::ENTRY_NAME.to_string(), E::schema_info())
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace_name
    }

    pub fn persister(&self) -> &Arc<dyn Persister<E>> {
        &self.persister
    }

    /// Spawns a checked subscription (parsed records) starting at
    /// `start_index`. Drop the returned scope to cancel.
    pub fn subscribe(&self, start_index: u64, subscriber: Box<dyn Subscription<E>>) -> SubscriberScope {
        spawn_subscription(
            Arc::clone(&self.persister),
            Arc::clone(&self.doorbell),
            Arc::clone(&self.shutting_down),
            SubscriptionMode::Checked,
            start_index,
            subscriber,
        )
    }

    /// Spawns an unchecked subscription (raw log lines) starting at
    /// `start_index`.
    pub fn subscribe_unsafe(&self, start_index: u64, subscriber: Box<dyn Subscription<E>>) -> SubscriberScope {
        spawn_subscription(
            Arc::clone(&self.persister),
            Arc::clone(&self.doorbell),
            Arc::clone(&self.shutting_down),
            SubscriptionMode::Unchecked,
            start_index,
            subscriber,
        )
    }
}

impl<E: StreamEntry> Drop for Stream<E> {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.doorbell.ring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{SubscriberResponse, TerminateResponse};
    use crate::types::SchemaInfo;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Ev {
        x: i32,
    }

    impl StreamEntry for Ev {
        const ENTRY_NAME: &'static str = "Ev";
        fn schema_info() -> SchemaInfo {
            SchemaInfo::from_fields(&[("x", "i32")])
        }
    }

    struct Collector {
        seen: Arc<Mutex<Vec<Ev>>>,
    }

    impl Subscription<Ev> for Collector {
        fn on_entry(&mut self, entry: &Ev, _current: IndexTimestamp, _last: IndexTimestamp) -> SubscriberResponse {
            self.seen.lock().unwrap().push(entry.clone());
            SubscriberResponse::More
        }

        fn terminate(&mut self) -> TerminateResponse {
            TerminateResponse::Terminate
        }
    }

    #[test]
    fn publish_through_stream_and_subscribe() {
        let stream = Stream::<Ev>::in_memory(StreamConfig::new("ns"));
        let publisher = stream.get_publisher().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let scope = stream.subscribe(0, Box::new(Collector { seen: Arc::clone(&seen) }));

        publisher.publish(&Ev { x: 1 }, 10).unwrap();
        publisher.publish(&Ev { x: 2 }, 20).unwrap();

        for _ in 0..200 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(scope);
        assert_eq!(*seen.lock().unwrap(), vec![Ev { x: 1 }, Ev { x: 2 }]);
    }

    #[test]
    fn become_following_then_flip_back() {
        let stream = Stream::<Ev>::in_memory(StreamConfig::new("ns"));
        let remote_handle = stream.become_following().unwrap();
        assert!(stream.get_publisher().is_err());
        remote_handle.publish(&Ev { x: 1 }, 10).unwrap();
        drop(remote_handle);
        stream.become_master().unwrap();
        assert!(stream.get_publisher().is_ok());
        assert_eq!(stream.size(), 1);
    }

    #[test]
    fn signature_reflects_namespace_and_entry() {
        let stream = Stream::<Ev>::in_memory(StreamConfig::new("ns"));
        let sig = stream.signature();
        assert_eq!(sig.namespace_name, "ns");
        assert_eq!(sig.entry_name, "Ev");
    }
}
