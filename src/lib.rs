//! Append-only, single-writer event log with multiplexed subscribers,
//! an HTTP pub/sub endpoint, a replication follower, and master-flip
//! handover.
//!
//! The core (`error`, `types`, `clock`, `owned`, `doorbell`, `persister`,
//! `publisher`, `subscription`, `container`) has no feature gates and no
//! network dependency. `http`, `replication`, and `flip` are Cargo features
//! layering the ambient web/replication stack on top.

pub mod clock;
pub mod container;
pub mod doorbell;
pub mod error;
pub mod owned;
pub mod persister;
pub mod publisher;
pub mod subscription;
pub mod types;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "replication")]
pub mod replication;

#[cfg(feature = "flip")]
pub mod flip;

pub use container::{Stream, StreamConfig};
pub use error::{Error, Result};
pub use persister::file::FilePersisterConfig;
pub use persister::{FilePersister, MemoryPersister, Persister};
pub use publisher::{Publisher, PublisherCell};
pub use subscription::{SubscriberResponse, SubscriberScope, Subscription, SubscriptionMode, TerminateResponse};
pub use types::{FieldInfo, HeadAndMaybeLast, IndexTimestamp, SchemaInfo, Signature, StreamEntry};

#[cfg(feature = "http")]
pub use http::{router as http_router, HttpEndpointConfig};

#[cfg(feature = "replication")]
pub use replication::{spawn_follower, FollowerConfig, FollowerHandle};

#[cfg(feature = "flip")]
pub use flip::{flip_to_master, FlipCallbacks, FlipConfig, FlipController, MasterFlipRestrictions};
