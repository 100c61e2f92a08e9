//! The replication follower (spec §4.5): a thread-per-remote subscriber
//! that writes into a local persister through a `Borrowed<Publisher<E>>`.

pub mod follower;

pub use follower::{spawn_follower, FollowerConfig, FollowerHandle};
