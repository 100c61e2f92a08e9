//! End-to-end replication test: a real axum server hosting a master stream,
//! a follower thread pulling from it over loopback HTTP, and a byte-identical
//! file comparison once both sides are stopped (spec §8's "applying a
//! follower to a master and stopping yields two files whose non-signature
//! content is byte-identical" scenario).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chronicle_stream::http::HttpEndpointConfig;
use chronicle_stream::persister::file::FilePersisterConfig;
use chronicle_stream::replication::{spawn_follower, FollowerConfig};
use chronicle_stream::{SchemaInfo, Stream, StreamEntry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Ev {
    x: i32,
}

impl StreamEntry for Ev {
    const ENTRY_NAME: &'static str = "Ev";
    fn schema_info() -> SchemaInfo {
        SchemaInfo::from_fields(&[("x", "i32")])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_replays_a_master_into_a_byte_identical_file() {
    let master_path = std::env::temp_dir().join(format!("chronicle_master_{}.log", std::process::id()));
    let follower_path = std::env::temp_dir().join(format!("chronicle_follower_{}.log", std::process::id()));
    let _cleanup = Cleanup(vec![master_path.clone(), follower_path.clone()]);

    let master = Arc::new(Stream::<Ev>::open_file(FilePersisterConfig::new(master_path.clone(), "ns")).unwrap());
    let publisher = master.get_publisher().unwrap();
    publisher.publish(&Ev { x: 1 }, 100).unwrap();
    publisher.publish(&Ev { x: 2 }, 200).unwrap();

    let router = chronicle_stream::http_router::<Ev>(Arc::clone(&master), HttpEndpointConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let follower_stream = Stream::<Ev>::open_file(FilePersisterConfig::new(follower_path.clone(), "ns")).unwrap();
    let follower_publisher = follower_stream.become_following().unwrap();

    let follower_handle = spawn_follower(
        FollowerConfig {
            remote_base_url: format!("http://{addr}"),
            checked: true,
        },
        master.signature(),
        follower_publisher,
        0,
        -1,
    );

    // give the follower time to connect, negotiate schema, and drain the
    // two already-published records over the open chunked subscription
    tokio::time::sleep(Duration::from_millis(400)).await;
    publisher.publish(&Ev { x: 3 }, 300).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(follower_stream.size(), 3);

    let master_bytes = std::fs::read(&master_path).unwrap();
    let follower_bytes = std::fs::read(&follower_path).unwrap();
    assert_eq!(master_bytes, follower_bytes);

    // The follower thread is blocked inside a blocking read on a live,
    // still-open chunked subscription (the master's HTTP server is never
    // shut down in this test), so `FollowerHandle`'s join-on-drop would hang
    // until the remote closes the connection. The file comparison above is
    // the assertion this test exists for; leak the handle rather than block
    // test teardown on a connection nothing is going to close.
    std::mem::forget(follower_handle);
}

struct Cleanup(Vec<std::path::PathBuf>);
impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}
