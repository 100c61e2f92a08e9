//! A replication follower: a dedicated OS thread that opens a chunked GET
//! on a remote stream's HTTP endpoint and replays every line it sees into
//! a local persister via a `Borrowed<Publisher<E>>`. Spec §4.5/§5 — "one
//! per remote follower", no async runtime requirement.
//!
//! Grounded in the teacher's `src/core/reader.rs` reconnect/backoff
//! logging density; the blocking HTTP client itself is `reqwest::blocking`,
//! already present in the teacher's dependency table.

use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};
use crate::owned::Borrowed;
use crate::persister::format;
use crate::publisher::Publisher;
use crate::types::{Signature, StreamEntry};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Base URL of the remote stream's HTTP endpoint, e.g.
    /// `http://host:port/route`, with no trailing slash.
    pub remote_base_url: String,
    /// Whether to request `checked` (parsed, index-validated) delivery, or
    /// the default raw passthrough.
    pub checked: bool,
}

/// Caller-held handle. Dropping it stops the follower thread and joins it.
pub struct FollowerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawns a follower thread that publishes into `publisher` starting from
/// `start_index`/`start_us` (the local stream's current tail).
pub fn spawn_follower<E: StreamEntry>(
    config: FollowerConfig,
    expected_signature: Signature,
    publisher: Borrowed<Publisher<E>>,
    start_index: u64,
    start_us: i64,
) -> FollowerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        run_follower_loop(config, expected_signature, publisher, start_index, start_us, stop_for_thread);
    });
    FollowerHandle { stop, handle: Some(handle) }
}

fn run_follower_loop<E: StreamEntry>(
    config: FollowerConfig,
    expected_signature: Signature,
    publisher: Borrowed<Publisher<E>>,
    mut expected_next_index: u64,
    mut expected_next_us: i64,
    stop: Arc<AtomicBool>,
) {
    let client = reqwest::blocking::Client::new();
    let mut backoff = INITIAL_BACKOFF;
    let mut consecutive_malformed = 0u32;

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = negotiate_schema(&client, &config, &expected_signature) {
            warn!("replication follower: schema negotiation failed: {e}");
            sleep_and_grow_backoff(&mut backoff);
            continue;
        }

        let mut url = format!("{}?i={expected_next_index}&since={expected_next_us}", config.remote_base_url);
        if config.checked {
            url.push_str("&checked");
        }

        let response = match client.get(&url).send() {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("replication follower: remote returned {}", r.status());
                sleep_and_grow_backoff(&mut backoff);
                continue;
            }
            Err(e) => {
                warn!("replication follower: connection failed: {e}");
                sleep_and_grow_backoff(&mut backoff);
                continue;
            }
        };

        let subscription_id = response
            .headers()
            .get("X-Current-Stream-Subscription-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        backoff = INITIAL_BACKOFF; // connected cleanly, reset
        let broke_cleanly = drain_chunks(
            response,
            &publisher,
            &mut expected_next_index,
            &mut expected_next_us,
            config.checked,
            &stop,
            &mut consecutive_malformed,
        );

        if let Some(id) = subscription_id {
            terminate_remote(&client, &config, &id);
        }

        if stop.load(Ordering::SeqCst) {
            return;
        }
        if !broke_cleanly {
            sleep_and_grow_backoff(&mut backoff);
        }
    }
}

/// Reads chunks off `response` until the remote closes the connection, the
/// caller asks to stop, or the body can no longer be read. Returns whether
/// the remote closed the stream on its own (a signal not to immediately
/// escalate backoff, since `nowait`-style closes are expected traffic).
fn drain_chunks<E: StreamEntry>(
    mut response: reqwest::blocking::Response,
    publisher: &Borrowed<Publisher<E>>,
    expected_next_index: &mut u64,
    expected_next_us: &mut i64,
    checked: bool,
    stop: &AtomicBool,
    consecutive_malformed: &mut u32,
) -> bool {
    let mut buf = [0u8; 8192];
    let mut pending = String::new();

    loop {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let n = match response.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => n,
            Err(e) => {
                warn!("replication follower: read error: {e}");
                return false;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        let (lines, rest) = format::split_lines(&pending);
        let lines: Vec<String> = lines.into_iter().map(str::to_string).collect();
        let rest = rest.to_string();

        for line in &lines {
            match dispatch_line(line, publisher, expected_next_index, expected_next_us, checked) {
                Ok(()) => *consecutive_malformed = 0,
                Err(e) => {
                    *consecutive_malformed += 1;
                    warn!("replication follower: malformed chunk (#{consecutive_malformed}): {e}");
                    if *consecutive_malformed >= 3 {
                        warn!("replication follower: three consecutive malformed chunks, still reconnecting");
                    }
                }
            }
        }
        pending = rest;
    }
}

/// Applies one line of remote log output to a local publisher — shared by
/// the follower's steady-state chunk loop and the flip protocol's one-shot
/// diff application.
pub(crate) fn dispatch_line<E: StreamEntry>(
    line: &str,
    publisher: &Borrowed<Publisher<E>>,
    expected_next_index: &mut u64,
    expected_next_us: &mut i64,
    checked: bool,
) -> Result<()> {
    if !line.contains('\t') {
        let value: serde_json::Value = serde_json::from_str(line).map_err(|_| Error::MalformedEntry(line.to_string()))?;
        let us = value
            .get("us")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| Error::MalformedEntry(line.to_string()))?;
        publisher.update_head(us)?;
        *expected_next_us = us.max(*expected_next_us);
        return Ok(());
    }

    let idxts = format::parse_idxts_prefix(line)?;
    if checked && idxts.index != *expected_next_index {
        return Err(Error::MalformedEntry(format!(
            "expected index {}, remote sent {} ({line})",
            *expected_next_index, idxts.index
        )));
    }
    publisher.publish_unsafe(line)?;
    *expected_next_index = idxts.index + 1;
    *expected_next_us = idxts.us;
    Ok(())
}

fn negotiate_schema(client: &reqwest::blocking::Client, config: &FollowerConfig, expected: &Signature) -> Result<()> {
    let url = format!("{}/schema.simple", config.remote_base_url);
    let response = client
        .get(&url)
        .send()
        .map_err(|e| Error::RemoteStreamDoesNotRespond(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::RemoteStreamDoesNotRespond(format!("schema request returned {}", response.status())));
    }
    let body: serde_json::Value = response.json().map_err(|e| Error::RemoteStreamInvalidSchema(e.to_string()))?;
    let type_id = body.get("type_id").and_then(serde_json::Value::as_u64);
    let entry_name = body.get("entry_name").and_then(serde_json::Value::as_str);
    let namespace_name = body.get("namespace_name").and_then(serde_json::Value::as_str);

    if type_id != Some(expected.schema_info.type_id)
        || entry_name != Some(expected.entry_name.as_str())
        || namespace_name != Some(expected.namespace_name.as_str())
    {
        return Err(Error::RemoteStreamInvalidSchema(format!(
            "remote {{type_id:{type_id:?}, entry_name:{entry_name:?}, namespace_name:{namespace_name:?}}} != local {{type_id:{}, entry_name:{}, namespace_name:{}}}",
            expected.schema_info.type_id, expected.entry_name, expected.namespace_name
        )));
    }
    Ok(())
}

fn terminate_remote(client: &reqwest::blocking::Client, config: &FollowerConfig, subscription_id: &str) {
    let url = format!("{}?terminate={subscription_id}", config.remote_base_url);
    if let Err(e) = client.get(&url).send() {
        warn!("replication follower: failed to terminate remote subscription {subscription_id}: {e}");
    }
}

fn sleep_and_grow_backoff(backoff: &mut Duration) {
    std::thread::sleep(*backoff);
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexTimestamp, SchemaInfo};
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

    fn publisher_cell() -> crate::publisher::PublisherCell<Ev> {
        let doorbell = Arc::new(crate::doorbell::Doorbell::new());
        let persister: Arc<dyn crate::persister::Persister<Ev>> = Arc::new(crate::persister::MemoryPersister::new());
        crate::publisher::PublisherCell::new(persister, doorbell)
    }

    #[test]
    fn dispatch_line_applies_record_and_head_update() {
        let cell = publisher_cell();
        let publisher = cell.get_publisher().unwrap();
        let mut next_index = 0u64;
        let mut next_us = -1i64;

        let record_line = format::format_record_line(IndexTimestamp::new(0, 10), r#"{"x":1}"#);
        dispatch_line(record_line.trim_end_matches('\n'), &publisher, &mut next_index, &mut next_us, true).unwrap();
        assert_eq!(next_index, 1);
        assert_eq!(next_us, 10);

        dispatch_line(r#"{"us":20}"#, &publisher, &mut next_index, &mut next_us, true).unwrap();
        assert_eq!(next_us, 20);
    }

    #[test]
    fn checked_mode_rejects_index_gap() {
        let cell = publisher_cell();
        let publisher = cell.get_publisher().unwrap();
        let mut next_index = 5u64;
        let mut next_us = -1i64;
        let record_line = format::format_record_line(IndexTimestamp::new(0, 10), r#"{"x":1}"#);
        assert!(dispatch_line(record_line.trim_end_matches('\n'), &publisher, &mut next_index, &mut next_us, true).is_err());
    }
}
