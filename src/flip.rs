//! Master-flip controller (spec §4.6): migrates write authority between two
//! streams with zero gap and zero overlap. One side exposes
//! `/<route>/control/flip_to_master` via [`FlipController::router`]; the
//! other side calls [`flip_to_master`] once it holds the secret key.
//!
//! Grounded in the teacher's flip-restriction naming
//! (`MasterFlipRestrictions`) and the `axum` state-handler shape already
//! established in `http::endpoint`; the exponential backoff rate limiter
//! mirrors `replication::follower`'s reconnect backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{OriginalUri, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use rand::Rng;

use crate::container::Stream as StreamContainer;
use crate::error::{Error, Result};
use crate::owned::Borrowed;
use crate::persister::format;
use crate::publisher::Publisher;
use crate::replication::follower::dispatch_line;
use crate::types::StreamEntry;

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// Caps on how far behind the prospective master may be before a flip is
/// refused outright (spec §4.6 precondition 6).
#[derive(Debug, Clone, Default)]
pub struct MasterFlipRestrictions {
    pub max_index_diff: Option<u64>,
    pub max_head_diff: Option<i64>,
    pub max_diff_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FlipConfig {
    /// Route prefix the control endpoint is mounted under, e.g. `/ns`.
    pub route: String,
    /// `0` disables the clock-skew precondition.
    pub max_clock_diff_us: i64,
    pub restrictions: MasterFlipRestrictions,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            route: String::new(),
            max_clock_diff_us: 0,
            restrictions: MasterFlipRestrictions::default(),
        }
    }
}

/// Lifecycle hooks fired around a successful flip. All optional; the
/// default is silence.
#[derive(Default)]
pub struct FlipCallbacks {
    pub flip_started: Option<Box<dyn Fn() + Send + Sync>>,
    pub flip_finished: Option<Box<dyn Fn() + Send + Sync>>,
    pub flip_canceled: Option<Box<dyn Fn() + Send + Sync>>,
}

struct BackoffState {
    next_allowed_attempt: Instant,
    current_delay: Duration,
}

struct Inner<E: StreamEntry> {
    stream: Arc<StreamContainer<E>>,
    config: FlipConfig,
    callbacks: FlipCallbacks,
    secret_key: Mutex<Option<String>>,
    backoff: Mutex<BackoffState>,
    flipping: AtomicBool,
}

/// Wraps a stream, minting a one-time flip key and serving the
/// `flip_to_master` control route against it.
pub struct FlipController<E: StreamEntry> {
    inner: Arc<Inner<E>>,
}

impl<E: StreamEntry> Clone for FlipController<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: StreamEntry> FlipController<E> {
    pub fn new(stream: Arc<StreamContainer<E>>, config: FlipConfig, callbacks: FlipCallbacks) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream,
                config,
                callbacks,
                secret_key: Mutex::new(None),
                backoff: Mutex::new(BackoffState {
                    next_allowed_attempt: Instant::now(),
                    current_delay: BACKOFF_FLOOR,
                }),
                flipping: AtomicBool::new(false),
            }),
        }
    }

    /// Mints a fresh 19-digit secret key and returns it. Fails with
    /// `StreamIsAlreadyExposed` if one was already minted.
    pub fn expose_via_http(&self) -> Result<String> {
        let mut guard = self.inner.secret_key.lock().unwrap();
        if guard.is_some() {
            return Err(Error::StreamIsAlreadyExposed);
        }
        let key = generate_flip_key();
        *guard = Some(key.clone());
        Ok(key)
    }

    pub fn is_exposed(&self) -> bool {
        self.inner.secret_key.lock().unwrap().is_some()
    }

    /// Builds the axum router serving this controller's control route.
    pub fn router(&self) -> Router {
        let path = format!("{}/control/flip_to_master", self.inner.config.route);
        Router::new().route(&path, get(handle_flip_to_master::<E>)).with_state(self.clone())
    }

    fn check_preconditions(&self, query: &FlipQuery) -> std::result::Result<String, (StatusCode, String)> {
        let secret = self
            .inner
            .secret_key
            .lock()
            .unwrap()
            .clone()
            .ok_or((StatusCode::BAD_REQUEST, "stream is not exposed via HTTP".to_string()))?;

        let client_head = query.head.ok_or((StatusCode::BAD_REQUEST, "missing head".to_string()))?;
        let snapshot = self.inner.stream.head_and_last();
        let current_head = snapshot.head;
        let current_next_index = self.inner.stream.size();

        if client_head > current_head {
            return Err((StatusCode::BAD_REQUEST, format!("client_head {client_head} exceeds current_head {current_head}")));
        }

        if let Some(client_next_index) = query.i {
            if client_next_index > current_next_index {
                return Err((StatusCode::BAD_REQUEST, "client_next_index exceeds current_next_index".to_string()));
            }
            let (implied_begin, _) = self.inner.stream.index_range_by_timestamp_range(client_head + 1, -1);
            if implied_begin != client_next_index {
                return Err((StatusCode::BAD_REQUEST, "client head/index are inconsistent".to_string()));
            }
        }

        if self.inner.flipping.load(Ordering::SeqCst) {
            return Err((StatusCode::BAD_REQUEST, "a flip is already in progress".to_string()));
        }

        if self.inner.config.max_clock_diff_us > 0 {
            if let Some(clock) = query.clock {
                let now_us = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as i64;
                if (clock - now_us).abs() > self.inner.config.max_clock_diff_us {
                    return Err((StatusCode::BAD_REQUEST, "clock skew exceeds max_clock_diff".to_string()));
                }
            }
        }

        {
            let mut backoff = self.inner.backoff.lock().unwrap();
            let now = Instant::now();
            if now < backoff.next_allowed_attempt {
                return Err((StatusCode::BAD_REQUEST, "rate limited after a prior bad key, try later".to_string()));
            }
            if query.key.as_deref() != Some(secret.as_str()) {
                backoff.next_allowed_attempt = now + backoff.current_delay;
                backoff.current_delay = (backoff.current_delay * 2).min(BACKOFF_CEILING);
                return Err((StatusCode::BAD_REQUEST, "bad flip key".to_string()));
            }
            backoff.current_delay = BACKOFF_FLOOR;
        }

        let client_next_index = query.i.unwrap_or(0);
        if let Some(max) = self.inner.config.restrictions.max_index_diff {
            if current_next_index.saturating_sub(client_next_index) > max {
                return Err((StatusCode::BAD_REQUEST, "index diff exceeds max_index_diff".to_string()));
            }
        }
        if let Some(max) = self.inner.config.restrictions.max_head_diff {
            if current_head - client_head > max {
                return Err((StatusCode::BAD_REQUEST, "head diff exceeds max_head_diff".to_string()));
            }
        }

        Ok(secret)
    }

    fn attempt_flip(&self, query: FlipQuery) -> Response {
        if let Err((status, msg)) = self.check_preconditions(&query) {
            return (status, msg).into_response();
        }

        self.inner.flipping.store(true, Ordering::SeqCst);
        if let Some(cb) = &self.inner.callbacks.flip_started {
            cb();
        }

        if let Err(e) = self.inner.stream.become_following() {
            self.inner.flipping.store(false, Ordering::SeqCst);
            if let Some(cb) = &self.inner.callbacks.flip_canceled {
                cb();
            }
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        // become_following's returned Borrowed only matters for blocking
        // until exclusivity is reached; we don't publish through it here.

        let client_next_index = query.i.unwrap_or(0);
        let body = build_diff_body(&self.inner.stream, client_next_index, query.checked);

        if let Some(max) = self.inner.config.restrictions.max_diff_size {
            if body.len() as u64 > max {
                warn!("flip: diff of {} bytes exceeds max_diff_size {max}, rolling back", body.len());
                let _ = self.inner.stream.become_master();
                self.inner.flipping.store(false, Ordering::SeqCst);
                if let Some(cb) = &self.inner.callbacks.flip_canceled {
                    cb();
                }
                return (StatusCode::BAD_REQUEST, "diff too large".to_string()).into_response();
            }
        }

        self.inner.flipping.store(false, Ordering::SeqCst);
        info!("flip: handed off master status, streamed {} diff bytes", body.len());
        if let Some(cb) = &self.inner.callbacks.flip_finished {
            cb();
        }
        (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

fn build_diff_body<E: StreamEntry>(stream: &StreamContainer<E>, begin: u64, checked: bool) -> String {
    let end = stream.size();
    let snapshot = stream.head_and_last();
    let mut body = String::new();
    let mut last_us = snapshot.idxts.map(|idxts| idxts.us).unwrap_or(-1);

    if checked {
        if let Ok(iter) = stream.persister().iterate(begin, end) {
            for item in iter {
                let Ok((idxts, entry)) = item else { break };
                let payload_json = serde_json::to_string(&entry).unwrap_or_default();
                body.push_str(&format::format_record_line(idxts, &payload_json));
                last_us = idxts.us;
            }
        }
    } else if let Ok(iter) = stream.persister().iterate_unsafe(begin, end) {
        for item in iter {
            let Ok(raw_line) = item else { break };
            if let Ok(idxts) = format::parse_idxts_prefix(&raw_line) {
                last_us = idxts.us;
            }
            body.push_str(&raw_line);
            body.push('\n');
        }
    }

    if snapshot.head > last_us {
        body.push_str(&format!("{{\"us\":{}}}\n", snapshot.head));
    }
    body
}

fn generate_flip_key() -> String {
    let mut rng = rand::thread_rng();
    let key: u64 = rng.gen_range(10u64.pow(18)..10u64.pow(19));
    key.to_string()
}

#[derive(Debug, Default)]
struct FlipQuery {
    key: Option<String>,
    head: Option<i64>,
    i: Option<u64>,
    clock: Option<i64>,
    checked: bool,
}

impl FlipQuery {
    fn parse(raw: &str) -> Self {
        let mut q = FlipQuery::default();
        for pair in raw.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (pair, None),
            };
            match key {
                "key" => q.key = value.map(str::to_string),
                "head" => q.head = value.and_then(|v| v.parse().ok()),
                "i" => q.i = value.and_then(|v| v.parse().ok()),
                "clock" => q.clock = value.and_then(|v| v.parse().ok()),
                "checked" => q.checked = true,
                _ => {}
            }
        }
        q
    }
}

async fn handle_flip_to_master<E: StreamEntry>(State(controller): State<FlipController<E>>, uri: OriginalUri) -> Response {
    let query = FlipQuery::parse(uri.query().unwrap_or(""));
    controller.attempt_flip(query)
}

/// Caller side of the protocol: sends the GET, applies the diff body
/// through the same line-dispatch path the replication follower uses, then
/// switches the local stream to master. `publisher` must be the
/// `Borrowed<Publisher<E>>` the caller already holds from following the
/// remote stream.
#[allow(clippy::too_many_arguments)]
pub fn flip_to_master<E: StreamEntry>(
    remote_base_url: &str,
    key: &str,
    head: i64,
    next_index: u64,
    checked: bool,
    clock: Option<i64>,
    publisher: &Borrowed<Publisher<E>>,
    stream: &StreamContainer<E>,
) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    let mut url = format!("{remote_base_url}/control/flip_to_master?key={key}&head={head}&i={next_index}");
    if let Some(c) = clock {
        url.push_str(&format!("&clock={c}"));
    }
    if checked {
        url.push_str("&checked");
    }

    let response = client.get(&url).send().map_err(|e| Error::RemoteStreamDoesNotRespond(e.to_string()))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        return Err(Error::RemoteStreamRefusedFlipRequest(format!("{status}: {body}")));
    }

    let body = response.text().map_err(|e| Error::RemoteStreamMalformedChunk(e.to_string()))?;
    let mut next_index = next_index;
    let mut next_us = head;
    for line in body.lines() {
        dispatch_line(line, publisher, &mut next_index, &mut next_us, checked)?;
    }

    stream.become_master()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::StreamConfig;
    use crate::types::SchemaInfo;
    use serde::{Deserialize, Serialize};

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

    fn controller() -> (Arc<StreamContainer<Ev>>, FlipController<Ev>) {
        let stream = Arc::new(StreamContainer::<Ev>::in_memory(StreamConfig::new("ns")));
        let controller = FlipController::new(Arc::clone(&stream), FlipConfig::default(), FlipCallbacks::default());
        (stream, controller)
    }

    #[test]
    fn expose_via_http_mints_a_19_digit_key_once() {
        let (_stream, controller) = controller();
        let key = controller.expose_via_http().unwrap();
        assert_eq!(key.len(), 19);
        assert!(controller.expose_via_http().is_err());
    }

    #[test]
    fn bad_key_is_rejected_and_rate_limited() {
        let (stream, controller) = controller();
        controller.expose_via_http().unwrap();
        let publisher = stream.get_publisher().unwrap();
        publisher.publish(&Ev { x: 1 }, 10).unwrap();
        drop(publisher);

        let query = FlipQuery {
            key: Some("0000000000000000000".to_string()),
            head: Some(10),
            i: Some(1),
            clock: None,
            checked: false,
        };
        assert!(controller.check_preconditions(&query).is_err());
        // immediately retrying is now rate-limited even with the right key
        let real_key = controller.inner.secret_key.lock().unwrap().clone().unwrap();
        let retry = FlipQuery { key: Some(real_key), ..query };
        assert!(controller.check_preconditions(&retry).is_err());
    }

    #[test]
    fn diff_body_carries_new_records_and_trailing_head() {
        let (stream, _controller) = controller();
        let publisher = stream.get_publisher().unwrap();
        publisher.publish(&Ev { x: 1 }, 10).unwrap();
        publisher.publish(&Ev { x: 2 }, 20).unwrap();
        publisher.update_head(30).unwrap();
        drop(publisher);

        let body = build_diff_body(&stream, 1, true);
        assert!(body.contains(r#""x":2"#));
        assert!(!body.contains(r#""x":1"#));
        assert!(body.trim_end().ends_with("{\"us\":30}"));
    }
}
