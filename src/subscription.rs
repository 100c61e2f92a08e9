//! One OS thread per subscription, cooperative suspend/resume on the
//! stream's doorbell, strictly ordered delivery. Grounded in the teacher's
//! `src/ipc/fanin.rs`/`src/ipc/bidirectional.rs` thread-per-consumer shape,
//! generalized to the checked/unchecked/type-filtered capability set spec'd
//! in §4.3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::doorbell::Doorbell;
use crate::error::Result;
use crate::owned::{BorrowedWithCallback, Owned};
use crate::persister::Persister;
use crate::types::{IndexTimestamp, StreamEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberResponse {
    More,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateResponse {
    Wait,
    Terminate,
}

/// The capability set a subscription implements. Every method has a default
/// so an implementor only overrides the forms it actually consumes —
/// checked subscribers override `on_entry`, unchecked ones `on_raw`.
pub trait Subscription<E: StreamEntry>: Send {
    fn on_entry(&mut self, _entry: &E, _current: IndexTimestamp, _last: IndexTimestamp) -> SubscriberResponse {
        SubscriberResponse::More
    }

    fn on_raw(&mut self, _raw_line: &str, _current_index: u64, _last: IndexTimestamp) -> SubscriberResponse {
        SubscriberResponse::More
    }

    fn on_head(&mut self, _us: i64) -> SubscriberResponse {
        SubscriberResponse::More
    }

    fn terminate(&mut self) -> TerminateResponse {
        TerminateResponse::Terminate
    }

    /// Type-filtered subscriptions only: whether `entry` passes the filter.
    /// Default: every entry passes (no filtering).
    fn matches(&self, _entry: &E) -> bool {
        true
    }

    /// Called when the scheduler skipped a run of entries at the tail, all
    /// rejected by `matches`, and has nothing else to deliver. Lets a
    /// type-filtered subscriber decide whether to keep waiting.
    fn entry_response_if_no_more_pass_type_filter(&mut self) -> SubscriberResponse {
        SubscriberResponse::More
    }
}

/// Whether a subscriber iterates parsed records (`Checked`) or raw log
/// lines (`Unchecked`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Checked,
    Unchecked,
}

/// Caller-held handle to a running subscription. Dropping it signals
/// termination and joins the subscriber thread — the `Owned<()>` it holds
/// is the sole owner of this subscription's liveness; the thread holds a
/// `BorrowedWithCallback<()>` of it, so drop here fires that callback
/// synchronously, then blocks until the thread has released its borrow,
/// then joins.
pub struct SubscriberScope {
    liveness: Option<Owned<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SubscriberScope {
    fn drop(&mut self) {
        self.liveness.take(); // fires the thread's termination callback, blocks until released
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn spawn_subscription<E: StreamEntry>(
    persister: Arc<dyn Persister<E>>,
    doorbell: Arc<Doorbell>,
    shutting_down: Arc<AtomicBool>,
    mode: SubscriptionMode,
    start_index: u64,
    mut subscriber: Box<dyn Subscription<E>>,
) -> SubscriberScope {
    let liveness = Owned::new(());
    let terminate_flag = Arc::new(AtomicBool::new(false));
    let callback_flag = Arc::clone(&terminate_flag);
    let doorbell_for_callback = Arc::clone(&doorbell);
    let borrowed = liveness.borrow_with_callback(move || {
        callback_flag.store(true, Ordering::SeqCst);
        doorbell_for_callback.ring();
    });

    let handle = std::thread::spawn(move || {
        run_scheduler_loop(persister, doorbell, shutting_down, terminate_flag, mode, start_index, subscriber.as_mut(), borrowed);
    });

    SubscriberScope {
        liveness: Some(liveness),
        handle: Some(handle),
    }
}

fn run_scheduler_loop<E: StreamEntry>(
    persister: Arc<dyn Persister<E>>,
    doorbell: Arc<Doorbell>,
    shutting_down: Arc<AtomicBool>,
    terminate_flag: Arc<AtomicBool>,
    mode: SubscriptionMode,
    mut cursor_index: u64,
    subscriber: &mut dyn Subscription<E>,
    _borrowed: BorrowedWithCallback<()>,
) {
    // If the subscription starts at the tail, the stream's current HEAD is
    // not a "new" advance — only movements past this point should trigger
    // `on_head`. If it starts mid-backlog, the first delivery pass below
    // sets this from the snapshot once the backlog is drained.
    let mut last_head_seen: i64 = if cursor_index >= persister.size() {
        persister.current_head()
    } else {
        -1
    };
    loop {
        if terminate_flag.load(Ordering::SeqCst) || shutting_down.load(Ordering::SeqCst) {
            match subscriber.terminate() {
                TerminateResponse::Terminate => {
                    debug!("subscriber terminating at index {cursor_index}");
                    return;
                }
                TerminateResponse::Wait => {
                    warn!("subscriber declined termination, continuing to drain at index {cursor_index}");
                }
            }
        }

        let snapshot = persister.head_and_last();
        let size = persister.size();

        if cursor_index < size {
            match deliver_range(persister.as_ref(), mode, cursor_index, size, subscriber) {
                Ok(DeliveryOutcome::Continued(new_cursor, skipped_all)) => {
                    cursor_index = new_cursor;
                    if let Some(idxts) = snapshot.idxts {
                        last_head_seen = idxts.us;
                    }
                    if skipped_all && cursor_index == size {
                        if subscriber.entry_response_if_no_more_pass_type_filter() == SubscriberResponse::Done {
                            return;
                        }
                    }
                }
                Ok(DeliveryOutcome::Done) => return,
                Err(_) => return,
            }
            continue;
        }

        if snapshot.head > last_head_seen {
            last_head_seen = snapshot.head;
            if subscriber.on_head(snapshot.head) == SubscriberResponse::Done {
                return;
            }
            continue;
        }

        debug!("subscriber suspending at index {cursor_index}, head {}", snapshot.head);
        let gen = doorbell.generation();
        doorbell.wait_for_change(gen, Duration::from_millis(500));
    }
}

enum DeliveryOutcome {
    Continued(u64, bool),
    Done,
}

fn deliver_range<E: StreamEntry>(
    persister: &dyn Persister<E>,
    mode: SubscriptionMode,
    begin: u64,
    end: u64,
    subscriber: &mut dyn Subscription<E>,
) -> Result<DeliveryOutcome> {
    let mut cursor = begin;
    let mut delivered_any = false;

    match mode {
        SubscriptionMode::Checked => {
            for item in persister.iterate(begin, end)? {
                let (idxts, entry) = item?;
                let last = idxts;
                if !subscriber.matches(&entry) {
                    cursor = idxts.index + 1;
                    continue;
                }
                delivered_any = true;
                cursor = idxts.index + 1;
                if subscriber.on_entry(&entry, idxts, last) == SubscriberResponse::Done {
                    return Ok(DeliveryOutcome::Done);
                }
            }
        }
        SubscriptionMode::Unchecked => {
            for (offset, item) in persister.iterate_unsafe(begin, end)?.enumerate() {
                let raw_line = item?;
                let current_index = begin + offset as u64;
                let idxts = crate::persister::format::parse_idxts_prefix(&raw_line)?;
                delivered_any = true;
                cursor = current_index + 1;
                if subscriber.on_raw(&raw_line, current_index, idxts) == SubscriberResponse::Done {
                    return Ok(DeliveryOutcome::Done);
                }
            }
        }
    }

    Ok(DeliveryOutcome::Continued(cursor, !delivered_any))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::MemoryPersister;
    use crate::types::SchemaInfo;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

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
        done_at: usize,
    }

    impl Subscription<Ev> for Collector {
        fn on_entry(&mut self, entry: &Ev, _current: IndexTimestamp, _last: IndexTimestamp) -> SubscriberResponse {
            let mut seen = self.seen.lock().unwrap();
            seen.push(entry.clone());
            if seen.len() >= self.done_at {
                SubscriberResponse::Done
            } else {
                SubscriberResponse::More
            }
        }
    }

    #[test]
    fn three_publishes_observed_in_order() {
        let persister: Arc<dyn Persister<Ev>> = Arc::new(MemoryPersister::<Ev>::new());
        let doorbell = Arc::new(Doorbell::new());
        persister.publish(&Ev { x: 1 }, 10).unwrap();
        persister.publish(&Ev { x: 2 }, 20).unwrap();
        persister.publish(&Ev { x: 3 }, 30).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let scope = spawn_subscription(
            Arc::clone(&persister),
            doorbell,
            Arc::new(AtomicBool::new(false)),
            SubscriptionMode::Checked,
            0,
            Box::new(Collector { seen: Arc::clone(&seen), done_at: 3 }),
        );
        for _ in 0..200 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(scope);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ev { x: 1 }, Ev { x: 2 }, Ev { x: 3 }]
        );
    }

    struct NeverDone;
    impl Subscription<Ev> for NeverDone {}

    #[test]
    fn scope_drop_terminates_waiting_thread() {
        let persister: Arc<dyn Persister<Ev>> = Arc::new(MemoryPersister::<Ev>::new());
        let doorbell = Arc::new(Doorbell::new());
        let scope = spawn_subscription(
            persister,
            doorbell,
            Arc::new(AtomicBool::new(false)),
            SubscriptionMode::Checked,
            0,
            Box::new(NeverDone),
        );
        // give the subscriber thread time to reach its tail wait before we
        // drop, so this actually exercises the parked-at-tail case.
        std::thread::sleep(Duration::from_millis(50));
        let start = std::time::Instant::now();
        drop(scope); // must not hang, and must not ride out the 500ms poll ceiling
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "scope drop took {:?}; termination callback should ring the doorbell, not wait for the next poll",
            start.elapsed()
        );
    }
}
