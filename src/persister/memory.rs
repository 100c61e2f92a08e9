//! In-memory persister: nothing survives process exit, nothing ever touches
//! disk. Useful for tests and for streams that only need in-process fan-out.
//!
//! Open Question (b) from the source framework is resolved here: the
//! original memory persister accepted a mutex parameter it then ignored.
//! This one takes none — there is nothing external to synchronize with.

use std::marker::PhantomData;
use std::sync::Mutex;

use super::{format, validate_range};
use crate::error::{Error, Result};
use crate::types::{HeadAndMaybeLast, IndexTimestamp, StreamEntry};
use crate::persister::Persister;

struct State {
    next_index: u64,
    last_entry_us: i64,
    head: i64,
    timestamps: Vec<i64>,
    payload_json: Vec<String>,
}

impl State {
    fn new() -> Self {
        Self {
            next_index: 0,
            last_entry_us: -1,
            head: -1,
            timestamps: Vec::new(),
            payload_json: Vec::new(),
        }
    }
}

/// An entirely in-memory [`Persister`].
pub struct MemoryPersister<E: StreamEntry> {
    state: Mutex<State>,
    _entry: PhantomData<E>,
}

impl<E: StreamEntry> Default for MemoryPersister<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StreamEntry> MemoryPersister<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
            _entry: PhantomData,
        }
    }
}

impl<E: StreamEntry> Persister<E> for MemoryPersister<E> {
    fn publish(&self, payload: &E, us: i64) -> Result<IndexTimestamp> {
        let mut state = self.state.lock().unwrap();
        if us <= state.head {
            return Err(Error::InconsistentTimestamp {
                head_us: state.head,
                attempted_us: us,
            });
        }
        let idxts = IndexTimestamp::new(state.next_index, us);
        let payload_json = serde_json::to_string(payload)?;
        state.timestamps.push(us);
        state.payload_json.push(payload_json);
        state.next_index += 1;
        state.last_entry_us = us;
        state.head = us;
        Ok(idxts)
    }

    fn publish_unsafe(&self, raw_line: &str) -> Result<IndexTimestamp> {
        let mut state = self.state.lock().unwrap();
        let idxts = format::parse_idxts_prefix(raw_line)?;
        if idxts.index != state.next_index {
            return Err(Error::UnsafePublishBadIndexTimestamp {
                expected: state.next_index,
                found: idxts.index,
            });
        }
        if idxts.us <= state.head {
            return Err(Error::InconsistentTimestamp {
                head_us: state.head,
                attempted_us: idxts.us,
            });
        }
        let tab_pos = raw_line
            .find('\t')
            .ok_or_else(|| Error::MalformedEntry(raw_line.to_string()))?;
        state.timestamps.push(idxts.us);
        state.payload_json.push(raw_line[tab_pos + 1..].to_string());
        state.next_index += 1;
        state.last_entry_us = idxts.us;
        state.head = idxts.us;
        Ok(idxts)
    }

    fn update_head(&self, us: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if us <= state.head {
            return Err(Error::InconsistentTimestamp {
                head_us: state.head,
                attempted_us: us,
            });
        }
        state.head = us;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().unwrap().next_index
    }

    fn current_head(&self) -> i64 {
        self.state.lock().unwrap().head
    }

    fn last_published(&self) -> Result<IndexTimestamp> {
        let state = self.state.lock().unwrap();
        if state.next_index == 0 {
            return Err(Error::NoEntriesPublishedYet);
        }
        Ok(IndexTimestamp::new(state.next_index - 1, state.last_entry_us))
    }

    fn head_and_last(&self) -> HeadAndMaybeLast {
        let state = self.state.lock().unwrap();
        let idxts = if state.next_index == 0 {
            None
        } else {
            Some(IndexTimestamp::new(state.next_index - 1, state.last_entry_us))
        };
        HeadAndMaybeLast { head: state.head, idxts }
    }

    fn index_range_by_timestamp_range(&self, from: i64, till: i64) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        super::index_range_by_timestamp_range(&state.timestamps, from, till)
    }

    fn iterate<'a>(
        &'a self,
        begin_index: u64,
        end_index: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<(IndexTimestamp, E)>> + 'a>> {
        let snapshot: Vec<(i64, String)> = {
            let state = self.state.lock().unwrap();
            validate_range(begin_index, end_index, state.next_index)?;
            (begin_index..end_index)
                .map(|i| (state.timestamps[i as usize], state.payload_json[i as usize].clone()))
                .collect()
        };
        Ok(Box::new(snapshot.into_iter().enumerate().map(move |(offset, (us, json))| {
            let idxts = IndexTimestamp::new(begin_index + offset as u64, us);
            let record: E = serde_json::from_str(&json)?;
            Ok((idxts, record))
        })))
    }

    fn iterate_unsafe<'a>(
        &'a self,
        begin_index: u64,
        end_index: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<String>> + 'a>> {
        let snapshot: Vec<(i64, String)> = {
            let state = self.state.lock().unwrap();
            validate_range(begin_index, end_index, state.next_index)?;
            (begin_index..end_index)
                .map(|i| (state.timestamps[i as usize], state.payload_json[i as usize].clone()))
                .collect()
        };
        Ok(Box::new(snapshot.into_iter().enumerate().map(move |(offset, (us, json))| {
            let idxts = IndexTimestamp::new(begin_index + offset as u64, us);
            Ok(format::format_record_line(idxts, &json).trim_end_matches('\n').to_string())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use crate::types::SchemaInfo;

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

    #[test]
    fn publish_then_iterate_round_trip() {
        let p = MemoryPersister::<Ev>::new();
        let idxts = p.publish(&Ev { x: 1 }, 10).unwrap();
        assert_eq!(idxts.index, 0);
        let mut it = p.iterate(0, 1).unwrap();
        let (got_idxts, got) = it.next().unwrap().unwrap();
        assert_eq!(got_idxts, idxts);
        assert_eq!(got, Ev { x: 1 });
        assert!(it.next().is_none());
    }

    #[test]
    fn rejects_non_increasing_timestamp() {
        let p = MemoryPersister::<Ev>::new();
        p.publish(&Ev { x: 1 }, 10).unwrap();
        assert!(matches!(
            p.publish(&Ev { x: 2 }, 10),
            Err(Error::InconsistentTimestamp { .. })
        ));
    }

    #[test]
    fn update_head_then_publish_and_head_monotonic() {
        let p = MemoryPersister::<Ev>::new();
        p.publish(&Ev { x: 1 }, 100).unwrap();
        p.update_head(300).unwrap();
        assert!(matches!(p.update_head(200), Err(Error::InconsistentTimestamp { .. })));
        p.publish(&Ev { x: 2 }, 400).unwrap();
        assert_eq!(p.current_head(), 400);
    }

    #[test]
    fn invalid_range_rejected() {
        let p = MemoryPersister::<Ev>::new();
        p.publish(&Ev { x: 1 }, 10).unwrap();
        assert!(matches!(
            p.iterate(0, 5),
            Err(Error::InvalidIterableRange { .. })
        ));
        assert!(matches!(
            p.iterate(1, 0),
            Err(Error::InvalidIterableRange { .. })
        ));
    }

    #[test]
    fn no_entries_published_yet() {
        let p = MemoryPersister::<Ev>::new();
        assert!(matches!(p.last_published(), Err(Error::NoEntriesPublishedYet)));
        assert_eq!(p.head_and_last(), HeadAndMaybeLast::empty());
    }
}
