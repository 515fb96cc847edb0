//! # Tables
//!
//! A table maps full tuples to a ternary state and maintains hash-keyed
//! secondary indexes over column subsets. State transitions follow the
//! differential-update protocol:
//!
//! `Absent -> Present` on first proof, `Present -> Unknown` when a proof is
//! retracted, `Unknown -> Present` when another proof exists, and
//! `Unknown -> Absent` once confirmed unprovable.
//!
//! Transitions take the table lock for their whole step, so each is a
//! single linearizable operation. Scans snapshot under the lock and pin the
//! table against reclamation until dropped.

use super::{Tuple, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-tuple proof state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleState {
    Absent,
    Present,
    Unknown,
}

impl TupleState {
    /// The transitions the protocol allows.
    pub fn can_transition_to(self, to: TupleState) -> bool {
        matches!(
            (self, to),
            (TupleState::Absent, TupleState::Present)
                | (TupleState::Present, TupleState::Unknown)
                | (TupleState::Unknown, TupleState::Present)
                | (TupleState::Unknown, TupleState::Absent)
        )
    }
}

/// Outcome of [`Table::insert_or_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Was absent (or never seen); now present.
    Inserted,
    /// Was unknown; now present again.
    Changed,
    /// Already present.
    Unchanged,
}

struct IndexData {
    key_columns: Vec<usize>,
    map: HashMap<Vec<Value>, Vec<Tuple>>,
}

impl IndexData {
    fn key_of(&self, tuple: &Tuple) -> Vec<Value> {
        self.key_columns.iter().map(|&c| tuple[c].clone()).collect()
    }

    fn add(&mut self, tuple: &Tuple) {
        let key = self.key_of(tuple);
        let bucket = self.map.entry(key).or_default();
        if !bucket.iter().any(|t| t == tuple) {
            bucket.push(Arc::clone(tuple));
        }
    }
}

struct TableInner {
    states: HashMap<Tuple, TupleState>,
    indexes: Vec<IndexData>,
}

/// Persistent tuple-state storage with secondary indexes.
pub struct Table {
    id: u32,
    arity: usize,
    inner: Mutex<TableInner>,
    /// Live scan references; reclamation waits for zero.
    pins: Arc<AtomicUsize>,
}

impl Table {
    pub fn new(id: u32, arity: usize, indexes: &[Vec<usize>]) -> Self {
        Table {
            id,
            arity,
            inner: Mutex::new(TableInner {
                states: HashMap::new(),
                indexes: indexes
                    .iter()
                    .map(|keys| IndexData { key_columns: keys.clone(), map: HashMap::new() })
                    .collect(),
            }),
            pins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn index_specs(&self) -> Vec<Vec<usize>> {
        self.inner.lock().indexes.iter().map(|i| i.key_columns.clone()).collect()
    }

    pub fn get_state(&self, tuple: &Tuple) -> TupleState {
        self.inner
            .lock()
            .states
            .get(tuple)
            .copied()
            .unwrap_or(TupleState::Absent)
    }

    /// Attempt `from -> to`. Fires only when the tuple is currently in
    /// `from` and the protocol allows the move. One linearizable step.
    pub fn try_change_state(&self, from: TupleState, to: TupleState, tuple: &Tuple) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let mut inner = self.inner.lock();
        let current = inner.states.get(tuple).copied().unwrap_or(TupleState::Absent);
        if current != from {
            return false;
        }
        inner.states.insert(Arc::clone(tuple), to);
        if to == TupleState::Present {
            for index in &mut inner.indexes {
                index.add(tuple);
            }
        }
        true
    }

    /// Prove a tuple: absent and unknown both become present.
    pub fn insert_or_transition(&self, tuple: &Tuple) -> InsertResult {
        let mut inner = self.inner.lock();
        let current = inner.states.get(tuple).copied().unwrap_or(TupleState::Absent);
        let result = match current {
            TupleState::Absent => InsertResult::Inserted,
            TupleState::Unknown => InsertResult::Changed,
            TupleState::Present => return InsertResult::Unchanged,
        };
        inner.states.insert(Arc::clone(tuple), TupleState::Present);
        for index in &mut inner.indexes {
            index.add(tuple);
        }
        result
    }

    /// Snapshot every tuple with its state. The scan pins the table.
    pub fn scan(&self) -> Scan {
        let inner = self.inner.lock();
        let rows: Vec<(Tuple, TupleState)> = inner
            .states
            .iter()
            .map(|(t, &s)| (Arc::clone(t), s))
            .collect();
        Scan::new(rows, Arc::clone(&self.pins))
    }

    /// Snapshot the tuples matching `key` on index `index_id`, with states.
    pub fn scan_index(&self, index_id: usize, key: &[Value]) -> Scan {
        let inner = self.inner.lock();
        let rows: Vec<(Tuple, TupleState)> = inner.indexes[index_id]
            .map
            .get(key)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|t| {
                        let state = inner
                            .states
                            .get(t)
                            .copied()
                            .unwrap_or(TupleState::Absent);
                        (Arc::clone(t), state)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Scan::new(rows, Arc::clone(&self.pins))
    }

    /// Number of tuples currently present.
    pub fn present_count(&self) -> usize {
        self.inner
            .lock()
            .states
            .values()
            .filter(|&&s| s == TupleState::Present)
            .count()
    }

    /// All present tuples, sorted, for assertions and dumps.
    pub fn present_tuples(&self) -> Vec<Tuple> {
        let mut rows: Vec<Tuple> = self
            .inner
            .lock()
            .states
            .iter()
            .filter(|(_, &s)| s == TupleState::Present)
            .map(|(t, _)| Arc::clone(t))
            .collect();
        rows.sort();
        rows
    }

    /// Drop tuples confirmed absent and their index entries. Refuses while
    /// any scan still pins the table.
    pub fn try_reclaim(&self) -> bool {
        if self.pins.load(Ordering::Acquire) != 0 {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.states.retain(|_, s| *s != TupleState::Absent);
        let live: Vec<Tuple> = inner.states.keys().map(Arc::clone).collect();
        for index in &mut inner.indexes {
            for bucket in index.map.values_mut() {
                bucket.retain(|t| live.contains(t));
            }
            index.map.retain(|_, bucket| !bucket.is_empty());
        }
        true
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }
}

/// A pinned snapshot of rows. Holding one keeps the table from reclaiming
/// its backing storage.
pub struct Scan {
    rows: Vec<(Tuple, TupleState)>,
    pins: Arc<AtomicUsize>,
}

impl Scan {
    fn new(rows: Vec<(Tuple, TupleState)>, pins: Arc<AtomicUsize>) -> Self {
        pins.fetch_add(1, Ordering::AcqRel);
        Scan { rows, pins }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Tuple, TupleState)> {
        self.rows.iter()
    }

    /// Rows currently present, in snapshot order.
    pub fn present(&self) -> impl Iterator<Item = &Tuple> {
        self.rows
            .iter()
            .filter(|(_, s)| *s == TupleState::Present)
            .map(|(t, _)| t)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{tuple, Value};

    fn t2(a: u64, b: u64) -> Tuple {
        tuple([Value::UInt(a), Value::UInt(b)])
    }

    #[test]
    fn state_machine_allows_only_protocol_moves() {
        assert!(TupleState::Absent.can_transition_to(TupleState::Present));
        assert!(TupleState::Present.can_transition_to(TupleState::Unknown));
        assert!(TupleState::Unknown.can_transition_to(TupleState::Present));
        assert!(TupleState::Unknown.can_transition_to(TupleState::Absent));
        assert!(!TupleState::Present.can_transition_to(TupleState::Absent));
        assert!(!TupleState::Absent.can_transition_to(TupleState::Unknown));
    }

    #[test]
    fn insert_then_retract_then_reprove() {
        let table = Table::new(0, 2, &[]);
        let row = t2(1, 2);

        assert_eq!(table.insert_or_transition(&row), InsertResult::Inserted);
        assert_eq!(table.insert_or_transition(&row), InsertResult::Unchanged);

        assert!(table.try_change_state(TupleState::Present, TupleState::Unknown, &row));
        assert_eq!(table.get_state(&row), TupleState::Unknown);

        assert_eq!(table.insert_or_transition(&row), InsertResult::Changed);
        assert_eq!(table.get_state(&row), TupleState::Present);
    }

    #[test]
    fn wrong_from_state_does_not_fire() {
        let table = Table::new(0, 2, &[]);
        let row = t2(1, 2);
        assert!(!table.try_change_state(TupleState::Present, TupleState::Unknown, &row));
        assert_eq!(table.get_state(&row), TupleState::Absent);
    }

    #[test]
    fn index_scan_finds_by_key() {
        let table = Table::new(0, 2, &[vec![0]]);
        table.insert_or_transition(&t2(1, 2));
        table.insert_or_transition(&t2(1, 3));
        table.insert_or_transition(&t2(2, 4));

        let scan = table.scan_index(0, &[Value::UInt(1)]);
        let rows: Vec<_> = scan.present().cloned().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&t2(1, 2)));
        assert!(rows.contains(&t2(1, 3)));
    }

    #[test]
    fn index_scan_reports_states() {
        let table = Table::new(0, 2, &[vec![0]]);
        let row = t2(1, 2);
        table.insert_or_transition(&row);
        table.try_change_state(TupleState::Present, TupleState::Unknown, &row);

        let scan = table.scan_index(0, &[Value::UInt(1)]);
        assert_eq!(scan.len(), 1);
        assert_eq!(scan.present().count(), 0);
    }

    #[test]
    fn scans_pin_against_reclaim() {
        let table = Table::new(0, 2, &[]);
        let row = t2(1, 2);
        table.insert_or_transition(&row);
        table.try_change_state(TupleState::Present, TupleState::Unknown, &row);
        table.try_change_state(TupleState::Unknown, TupleState::Absent, &row);

        let scan = table.scan();
        assert_eq!(table.pin_count(), 1);
        assert!(!table.try_reclaim());
        drop(scan);
        assert_eq!(table.pin_count(), 0);
        assert!(table.try_reclaim());
        assert!(table.scan().is_empty());
    }
}
