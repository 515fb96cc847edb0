//! # Runtime
//!
//! The storage contract generated programs execute against: a [`Storage`]
//! owning typed [`Table`]s (persistent tuple-state maps with secondary
//! indexes), ephemeral [`Vector`]s and [`Set`]s, condition reference counts,
//! and a checksummed [`Superblock`] for crash-consistent metadata.
//!
//! Every state transition is a single linearizable step against its table;
//! concurrent readers observe either the pre- or post-state. Scans hand out
//! pinned references counted against the table so backing storage is never
//! reclaimed under a live reader.

pub mod condition;
pub mod superblock;
pub mod table;
pub mod vector;

pub use condition::ConditionRefCount;
pub use superblock::{Superblock, SuperblockError, TableMeta};
pub use table::{InsertResult, Scan, Table, TupleState};
pub use vector::{Set, Vector};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Bit pattern of an `f64`, hashable and totally ordered. Runtime tuples
/// need `Eq + Hash`; floats get it through their bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct F64Bits(u64);

impl F64Bits {
    pub fn from_f64(value: f64) -> Self {
        F64Bits(value.to_bits())
    }

    pub fn value(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// A runtime value. The compiler's type vocabulary maps onto this: sized
/// integers widen to 64 bits, `utf8`/`ascii` become strings, `bytes` byte
/// arrays, and foreign values travel as bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(F64Bits),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Uuid(uuid::Uuid),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::String(Arc::from(s))
    }

    pub fn float(f: f64) -> Value {
        Value::Float(F64Bits::from_f64(f))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{}", v.value()),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "{v:02x?}"),
            Value::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// A runtime tuple. Shared so indexes and scans reference one allocation.
pub type Tuple = Arc<[Value]>;

/// Build a tuple from values.
pub fn tuple(values: impl IntoIterator<Item = Value>) -> Tuple {
    values.into_iter().collect()
}

/// Runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no table with id {0}")]
    NoSuchTable(u32),

    #[error("table {table} expects arity {expected}, got {found}")]
    ArityMismatch { table: u32, expected: usize, found: usize },

    #[error(transparent)]
    Superblock(#[from] SuperblockError),
}

/// Owner of all persistent state: tables by id plus condition variables.
/// Ephemeral vectors live inside procedure frames, not here.
#[derive(Default)]
pub struct Storage {
    tables: RwLock<HashMap<u32, Arc<Table>>>,
    conditions: RwLock<HashMap<u32, Arc<ConditionRefCount>>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the table with `id`. Index specs are key-column
    /// sets over the tuple.
    pub fn create_table(&self, id: u32, arity: usize, indexes: &[Vec<usize>]) -> Arc<Table> {
        let mut tables = self.tables.write();
        Arc::clone(
            tables
                .entry(id)
                .or_insert_with(|| Arc::new(Table::new(id, arity, indexes))),
        )
    }

    pub fn table(&self, id: u32) -> Result<Arc<Table>, RuntimeError> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::NoSuchTable(id))
    }

    pub fn condition(&self, id: u32) -> Arc<ConditionRefCount> {
        let mut conditions = self.conditions.write();
        Arc::clone(conditions.entry(id).or_default())
    }

    /// Metadata snapshot for the superblock.
    pub fn metadata(&self) -> Vec<TableMeta> {
        let tables = self.tables.read();
        let mut metas: Vec<TableMeta> = tables
            .values()
            .map(|t| TableMeta {
                id: t.id(),
                arity: t.arity(),
                indexes: t.index_specs(),
            })
            .collect();
        metas.sort_by_key(|m| m.id);
        metas
    }
}

/// An undo log staging state transitions so a failed batch can roll back.
/// Batches are atomic: either every transition of a batch lands, or none.
#[derive(Default)]
pub struct TransitionLog {
    entries: Vec<(Arc<Table>, Tuple, TupleState, TupleState)>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transition through the log. Returns whether it fired.
    pub fn try_change_state(
        &mut self,
        table: &Arc<Table>,
        from: TupleState,
        to: TupleState,
        tuple: &Tuple,
    ) -> bool {
        if table.try_change_state(from, to, tuple) {
            self.entries.push((Arc::clone(table), Arc::clone(tuple), from, to));
            true
        } else {
            false
        }
    }

    pub fn insert_or_transition(&mut self, table: &Arc<Table>, tuple: &Tuple) -> InsertResult {
        let result = table.insert_or_transition(tuple);
        let from = match result {
            InsertResult::Inserted => TupleState::Absent,
            InsertResult::Changed => TupleState::Unknown,
            InsertResult::Unchanged => return result,
        };
        self.entries
            .push((Arc::clone(table), Arc::clone(tuple), from, TupleState::Present));
        result
    }

    /// Commit: forget the undo entries.
    pub fn commit(&mut self) {
        self.entries.clear();
    }

    /// Revert every staged transition, newest first.
    pub fn rollback(&mut self) {
        while let Some((table, tuple, from, to)) = self.entries.pop() {
            let reverted = table.try_change_state(to, from, &tuple);
            debug_assert!(reverted, "rollback transition must apply");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
