//! # Control-Flow IR
//!
//! The scheduled form of the data-flow graph: persistent tables with
//! secondary indexes, ephemeral vectors, typed variables, and procedures
//! built from a region tree. Generated code maps onto this IR one-to-one:
//! one type per table/index, one function per procedure.
//!
//! Procedures come in six kinds: the initializer, one message handler per
//! received message, top-down tuple finders and removers for differential
//! maintenance, and the two induction handlers for recursive strata.

pub mod builder;
pub mod format;

use crate::ast::{ComparisonOp, DeclId};
use crate::intern::StrId;
use crate::types::TypeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcedureId(pub u32);

/// What backs a table: a declared relation or an internal materialization of
/// a view (join inputs that are not plain relation selects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    Relation(DeclId),
    View(crate::query::ViewId),
}

/// Persistent mapping from a full-tuple key to a tuple state.
#[derive(Debug, Clone)]
pub struct DataTable {
    pub id: TableId,
    pub source: TableSource,
    pub name: StrId,
    pub columns: Vec<TypeKind>,
    pub indexes: Vec<IndexId>,
}

impl DataTable {
    pub fn arity(&self) -> usize {
        self.columns.len()
    }
}

/// Hash index over a subset of a table's columns. When the keys cover every
/// column the index is covering and serves full-tuple lookups.
#[derive(Debug, Clone)]
pub struct DataIndex {
    pub id: IndexId,
    pub table: TableId,
    pub key_columns: Vec<usize>,
    pub value_columns: Vec<usize>,
}

impl DataIndex {
    pub fn is_covering(&self) -> bool {
        self.value_columns.is_empty()
    }
}

/// Purpose of an ephemeral vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    /// Added tuples of a message batch (a handler parameter).
    InputAdded,
    /// Removed tuples of a `@differential` message batch.
    InputRemoved,
    /// Worklist feeding an induction cycle.
    Induction,
    /// Double-buffer partner drained inside an induction iteration.
    InductionSwap,
    /// Rows accumulated for a query response or publish.
    Output,
}

#[derive(Debug, Clone)]
pub struct DataVector {
    pub id: VectorId,
    pub kind: VectorKind,
    pub columns: Vec<TypeKind>,
    /// Worker the vector partitions to; single-worker plans use 0.
    pub worker: u32,
}

/// Role of a variable, mirroring how emitted code declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    Parameter,
    Local,
    Free,
    GlobalBoolean,
    ConditionRefCount,
}

#[derive(Debug, Clone)]
pub struct DataVariable {
    pub id: VariableId,
    pub role: VariableRole,
    pub ty: TypeKind,
    pub name: StrId,
}

/// Allowed tuple-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// First proof arrives.
    AbsentToPresent,
    /// A proof is retracted; the tuple needs re-verification.
    PresentToUnknown,
    /// An alternative proof exists.
    UnknownToPresent,
    /// Confirmed unprovable.
    UnknownToAbsent,
}

/// Which branch of a `CheckState` fires.
#[derive(Debug, Clone, Default)]
pub struct StateBranches {
    pub present: Option<Box<Region>>,
    pub absent: Option<Box<Region>>,
    pub unknown: Option<Box<Region>>,
}

/// Procedure body building block.
#[derive(Debug, Clone)]
pub enum Region {
    /// Children run in order.
    Series(Vec<Region>),
    /// Children share no data-flow dependency and may run concurrently.
    Parallel(Vec<Region>),
    /// Introduce local variables for the nested region.
    LetBinding { vars: Vec<VariableId>, body: Box<Region> },
    /// Invoke another procedure; `result` receives its boolean, if any.
    Call { procedure: ProcedureId, args: Vec<VariableId>, result: Option<VariableId> },
    Return { value: Option<bool> },
    /// Adjust a condition reference count.
    ExistenceAssertion { condition: VariableId, increment: bool },
    /// Gate the body on a condition count being non-zero (or zero).
    ExistenceCheck { condition: VariableId, expect_nonzero: bool, body: Box<Region> },
    /// Invoke a functor; the body runs once per produced output row. A
    /// negated generate subtracts previously produced rows instead.
    Generate {
        functor: DeclId,
        inputs: Vec<VariableId>,
        outputs: Vec<VariableId>,
        negated: bool,
        body: Box<Region>,
    },
    /// Fixed-point loop: while any worklist vector is non-empty, run the
    /// cycle; afterwards run the output region once.
    Induction { vectors: Vec<VectorId>, cycle: Box<Region>, output: Box<Region> },
    VectorAppend { vector: VectorId, vars: Vec<VariableId> },
    VectorLoop { vector: VectorId, vars: Vec<VariableId>, body: Box<Region> },
    VectorClear { vector: VectorId },
    VectorSwap { lhs: VectorId, rhs: VectorId },
    /// Deduplicate in place; required before duplicate-sensitive loops.
    VectorUnique { vector: VectorId },
    /// Atomic state change; the body runs only when the transition fired.
    TransitionState {
        table: TableId,
        transition: StateTransition,
        vars: Vec<VariableId>,
        body: Box<Region>,
    },
    /// Branch on the current state of a tuple.
    CheckState { table: TableId, vars: Vec<VariableId>, branches: StateBranches },
    /// Probe an index with bound key variables; the body runs per match with
    /// the value columns bound to `out_vars`.
    TableJoin {
        table: TableId,
        index: IndexId,
        key_vars: Vec<VariableId>,
        out_vars: Vec<VariableId>,
        body: Box<Region>,
    },
    /// Cross product over whole tables.
    TableProduct { tables: Vec<TableId>, out_vars: Vec<Vec<VariableId>>, body: Box<Region> },
    /// Full scan; the body runs per row.
    TableScan { table: TableId, out_vars: Vec<VariableId>, body: Box<Region> },
    /// Filter on a comparison between variable tuples (or a constant,
    /// pre-loaded into a variable by the initializer).
    TupleCompare { op: ComparisonOp, lhs: Vec<VariableId>, rhs: Vec<VariableId>, body: Box<Region> },
    /// Emit a tuple on a published message stream.
    Publish { message: DeclId, vars: Vec<VariableId>, added: bool },
}

impl Region {
    /// Empty series; the unit region.
    pub fn nop() -> Region {
        Region::Series(Vec::new())
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Region::Series(v) if v.is_empty())
    }

    /// Number of regions in this subtree, for structural tests and dumps.
    pub fn size(&self) -> usize {
        1 + match self {
            Region::Series(children) | Region::Parallel(children) => {
                children.iter().map(Region::size).sum()
            }
            Region::LetBinding { body, .. }
            | Region::ExistenceCheck { body, .. }
            | Region::Generate { body, .. }
            | Region::VectorLoop { body, .. }
            | Region::TransitionState { body, .. }
            | Region::TableJoin { body, .. }
            | Region::TableProduct { body, .. }
            | Region::TableScan { body, .. }
            | Region::TupleCompare { body, .. } => body.size(),
            Region::Induction { cycle, output, .. } => cycle.size() + output.size(),
            Region::CheckState { branches, .. } => {
                branches.present.as_deref().map_or(0, Region::size)
                    + branches.absent.as_deref().map_or(0, Region::size)
                    + branches.unknown.as_deref().map_or(0, Region::size)
            }
            _ => 0,
        }
    }
}

/// Kinds of generated procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Initializer,
    MessageHandler(DeclId),
    TupleFinder(DeclId),
    TupleRemover(DeclId),
    InductionCycleHandler,
    InductionOutputHandler,
}

#[derive(Debug, Clone)]
pub struct Procedure {
    pub id: ProcedureId,
    pub kind: ProcedureKind,
    /// Scalar parameters (e.g. the bound columns of a finder).
    pub params: Vec<VariableId>,
    /// Vector parameters (message handler input batches).
    pub vector_params: Vec<VectorId>,
    pub body: Region,
}

/// A zero-arity predicate maintained as a reference count.
#[derive(Debug, Clone)]
pub struct Condition {
    pub decl: DeclId,
    pub variable: VariableId,
}

/// The complete control-flow program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub tables: Vec<DataTable>,
    pub indexes: Vec<DataIndex>,
    pub vectors: Vec<DataVector>,
    pub variables: Vec<DataVariable>,
    pub procedures: Vec<Procedure>,
    pub conditions: Vec<Condition>,
}

impl Program {
    pub fn table(&self, id: TableId) -> &DataTable {
        &self.tables[id.0 as usize]
    }

    pub fn index(&self, id: IndexId) -> &DataIndex {
        &self.indexes[id.0 as usize]
    }

    pub fn vector(&self, id: VectorId) -> &DataVector {
        &self.vectors[id.0 as usize]
    }

    pub fn variable(&self, id: VariableId) -> &DataVariable {
        &self.variables[id.0 as usize]
    }

    pub fn procedure(&self, id: ProcedureId) -> &Procedure {
        &self.procedures[id.0 as usize]
    }

    pub fn procedures_of_kind(
        &self,
        pred: impl Fn(&ProcedureKind) -> bool,
    ) -> impl Iterator<Item = &Procedure> {
        self.procedures.iter().filter(move |p| pred(&p.kind))
    }

    pub fn add_table(&mut self, source: TableSource, name: StrId, columns: Vec<TypeKind>) -> TableId {
        let id = TableId(self.tables.len() as u32);
        self.tables.push(DataTable { id, source, name, columns, indexes: Vec::new() });
        id
    }

    /// Get or create an index over `key_columns` of `table`.
    pub fn ensure_index(&mut self, table: TableId, mut key_columns: Vec<usize>) -> IndexId {
        key_columns.sort_unstable();
        key_columns.dedup();
        if let Some(existing) = self.table(table).indexes.iter().find(|&&i| {
            self.index(i).key_columns == key_columns
        }) {
            return *existing;
        }
        let arity = self.table(table).arity();
        let value_columns: Vec<usize> =
            (0..arity).filter(|c| !key_columns.contains(c)).collect();
        let id = IndexId(self.indexes.len() as u32);
        self.indexes.push(DataIndex { id, table, key_columns, value_columns });
        self.tables[table.0 as usize].indexes.push(id);
        id
    }

    pub fn add_vector(&mut self, kind: VectorKind, columns: Vec<TypeKind>, worker: u32) -> VectorId {
        let id = VectorId(self.vectors.len() as u32);
        self.vectors.push(DataVector { id, kind, columns, worker });
        id
    }

    pub fn add_variable(&mut self, role: VariableRole, ty: TypeKind, name: StrId) -> VariableId {
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(DataVariable { id, role, ty, name });
        id
    }

    pub fn add_procedure(
        &mut self,
        kind: ProcedureKind,
        params: Vec<VariableId>,
        vector_params: Vec<VectorId>,
        body: Region,
    ) -> ProcedureId {
        let id = ProcedureId(self.procedures.len() as u32);
        self.procedures.push(Procedure { id, kind, params, vector_params, body });
        id
    }
}
