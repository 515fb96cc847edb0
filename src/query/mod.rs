//! # Data-Flow IR
//!
//! The relational view graph lowered from clauses. Views live in an arena
//! addressed by [`ViewId`]; columns live beside them addressed by [`ColId`]
//! and record their producing view, so edges are plain index records and the
//! graph tolerates cycles (recursion) without back-pointers.
//!
//! Ten view kinds cover the algebra: Select, Tuple, Join, Compare, Map,
//! Aggregate, Negate, Merge, Insert, KVIndex, plus zero-arity Condition
//! guards. Differential labels (`can_receive_deletions` /
//! `can_produce_deletions`) are computed by a monotone fixpoint from the
//! sources that can ever retract.

pub mod builder;
pub mod dot;
pub mod rewrite;

use crate::ast::{DeclId, Literal};
use crate::ast::ComparisonOp;
use crate::intern::StrId;
use crate::types::TypeKind;
use std::collections::HashMap;

/// Index of a view in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u32);

/// Index of a column in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColId(pub u32);

/// A dataflow column: stable identity plus producing view and position.
#[derive(Debug, Clone)]
pub struct QueryColumn {
    pub id: ColId,
    pub view: ViewId,
    /// Output position within the producing view.
    pub index: usize,
    pub ty: TypeKind,
    /// Best-effort source name for dumps; empty for synthesized columns.
    pub name: StrId,
}

/// Where a `Select` pulls tuples from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A materialized relation.
    Relation(DeclId),
    /// A received message stream.
    Stream(DeclId),
    /// A constant generator producing one tuple.
    Constant(Literal),
}

/// Where an `Insert` sinks tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// A materialized relation.
    Relation(DeclId),
    /// A published (transmitted) message stream.
    Stream(DeclId),
}

/// View payload.
#[derive(Debug, Clone)]
pub enum ViewKind {
    /// Pull all columns from a source.
    Select { source: Source },

    /// Projection / forwarding. `input_columns[i]` feeds output `i`;
    /// positions in `constants` are filled from literals instead.
    Tuple { constants: Vec<(usize, Literal)> },

    /// Equi-join. The first `pivots` outputs are pivot columns; each pivot
    /// output merges one column from every input (`pivot_sources`), and the
    /// remaining outputs forward the non-pivot input columns in input order.
    Join { pivots: usize, pivot_sources: Vec<Vec<ColId>> },

    /// Filter `lhs op rhs`. `input_columns[0]` is the lhs; the rhs is either
    /// `input_columns[1]` or a literal. Remaining input columns pass through.
    /// For `=`, the lhs and rhs merge into a single output column.
    Compare { op: ComparisonOp, rhs_literal: Option<Literal> },

    /// Apply a functor. The first `copied` input columns are forwarded
    /// unchanged; the rest feed the functor's bound parameters. Outputs are
    /// the copied columns followed by one column per free parameter. A
    /// negated map subtracts previously produced outputs (impure functors
    /// during retraction).
    Map { functor: DeclId, copied: usize, negated: bool },

    /// Group-and-reduce. Input columns are `group` group-by columns, then
    /// `config` configuration columns, then the aggregated columns. Outputs
    /// are group + config + one column per summary parameter.
    Aggregate { functor: DeclId, group: usize, config: usize },

    /// Anti-semi-join. `inputs[0]` supplies candidate tuples; `inputs[1]` is
    /// the negated view. The first `copied` input columns pass through; the
    /// rest participate in the anti-match against the negated view's columns
    /// (positionally).
    Negate { copied: usize },

    /// Union of same-shaped inputs.
    Merge,

    /// Terminal sink. A deletion insert retracts instead of proving.
    Insert { sink: Sink, deletion: bool },

    /// Keyed storage with per-value merge functors. The first `keys` input
    /// columns key the entry; the rest are values merged by `merge_functors`.
    KVIndex { keys: usize, merge_functors: Vec<DeclId> },

    /// Zero-arity boolean, maintained as a reference count.
    Condition { decl: DeclId },
}

impl ViewKind {
    pub fn name(&self) -> &'static str {
        match self {
            ViewKind::Select { .. } => "select",
            ViewKind::Tuple { .. } => "tuple",
            ViewKind::Join { .. } => "join",
            ViewKind::Compare { .. } => "compare",
            ViewKind::Map { .. } => "map",
            ViewKind::Aggregate { .. } => "aggregate",
            ViewKind::Negate { .. } => "negate",
            ViewKind::Merge => "merge",
            ViewKind::Insert { .. } => "insert",
            ViewKind::KVIndex { .. } => "kvindex",
            ViewKind::Condition { .. } => "condition",
        }
    }
}

/// One node of the data-flow graph.
#[derive(Debug, Clone)]
pub struct QueryView {
    pub id: ViewId,
    pub kind: ViewKind,
    /// Output columns, in order.
    pub columns: Vec<ColId>,
    /// Input views, in order.
    pub inputs: Vec<ViewId>,
    /// Input column references; meaning depends on `kind`.
    pub input_columns: Vec<ColId>,
    /// Zero-arity guards: all must hold / all must not hold.
    pub positive_conditions: Vec<ViewId>,
    pub negative_conditions: Vec<ViewId>,
    pub can_receive_deletions: bool,
    pub can_produce_deletions: bool,
    /// Cleared by the rewriter when a view is replaced.
    pub dead: bool,
}

/// The data-flow graph.
#[derive(Debug, Default)]
pub struct Query {
    pub views: Vec<QueryView>,
    pub columns: Vec<QueryColumn>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, id: ViewId) -> &QueryView {
        &self.views[id.0 as usize]
    }

    pub fn view_mut(&mut self, id: ViewId) -> &mut QueryView {
        &mut self.views[id.0 as usize]
    }

    pub fn column(&self, id: ColId) -> &QueryColumn {
        &self.columns[id.0 as usize]
    }

    /// Allocate a view with freshly-minted output columns described by
    /// `(type, name)` pairs.
    pub fn add_view(
        &mut self,
        kind: ViewKind,
        inputs: Vec<ViewId>,
        input_columns: Vec<ColId>,
        outputs: &[(TypeKind, StrId)],
    ) -> ViewId {
        let id = ViewId(self.views.len() as u32);
        let mut columns = Vec::with_capacity(outputs.len());
        for (index, &(ty, name)) in outputs.iter().enumerate() {
            let col = ColId(self.columns.len() as u32);
            self.columns.push(QueryColumn { id: col, view: id, index, ty, name });
            columns.push(col);
        }
        self.views.push(QueryView {
            id,
            kind,
            columns,
            inputs,
            input_columns,
            positive_conditions: Vec::new(),
            negative_conditions: Vec::new(),
            can_receive_deletions: false,
            can_produce_deletions: false,
            dead: false,
        });
        id
    }

    /// Live views in id order.
    pub fn live_views(&self) -> impl Iterator<Item = &QueryView> {
        self.views.iter().filter(|v| !v.dead)
    }

    /// All live `Insert` views.
    pub fn inserts(&self) -> impl Iterator<Item = &QueryView> {
        self.live_views()
            .filter(|v| matches!(v.kind, ViewKind::Insert { .. }))
    }

    /// All live `Select` views reading `source`.
    pub fn selects_of(&self, decl: DeclId) -> Vec<ViewId> {
        self.live_views()
            .filter(|v| {
                matches!(
                    &v.kind,
                    ViewKind::Select { source: Source::Relation(d) | Source::Stream(d) } if *d == decl
                )
            })
            .map(|v| v.id)
            .collect()
    }

    /// Predecessor map (consumer -> producers), computed in one reverse pass.
    pub fn successors(&self) -> HashMap<ViewId, Vec<ViewId>> {
        let mut successors: HashMap<ViewId, Vec<ViewId>> = HashMap::new();
        for view in self.live_views() {
            for &input in &view.inputs {
                successors.entry(input).or_default().push(view.id);
            }
        }
        successors
    }

    /// Compute differential labels by least fixpoint. Sources that can
    /// produce deletions: selects on `@differential` streams (the caller
    /// passes their ids), negations, aggregates, and negated maps. Any view
    /// downstream of a deletion producer can receive them, and propagates.
    pub fn label_differential(&mut self, differential_sources: &[ViewId]) {
        for &id in differential_sources {
            self.view_mut(id).can_produce_deletions = true;
        }
        for view in &mut self.views {
            if view.dead {
                continue;
            }
            match view.kind {
                ViewKind::Negate { .. } | ViewKind::Aggregate { .. } => {
                    view.can_produce_deletions = true;
                }
                ViewKind::Map { negated, .. } if negated => {
                    view.can_produce_deletions = true;
                }
                _ => {}
            }
        }

        loop {
            let mut changed = false;
            for i in 0..self.views.len() {
                if self.views[i].dead {
                    continue;
                }
                let receives = self.views[i]
                    .inputs
                    .iter()
                    .any(|&input| self.view(input).can_produce_deletions);
                let view = &mut self.views[i];
                if receives && !view.can_receive_deletions {
                    view.can_receive_deletions = true;
                    changed = true;
                }
                if view.can_receive_deletions && !view.can_produce_deletions {
                    view.can_produce_deletions = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Internal consistency checks; violations are compiler bugs.
    pub fn verify(&self) -> Result<(), String> {
        for view in self.live_views() {
            for &col in &view.columns {
                let column = self.column(col);
                if column.view != view.id {
                    return Err(format!(
                        "column {:?} claims view {:?} but is owned by {:?}",
                        col, column.view, view.id
                    ));
                }
            }
            for &input_col in &view.input_columns {
                let owner = self.column(input_col).view;
                if !view.inputs.contains(&owner)
                    && !matches!(view.kind, ViewKind::Insert { .. } | ViewKind::Tuple { .. })
                {
                    // Tuple/Insert may forward columns of transitive inputs
                    // collapsed by rewrites; everything else references its
                    // direct inputs.
                    if !view.inputs.is_empty() {
                        return Err(format!(
                            "view {:?} reads column {:?} of non-input view {:?}",
                            view.id, input_col, owner
                        ));
                    }
                }
            }
            if let ViewKind::Join { pivots, ref pivot_sources } = view.kind {
                if pivot_sources.len() != pivots {
                    return Err(format!("join {:?} pivot arity mismatch", view.id));
                }
                // Pivot sets partition the inputs: no input column may appear
                // in two pivot sets.
                let mut seen = std::collections::HashSet::new();
                for set in pivot_sources {
                    for &col in set {
                        if !seen.insert(col) {
                            return Err(format!(
                                "join {:?} pivot column {:?} appears twice",
                                view.id, col
                            ));
                        }
                    }
                }
            }
            if matches!(view.kind, ViewKind::Merge) {
                let arity = view.columns.len();
                for &input in &view.inputs {
                    let input_view = self.view(input);
                    if input_view.columns.len() != arity {
                        return Err(format!(
                            "merge {:?} input {:?} arity mismatch",
                            view.id, input
                        ));
                    }
                    for (a, b) in view.columns.iter().zip(&input_view.columns) {
                        if self.column(*a).ty != self.column(*b).ty {
                            return Err(format!(
                                "merge {:?} input {:?} type mismatch",
                                view.id, input
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::StrId;

    fn ty() -> TypeKind {
        TypeKind::Unsigned(32)
    }

    #[test]
    fn add_view_mints_columns() {
        let mut q = Query::new();
        let v = q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(0)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );
        let view = q.view(v);
        assert_eq!(view.columns.len(), 2);
        assert_eq!(q.column(view.columns[1]).index, 1);
        assert_eq!(q.column(view.columns[1]).view, v);
    }

    #[test]
    fn differential_labels_propagate() {
        let mut q = Query::new();
        let src = q.add_view(
            ViewKind::Select { source: Source::Stream(DeclId(0)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY)],
        );
        let src_col = q.view(src).columns[0];
        let tup = q.add_view(
            ViewKind::Tuple { constants: vec![] },
            vec![src],
            vec![src_col],
            &[(ty(), StrId::EMPTY)],
        );
        let tup_col = q.view(tup).columns[0];
        let ins = q.add_view(
            ViewKind::Insert { sink: Sink::Relation(DeclId(1)), deletion: false },
            vec![tup],
            vec![tup_col],
            &[],
        );

        q.label_differential(&[src]);
        assert!(q.view(src).can_produce_deletions);
        assert!(q.view(tup).can_receive_deletions);
        assert!(q.view(tup).can_produce_deletions);
        assert!(q.view(ins).can_receive_deletions);
    }

    #[test]
    fn negate_is_an_intrinsic_deletion_source() {
        let mut q = Query::new();
        let a = q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(0)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY)],
        );
        let b = q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(1)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY)],
        );
        let a_col = q.view(a).columns[0];
        let neg = q.add_view(
            ViewKind::Negate { copied: 0 },
            vec![a, b],
            vec![a_col],
            &[(ty(), StrId::EMPTY)],
        );
        q.label_differential(&[]);
        assert!(q.view(neg).can_produce_deletions);
        assert!(!q.view(a).can_produce_deletions);
    }

    #[test]
    fn verify_catches_merge_arity_mismatch() {
        let mut q = Query::new();
        let a = q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(0)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY)],
        );
        let b = q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(1)) },
            vec![],
            vec![],
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );
        let _merge = q.add_view(
            ViewKind::Merge,
            vec![a, b],
            vec![],
            &[(ty(), StrId::EMPTY)],
        );
        assert!(q.verify().is_err());
    }
}
