//! # Data-Flow Builder
//!
//! Lowers each clause's best-scoring SIPS permutation into views. The
//! builder is a [`SipsVisitor`]: selection scopes become Selects joined into
//! the accumulated row context, comparisons become Compare filters, functor
//! applications become Maps, aggregations become Aggregates, negations
//! become anti-joins, and the head becomes a Tuple feeding an Insert.
//! Multiple clauses over one head merge into a single Insert through a
//! Merge view.

use super::*;
use crate::ast::{
    Binding as AstBinding, BodyItem, DeclId, Literal, ModuleIndex, ParseArena, ParsedAggregate,
    ParsedClause, ParsedPredicate,
};
use crate::error::{BuildError, ErrorLog};
use crate::intern::{StrId, StringPool};
use crate::sips::{best_permutation, ComplexityScorer, SipsGenerator, SipsVisitor, UseColumn};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Builds the whole data-flow graph for a module's import closure.
pub struct QueryBuilder<'a> {
    pool: &'a StringPool,
    arena: &'a ParseArena,
    log: ErrorLog,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(pool: &'a StringPool, arena: &'a ParseArena, log: ErrorLog) -> Self {
        QueryBuilder { pool, arena, log }
    }

    /// Lower every clause, merge per-head inserts, canonicalize, and label.
    pub fn build(&self, root: ModuleIndex) -> Result<Query, BuildError> {
        let mut query = Query::new();
        let mut conditions: HashMap<DeclId, ViewId> = HashMap::new();
        // (head decl, deletion, tuple view) per built clause.
        let mut pending_inserts: Vec<(DeclId, bool, ViewId)> = Vec::new();

        for clause in self.arena.clauses_in_dependency_order(root) {
            match self.build_clause(&mut query, &mut conditions, clause)? {
                Some(insert) => pending_inserts.push(insert),
                None => {
                    let head = self.arena.canonical(clause.head);
                    self.log.error(
                        clause.range,
                        BuildError::NoValidPermutation(self.pool.get(head.name).to_string()),
                    );
                }
            }
        }

        self.merge_heads(&mut query, pending_inserts);

        // Differential sources: selects over `@differential` streams.
        let differential: Vec<ViewId> = query
            .live_views()
            .filter(|v| match &v.kind {
                ViewKind::Select { source: Source::Stream(decl) } => {
                    self.arena.canonical(*decl).pragmas.differential
                }
                _ => false,
            })
            .map(|v| v.id)
            .collect();

        rewrite::canonicalize(&mut query);
        query.label_differential(&differential);
        query.verify().map_err(BuildError::Internal)?;
        debug!(
            views = query.live_views().count(),
            "data-flow graph built"
        );
        Ok(query)
    }

    /// Pick the clause's assumption (its received message, when present),
    /// find the cheapest committing permutation, and replay it through the
    /// flow-building visitor.
    fn build_clause(
        &self,
        query: &mut Query,
        conditions: &mut HashMap<DeclId, ViewId>,
        clause: &ParsedClause,
    ) -> Result<Option<(DeclId, bool, ViewId)>, BuildError> {
        let assumption = clause.body.iter().position(|item| {
            matches!(item, BodyItem::Predicate(p)
                if !p.negated && self.arena.canonical(p.decl).is_message())
        });

        let Some((_, best_score)) = best_permutation(self.arena, clause, assumption) else {
            return Ok(None);
        };

        let mut generator = match assumption {
            Some(index) => SipsGenerator::with_assumption(self.arena, clause, index),
            None => SipsGenerator::new(self.arena, clause),
        };
        loop {
            let mut scorer = ComplexityScorer::default();
            if generator.visit(&mut scorer) && scorer.score == best_score {
                let mut flow = ClauseFlow {
                    arena: self.arena,
                    query: &mut *query,
                    conditions: &mut *conditions,
                    env: HashMap::new(),
                    current: None,
                    assumption_positions: Vec::new(),
                    positive_conditions: Vec::new(),
                    negative_conditions: Vec::new(),
                    pending_aggregate: None,
                    finished_aggregate: None,
                    result: None,
                    unsatisfiable: false,
                    internal_error: None,
                };
                let committed = generator.visit(&mut flow);
                if let Some(err) = flow.internal_error.take() {
                    return Err(err);
                }
                if committed && !flow.unsatisfiable {
                    return Ok(flow.result);
                }
                // A scoring commit that fails to build is a bug upstream.
                warn!("permutation committed for scoring but failed to build");
                return Ok(None);
            }
            if !generator.advance() {
                return Ok(None);
            }
        }
    }

    /// Combine the tuple views of clauses sharing a head into one Insert
    /// (through a Merge when there are several), separately for proofs and
    /// deletions.
    fn merge_heads(&self, query: &mut Query, pending: Vec<(DeclId, bool, ViewId)>) {
        let mut groups: HashMap<(DeclId, bool), Vec<ViewId>> = HashMap::new();
        for (decl, deletion, tuple) in pending {
            groups.entry((decl, deletion)).or_default().push(tuple);
        }
        let mut keys: Vec<(DeclId, bool)> = groups.keys().copied().collect();
        keys.sort();
        for key in keys {
            let (decl_id, deletion) = key;
            let tuples = &groups[&key];
            let decl = self.arena.canonical(decl_id);
            let sink = if decl.is_message() {
                Sink::Stream(decl.id)
            } else {
                Sink::Relation(decl.id)
            };

            let body = if tuples.len() == 1 {
                tuples[0]
            } else {
                let outputs: Vec<(crate::types::TypeKind, StrId)> =
                    decl.params.iter().map(|p| (p.ty, p.name)).collect();
                query.add_view(ViewKind::Merge, tuples.clone(), vec![], &outputs)
            };

            // Mutable parameters route through keyed storage with their
            // merge functors before landing in the relation.
            let mutable_merges: Vec<DeclId> = decl
                .params
                .iter()
                .filter_map(|p| match p.binding {
                    Some(AstBinding::Mutable(merge_name)) => {
                        self.arena.lookup(merge_name, 3)
                    }
                    _ => None,
                })
                .collect();
            let body = if mutable_merges.is_empty() {
                body
            } else {
                let keys = decl
                    .params
                    .iter()
                    .filter(|p| !matches!(p.binding, Some(AstBinding::Mutable(_))))
                    .count();
                let outputs: Vec<(crate::types::TypeKind, StrId)> =
                    decl.params.iter().map(|p| (p.ty, p.name)).collect();
                let cols = query.view(body).columns.clone();
                query.add_view(
                    ViewKind::KVIndex { keys, merge_functors: mutable_merges },
                    vec![body],
                    cols,
                    &outputs,
                )
            };

            let cols = query.view(body).columns.clone();
            query.add_view(ViewKind::Insert { sink, deletion }, vec![body], cols, &[]);
        }
    }
}

/// Value a binding class currently maps to.
#[derive(Debug, Clone)]
enum EnvVal {
    /// Output position within the current row context view.
    Slot(usize),
    /// A compile-time constant, materialized on demand.
    Const(Literal),
}

/// The per-clause flow-building visitor.
struct ClauseFlow<'a> {
    arena: &'a ParseArena,
    query: &'a mut Query,
    conditions: &'a mut HashMap<DeclId, ViewId>,
    /// Binding-class id → current value.
    env: HashMap<u32, EnvVal>,
    /// The accumulated row context.
    current: Option<ViewId>,
    /// Parameter position → column position in `current`, for the
    /// assumption's select (constant filters reorder columns).
    assumption_positions: Vec<usize>,
    positive_conditions: Vec<ViewId>,
    negative_conditions: Vec<ViewId>,
    pending_aggregate: Option<PendingAggregate>,
    finished_aggregate: Option<(PendingAggregate, ViewId, usize)>,
    result: Option<(DeclId, bool, ViewId)>,
    /// Set when constant comparison is statically false.
    unsatisfiable: bool,
    /// First internal invariant violation; surfaced after the visit.
    internal_error: Option<BuildError>,
}

impl ClauseFlow<'_> {
    fn current_cols(&self) -> Vec<ColId> {
        self.current
            .map(|v| self.query.view(v).columns.clone())
            .unwrap_or_default()
    }

    fn col_spec(&self, col: ColId) -> (crate::types::TypeKind, StrId) {
        let c = self.query.column(col);
        (c.ty, c.name)
    }

    /// The accumulated row context, or record an internal invariant
    /// violation: every caller here runs after the permutation search has
    /// established one.
    fn row_context(&mut self, what: &str) -> Option<ViewId> {
        if self.current.is_none() && self.internal_error.is_none() {
            self.internal_error =
                Some(BuildError::Internal(format!("{what} without a row context")));
        }
        self.current
    }

    /// A recorded internal error stops further flow construction.
    fn poisoned(&self) -> bool {
        self.internal_error.is_some()
    }

    /// After replacing `current`, remap every Slot through `position_map`
    /// (old position → new position).
    fn remap_env(&mut self, position_map: &HashMap<usize, usize>) {
        for val in self.env.values_mut() {
            if let EnvVal::Slot(pos) = val {
                if let Some(&new_pos) = position_map.get(pos) {
                    *pos = new_pos;
                }
            }
        }
    }

    fn slot_of(&self, id: u32) -> Option<usize> {
        match self.env.get(&id) {
            Some(EnvVal::Slot(pos)) => Some(*pos),
            _ => None,
        }
    }

    fn const_of(&self, id: u32) -> Option<Literal> {
        match self.env.get(&id) {
            Some(EnvVal::Const(lit)) => Some(lit.clone()),
            _ => None,
        }
    }

    /// Filter a freshly selected view so column `position` equals `literal`.
    fn filter_const(&mut self, view: ViewId, position: usize, literal: Literal) -> ViewId {
        let cols = self.query.view(view).columns.clone();
        let specs: Vec<(crate::types::TypeKind, StrId)> =
            cols.iter().map(|&c| self.col_spec(c)).collect();
        let mut input_columns = vec![cols[position]];
        let mut out_specs = vec![specs[position]];
        for (i, &c) in cols.iter().enumerate() {
            if i != position {
                input_columns.push(c);
                out_specs.push(specs[i]);
            }
        }
        let cmp = self.query.add_view(
            ViewKind::Compare { op: crate::ast::ComparisonOp::Equal, rhs_literal: Some(literal) },
            vec![view],
            input_columns,
            &out_specs,
        );
        // Restore declaration order: output 0 is the filtered column, the
        // rest follow in original order minus it. Track with a Tuple when
        // the column order matters downstream; here consumers go through the
        // position maps we return, so reordering is fine.
        cmp
    }

    /// Join `current` with `right` on `(current position, right position)`
    /// pivots. With no pivots this is a product. Returns position maps for
    /// both sides.
    fn join_current(
        &mut self,
        right: ViewId,
        pivots: Vec<(usize, usize)>,
    ) -> (HashMap<usize, usize>, HashMap<usize, usize>) {
        let Some(left) = self.row_context("join") else {
            return (HashMap::new(), HashMap::new());
        };
        let left_cols = self.query.view(left).columns.clone();
        let right_cols = self.query.view(right).columns.clone();

        let mut pivot_sources = Vec::new();
        let mut out_specs = Vec::new();
        let mut left_map = HashMap::new();
        let mut right_map = HashMap::new();

        for (n, &(lp, rp)) in pivots.iter().enumerate() {
            pivot_sources.push(vec![left_cols[lp], right_cols[rp]]);
            out_specs.push(self.col_spec(left_cols[lp]));
            left_map.insert(lp, n);
            right_map.insert(rp, n);
        }
        let mut input_columns = Vec::new();
        let mut next = pivots.len();
        for (i, &c) in left_cols.iter().enumerate() {
            if !left_map.contains_key(&i) {
                input_columns.push(c);
                out_specs.push(self.col_spec(c));
                left_map.insert(i, next);
                next += 1;
            }
        }
        for (i, &c) in right_cols.iter().enumerate() {
            if !right_map.contains_key(&i) {
                input_columns.push(c);
                out_specs.push(self.col_spec(c));
                right_map.insert(i, next);
                next += 1;
            }
        }

        let join = self.query.add_view(
            ViewKind::Join { pivots: pivots.len(), pivot_sources },
            vec![left, right],
            input_columns,
            &out_specs,
        );
        self.current = Some(join);
        (left_map, right_map)
    }

    /// Build the Select (plus constant filters) for a predicate use. Returns
    /// the filtered view and, per argument position, its column position in
    /// that view.
    fn select_source(&mut self, pred: &ParsedPredicate, cols: &[UseColumn]) -> (ViewId, Vec<usize>) {
        let decl = self.arena.canonical(pred.decl);
        let source = if decl.is_message() {
            Source::Stream(decl.id)
        } else {
            Source::Relation(decl.id)
        };
        let outputs: Vec<(crate::types::TypeKind, StrId)> =
            decl.params.iter().map(|p| (p.ty, p.name)).collect();
        let mut view = self.query.add_view(ViewKind::Select { source }, vec![], vec![], &outputs);

        // Literal arguments and constant-bound classes filter the selection
        // in place; positions shuffle as each Compare fronts its column.
        let mut positions: Vec<usize> = (0..cols.len()).collect();
        for col in cols {
            let literal = col
                .literal
                .clone()
                .or_else(|| self.const_of(col.id));
            if let Some(lit) = literal {
                let pos = positions[col.n];
                view = self.filter_const(view, pos, lit);
                // The filtered column moved to the front.
                for p in &mut positions {
                    match (*p).cmp(&pos) {
                        std::cmp::Ordering::Less => *p += 1,
                        std::cmp::Ordering::Equal => *p = 0,
                        std::cmp::Ordering::Greater => {}
                    }
                }
            }
        }
        (view, positions)
    }
}

impl SipsVisitor for ClauseFlow<'_> {
    fn begin(&mut self, _clause: &ParsedClause, assumption: Option<&ParsedPredicate>) {
        if let Some(pred) = assumption {
            let decl = self.arena.canonical(pred.decl);
            let outputs: Vec<(crate::types::TypeKind, StrId)> =
                decl.params.iter().map(|p| (p.ty, p.name)).collect();
            let view = self.query.add_view(
                ViewKind::Select { source: Source::Stream(decl.id) },
                vec![],
                vec![],
                &outputs,
            );
            self.current = Some(view);
            self.assumption_positions = (0..decl.params.len()).collect();
        }
    }

    fn declare_parameter(&mut self, col: &UseColumn) {
        if let Some(lit) = col.literal.clone() {
            // A literal in the assumption filters the stream in place.
            if let Some(view) = self.current {
                let pos = self.assumption_positions[col.n];
                let filtered = self.filter_const(view, pos, lit);
                self.current = Some(filtered);
                // The filtered column rotates to the front; earlier
                // parameters' slots shift with it.
                let arity = self.query.view(filtered).columns.len();
                let mut map = HashMap::new();
                for i in 0..arity {
                    map.insert(
                        i,
                        match i.cmp(&pos) {
                            std::cmp::Ordering::Less => i + 1,
                            std::cmp::Ordering::Equal => 0,
                            std::cmp::Ordering::Greater => i,
                        },
                    );
                }
                self.remap_env(&map);
                for p in &mut self.assumption_positions {
                    *p = map[p];
                }
            }
        } else {
            self.env
                .insert(col.id, EnvVal::Slot(self.assumption_positions[col.n]));
        }
    }

    fn declare_constant(&mut self, literal: &Literal, id: u32) {
        self.env.insert(id, EnvVal::Const(literal.clone()));
    }

    fn assert_true(&mut self, pred: &ParsedPredicate) {
        let decl = self.arena.canonical(pred.decl).id;
        let view = *self
            .conditions
            .entry(decl)
            .or_insert_with(|| {
                self.query
                    .add_view(ViewKind::Condition { decl }, vec![], vec![], &[])
            });
        self.positive_conditions.push(view);
    }

    fn assert_false(&mut self, pred: &ParsedPredicate) {
        let decl = self.arena.canonical(pred.decl).id;
        let view = *self
            .conditions
            .entry(decl)
            .or_insert_with(|| {
                self.query
                    .add_view(ViewKind::Condition { decl }, vec![], vec![], &[])
            });
        self.negative_conditions.push(view);
    }

    fn assert_equal(&mut self, lhs: u32, rhs: u32) {
        if self.poisoned() {
            return;
        }
        let root = lhs.min(rhs);
        match (self.env.get(&lhs).cloned(), self.env.get(&rhs).cloned()) {
            (Some(EnvVal::Slot(a)), Some(EnvVal::Slot(b))) if a != b => {
                // Filter current on column equality; the two merge.
                let Some(view) = self.row_context("comparison") else { return };
                let cols = self.query.view(view).columns.clone();
                let mut input_columns = vec![cols[a], cols[b]];
                let mut out_specs = vec![self.col_spec(cols[a])];
                let mut map = HashMap::new();
                map.insert(a, 0);
                map.insert(b, 0);
                let mut next = 1;
                for (i, &c) in cols.iter().enumerate() {
                    if i != a && i != b {
                        input_columns.push(c);
                        out_specs.push(self.col_spec(c));
                        map.insert(i, next);
                        next += 1;
                    }
                }
                let cmp = self.query.add_view(
                    ViewKind::Compare { op: crate::ast::ComparisonOp::Equal, rhs_literal: None },
                    vec![view],
                    input_columns,
                    &out_specs,
                );
                self.current = Some(cmp);
                self.remap_env(&map);
                self.env.insert(root, EnvVal::Slot(0));
            }
            (Some(EnvVal::Slot(a)), Some(EnvVal::Const(lit)))
            | (Some(EnvVal::Const(lit)), Some(EnvVal::Slot(a))) => {
                let Some(view) = self.row_context("comparison") else { return };
                let filtered = self.filter_const(view, a, lit);
                self.current = Some(filtered);
                let arity = self.query.view(filtered).columns.len();
                let mut map = HashMap::new();
                for i in 0..arity {
                    map.insert(
                        i,
                        match i.cmp(&a) {
                            std::cmp::Ordering::Less => i + 1,
                            std::cmp::Ordering::Equal => 0,
                            std::cmp::Ordering::Greater => i,
                        },
                    );
                }
                self.remap_env(&map);
                self.env.insert(root, EnvVal::Slot(0));
            }
            (Some(EnvVal::Const(a)), Some(EnvVal::Const(b))) => {
                if a.value != b.value {
                    self.unsatisfiable = true;
                }
                self.env.insert(root, EnvVal::Const(a));
            }
            (Some(val), None) | (None, Some(val)) => {
                // Binding transfer: the unbound class aliases the bound one.
                self.env.insert(lhs, val.clone());
                self.env.insert(rhs, val.clone());
                self.env.insert(root, val);
            }
            _ => {}
        }
    }

    fn assert_not_equal(&mut self, lhs: u32, rhs: u32) {
        self.comparison(crate::ast::ComparisonOp::NotEqual, lhs, rhs);
    }

    fn assert_less(&mut self, lhs: u32, rhs: u32) {
        self.comparison(crate::ast::ComparisonOp::Less, lhs, rhs);
    }

    fn assert_greater(&mut self, lhs: u32, rhs: u32) {
        self.comparison(crate::ast::ComparisonOp::Greater, lhs, rhs);
    }

    fn assert_present(&mut self, pred: &ParsedPredicate, cols: &[UseColumn]) {
        if self.poisoned() {
            return;
        }
        let decl = self.arena.canonical(pred.decl);
        if decl.is_functor() {
            // Fully-bound functor: a filtering Map with no free outputs.
            let Some(current) = self.row_context("functor application") else { return };
            let current_cols = self.query.view(current).columns.clone();
            let copied = current_cols.len();
            let mut input_columns = current_cols.clone();
            for col in cols {
                if let Some(slot) = self.slot_of(col.id) {
                    input_columns.push(current_cols[slot]);
                }
            }
            let out_specs: Vec<(crate::types::TypeKind, StrId)> =
                current_cols.iter().map(|&c| self.col_spec(c)).collect();
            let map_view = self.query.add_view(
                ViewKind::Map { functor: decl.id, copied, negated: false },
                vec![current],
                input_columns,
                &out_specs,
            );
            self.current = Some(map_view);
            return;
        }

        // Fully-bound relation: semi-join against it.
        let (sel, positions) = self.select_source(pred, cols);
        let mut pivots = Vec::new();
        for col in cols {
            if let Some(slot) = self.slot_of(col.id) {
                pivots.push((slot, positions[col.n]));
            }
        }
        if self.current.is_none() {
            self.current = Some(sel);
            for col in cols {
                if col.literal.is_none() && self.const_of(col.id).is_none() {
                    self.env.insert(col.id, EnvVal::Slot(positions[col.n]));
                }
            }
            return;
        }
        let (left_map, _) = self.join_current(sel, pivots);
        self.remap_env(&left_map);
    }

    fn assert_absent(&mut self, pred: &ParsedPredicate, cols: &[UseColumn]) {
        if self.poisoned() {
            return;
        }
        let (sel, positions) = self.select_source(pred, cols);
        // A negation with no positive context (all-constant match) checks
        // against a unit row.
        let current = match self.current {
            Some(v) => v,
            None => {
                let unit =
                    self.query.add_view(ViewKind::Tuple { constants: vec![] }, vec![], vec![], &[]);
                self.current = Some(unit);
                unit
            }
        };
        let current_cols = self.query.view(current).columns.clone();
        let sel_cols = self.query.view(sel).columns.clone();

        // Layout: all candidate columns (copied), then the matched candidate
        // columns, then the negated view's matched columns pairwise.
        let mut input_columns = current_cols.clone();
        let copied = current_cols.len();
        let mut match_sel_cols = Vec::new();
        for col in cols {
            if let Some(slot) = self.slot_of(col.id) {
                input_columns.push(current_cols[slot]);
                match_sel_cols.push(sel_cols[positions[col.n]]);
            }
        }
        input_columns.extend(match_sel_cols);
        let out_specs: Vec<(crate::types::TypeKind, StrId)> =
            current_cols.iter().map(|&c| self.col_spec(c)).collect();
        let neg = self.query.add_view(
            ViewKind::Negate { copied },
            vec![current, sel],
            input_columns,
            &out_specs,
        );
        self.current = Some(neg);
    }

    fn enter_select(
        &mut self,
        pred: &ParsedPredicate,
        where_cols: &[UseColumn],
        select_cols: &[UseColumn],
    ) {
        if self.poisoned() {
            return;
        }
        let decl = self.arena.canonical(pred.decl);
        if decl.is_functor() {
            self.apply_map(pred, where_cols, select_cols);
            return;
        }

        let all: Vec<UseColumn> = {
            let mut v: Vec<UseColumn> = where_cols.iter().cloned().chain(select_cols.iter().cloned()).collect();
            v.sort_by_key(|c| c.n);
            v
        };
        let (sel, positions) = self.select_source(pred, &all);

        if self.current.is_none() {
            self.current = Some(sel);
            for col in select_cols {
                self.env.insert(col.id, EnvVal::Slot(positions[col.n]));
            }
            // Duplicate classes among selected columns filter in place:
            // `p(X, X)` selects then compares the two positions.
            let mut seen: HashMap<u32, usize> = HashMap::new();
            for col in select_cols {
                if let Some(&first_n) = seen.get(&col.id) {
                    if first_n != col.n {
                        self.assert_equal_slots(positions[first_n], positions[col.n], col.id);
                    }
                } else {
                    seen.insert(col.id, col.n);
                }
            }
            return;
        }

        let mut pivots = Vec::new();
        for col in where_cols {
            if let Some(slot) = self.slot_of(col.id) {
                pivots.push((slot, positions[col.n]));
            }
        }
        let (left_map, right_map) = self.join_current(sel, pivots);
        self.remap_env(&left_map);
        for col in select_cols {
            if let Some(&pos) = right_map.get(&positions[col.n]) {
                self.env.insert(col.id, EnvVal::Slot(pos));
            }
        }
    }

    fn enter_aggregation(
        &mut self,
        agg: &ParsedAggregate,
        group_cols: &[UseColumn],
        config_cols: &[UseColumn],
        aggregate_cols: &[UseColumn],
        summary_cols: &[UseColumn],
    ) {
        // The aggregation builds its own sub-flow in `collect`; stash the
        // partition shape here.
        let functor = self.arena.canonical(agg.functor.decl).id;
        self.pending_aggregate = Some(PendingAggregate {
            functor,
            group: group_cols.to_vec(),
            config: config_cols.to_vec(),
            aggregate: aggregate_cols.to_vec(),
            summary: summary_cols.to_vec(),
        });
    }

    fn collect(&mut self, agg: &ParsedAggregate, cols: &[UseColumn]) {
        if self.poisoned() {
            return;
        }
        let Some(pending) = self.pending_aggregate.take() else { return };
        let (sel, positions) = self.select_source(&agg.predicate, cols);
        let sel_cols = self.query.view(sel).columns.clone();

        // Input layout: group columns, then config, then aggregated.
        let mut input_columns = Vec::new();
        let mut out_specs = Vec::new();
        for g in &pending.group {
            // Group columns are shared classes with the inner predicate.
            let inner = cols.iter().find(|c| c.id == g.id);
            if let Some(inner) = inner {
                let col = sel_cols[positions[inner.n]];
                input_columns.push(col);
                out_specs.push(self.col_spec(col));
            }
        }
        let group = input_columns.len();
        // Config columns parameterize the reducer from the outer row; their
        // count is recorded here and their values resolve from the enclosing
        // row context at scheduling time.
        let config = pending.config.len();
        for a in &pending.aggregate {
            let inner = cols.iter().find(|c| c.id == a.id);
            if let Some(inner) = inner {
                input_columns.push(sel_cols[positions[inner.n]]);
            }
        }
        for s in &pending.summary {
            out_specs.push((s.ty, StrId::EMPTY));
        }

        let agg_view = self.query.add_view(
            ViewKind::Aggregate { functor: pending.functor, group, config },
            vec![sel],
            input_columns,
            &out_specs,
        );
        self.finished_aggregate = Some((pending, agg_view, group));
    }

    fn select_from_summary(&mut self, _agg: &ParsedAggregate, _summary_cols: &[UseColumn]) {
        if self.poisoned() {
            return;
        }
        let Some((pending, agg_view, group)) = self.finished_aggregate.take() else { return };

        if self.current.is_none() {
            self.current = Some(agg_view);
            for (i, g) in pending.group.iter().enumerate() {
                self.env.insert(g.id, EnvVal::Slot(i));
            }
            for (i, s) in pending.summary.iter().enumerate() {
                self.env.insert(s.id, EnvVal::Slot(group + i));
            }
            return;
        }

        // Join the aggregate result into the row context on the group
        // columns bound there; with none, this is a product.
        let mut pivots = Vec::new();
        for (i, g) in pending.group.iter().enumerate() {
            if let Some(slot) = self.slot_of(g.id) {
                pivots.push((slot, i));
            }
        }
        let (left_map, right_map) = self.join_current(agg_view, pivots);
        self.remap_env(&left_map);
        for (i, g) in pending.group.iter().enumerate() {
            if let Some(&pos) = right_map.get(&i) {
                self.env.insert(g.id, EnvVal::Slot(pos));
            }
        }
        for (i, s) in pending.summary.iter().enumerate() {
            if let Some(&pos) = right_map.get(&(group + i)) {
                self.env.insert(s.id, EnvVal::Slot(pos));
            }
        }
    }

    fn insert(&mut self, decl: DeclId, cols: &[UseColumn], negated_head: bool) {
        if self.poisoned() {
            return;
        }
        let head = self.arena.decl(decl);
        let mut input_columns = Vec::new();
        let mut constants = Vec::new();
        let current_cols = self.current_cols();
        for (n, col) in cols.iter().enumerate() {
            if let Some(slot) = self.slot_of(col.id) {
                input_columns.push(current_cols[slot]);
            } else if let Some(lit) = col.literal.clone().or_else(|| self.const_of(col.id)) {
                constants.push((n, lit));
            }
        }
        let outputs: Vec<(crate::types::TypeKind, StrId)> =
            head.params.iter().map(|p| (p.ty, p.name)).collect();
        let inputs = self.current.into_iter().collect();
        let tuple = self.query.add_view(
            ViewKind::Tuple { constants },
            inputs,
            input_columns,
            &outputs,
        );
        let view = self.query.view_mut(tuple);
        view.positive_conditions = self.positive_conditions.clone();
        view.negative_conditions = self.negative_conditions.clone();
        self.result = Some((self.arena.redeclarations(decl)[0], negated_head, tuple));
    }
}

/// Aggregation state carried between the enter / collect / summary calls.
struct PendingAggregate {
    functor: DeclId,
    group: Vec<UseColumn>,
    config: Vec<UseColumn>,
    aggregate: Vec<UseColumn>,
    summary: Vec<UseColumn>,
}

impl ClauseFlow<'_> {
    fn comparison(&mut self, op: crate::ast::ComparisonOp, lhs: u32, rhs: u32) {
        if self.poisoned() {
            return;
        }
        // Constant-only comparisons have no row context to filter.
        let Some(view) = self.current else { return };
        let cols = self.query.view(view).columns.clone();
        match (self.env.get(&lhs).cloned(), self.env.get(&rhs).cloned()) {
            (Some(EnvVal::Slot(a)), Some(EnvVal::Slot(b))) => {
                let mut input_columns = vec![cols[a], cols[b]];
                let mut out_specs = Vec::new();
                for &c in &cols {
                    out_specs.push(self.col_spec(c));
                }
                input_columns.extend(cols.iter().copied());
                let cmp = self.query.add_view(
                    ViewKind::Compare { op, rhs_literal: None },
                    vec![view],
                    input_columns,
                    &out_specs,
                );
                self.current = Some(cmp);
            }
            (Some(EnvVal::Slot(a)), Some(EnvVal::Const(lit)))
            | (Some(EnvVal::Const(lit)), Some(EnvVal::Slot(a))) => {
                let mirrored = matches!(self.env.get(&lhs), Some(EnvVal::Const(_)));
                let op = if mirrored { op.mirror() } else { op };
                let mut input_columns = vec![cols[a]];
                let mut out_specs = Vec::new();
                for &c in &cols {
                    out_specs.push(self.col_spec(c));
                }
                input_columns.extend(cols.iter().copied());
                let cmp = self.query.add_view(
                    ViewKind::Compare { op, rhs_literal: Some(lit) },
                    vec![view],
                    input_columns,
                    &out_specs,
                );
                self.current = Some(cmp);
            }
            _ => {}
        }
    }

    fn assert_equal_slots(&mut self, a: usize, b: usize, class: u32) {
        if a == b {
            return;
        }
        let Some(view) = self.row_context("comparison") else { return };
        let cols = self.query.view(view).columns.clone();
        let mut input_columns = vec![cols[a], cols[b]];
        let mut out_specs = vec![self.col_spec(cols[a])];
        let mut map = HashMap::new();
        map.insert(a, 0);
        map.insert(b, 0);
        let mut next = 1;
        for (i, &c) in cols.iter().enumerate() {
            if i != a && i != b {
                input_columns.push(c);
                out_specs.push(self.col_spec(c));
                map.insert(i, next);
                next += 1;
            }
        }
        let cmp = self.query.add_view(
            ViewKind::Compare { op: crate::ast::ComparisonOp::Equal, rhs_literal: None },
            vec![view],
            input_columns,
            &out_specs,
        );
        self.current = Some(cmp);
        self.remap_env(&map);
        self.env.insert(class, EnvVal::Slot(0));
    }

    /// Functor application with free outputs: a Map view forwarding the
    /// whole row context and appending one column per free parameter.
    fn apply_map(
        &mut self,
        pred: &ParsedPredicate,
        where_cols: &[UseColumn],
        select_cols: &[UseColumn],
    ) {
        let decl = self.arena.canonical(pred.decl).clone();

        // Constant bound arguments must exist as row columns first.
        let mut const_extensions: Vec<(u32, Literal)> = Vec::new();
        for col in where_cols {
            if self.slot_of(col.id).is_none() {
                if let Some(lit) = col.literal.clone().or_else(|| self.const_of(col.id)) {
                    const_extensions.push((col.id, lit));
                }
            }
        }
        if self.current.is_none() || !const_extensions.is_empty() {
            self.extend_with_constants(&const_extensions);
        }

        let Some(current) = self.row_context("functor application") else { return };
        let current_cols = self.query.view(current).columns.clone();
        let copied = current_cols.len();

        let mut input_columns = current_cols.clone();
        for col in where_cols {
            if let Some(slot) = self.slot_of(col.id) {
                input_columns.push(current_cols[slot]);
            }
        }
        let mut out_specs: Vec<(crate::types::TypeKind, StrId)> =
            current_cols.iter().map(|&c| self.col_spec(c)).collect();
        for col in select_cols {
            let param = &decl.params[col.n];
            out_specs.push((param.ty, param.name));
        }

        let map_view = self.query.add_view(
            ViewKind::Map { functor: decl.id, copied, negated: false },
            vec![current],
            input_columns,
            &out_specs,
        );
        self.current = Some(map_view);
        for (i, col) in select_cols.iter().enumerate() {
            self.env.insert(col.id, EnvVal::Slot(copied + i));
        }
    }

    /// Extend (or create) the row context with constant columns via a Tuple
    /// with constant insertion.
    fn extend_with_constants(&mut self, constants: &[(u32, Literal)]) {
        let current_cols = self.current_cols();
        let mut out_specs: Vec<(crate::types::TypeKind, StrId)> =
            current_cols.iter().map(|&c| self.col_spec(c)).collect();
        let base = out_specs.len();
        let mut tuple_constants = Vec::new();
        for (i, (_, lit)) in constants.iter().enumerate() {
            out_specs.push((lit.ty, StrId::EMPTY));
            tuple_constants.push((base + i, lit.clone()));
        }
        let inputs: Vec<ViewId> = self.current.into_iter().collect();
        let tuple = self.query.add_view(
            ViewKind::Tuple { constants: tuple_constants },
            inputs,
            current_cols,
            &out_specs,
        );
        self.current = Some(tuple);
        for (i, (class, _)) in constants.iter().enumerate() {
            self.env.insert(*class, EnvVal::Slot(base + i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn graph_for(text: &str) -> (Query, ParseArena) {
        let pool = StringPool::new();
        let log = ErrorLog::new();
        let mut arena = ParseArena::new();
        let index = {
            let mut parser = Parser::new(&pool, log.clone());
            parser.parse_string(&mut arena, "test.dl", text)
        };
        assert!(log.is_empty(), "parse: {:?}", log.snapshot());
        let query = QueryBuilder::new(&pool, &arena, log.clone())
            .build(index)
            .expect("builds");
        assert!(log.is_empty(), "build: {:?}", log.snapshot());
        (query, arena)
    }

    fn count_kind(query: &Query, pred: impl Fn(&ViewKind) -> bool) -> usize {
        query.live_views().filter(|v| pred(&v.kind)).count()
    }

    #[test]
    fn single_clause_is_select_tuple_insert() {
        let (query, _) = graph_for(
            "#message edge(u32 X, u32 Y).\n\
             #export copy(u32 X, u32 Y).\n\
             copy(X, Y) : edge(X, Y).\n",
        );
        assert_eq!(count_kind(&query, |k| matches!(k, ViewKind::Select { .. })), 1);
        assert_eq!(count_kind(&query, |k| matches!(k, ViewKind::Tuple { .. })), 1);
        assert_eq!(count_kind(&query, |k| matches!(k, ViewKind::Insert { .. })), 1);
        query.verify().expect("well-formed");
    }

    #[test]
    fn join_pivots_partition_inputs() {
        let (query, _) = graph_for(
            "#message edge(u32 X, u32 Y).\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );
        let join = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Join { .. }))
            .expect("recursive clause joins");
        let ViewKind::Join { pivots, ref pivot_sources } = join.kind else { unreachable!() };
        assert_eq!(pivots, 1);
        // The pivot merges one column from each of the two inputs.
        assert_eq!(pivot_sources[0].len(), 2);
        let owners: Vec<ViewId> =
            pivot_sources[0].iter().map(|&c| query.column(c).view).collect();
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        query.verify().expect("well-formed");
    }

    #[test]
    fn negation_builds_anti_join() {
        let (query, arena) = graph_for(
            "#message node(u32 X).\n\
             #message seen(u32 X).\n\
             #export fresh(u32 X).\n\
             fresh(X) : node(X), !seen(X).\n",
        );
        let negate = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Negate { .. }))
            .expect("negate view");
        assert_eq!(negate.inputs.len(), 2);
        let ViewKind::Negate { copied } = negate.kind else { unreachable!() };
        // One candidate column copied, one matched pair recorded.
        assert_eq!(copied, 1);
        assert_eq!(negate.input_columns.len(), copied + 2);
        let _ = arena;
    }

    #[test]
    fn constant_argument_filters_the_select() {
        let (query, _) = graph_for(
            "#message edge(u32 X, u32 Y).\n\
             #export from_one(u32 Y).\n\
             from_one(Y) : edge(1, Y).\n",
        );
        let compare = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Compare { rhs_literal: Some(_), .. }))
            .expect("constant filter");
        assert!(matches!(
            query.view(compare.inputs[0]).kind,
            ViewKind::Select { .. }
        ));
    }

    #[test]
    fn head_constant_lands_in_tuple() {
        let (query, _) = graph_for(
            "#message evt(u32 X).\n\
             #export tagged(u32 X, u32 Tag).\n\
             tagged(X, 7) : evt(X).\n",
        );
        let tuple = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Tuple { .. }))
            .expect("head tuple");
        let ViewKind::Tuple { ref constants } = tuple.kind else { unreachable!() };
        assert_eq!(constants.len(), 1);
        assert_eq!(constants[0].0, 1);
    }

    #[test]
    fn functor_becomes_map_with_copied_prefix() {
        let (query, arena) = graph_for(
            "#message num(u32 X).\n\
             #functor add1(bound u32 X, free u32 Y).\n\
             #export succ(u32 X, u32 Y).\n\
             succ(X, Y) : num(X), add1(X, Y).\n",
        );
        let map = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Map { .. }))
            .expect("map view");
        let ViewKind::Map { functor, copied, negated } = map.kind else { unreachable!() };
        assert!(arena.canonical(functor).is_functor());
        assert!(!negated);
        // One forwarded stream column plus one mapped output.
        assert_eq!(copied, 1);
        assert_eq!(map.columns.len(), 2);
    }

    #[test]
    fn aggregation_partitions_group_and_summary() {
        let (query, _) = graph_for(
            "#message edge(u32 X, u32 Y).\n\
             #functor count_per(bound u32 G, aggregate u32 V, summary u32 N).\n\
             #export counts(u32 G, u32 N).\n\
             counts(G, N) : count_per(G, V, N) over edge(G, V).\n",
        );
        let agg = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::Aggregate { .. }))
            .expect("aggregate view");
        let ViewKind::Aggregate { group, config, .. } = agg.kind else { unreachable!() };
        assert_eq!(group, 1);
        assert_eq!(config, 0);
        // Outputs: the group key plus the summary.
        assert_eq!(agg.columns.len(), 2);
    }

    #[test]
    fn mutable_parameters_route_through_kv_index() {
        let (query, _) = graph_for(
            "#message sample(u32 K, u64 V).\n\
             #functor merge_sum(bound u64 Old, bound u64 New, free u64 Out).\n\
             #export totals(u32 K, mutable(merge_sum) u64 Total).\n\
             totals(K, V) : sample(K, V).\n",
        );
        let kv = query
            .live_views()
            .find(|v| matches!(v.kind, ViewKind::KVIndex { .. }))
            .expect("kv index view");
        let ViewKind::KVIndex { keys, ref merge_functors } = kv.kind else { unreachable!() };
        assert_eq!(keys, 1);
        assert_eq!(merge_functors.len(), 1);
    }
}
