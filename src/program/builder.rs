//! # Control-Flow Builder
//!
//! Schedules the canonicalized data-flow graph into a [`Program`]:
//!
//! - every Select source and Insert target gets a [`DataTable`] keyed by the
//!   full tuple; join inputs that are not plain relation selects materialize
//!   into internal tables so differential propagation can probe them;
//! - observed access patterns (join pivots, negation matches, bound query
//!   parameters) become [`DataIndex`]es;
//! - one message handler per received message walks the graph downstream of
//!   the message's select, per added (and removed) tuple;
//! - recursive strata detected over the relation graph run inside an
//!   Induction region draining per-relation worklist vectors;
//! - top-down tuple finders re-prove Unknown tuples; removers transition
//!   Present to Unknown and propagate.

use super::*;
use crate::ast::{DeclId, DeclKind, ParseArena};
use crate::error::BuildError;
use crate::intern::{StrId, StringPool};
use crate::query::{ColId, Query, Sink, Source, ViewId, ViewKind};
use crate::sema::stratify::{find_sccs, DependencyGraph, DependencyType};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Propagation direction while walking the graph.
#[derive(Debug, Clone)]
enum Mode {
    /// A tuple arrived; prove downstream consequences.
    Insert,
    /// A tuple left; retract downstream consequences.
    Remove,
    /// Top-down re-proof of one target tuple (finder unknown branch).
    Prove { target: DeclId, params: Vec<VariableId> },
}

/// Bindings from dataflow columns to program variables.
type ColMap = HashMap<ColId, VariableId>;

pub struct ProgramBuilder<'a> {
    pool: &'a StringPool,
    arena: &'a ParseArena,
    query: &'a Query,
    program: Program,
    successors: HashMap<ViewId, Vec<ViewId>>,
    table_of_decl: HashMap<DeclId, TableId>,
    table_of_view: HashMap<ViewId, TableId>,
    condition_of: HashMap<DeclId, VariableId>,
    constant_of: HashMap<(String, crate::types::TypeKind), VariableId>,
    false_var: Option<VariableId>,
    finder_of: HashMap<DeclId, ProcedureId>,
    remover_of: HashMap<DeclId, ProcedureId>,
    recursive: HashSet<DeclId>,
    induction_vec: HashMap<DeclId, (VectorId, VectorId)>,
}

impl<'a> ProgramBuilder<'a> {
    pub fn new(pool: &'a StringPool, arena: &'a ParseArena, query: &'a Query) -> Self {
        ProgramBuilder {
            pool,
            arena,
            query,
            program: Program::default(),
            successors: query.successors(),
            table_of_decl: HashMap::new(),
            table_of_view: HashMap::new(),
            condition_of: HashMap::new(),
            constant_of: HashMap::new(),
            false_var: None,
            finder_of: HashMap::new(),
            remover_of: HashMap::new(),
            recursive: HashSet::new(),
            induction_vec: HashMap::new(),
        }
    }

    pub fn build(mut self) -> Result<Program, BuildError> {
        self.create_tables();
        self.create_conditions();
        self.detect_recursion();
        self.create_induction_vectors();

        // Procedure stubs first so handlers can call finders and removers
        // before their bodies exist (mutual recursion across relations).
        self.declare_finders_and_removers();

        self.build_initializer();
        self.build_message_handlers();
        self.build_finder_bodies()?;
        self.build_remover_bodies();
        self.build_query_finders();

        debug!(
            tables = self.program.tables.len(),
            indexes = self.program.indexes.len(),
            procedures = self.program.procedures.len(),
            "control-flow program built"
        );
        Ok(self.program)
    }

    // ------------------------------------------------------------------
    // Storage layout
    // ------------------------------------------------------------------

    fn create_tables(&mut self) {
        // Declared relations and message streams observed in the graph.
        for view in self.query.live_views() {
            let decl = match &view.kind {
                ViewKind::Select { source: Source::Relation(d) | Source::Stream(d) } => Some(*d),
                ViewKind::Insert { sink: Sink::Relation(d), .. } => Some(*d),
                _ => None,
            };
            if let Some(decl_id) = decl {
                let decl = self.arena.canonical(decl_id);
                if decl.is_condition() {
                    continue;
                }
                if !self.table_of_decl.contains_key(&decl.id) {
                    let columns = decl.params.iter().map(|p| p.ty).collect();
                    let table = self.program.add_table(
                        TableSource::Relation(decl.id),
                        decl.name,
                        columns,
                    );
                    self.table_of_decl.insert(decl.id, table);
                }
            }
        }

        // Internal materializations: join and negate inputs that are not
        // plain selects must be probe-able during differential propagation.
        for view in self.query.live_views() {
            let inputs_needing_tables: Vec<ViewId> = match &view.kind {
                ViewKind::Join { .. } | ViewKind::Negate { .. } => view
                    .inputs
                    .iter()
                    .copied()
                    .filter(|&input| !matches!(self.query.view(input).kind, ViewKind::Select { .. }))
                    .collect(),
                _ => Vec::new(),
            };
            for input in inputs_needing_tables {
                if !self.table_of_view.contains_key(&input) {
                    let columns = self
                        .query
                        .view(input)
                        .columns
                        .iter()
                        .map(|&c| self.query.column(c).ty)
                        .collect();
                    let table = self.program.add_table(
                        TableSource::View(input),
                        StrId::EMPTY,
                        columns,
                    );
                    self.table_of_view.insert(input, table);
                }
            }
        }

        // Indexes from observed access patterns.
        for view in self.query.live_views() {
            match &view.kind {
                ViewKind::Join { pivot_sources, .. } => {
                    for &input in &view.inputs {
                        if let Some(table) = self.table_for_input(input) {
                            let keys = self.pivot_positions(input, pivot_sources);
                            if !keys.is_empty() {
                                self.program.ensure_index(table, keys);
                            }
                        }
                    }
                }
                ViewKind::Negate { copied } => {
                    // Candidate side keyed by the matched columns.
                    let matches = (view.input_columns.len() - copied) / 2;
                    if let Some(table) = self.table_for_input(view.inputs[0]) {
                        let keys: Vec<usize> = view.input_columns
                            [*copied..copied + matches]
                            .iter()
                            .filter_map(|&c| self.position_in_view(view.inputs[0], c))
                            .collect();
                        if !keys.is_empty() {
                            self.program.ensure_index(table, keys);
                        }
                    }
                }
                _ => {}
            }
        }

        // Query finders probe by their bound parameters.
        for decl in &self.arena.declarations {
            if decl.kind == DeclKind::Query && decl.redecl_index == 0 {
                if let Some(&table) = self.table_of_decl.get(&decl.id) {
                    let bound: Vec<usize> = decl
                        .params
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| {
                            matches!(p.binding, Some(crate::ast::Binding::Bound))
                        })
                        .map(|(i, _)| i)
                        .collect();
                    if !bound.is_empty() {
                        self.program.ensure_index(table, bound);
                    }
                }
            }
        }
    }

    fn create_conditions(&mut self) {
        for view in self.query.live_views() {
            if let ViewKind::Condition { decl } = view.kind {
                self.condition_var(decl);
            }
        }
        // Conditions defined by inserts into zero-arity relations.
        for view in self.query.inserts() {
            if let ViewKind::Insert { sink: Sink::Relation(decl), .. } = view.kind {
                if self.arena.canonical(decl).is_condition() {
                    self.condition_var(decl);
                }
            }
        }
    }

    fn condition_var(&mut self, decl: DeclId) -> VariableId {
        if let Some(&var) = self.condition_of.get(&decl) {
            return var;
        }
        let name = self.arena.canonical(decl).name;
        let var = self.program.add_variable(
            VariableRole::ConditionRefCount,
            crate::types::TypeKind::Unsigned(64),
            name,
        );
        self.condition_of.insert(decl, var);
        self.program.conditions.push(Condition { decl, variable: var });
        var
    }

    /// Relation-level recursion: an insert into R whose flow reads S puts an
    /// edge R -> S; SCCs with a cycle need induction.
    fn detect_recursion(&mut self) {
        let mut graph = DependencyGraph::default();
        for insert in self.query.inserts() {
            let ViewKind::Insert { sink: Sink::Relation(head), .. } = insert.kind else {
                continue;
            };
            for ancestor in self.ancestors(insert.id) {
                if let ViewKind::Select { source: Source::Relation(read) } =
                    self.query.view(ancestor).kind
                {
                    graph.add_edge(head, read, DependencyType::Positive);
                }
            }
        }
        for scc in find_sccs(&graph) {
            let self_loop = scc.len() == 1
                && graph
                    .edges
                    .get(&scc[0])
                    .is_some_and(|edges| edges.iter().any(|&(to, _)| to == scc[0]));
            if scc.len() > 1 || self_loop {
                self.recursive.extend(scc);
            }
        }
    }

    fn create_induction_vectors(&mut self) {
        let mut recursive: Vec<DeclId> = self.recursive.iter().copied().collect();
        recursive.sort();
        for decl_id in recursive {
            let columns: Vec<crate::types::TypeKind> = self
                .arena
                .canonical(decl_id)
                .params
                .iter()
                .map(|p| p.ty)
                .collect();
            let work = self.program.add_vector(VectorKind::Induction, columns.clone(), 0);
            let swap = self.program.add_vector(VectorKind::InductionSwap, columns, 0);
            self.induction_vec.insert(decl_id, (work, swap));
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ancestors(&self, view: ViewId) -> Vec<ViewId> {
        let mut seen = HashSet::new();
        let mut stack = vec![view];
        while let Some(at) = stack.pop() {
            if !seen.insert(at) {
                continue;
            }
            stack.extend(self.query.view(at).inputs.iter().copied());
        }
        let mut out: Vec<ViewId> = seen.into_iter().collect();
        out.sort();
        out
    }

    fn table_for_input(&self, input: ViewId) -> Option<TableId> {
        match &self.query.view(input).kind {
            ViewKind::Select { source: Source::Relation(d) | Source::Stream(d) } => {
                self.table_of_decl.get(d).copied()
            }
            _ => self.table_of_view.get(&input).copied(),
        }
    }

    /// Positions within `input`'s outputs of its members of each pivot set.
    fn pivot_positions(&self, input: ViewId, pivot_sources: &[Vec<ColId>]) -> Vec<usize> {
        let mut keys = Vec::new();
        for set in pivot_sources {
            for &col in set {
                if let Some(pos) = self.position_in_view(input, col) {
                    keys.push(pos);
                }
            }
        }
        keys
    }

    fn position_in_view(&self, view: ViewId, col: ColId) -> Option<usize> {
        self.query.view(view).columns.iter().position(|&c| c == col)
    }

    fn fresh_vars(&mut self, view: ViewId, role: VariableRole) -> (Vec<VariableId>, ColMap) {
        let cols = self.query.view(view).columns.clone();
        let mut vars = Vec::with_capacity(cols.len());
        let mut map = ColMap::new();
        for &c in &cols {
            let col = self.query.column(c);
            let var = self.program.add_variable(role, col.ty, col.name);
            vars.push(var);
            map.insert(c, var);
        }
        (vars, map)
    }

    /// A Local variable holding a literal; shared per distinct value.
    fn constant_var(&mut self, lit: &crate::ast::Literal) -> VariableId {
        let key = (format!("{:?}", lit.value), lit.ty);
        if let Some(&var) = self.constant_of.get(&key) {
            return var;
        }
        let var = self.program.add_variable(VariableRole::Local, lit.ty, lit.spelling);
        self.constant_of.insert(key, var);
        var
    }

    /// Shared `false` constant for finder-result comparisons.
    fn false_const(&mut self) -> VariableId {
        if let Some(var) = self.false_var {
            return var;
        }
        let var = self.program.add_variable(
            VariableRole::GlobalBoolean,
            crate::types::TypeKind::Bool,
            StrId::EMPTY,
        );
        self.false_var = Some(var);
        var
    }

    /// Variables of a view's columns under `map`, in output order.
    fn vars_of(&self, view: ViewId, map: &ColMap) -> Vec<VariableId> {
        self.query
            .view(view)
            .columns
            .iter()
            .filter_map(|c| map.get(c).copied())
            .collect()
    }

    // ------------------------------------------------------------------
    // Procedure stubs
    // ------------------------------------------------------------------

    /// Relations that need a boolean finder / a remover: anything negated
    /// against, plus every deletion-capable relation.
    fn declare_finders_and_removers(&mut self) {
        let mut decls: Vec<DeclId> = Vec::new();
        for view in self.query.live_views() {
            match &view.kind {
                ViewKind::Negate { .. } => {
                    if let ViewKind::Select { source: Source::Relation(d) } =
                        self.query.view(view.inputs[1]).kind
                    {
                        decls.push(d);
                    }
                }
                ViewKind::Insert { sink: Sink::Relation(d), .. } => {
                    if view.can_receive_deletions && !self.arena.canonical(*d).is_condition() {
                        decls.push(*d);
                    }
                }
                _ => {}
            }
        }
        decls.sort();
        decls.dedup();
        for decl_id in decls {
            let decl = self.arena.canonical(decl_id).clone();
            let params: Vec<VariableId> = decl
                .params
                .iter()
                .map(|p| self.program.add_variable(VariableRole::Parameter, p.ty, p.name))
                .collect();
            let finder = self.program.add_procedure(
                ProcedureKind::TupleFinder(decl_id),
                params,
                vec![],
                Region::nop(),
            );
            self.finder_of.insert(decl_id, finder);

            let params: Vec<VariableId> = decl
                .params
                .iter()
                .map(|p| self.program.add_variable(VariableRole::Parameter, p.ty, p.name))
                .collect();
            let remover = self.program.add_procedure(
                ProcedureKind::TupleRemover(decl_id),
                params,
                vec![],
                Region::nop(),
            );
            self.remover_of.insert(decl_id, remover);
        }
    }

    // ------------------------------------------------------------------
    // Initializer
    // ------------------------------------------------------------------

    /// Seeds constant-producing views (fact clauses) and asserts
    /// unconditional conditions.
    fn build_initializer(&mut self) {
        let mut regions = Vec::new();
        let inserts: Vec<ViewId> = self.query.inserts().map(|v| v.id).collect();
        for insert_id in inserts {
            let insert = self.query.view(insert_id).clone();
            let body = insert.inputs[0];
            let body_view = self.query.view(body).clone();
            let ViewKind::Tuple { ref constants } = body_view.kind else { continue };
            if !body_view.inputs.is_empty() {
                continue;
            }
            // A source-free tuple: every column is a constant.
            match insert.kind {
                ViewKind::Insert { sink: Sink::Relation(decl), deletion: false } => {
                    if self.arena.canonical(decl).is_condition() {
                        let cond = self.condition_var(decl);
                        regions.push(Region::ExistenceAssertion {
                            condition: cond,
                            increment: true,
                        });
                    } else if let Some(&table) = self.table_of_decl.get(&decl) {
                        let mut vars = Vec::new();
                        for (_, lit) in constants {
                            vars.push(self.constant_var(lit));
                        }
                        regions.push(Region::LetBinding {
                            vars: vars.clone(),
                            body: Box::new(Region::TransitionState {
                                table,
                                transition: StateTransition::AbsentToPresent,
                                vars,
                                body: Box::new(Region::nop()),
                            }),
                        });
                    }
                }
                _ => continue,
            }
        }
        self.program
            .add_procedure(ProcedureKind::Initializer, vec![], vec![], Region::Series(regions));
    }

    // ------------------------------------------------------------------
    // Message handlers
    // ------------------------------------------------------------------

    fn build_message_handlers(&mut self) {
        let mut messages: Vec<DeclId> = self
            .query
            .live_views()
            .filter_map(|v| match &v.kind {
                ViewKind::Select { source: Source::Stream(d) } => Some(*d),
                _ => None,
            })
            .collect();
        messages.sort();
        messages.dedup();

        for message in messages {
            let decl = self.arena.canonical(message).clone();
            let columns: Vec<crate::types::TypeKind> =
                decl.params.iter().map(|p| p.ty).collect();
            let added = self.program.add_vector(VectorKind::InputAdded, columns.clone(), 0);
            let mut vector_params = vec![added];

            let selects = self.query.selects_of(message);
            let table = self.table_of_decl.get(&message).copied();

            // Added tuples: persist, then propagate.
            let (add_vars, add_map) = self.handler_select_vars(&selects);
            let mut add_body = Vec::new();
            for &sel in &selects {
                add_body.push(self.emit_downstream(sel, &add_map, &Mode::Insert, None));
            }
            let add_inner = if let Some(table) = table {
                Region::TransitionState {
                    table,
                    transition: StateTransition::AbsentToPresent,
                    vars: add_vars.clone(),
                    body: Box::new(Region::Series(add_body)),
                }
            } else {
                Region::Series(add_body)
            };
            let mut body = vec![Region::VectorLoop {
                vector: added,
                vars: add_vars,
                body: Box::new(add_inner),
            }];

            // Removed tuples, for differential messages.
            if decl.pragmas.differential {
                let removed =
                    self.program.add_vector(VectorKind::InputRemoved, columns.clone(), 0);
                vector_params.push(removed);
                let (rm_vars, rm_map) = self.handler_select_vars(&selects);
                let mut rm_body = Vec::new();
                for &sel in &selects {
                    rm_body.push(self.emit_downstream(sel, &rm_map, &Mode::Remove, None));
                }
                let rm_inner = if let Some(table) = table {
                    Region::Series(vec![
                        Region::TransitionState {
                            table,
                            transition: StateTransition::PresentToUnknown,
                            vars: rm_vars.clone(),
                            body: Box::new(Region::Series(rm_body)),
                        },
                        Region::TransitionState {
                            table,
                            transition: StateTransition::UnknownToAbsent,
                            vars: rm_vars.clone(),
                            body: Box::new(Region::nop()),
                        },
                    ])
                } else {
                    Region::Series(rm_body)
                };
                body.push(Region::VectorLoop {
                    vector: removed,
                    vars: rm_vars,
                    body: Box::new(rm_inner),
                });
            }

            // Recursive strata reached from this message iterate to fixpoint.
            if let Some(induction) = self.build_induction_region(&selects) {
                body.push(induction);
            }

            self.program.add_procedure(
                ProcedureKind::MessageHandler(message),
                vec![],
                vector_params,
                Region::Series(body),
            );
        }
    }

    /// One set of loop variables shared by every select of the message (all
    /// selects of one stream see the same tuple).
    fn handler_select_vars(&mut self, selects: &[ViewId]) -> (Vec<VariableId>, ColMap) {
        let first = selects[0];
        let (vars, mut map) = self.fresh_vars(first, VariableRole::Local);
        for &other in &selects[1..] {
            let cols = self.query.view(other).columns.clone();
            for (i, &c) in cols.iter().enumerate() {
                map.insert(c, vars[i]);
            }
        }
        (vars, map)
    }

    /// The induction region for recursive relations reachable from these
    /// selects, when any exist.
    fn build_induction_region(&mut self, roots: &[ViewId]) -> Option<Region> {
        let mut reachable: Vec<DeclId> = Vec::new();
        let mut stack: Vec<ViewId> = roots.to_vec();
        let mut seen = HashSet::new();
        while let Some(at) = stack.pop() {
            if !seen.insert(at) {
                continue;
            }
            if let ViewKind::Insert { sink: Sink::Relation(d), .. } = self.query.view(at).kind {
                if self.recursive.contains(&d) && !reachable.contains(&d) {
                    reachable.push(d);
                }
            }
            if let Some(succs) = self.successors.get(&at) {
                stack.extend(succs.iter().copied());
            }
            // Propagation continues through the relation's selects.
            if let ViewKind::Insert { sink: Sink::Relation(d), .. } = self.query.view(at).kind {
                stack.extend(self.query.selects_of(d));
            }
        }
        if reachable.is_empty() {
            return None;
        }
        reachable.sort();

        let vectors: Vec<VectorId> =
            reachable.iter().map(|d| self.induction_vec[d].0).collect();

        // Each iteration drains every relation's worklist in parallel:
        // dedupe, swap into the drain buffer, walk each tuple downstream,
        // clear the buffer.
        let mut drains = Vec::new();
        for &decl in &reachable {
            let (work, swap) = self.induction_vec[&decl];
            let selects = self.query.selects_of(decl);
            if selects.is_empty() {
                continue;
            }
            let (vars, map) = self.handler_select_vars(&selects);
            let mut per_tuple = Vec::new();
            for &sel in &selects {
                per_tuple.push(self.emit_downstream(sel, &map, &Mode::Insert, None));
            }
            drains.push(Region::Series(vec![
                Region::VectorUnique { vector: work },
                Region::VectorSwap { lhs: work, rhs: swap },
                Region::VectorLoop {
                    vector: swap,
                    vars,
                    body: Box::new(Region::Series(per_tuple)),
                },
                Region::VectorClear { vector: swap },
            ]));
        }

        Some(Region::Induction {
            vectors,
            cycle: Box::new(Region::Series(vec![Region::Parallel(drains)])),
            output: Box::new(Region::nop()),
        })
    }

    // ------------------------------------------------------------------
    // Downstream propagation
    // ------------------------------------------------------------------

    /// Emit the regions propagating one tuple of `view` (bound in `map`) to
    /// all consumers. Independent consumers become a Parallel region.
    fn emit_downstream(
        &mut self,
        view: ViewId,
        map: &ColMap,
        mode: &Mode,
        scope: Option<&HashSet<ViewId>>,
    ) -> Region {
        let successors: Vec<ViewId> = self
            .successors
            .get(&view)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| scope.is_none_or(|set| set.contains(s)))
            .collect();
        let mut regions = Vec::new();
        for succ in successors {
            let region = self.emit_step(succ, view, map, mode, scope);
            if !region.is_nop() {
                regions.push(region);
            }
        }
        match regions.len() {
            0 => Region::nop(),
            1 => regions.pop().unwrap_or_else(Region::nop),
            _ => Region::Parallel(regions),
        }
    }

    /// One propagation step into `succ`, arriving from `from`.
    fn emit_step(
        &mut self,
        succ: ViewId,
        from: ViewId,
        map: &ColMap,
        mode: &Mode,
        scope: Option<&HashSet<ViewId>>,
    ) -> Region {
        let view = self.query.view(succ).clone();
        let inner = match &view.kind {
            ViewKind::Tuple { constants } => {
                let mut out_map = ColMap::new();
                let mut inputs = view.input_columns.iter();
                for (i, &out_col) in view.columns.iter().enumerate() {
                    if let Some((_, lit)) = constants.iter().find(|(pos, _)| *pos == i) {
                        let var = self.constant_var(lit);
                        out_map.insert(out_col, var);
                    } else if let Some(&in_col) = inputs.next() {
                        if let Some(&var) = map.get(&in_col) {
                            out_map.insert(out_col, var);
                        }
                    }
                }
                self.emit_downstream(succ, &out_map, mode, scope)
            }

            ViewKind::Compare { op, rhs_literal } => {
                let operands = if rhs_literal.is_some() { 1 } else { 2 };
                let lhs_var = map.get(&view.input_columns[0]).copied();
                let rhs_var = match rhs_literal {
                    Some(lit) => Some(self.constant_var(lit)),
                    None => map.get(&view.input_columns[1]).copied(),
                };
                let (Some(lhs), Some(rhs)) = (lhs_var, rhs_var) else {
                    return Region::nop();
                };
                // Outputs map positionally onto the passthrough columns;
                // the merged-equality layout drops one operand column.
                let passthrough = &view.input_columns[operands..];
                let mut out_map = ColMap::new();
                if passthrough.len() == view.columns.len() {
                    for (&out_col, &in_col) in view.columns.iter().zip(passthrough) {
                        if let Some(&var) = map.get(&in_col) {
                            out_map.insert(out_col, var);
                        }
                    }
                } else {
                    out_map.insert(view.columns[0], lhs);
                    for (&out_col, &in_col) in view.columns[1..].iter().zip(passthrough) {
                        if let Some(&var) = map.get(&in_col) {
                            out_map.insert(out_col, var);
                        }
                    }
                }
                let body = self.emit_downstream(succ, &out_map, mode, scope);
                Region::TupleCompare {
                    op: *op,
                    lhs: vec![lhs],
                    rhs: vec![rhs],
                    body: Box::new(body),
                }
            }

            ViewKind::Join { pivot_sources, .. } => {
                self.emit_join_step(succ, from, map, mode, scope, pivot_sources.clone())
            }

            ViewKind::Map { functor, copied, .. } => {
                let decl = self.arena.canonical(*functor).clone();
                let inputs: Vec<VariableId> = view.input_columns[*copied..]
                    .iter()
                    .filter_map(|c| map.get(c).copied())
                    .collect();
                let mut out_map = ColMap::new();
                for (i, &out_col) in view.columns.iter().take(*copied).enumerate() {
                    if let Some(&var) = map.get(&view.input_columns[i]) {
                        out_map.insert(out_col, var);
                    }
                }
                let mut outputs = Vec::new();
                for &out_col in &view.columns[*copied..] {
                    let col = self.query.column(out_col);
                    let var = self.program.add_variable(VariableRole::Free, col.ty, col.name);
                    out_map.insert(out_col, var);
                    outputs.push(var);
                }
                let negated = matches!(mode, Mode::Remove) && decl.pragmas.impure;
                let body = self.emit_downstream(succ, &out_map, mode, scope);
                Region::Generate {
                    functor: *functor,
                    inputs,
                    outputs,
                    negated,
                    body: Box::new(body),
                }
            }

            ViewKind::Aggregate { functor, group, .. } => {
                let inputs: Vec<VariableId> = view
                    .input_columns
                    .iter()
                    .filter_map(|c| map.get(c).copied())
                    .collect();
                let mut out_map = ColMap::new();
                for (i, &out_col) in view.columns.iter().take(*group).enumerate() {
                    if let Some(&var) = map.get(&view.input_columns[i]) {
                        out_map.insert(out_col, var);
                    }
                }
                let mut outputs = Vec::new();
                for &out_col in &view.columns[*group..] {
                    let col = self.query.column(out_col);
                    let var = self.program.add_variable(VariableRole::Free, col.ty, col.name);
                    out_map.insert(out_col, var);
                    outputs.push(var);
                }
                // A retraction re-invokes the reducer negated so the prior
                // summary retracts before the new one lands.
                let negated = matches!(mode, Mode::Remove);
                // The downstream summary always re-proves: after updating the
                // reducer state the fresh summary propagates as an insert.
                let body = self.emit_downstream(succ, &out_map, &Mode::Insert, scope);
                Region::Generate {
                    functor: *functor,
                    inputs,
                    outputs,
                    negated,
                    body: Box::new(body),
                }
            }

            ViewKind::Negate { copied } => {
                self.emit_negate_step(succ, from, map, mode, scope, *copied)
            }

            ViewKind::Merge => {
                let from_cols = self.query.view(from).columns.clone();
                let mut out_map = ColMap::new();
                for (&out_col, &in_col) in view.columns.iter().zip(&from_cols) {
                    if let Some(&var) = map.get(&in_col) {
                        out_map.insert(out_col, var);
                    }
                }
                self.emit_downstream(succ, &out_map, mode, scope)
            }

            ViewKind::KVIndex { keys, merge_functors } => {
                // Values merge through their functors; the merged row then
                // propagates like any other tuple.
                let mut out_map = ColMap::new();
                for (&out_col, &in_col) in view.columns.iter().zip(&view.input_columns) {
                    if let Some(&var) = map.get(&in_col) {
                        out_map.insert(out_col, var);
                    }
                }
                let mut region = self.emit_downstream(succ, &out_map, mode, scope);
                for &merge in merge_functors.iter().rev() {
                    let value_vars: Vec<VariableId> = view.input_columns[*keys..]
                        .iter()
                        .filter_map(|c| map.get(c).copied())
                        .collect();
                    region = Region::Generate {
                        functor: merge,
                        inputs: value_vars.clone(),
                        outputs: value_vars,
                        negated: false,
                        body: Box::new(region),
                    };
                }
                region
            }

            ViewKind::Insert { sink, deletion } => {
                self.emit_insert_step(succ, map, mode, *sink, *deletion)
            }

            ViewKind::Select { .. } | ViewKind::Condition { .. } => Region::nop(),
        };

        // Zero-arity guards wrap the whole step.
        let mut region = inner;
        for &cond_view in &view.negative_conditions {
            if let ViewKind::Condition { decl } = self.query.view(cond_view).kind {
                let condition = self.condition_var(decl);
                region = Region::ExistenceCheck {
                    condition,
                    expect_nonzero: false,
                    body: Box::new(region),
                };
            }
        }
        for &cond_view in &view.positive_conditions {
            if let ViewKind::Condition { decl } = self.query.view(cond_view).kind {
                let condition = self.condition_var(decl);
                region = Region::ExistenceCheck {
                    condition,
                    expect_nonzero: true,
                    body: Box::new(region),
                };
            }
        }
        region
    }

    fn emit_join_step(
        &mut self,
        join_id: ViewId,
        from: ViewId,
        map: &ColMap,
        mode: &Mode,
        scope: Option<&HashSet<ViewId>>,
        pivot_sources: Vec<Vec<ColId>>,
    ) -> Region {
        let join = self.query.view(join_id).clone();
        let my_pos = join
            .inputs
            .iter()
            .position(|&i| i == from)
            .unwrap_or(0);
        let other = join.inputs[1 - my_pos];
        let Some(other_table) = self.table_for_input(other) else {
            return Region::nop();
        };

        // Key variables: our member of each pivot set; key positions: the
        // other side's members.
        let mut key_vars = Vec::new();
        let mut key_positions = Vec::new();
        let mut pivot_out_vars = Vec::new();
        for set in &pivot_sources {
            let mine = set.iter().find(|&&c| self.query.column(c).view == from);
            let theirs = set.iter().find(|&&c| self.query.column(c).view == other);
            if let (Some(&mine), Some(&theirs)) = (mine, theirs) {
                if let Some(&var) = map.get(&mine) {
                    key_vars.push(var);
                    pivot_out_vars.push(var);
                }
                if let Some(pos) = self.position_in_view(other, theirs) {
                    key_positions.push(pos);
                }
            }
        }

        // Bind the other side's remaining columns.
        let other_cols = self.query.view(other).columns.clone();
        let mut out_vars = Vec::new();
        let mut other_map = ColMap::new();
        for (pos, &col) in other_cols.iter().enumerate() {
            if key_positions.contains(&pos) {
                continue;
            }
            let c = self.query.column(col);
            let var = self.program.add_variable(VariableRole::Free, c.ty, c.name);
            out_vars.push(var);
            other_map.insert(col, var);
        }
        for (set, &var) in pivot_sources.iter().zip(&pivot_out_vars) {
            for &col in set {
                other_map.insert(col, var);
            }
        }

        // Output mapping: pivots first, then the join's recorded non-pivot
        // input columns.
        let mut out_map = ColMap::new();
        for (i, &var) in pivot_out_vars.iter().enumerate() {
            out_map.insert(join.columns[i], var);
        }
        for (i, &in_col) in join.input_columns.iter().enumerate() {
            let out_col = join.columns[pivot_sources.len() + i];
            if let Some(&var) = map.get(&in_col).or_else(|| other_map.get(&in_col)) {
                out_map.insert(out_col, var);
            }
        }

        let body = self.emit_downstream(join_id, &out_map, mode, scope);
        let probe = if key_positions.is_empty() {
            Region::TableProduct {
                tables: vec![other_table],
                out_vars: vec![out_vars],
                body: Box::new(body),
            }
        } else {
            let index = self.program.ensure_index(other_table, key_positions);
            Region::TableJoin {
                table: other_table,
                index,
                key_vars,
                out_vars,
                body: Box::new(body),
            }
        };

        // Internal join inputs persist the arriving tuple first, so later
        // arrivals on the other side can see it.
        if self.table_of_view.contains_key(&from) {
            let table = self.table_of_view[&from];
            let vars = self.vars_of(from, map);
            let transition = match mode {
                Mode::Remove => StateTransition::PresentToUnknown,
                _ => StateTransition::AbsentToPresent,
            };
            Region::TransitionState { table, transition, vars, body: Box::new(probe) }
        } else {
            probe
        }
    }

    fn emit_negate_step(
        &mut self,
        negate_id: ViewId,
        from: ViewId,
        map: &ColMap,
        mode: &Mode,
        scope: Option<&HashSet<ViewId>>,
        copied: usize,
    ) -> Region {
        let negate = self.query.view(negate_id).clone();
        let matches = (negate.input_columns.len() - copied) / 2;
        let match_candidate = &negate.input_columns[copied..copied + matches];
        let match_negated = &negate.input_columns[copied + matches..];
        let candidate_side = negate.inputs[0];
        let negated_side = negate.inputs[1];

        if from == candidate_side {
            // Candidate tuple arrived: it survives only while the matched
            // tuple is absent from the negated relation.
            let Some(neg_table) = self.table_for_input(negated_side) else {
                return Region::nop();
            };
            // Full-tuple state check on the negated relation, ordered by its
            // column positions.
            let neg_cols = self.query.view(negated_side).columns.clone();
            let mut check_vars = vec![None; neg_cols.len()];
            for (cand_col, neg_col) in match_candidate.iter().zip(match_negated) {
                if let Some(pos) = self.position_in_view(negated_side, *neg_col) {
                    check_vars[pos] = map.get(cand_col).copied();
                }
            }
            let check_vars: Vec<VariableId> = check_vars.into_iter().flatten().collect();

            let mut out_map = ColMap::new();
            for (i, &out_col) in negate.columns.iter().enumerate() {
                if let Some(&var) = map.get(&negate.input_columns[i]) {
                    out_map.insert(out_col, var);
                }
            }
            let continue_region = self.emit_downstream(negate_id, &out_map, mode, scope);

            // Unknown resolves through the relation's finder.
            let finder = self.finder_of.get(&self.decl_of_table(neg_table)).copied();
            let unknown = finder.map(|finder| {
                let result = self.program.add_variable(
                    VariableRole::Local,
                    crate::types::TypeKind::Bool,
                    StrId::EMPTY,
                );
                let false_const = self.false_const();
                Box::new(Region::Series(vec![
                    Region::Call { procedure: finder, args: check_vars.clone(), result: Some(result) },
                    Region::TupleCompare {
                        op: crate::ast::ComparisonOp::Equal,
                        lhs: vec![result],
                        rhs: vec![false_const],
                        body: Box::new(continue_region.clone()),
                    },
                ]))
            });

            Region::CheckState {
                table: neg_table,
                vars: check_vars,
                branches: StateBranches {
                    present: None,
                    absent: Some(Box::new(continue_region)),
                    unknown,
                },
            }
        } else {
            // The negated relation changed: candidates matching the tuple
            // flip. Additions retract downstream proofs; removals re-prove.
            let Some(cand_table) = self.table_for_input(candidate_side) else {
                return Region::nop();
            };
            let key_positions: Vec<usize> = match_candidate
                .iter()
                .filter_map(|&c| self.position_in_view(candidate_side, c))
                .collect();
            let key_vars: Vec<VariableId> = match_negated
                .iter()
                .filter_map(|&c| map.get(&c).copied())
                .collect();
            if key_positions.is_empty() || key_vars.len() != key_positions.len() {
                return Region::nop();
            }
            let index = self.program.ensure_index(cand_table, key_positions.clone());

            let cand_cols = self.query.view(candidate_side).columns.clone();
            let mut cand_map = ColMap::new();
            let mut out_vars = Vec::new();
            for (pos, &col) in cand_cols.iter().enumerate() {
                if let Some(k) = key_positions.iter().position(|&p| p == pos) {
                    cand_map.insert(col, key_vars[k]);
                } else {
                    let c = self.query.column(col);
                    let var = self.program.add_variable(VariableRole::Free, c.ty, c.name);
                    out_vars.push(var);
                    cand_map.insert(col, var);
                }
            }
            let mut out_map = ColMap::new();
            for (i, &out_col) in negate.columns.iter().enumerate() {
                if let Some(&var) = cand_map.get(&negate.input_columns[i]) {
                    out_map.insert(out_col, var);
                }
            }
            let flipped = match mode {
                Mode::Insert => Mode::Remove,
                _ => Mode::Insert,
            };
            let body = self.emit_downstream(negate_id, &out_map, &flipped, scope);
            Region::TableJoin { table: cand_table, index, key_vars, out_vars, body: Box::new(body) }
        }
    }

    fn decl_of_table(&self, table: TableId) -> DeclId {
        match self.program.table(table).source {
            TableSource::Relation(d) => d,
            TableSource::View(_) => DeclId(u32::MAX),
        }
    }

    fn emit_insert_step(
        &mut self,
        insert_id: ViewId,
        map: &ColMap,
        mode: &Mode,
        sink: Sink,
        deletion: bool,
    ) -> Region {
        let insert = self.query.view(insert_id).clone();
        let vars: Vec<VariableId> = insert
            .input_columns
            .iter()
            .filter_map(|c| map.get(c).copied())
            .collect();

        match sink {
            Sink::Stream(message) => Region::Publish {
                message,
                vars,
                added: matches!(mode, Mode::Insert),
            },
            Sink::Relation(decl) => {
                if self.arena.canonical(decl).is_condition() {
                    let condition = self.condition_var(decl);
                    return Region::ExistenceAssertion {
                        condition,
                        increment: matches!(mode, Mode::Insert) != deletion,
                    };
                }
                let Some(&table) = self.table_of_decl.get(&decl) else {
                    return Region::nop();
                };

                if let Mode::Prove { target, params } = mode {
                    // Top-down re-proof: does this flow derive the sought
                    // tuple?
                    if *target != decl {
                        return Region::nop();
                    }
                    return Region::TupleCompare {
                        op: crate::ast::ComparisonOp::Equal,
                        lhs: vars,
                        rhs: params.clone(),
                        body: Box::new(Region::TransitionState {
                            table,
                            transition: StateTransition::UnknownToPresent,
                            vars: params.clone(),
                            body: Box::new(Region::Return { value: Some(true) }),
                        }),
                    };
                }

                let removing = matches!(mode, Mode::Remove) != deletion;
                if removing {
                    // Retraction routes through the remover so downstream
                    // proofs re-verify.
                    if let Some(&remover) = self.remover_of.get(&decl) {
                        return Region::Call { procedure: remover, args: vars, result: None };
                    }
                    return Region::TransitionState {
                        table,
                        transition: StateTransition::PresentToUnknown,
                        vars,
                        body: Box::new(Region::nop()),
                    };
                }

                // A fresh proof: transition, then either queue for the
                // induction loop or propagate inline.
                let inner = if self.recursive.contains(&decl) {
                    let (work, _) = self.induction_vec[&decl];
                    Region::VectorAppend { vector: work, vars: vars.clone() }
                } else {
                    let selects = self.query.selects_of(decl);
                    let mut regions = Vec::new();
                    if !selects.is_empty() {
                        let mut sel_map = ColMap::new();
                        for &sel in &selects {
                            let cols = self.query.view(sel).columns.clone();
                            for (i, &c) in cols.iter().enumerate() {
                                sel_map.insert(c, vars[i]);
                            }
                        }
                        for &sel in &selects {
                            regions.push(self.emit_downstream(sel, &sel_map, &Mode::Insert, None));
                        }
                    }
                    Region::Series(regions)
                };
                Region::TransitionState {
                    table,
                    transition: StateTransition::AbsentToPresent,
                    vars,
                    body: Box::new(inner),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Finders
    // ------------------------------------------------------------------

    /// Fill in the bodies of the boolean tuple finders: confirm Present,
    /// re-derive Unknown bottom-up from the defining flows, or conclude
    /// Absent.
    fn build_finder_bodies(&mut self) -> Result<(), BuildError> {
        let finders: Vec<(DeclId, ProcedureId)> =
            self.finder_of.iter().map(|(&d, &p)| (d, p)).collect();
        for (decl, proc_id) in finders {
            let table = *self
                .table_of_decl
                .get(&decl)
                .ok_or_else(|| BuildError::Internal("finder for untabled relation".into()))?;
            let params = self.program.procedure(proc_id).params.clone();

            // Re-proof attempts, one per defining flow.
            let mut attempts = Vec::new();
            let flows: Vec<ViewId> = self
                .query
                .inserts()
                .filter(|v| {
                    matches!(v.kind, ViewKind::Insert { sink: Sink::Relation(d), deletion: false } if d == decl)
                })
                .map(|v| v.id)
                .collect();
            for insert in flows {
                // One attempt per defining clause: a Merge fans the insert
                // out over the per-clause tuple views.
                let body = self.query.view(insert).inputs[0];
                let branches: Vec<ViewId> =
                    if matches!(self.query.view(body).kind, ViewKind::Merge) {
                        self.query.view(body).inputs.clone()
                    } else {
                        vec![body]
                    };
                for branch in branches {
                    if let Some(region) = self.emit_reproof(insert, branch, decl, &params) {
                        attempts.push(region);
                    }
                }
            }

            let mut unknown = attempts;
            unknown.push(Region::TransitionState {
                table,
                transition: StateTransition::UnknownToAbsent,
                vars: params.clone(),
                body: Box::new(Region::nop()),
            });
            unknown.push(Region::Return { value: Some(false) });

            let body = Region::CheckState {
                table,
                vars: params.clone(),
                branches: StateBranches {
                    present: Some(Box::new(Region::Return { value: Some(true) })),
                    absent: Some(Box::new(Region::Return { value: Some(false) })),
                    unknown: Some(Box::new(Region::Series(unknown))),
                },
            };
            self.program.procedures[proc_id.0 as usize].body = body;
        }
        Ok(())
    }

    /// Bottom-up re-derivation of one clause flow: scan the branch's base
    /// table and walk the flow forward; reaching the insert with a matching
    /// tuple transitions Unknown to Present and returns true.
    fn emit_reproof(
        &mut self,
        insert: ViewId,
        branch: ViewId,
        target: DeclId,
        params: &[VariableId],
    ) -> Option<Region> {
        // The linear spine of the branch: follow first inputs down to the
        // base select.
        let mut base = branch;
        while let Some(&first) = self.query.view(base).inputs.first() {
            base = first;
        }
        if !matches!(self.query.view(base).kind, ViewKind::Select { .. }) {
            return None;
        }
        let table = self.table_for_input(base)?;
        let scope: HashSet<ViewId> = self.ancestors(insert).into_iter().collect();

        let (out_vars, map) = self.fresh_vars(base, VariableRole::Free);
        let mode = Mode::Prove { target, params: params.to_vec() };
        let body = self.emit_downstream(base, &map, &mode, Some(&scope));
        if body.is_nop() {
            return None;
        }
        Some(Region::TableScan { table, out_vars, body: Box::new(body) })
    }

    // ------------------------------------------------------------------
    // Removers
    // ------------------------------------------------------------------

    /// Removers transition Present to Unknown, propagate the retraction to
    /// dependents, then re-verify through the finder; tuples that stay
    /// unproven become Absent.
    fn build_remover_bodies(&mut self) {
        let removers: Vec<(DeclId, ProcedureId)> =
            self.remover_of.iter().map(|(&d, &p)| (d, p)).collect();
        for (decl, proc_id) in removers {
            let Some(&table) = self.table_of_decl.get(&decl) else { continue };
            let params = self.program.procedure(proc_id).params.clone();

            let selects = self.query.selects_of(decl);
            let mut propagation = Vec::new();
            if !selects.is_empty() {
                let mut map = ColMap::new();
                for &sel in &selects {
                    let cols = self.query.view(sel).columns.clone();
                    for (i, &c) in cols.iter().enumerate() {
                        map.insert(c, params[i]);
                    }
                }
                for &sel in &selects {
                    propagation.push(self.emit_downstream(sel, &map, &Mode::Remove, None));
                }
            }

            let mut body = vec![Region::TransitionState {
                table,
                transition: StateTransition::PresentToUnknown,
                vars: params.clone(),
                body: Box::new(Region::Series(propagation)),
            }];

            if let Some(&finder) = self.finder_of.get(&decl) {
                let result = self.program.add_variable(
                    VariableRole::Local,
                    crate::types::TypeKind::Bool,
                    StrId::EMPTY,
                );
                body.push(Region::Call {
                    procedure: finder,
                    args: params.clone(),
                    result: Some(result),
                });
            } else {
                body.push(Region::TransitionState {
                    table,
                    transition: StateTransition::UnknownToAbsent,
                    vars: params.clone(),
                    body: Box::new(Region::nop()),
                });
            }

            self.program.procedures[proc_id.0 as usize].body = Region::Series(body);
        }
    }

    // ------------------------------------------------------------------
    // Query entry points
    // ------------------------------------------------------------------

    /// One finder per `#query`: probe by the bound parameters (or scan when
    /// all parameters are free) and append every Present row to the response
    /// vector.
    fn build_query_finders(&mut self) {
        let queries: Vec<DeclId> = self
            .arena
            .declarations
            .iter()
            .filter(|d| d.kind == DeclKind::Query && d.redecl_index == 0)
            .map(|d| d.id)
            .collect();
        for query_decl in queries {
            let decl = self.arena.canonical(query_decl).clone();
            let Some(&table) = self.table_of_decl.get(&decl.id) else { continue };

            let bound: Vec<usize> = decl
                .params
                .iter()
                .enumerate()
                .filter(|(_, p)| matches!(p.binding, Some(crate::ast::Binding::Bound)))
                .map(|(i, _)| i)
                .collect();

            let params: Vec<VariableId> = bound
                .iter()
                .map(|&i| {
                    let p = &decl.params[i];
                    self.program.add_variable(VariableRole::Parameter, p.ty, p.name)
                })
                .collect();
            let columns: Vec<crate::types::TypeKind> =
                decl.params.iter().map(|p| p.ty).collect();
            let response = self.program.add_vector(VectorKind::Output, columns, 0);

            // Row variables in declaration order; bound ones alias params.
            let mut row_vars = Vec::new();
            let mut free_vars = Vec::new();
            for (i, p) in decl.params.iter().enumerate() {
                if let Some(k) = bound.iter().position(|&b| b == i) {
                    row_vars.push(params[k]);
                } else {
                    let var = self.program.add_variable(VariableRole::Free, p.ty, p.name);
                    row_vars.push(var);
                    free_vars.push(var);
                }
            }

            let emit = Region::CheckState {
                table,
                vars: row_vars.clone(),
                branches: StateBranches {
                    present: Some(Box::new(Region::VectorAppend {
                        vector: response,
                        vars: row_vars.clone(),
                    })),
                    absent: None,
                    unknown: None,
                },
            };

            let body = if bound.is_empty() {
                Region::TableScan { table, out_vars: row_vars, body: Box::new(emit) }
            } else if free_vars.is_empty() {
                emit
            } else {
                let index = self.program.ensure_index(table, bound);
                Region::TableJoin {
                    table,
                    index,
                    key_vars: params.clone(),
                    out_vars: free_vars,
                    body: Box::new(emit),
                }
            };

            self.program.add_procedure(
                ProcedureKind::TupleFinder(decl.id),
                params,
                vec![response],
                body,
            );
        }
    }
}

/// Build a program from a canonicalized query graph.
pub fn build_program(
    pool: &StringPool,
    arena: &ParseArena,
    query: &Query,
) -> Result<Program, BuildError> {
    let _ = pool;
    ProgramBuilder::new(pool, arena, query).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorLog;
    use crate::parser::Parser;
    use crate::query::builder::QueryBuilder;

    fn program_for(text: &str) -> (Program, crate::ast::ParseArena) {
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
            .expect("query builds");
        assert!(log.is_empty(), "build: {:?}", log.snapshot());
        let program = build_program(&pool, &arena, &query).expect("program builds");
        (program, arena)
    }

    #[test]
    fn transitive_closure_schedules_induction() {
        let (program, _) = program_for(
            "#message edge(u32 X, u32 Y) @differential.\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );

        // One handler for edge, with added and removed vectors.
        let handler = program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::MessageHandler(_)))
            .next()
            .expect("edge handler");
        assert_eq!(handler.vector_params.len(), 2);

        // Recursion shows up as an Induction region in the handler.
        fn has_induction(region: &Region) -> bool {
            match region {
                Region::Induction { .. } => true,
                Region::Series(rs) | Region::Parallel(rs) => rs.iter().any(has_induction),
                Region::VectorLoop { body, .. }
                | Region::LetBinding { body, .. }
                | Region::TransitionState { body, .. }
                | Region::TableJoin { body, .. }
                | Region::TableScan { body, .. }
                | Region::TupleCompare { body, .. } => has_induction(body),
                _ => false,
            }
        }
        assert!(has_induction(&handler.body));

        // tc is removable, so it gets a finder and a remover.
        assert!(program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::TupleFinder(_)))
            .next()
            .is_some());
        assert!(program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::TupleRemover(_)))
            .next()
            .is_some());
    }

    #[test]
    fn tables_key_full_tuple_and_indexes_cover_pivots() {
        let (program, arena) = program_for(
            "#message edge(u32 X, u32 Y).\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );
        let _ = arena;
        // Tables exist for edge (message persistence) and tc.
        assert!(program.tables.len() >= 2);
        // The recursive join probes tc by its second column.
        assert!(!program.indexes.is_empty());
    }

    #[test]
    fn negation_emits_check_state() {
        let (program, _) = program_for(
            "#message node(u32 X).\n\
             #message start(u32 X).\n\
             #message edge(u32 X, u32 Y).\n\
             #export reach(u32 X).\n\
             #export unreach(u32 X).\n\
             reach(X) : start(X).\n\
             reach(Y) : reach(X), edge(X, Y).\n\
             unreach(X) : node(X), !reach(X).\n",
        );
        fn has_check_state(region: &Region) -> bool {
            match region {
                Region::CheckState { .. } => true,
                Region::Series(rs) | Region::Parallel(rs) => rs.iter().any(has_check_state),
                Region::VectorLoop { body, .. }
                | Region::LetBinding { body, .. }
                | Region::TransitionState { body, .. }
                | Region::TableJoin { body, .. }
                | Region::TableProduct { body, .. }
                | Region::TableScan { body, .. }
                | Region::ExistenceCheck { body, .. }
                | Region::Generate { body, .. }
                | Region::TupleCompare { body, .. } => has_check_state(body),
                Region::Induction { cycle, output, .. } => {
                    has_check_state(cycle) || has_check_state(output)
                }
                _ => false,
            }
        }
        let found = program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::MessageHandler(_)))
            .any(|p| has_check_state(&p.body));
        assert!(found);
    }

    #[test]
    fn conditions_become_ref_counts() {
        let (program, _) = program_for(
            "#message evt(u32 X).\n\
             #export enabled.\n\
             #export out(u32 X).\n\
             enabled.\n\
             out(X) : evt(X), enabled.\n",
        );
        assert_eq!(program.conditions.len(), 1);
        let var = program.variable(program.conditions[0].variable);
        assert_eq!(var.role, VariableRole::ConditionRefCount);

        // The initializer asserts the unconditional condition.
        let init = program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::Initializer))
            .next()
            .expect("initializer");
        fn has_assertion(region: &Region) -> bool {
            match region {
                Region::ExistenceAssertion { increment: true, .. } => true,
                Region::Series(rs) | Region::Parallel(rs) => rs.iter().any(has_assertion),
                Region::LetBinding { body, .. } | Region::TransitionState { body, .. } => {
                    has_assertion(body)
                }
                _ => false,
            }
        }
        assert!(has_assertion(&init.body));
    }

    #[test]
    fn query_finder_probes_bound_columns() {
        let (program, arena) = program_for(
            "#message knows(utf8 A, utf8 B).\n\
             #query who_knows(bound utf8 Name, free utf8 Friend).\n\
             who_knows(N, F) : knows(N, F).\n",
        );
        let finder = program
            .procedures_of_kind(|k| {
                matches!(k, ProcedureKind::TupleFinder(d)
                    if arena.canonical(*d).kind == DeclKind::Query)
            })
            .next()
            .expect("query finder");
        assert_eq!(finder.params.len(), 1);
        assert_eq!(finder.vector_params.len(), 1);
        assert!(matches!(finder.body, Region::TableJoin { .. }));
    }

    #[test]
    fn functor_use_emits_generate() {
        let (program, _) = program_for(
            "#message num(u32 X).\n\
             #functor add1(bound u32 X, free u32 Y).\n\
             #export succ(u32 X, u32 Y).\n\
             succ(X, Y) : num(X), add1(X, Y).\n",
        );
        fn has_generate(region: &Region) -> bool {
            match region {
                Region::Generate { .. } => true,
                Region::Series(rs) | Region::Parallel(rs) => rs.iter().any(has_generate),
                Region::VectorLoop { body, .. }
                | Region::LetBinding { body, .. }
                | Region::TransitionState { body, .. }
                | Region::TableJoin { body, .. }
                | Region::TableScan { body, .. }
                | Region::TupleCompare { body, .. } => has_generate(body),
                _ => false,
            }
        }
        let found = program
            .procedures_of_kind(|k| matches!(k, ProcedureKind::MessageHandler(_)))
            .any(|p| has_generate(&p.body));
        assert!(found);
    }
}
