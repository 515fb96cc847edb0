//! # Sideways Information Passing (SIPS)
//!
//! For a clause and an assumption (a body predicate taken as present, e.g.
//! an incoming message, or no assumption at all for top-down proving), the
//! [`SipsGenerator`] enumerates permutations of the body atoms and drives a
//! [`SipsVisitor`] through each: declaring parameters, variables, and
//! constants, asserting comparisons and tuple presence/absence, entering and
//! exiting selection scopes with bound/free column partitions, and finally
//! inserting into the head or cancelling.
//!
//! Binding state is tracked in a clause-local [`DisjointSet`]: equality
//! merges classes, and a class is bound once any member is. The
//! [`ComplexityScorer`] visitor scores a permutation by the count and
//! nesting depth of free-variable introductions; the data-flow builder picks
//! the minimum.

use crate::ast::*;
use crate::types::TypeKind;

/// Clause-local union-find over variable and constant ids, with a bound flag
/// per class.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<u32>,
    bound: Vec<bool>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        DisjointSet { parent: (0..n as u32).collect(), bound: vec![false; n] }
    }

    pub fn find(&mut self, x: u32) -> u32 {
        let mut root = x;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression.
        let mut at = x;
        while self.parent[at as usize] != root {
            let next = self.parent[at as usize];
            self.parent[at as usize] = root;
            at = next;
        }
        root
    }

    pub fn union(&mut self, a: u32, b: u32) -> u32 {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[merge as usize] = keep;
        let bound = self.bound[keep as usize] || self.bound[merge as usize];
        self.bound[keep as usize] = bound;
        keep
    }

    pub fn mark_bound(&mut self, x: u32) {
        let root = self.find(x);
        self.bound[root as usize] = true;
    }

    pub fn is_bound(&mut self, x: u32) -> bool {
        let root = self.find(x);
        self.bound[root as usize]
    }
}

/// One argument position of a predicate use, as seen by the visitor.
#[derive(Debug, Clone)]
pub struct UseColumn {
    /// Position within the predicate's parameter list.
    pub n: usize,
    /// Equivalence-class id at callback time.
    pub id: u32,
    pub var: Option<VarId>,
    pub literal: Option<Literal>,
    pub ty: TypeKind,
}

/// Why a binding pattern could not be met.
#[derive(Debug, Clone)]
pub struct FailedBinding {
    pub decl: DeclId,
    pub redecl: DeclId,
    pub unbound_var: VarId,
    pub param: usize,
}

/// Why a permutation was cancelled.
#[derive(Debug, Clone)]
pub enum Cancellation {
    /// A head or compared variable never receives a value.
    RangeRestriction(VarId),
    /// A comparison against a variable that is unbound at the end.
    Comparison(ComparisonOp, Option<VarId>),
    /// `p, !p` with identical argument classes.
    Contradiction(DeclId),
    /// A received message not serving as the left corner.
    Message(DeclId),
    /// No redeclaration's binding pattern can be satisfied.
    Predicate(Vec<FailedBinding>),
}

/// Visitor over one permutation. Callbacks arrive in evaluation order; the
/// default implementations ignore everything, so visitors override only what
/// they consume.
#[allow(unused_variables)]
pub trait SipsVisitor {
    /// Visiting begins. `assumption` is the predicate taken as present, when
    /// there is one.
    fn begin(&mut self, clause: &ParsedClause, assumption: Option<&ParsedPredicate>) {}

    /// A concrete parameter of the assumption, bound from the start.
    fn declare_parameter(&mut self, col: &UseColumn) {}

    /// First sighting of a variable.
    fn declare_variable(&mut self, var: VarId, id: u32) {}

    /// A literal constant, bound by definition.
    fn declare_constant(&mut self, literal: &Literal, id: u32) {}

    /// A zero-arity predicate asserted true / false in this clause.
    fn assert_true(&mut self, pred: &ParsedPredicate) {}
    fn assert_false(&mut self, pred: &ParsedPredicate) {}

    fn assert_equal(&mut self, lhs: u32, rhs: u32) {}
    fn assert_not_equal(&mut self, lhs: u32, rhs: u32) {}
    fn assert_less(&mut self, lhs: u32, rhs: u32) {}
    fn assert_greater(&mut self, lhs: u32, rhs: u32) {}

    /// A fully-bound positive predicate: existence check.
    fn assert_present(&mut self, pred: &ParsedPredicate, cols: &[UseColumn]) {}

    /// A fully-bound negated predicate: absence check.
    fn assert_absent(&mut self, pred: &ParsedPredicate, cols: &[UseColumn]) {}

    /// Enter a selection scope: `where_cols` are bound, `select_cols` become
    /// bound inside the scope. Scopes nest and exit in reverse order after
    /// the insert.
    fn enter_select(
        &mut self,
        pred: &ParsedPredicate,
        where_cols: &[UseColumn],
        select_cols: &[UseColumn],
    ) {
    }

    fn exit_select(&mut self, pred: &ParsedPredicate) {}

    /// Enter an aggregation: group columns carry into the result, config
    /// columns parameterize the reducer, aggregate columns are consumed.
    fn enter_aggregation(
        &mut self,
        agg: &ParsedAggregate,
        group_cols: &[UseColumn],
        config_cols: &[UseColumn],
        aggregate_cols: &[UseColumn],
        summary_cols: &[UseColumn],
    ) {
    }

    /// The aggregated predicate's tuples feed the reducer.
    fn collect(&mut self, agg: &ParsedAggregate, cols: &[UseColumn]) {}

    /// Aggregation finished; summary columns are now bound.
    fn select_from_summary(&mut self, agg: &ParsedAggregate, summary_cols: &[UseColumn]) {}

    /// Terminal insert into the head relation.
    fn insert(&mut self, decl: DeclId, cols: &[UseColumn], negated_head: bool) {}

    /// The permutation completed.
    fn commit(&mut self) {}

    /// The permutation was abandoned.
    fn cancel(&mut self, reason: &Cancellation) {}
}

/// Enumerates permutations of a clause's body atoms.
pub struct SipsGenerator<'a> {
    arena: &'a ParseArena,
    clause: &'a ParsedClause,
    /// Body index of the assumed predicate, if any.
    assumption: Option<usize>,
    /// Body indexes of the orderable atoms (positive predicates other than
    /// the assumption, and aggregates), in the current permutation.
    permutation: Vec<usize>,
    exhausted: bool,
}

impl<'a> SipsGenerator<'a> {
    /// Visit the clause assuming body item `assumption_index` (a positive
    /// predicate) holds.
    pub fn with_assumption(
        arena: &'a ParseArena,
        clause: &'a ParsedClause,
        assumption_index: usize,
    ) -> Self {
        let permutation = Self::orderable(clause, Some(assumption_index));
        SipsGenerator {
            arena,
            clause,
            assumption: Some(assumption_index),
            permutation,
            exhausted: false,
        }
    }

    /// Visit the clause with no assumptions.
    pub fn new(arena: &'a ParseArena, clause: &'a ParsedClause) -> Self {
        let permutation = Self::orderable(clause, None);
        SipsGenerator { arena, clause, assumption: None, permutation, exhausted: false }
    }

    fn orderable(clause: &ParsedClause, skip: Option<usize>) -> Vec<usize> {
        clause
            .body
            .iter()
            .enumerate()
            .filter(|(i, item)| {
                let orderable = match item {
                    BodyItem::Predicate(p) => !p.negated,
                    BodyItem::Aggregate(_) => true,
                    _ => false,
                };
                orderable && Some(*i) != skip
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Advance to the next permutation. Returns false once all orderings
    /// have been visited.
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if !next_permutation(&mut self.permutation) {
            self.exhausted = true;
            return false;
        }
        true
    }

    /// Visit the current ordering. Returns true iff the visitor committed.
    pub fn visit<V: SipsVisitor>(&self, visitor: &mut V) -> bool {
        let run = Run {
            arena: self.arena,
            clause: self.clause,
            assumption: self.assumption,
            permutation: &self.permutation,
        };
        run.visit(visitor)
    }
}

/// Lexicographic next-permutation over a vector of body indexes.
fn next_permutation(items: &mut [usize]) -> bool {
    if items.len() < 2 {
        return false;
    }
    let mut i = items.len() - 1;
    while i > 0 && items[i - 1] >= items[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = items.len() - 1;
    while items[j] <= items[i - 1] {
        j -= 1;
    }
    items.swap(i - 1, j);
    items[i..].reverse();
    true
}

/// One visitation of one ordering.
struct Run<'a> {
    arena: &'a ParseArena,
    clause: &'a ParsedClause,
    assumption: Option<usize>,
    permutation: &'a [usize],
}

impl<'a> Run<'a> {
    fn visit<V: SipsVisitor>(&self, visitor: &mut V) -> bool {
        let n_vars = self.clause.variables.len();
        // Ids: variables first, then constants allocated on sight.
        let mut ds = DisjointSet::new(n_vars + self.count_literals());
        let mut next_const_id = n_vars as u32;
        let mut declared_vars = vec![false; n_vars];
        let mut open_scopes: Vec<&ParsedPredicate> = Vec::new();
        let mut asserted: Vec<(DeclId, Vec<u32>)> = Vec::new();
        let mut pending_compares: Vec<&ParsedComparison> = self.clause.comparisons().collect();

        let assumption_pred = self.assumption.and_then(|i| match &self.clause.body[i] {
            BodyItem::Predicate(p) => Some(p),
            _ => None,
        });

        visitor.begin(self.clause, assumption_pred);

        // The assumption's columns are parameters, bound from the start.
        if let Some(pred) = assumption_pred {
            let cols = self.columns_of(
                pred,
                &mut ds,
                &mut next_const_id,
                &mut declared_vars,
                visitor,
            );
            for col in &cols {
                ds.mark_bound(col.id);
                visitor.declare_parameter(col);
            }
            asserted.push((
                self.arena.redeclarations(pred.decl)[0],
                cols.iter().map(|c| c.id).collect(),
            ));
        }

        // Constant assignments bind immediately.
        for assign in self.clause.assignments() {
            let const_id = next_const_id;
            next_const_id += 1;
            visitor.declare_constant(&assign.value, const_id);
            ds.mark_bound(const_id);
            if !declared_vars[assign.var.0 as usize] {
                declared_vars[assign.var.0 as usize] = true;
                visitor.declare_variable(assign.var, assign.var.0);
            }
            visitor.assert_equal(ds.find(assign.var.0), const_id);
            let merged = ds.union(assign.var.0, const_id);
            ds.mark_bound(merged);
        }

        self.flush_comparisons(&mut pending_compares, &mut ds, &mut next_const_id, visitor);

        // Walk the permutation.
        for &index in self.permutation {
            match &self.clause.body[index] {
                BodyItem::Predicate(pred) => {
                    let decl = self.arena.canonical(pred.decl).clone();
                    if decl.is_message() {
                        // A message can only ever be the left corner.
                        let reason = Cancellation::Message(decl.id);
                        visitor.cancel(&reason);
                        return false;
                    }
                    if decl.is_condition() {
                        visitor.assert_true(pred);
                        continue;
                    }
                    let cols = self.columns_of(
                        pred,
                        &mut ds,
                        &mut next_const_id,
                        &mut declared_vars,
                        visitor,
                    );
                    if decl.is_functor() {
                        if !self.apply_functor(pred, &decl, &cols, &mut ds, visitor, &mut open_scopes) {
                            return false;
                        }
                    } else {
                        self.select_relation(pred, &cols, &mut ds, visitor, &mut open_scopes);
                        asserted.push((
                            self.arena.redeclarations(pred.decl)[0],
                            cols.iter().map(|c| ds.find(c.id)).collect(),
                        ));
                    }
                }
                BodyItem::Aggregate(agg) => {
                    if !self.aggregate(agg, &mut ds, &mut next_const_id, &mut declared_vars, visitor) {
                        return false;
                    }
                }
                _ => {}
            }
            self.flush_comparisons(&mut pending_compares, &mut ds, &mut next_const_id, visitor);
        }

        // Negated predicates need all their columns bound.
        for pred in self.clause.negated_predicates() {
            let decl = self.arena.canonical(pred.decl).clone();
            if decl.is_condition() {
                visitor.assert_false(pred);
                continue;
            }
            let cols = self.columns_of(
                pred,
                &mut ds,
                &mut next_const_id,
                &mut declared_vars,
                visitor,
            );
            for col in &cols {
                if !ds.is_bound(col.id) {
                    let var = col.var.unwrap_or(VarId(0));
                    let reason = Cancellation::RangeRestriction(var);
                    visitor.cancel(&reason);
                    return false;
                }
            }
            // `p(..), !p(..)` over identical classes can never produce.
            let class_ids: Vec<u32> = cols.iter().map(|c| ds.find(c.id)).collect();
            let canonical = self.arena.redeclarations(pred.decl)[0];
            if asserted.iter().any(|(d, ids)| *d == canonical && *ids == class_ids) {
                let reason = Cancellation::Contradiction(canonical);
                visitor.cancel(&reason);
                return false;
            }
            visitor.assert_absent(pred, &cols);
        }

        // Any comparison still pending has an unbound side.
        if let Some(cmp) = pending_compares.first() {
            let unbound = [&cmp.lhs, &cmp.rhs]
                .into_iter()
                .filter_map(Term::as_variable)
                .find(|v| !ds.is_bound(v.0));
            let reason = Cancellation::Comparison(cmp.op, unbound);
            visitor.cancel(&reason);
            return false;
        }

        // Head columns must all be bound.
        let head_decl = self.arena.canonical(self.clause.head).clone();
        let mut head_cols = Vec::with_capacity(self.clause.head_args.len());
        for (n, term) in self.clause.head_args.iter().enumerate() {
            match term {
                Term::Variable(v) => {
                    if !ds.is_bound(v.0) {
                        let reason = Cancellation::RangeRestriction(*v);
                        visitor.cancel(&reason);
                        return false;
                    }
                    head_cols.push(UseColumn {
                        n,
                        id: ds.find(v.0),
                        var: Some(*v),
                        literal: None,
                        ty: head_decl.params[n].ty,
                    });
                }
                Term::Literal(lit) => {
                    let const_id = next_const_id;
                    next_const_id += 1;
                    visitor.declare_constant(lit, const_id);
                    ds.mark_bound(const_id);
                    head_cols.push(UseColumn {
                        n,
                        id: const_id,
                        var: None,
                        literal: Some(lit.clone()),
                        ty: head_decl.params[n].ty,
                    });
                }
            }
        }
        visitor.insert(head_decl.id, &head_cols, self.clause.negated_head);

        for pred in open_scopes.into_iter().rev() {
            visitor.exit_select(pred);
        }
        visitor.commit();
        true
    }

    fn count_literals(&self) -> usize {
        let in_pred = |p: &ParsedPredicate| {
            p.args.iter().filter(|t| matches!(t, Term::Literal(_))).count()
        };
        let body: usize = self
            .clause
            .body
            .iter()
            .map(|item| match item {
                BodyItem::Predicate(p) => in_pred(p),
                BodyItem::Aggregate(a) => in_pred(&a.functor) + in_pred(&a.predicate),
                BodyItem::Comparison(c) => [&c.lhs, &c.rhs]
                    .into_iter()
                    .filter(|t| matches!(t, Term::Literal(_)))
                    .count(),
                BodyItem::Assignment(_) => 1,
            })
            .sum();
        body + self
            .clause
            .head_args
            .iter()
            .filter(|t| matches!(t, Term::Literal(_)))
            .count()
    }

    /// Build the visitor-facing columns for a predicate use, declaring
    /// variables and constants on first sight.
    fn columns_of<V: SipsVisitor>(
        &self,
        pred: &ParsedPredicate,
        ds: &mut DisjointSet,
        next_const_id: &mut u32,
        declared_vars: &mut [bool],
        visitor: &mut V,
    ) -> Vec<UseColumn> {
        let decl = self.arena.canonical(pred.decl);
        pred.args
            .iter()
            .enumerate()
            .map(|(n, term)| match term {
                Term::Variable(v) => {
                    if !declared_vars[v.0 as usize] {
                        declared_vars[v.0 as usize] = true;
                        visitor.declare_variable(*v, v.0);
                    }
                    UseColumn {
                        n,
                        id: ds.find(v.0),
                        var: Some(*v),
                        literal: None,
                        ty: decl.params[n].ty,
                    }
                }
                Term::Literal(lit) => {
                    let id = *next_const_id;
                    *next_const_id += 1;
                    visitor.declare_constant(lit, id);
                    ds.mark_bound(id);
                    UseColumn { n, id, var: None, literal: Some(lit.clone()), ty: decl.params[n].ty }
                }
            })
            .collect()
    }

    fn select_relation<V: SipsVisitor>(
        &self,
        pred: &'a ParsedPredicate,
        cols: &[UseColumn],
        ds: &mut DisjointSet,
        visitor: &mut V,
        open_scopes: &mut Vec<&'a ParsedPredicate>,
    ) {
        let (where_cols, select_cols): (Vec<_>, Vec<_>) =
            cols.iter().cloned().partition(|c| ds.is_bound(c.id));
        if select_cols.is_empty() {
            visitor.assert_present(pred, cols);
        } else {
            visitor.enter_select(pred, &where_cols, &select_cols);
            for col in &select_cols {
                ds.mark_bound(col.id);
            }
            open_scopes.push(pred);
        }
    }

    fn apply_functor<V: SipsVisitor>(
        &self,
        pred: &'a ParsedPredicate,
        decl: &ParsedDeclaration,
        cols: &[UseColumn],
        ds: &mut DisjointSet,
        visitor: &mut V,
        open_scopes: &mut Vec<&'a ParsedPredicate>,
    ) -> bool {
        // Find a redeclaration whose `bound` parameters all have bound
        // arguments at this point in the ordering. Prefer the one with the
        // most bound parameters (most selective implementation).
        let mut failed: Vec<FailedBinding> = Vec::new();
        let mut best: Option<(usize, DeclId)> = None;
        for &redecl_id in self.arena.redeclarations(pred.decl) {
            let redecl = self.arena.decl(redecl_id);
            let mut ok = true;
            let mut bound_count = 0usize;
            for (param_index, (param, col)) in redecl.params.iter().zip(cols).enumerate() {
                let arg_bound = ds.is_bound(col.id);
                let needs_bound = param.binding.is_some_and(Binding::accepts_bound)
                    && !param.binding.is_some_and(Binding::accepts_free);
                if needs_bound && !arg_bound {
                    ok = false;
                    failed.push(FailedBinding {
                        decl: decl.id,
                        redecl: redecl_id,
                        unbound_var: col.var.unwrap_or(VarId(0)),
                        param: param_index,
                    });
                    break;
                }
                if arg_bound {
                    bound_count += 1;
                }
            }
            if ok && best.is_none_or(|(n, _)| bound_count > n) {
                best = Some((bound_count, redecl_id));
            }
        }
        let Some((_, chosen)) = best else {
            let reason = Cancellation::Predicate(failed);
            visitor.cancel(&reason);
            return false;
        };

        let chosen_decl = self.arena.decl(chosen);
        let (where_cols, select_cols): (Vec<_>, Vec<_>) = cols
            .iter()
            .cloned()
            .zip(chosen_decl.params.iter())
            .partition(|(c, _)| ds.is_bound(c.id));
        let where_cols: Vec<UseColumn> = where_cols.into_iter().map(|(c, _)| c).collect();
        let select_cols: Vec<UseColumn> = select_cols.into_iter().map(|(c, _)| c).collect();

        if select_cols.is_empty() {
            // All arguments bound: the functor acts as a filter.
            visitor.assert_present(pred, cols);
        } else {
            visitor.enter_select(pred, &where_cols, &select_cols);
            for col in &select_cols {
                ds.mark_bound(col.id);
            }
            open_scopes.push(pred);
        }
        true
    }

    fn aggregate<V: SipsVisitor>(
        &self,
        agg: &ParsedAggregate,
        ds: &mut DisjointSet,
        next_const_id: &mut u32,
        declared_vars: &mut [bool],
        visitor: &mut V,
    ) -> bool {
        let functor = self.arena.canonical(agg.functor.decl).clone();
        let functor_cols =
            self.columns_of(&agg.functor, ds, next_const_id, declared_vars, visitor);
        let inner_cols =
            self.columns_of(&agg.predicate, ds, next_const_id, declared_vars, visitor);

        let mut group_cols = Vec::new();
        let mut config_cols = Vec::new();
        let mut aggregate_cols = Vec::new();
        let mut summary_cols = Vec::new();
        let inner_ids: Vec<u32> = inner_cols.iter().map(|c| ds.find(c.id)).collect();
        for (param, col) in functor.params.iter().zip(&functor_cols) {
            match param.binding {
                Some(Binding::Aggregate) => aggregate_cols.push(col.clone()),
                Some(Binding::Summary) => summary_cols.push(col.clone()),
                _ => {
                    // Bound parameters shared with the aggregated predicate
                    // group the aggregation; others configure the reducer.
                    if inner_ids.contains(&ds.find(col.id)) {
                        group_cols.push(col.clone());
                    } else {
                        config_cols.push(col.clone());
                    }
                }
            }
        }

        // Config columns must already be bound: they parameterize the reducer.
        for col in &config_cols {
            if !ds.is_bound(col.id) {
                let reason = Cancellation::RangeRestriction(col.var.unwrap_or(VarId(0)));
                visitor.cancel(&reason);
                return false;
            }
        }

        visitor.enter_aggregation(agg, &group_cols, &config_cols, &aggregate_cols, &summary_cols);

        // The aggregated predicate binds its own columns inside the scope.
        for col in &inner_cols {
            ds.mark_bound(col.id);
        }
        visitor.collect(agg, &inner_cols);

        // Summaries (and group keys) are bound after the aggregation.
        for col in summary_cols.iter().chain(&group_cols) {
            ds.mark_bound(col.id);
        }
        visitor.select_from_summary(agg, &summary_cols);
        true
    }

    fn flush_comparisons<'c, V: SipsVisitor>(
        &self,
        pending: &mut Vec<&'c ParsedComparison>,
        ds: &mut DisjointSet,
        next_const_id: &mut u32,
        visitor: &mut V,
    ) {
        loop {
            let mut emitted = false;
            let mut i = 0;
            while i < pending.len() {
                let cmp = pending[i];
                let side_bound = |term: &Term, ds: &mut DisjointSet| match term {
                    Term::Variable(v) => {
                        let root = ds.find(v.0);
                        ds.is_bound(root)
                    }
                    Term::Literal(_) => true,
                };
                let lhs_bound = side_bound(&cmp.lhs, ds);
                let rhs_bound = side_bound(&cmp.rhs, ds);
                // Equality with one bound side transfers the binding.
                let transferable =
                    cmp.op == ComparisonOp::Equal && (lhs_bound || rhs_bound);
                if !(lhs_bound && rhs_bound) && !transferable {
                    i += 1;
                    continue;
                }

                // Literal sides materialize as constants at flush time.
                let mut side_id = |term: &Term,
                                   ds: &mut DisjointSet,
                                   visitor: &mut V|
                 -> u32 {
                    match term {
                        Term::Variable(v) => ds.find(v.0),
                        Term::Literal(lit) => {
                            let id = *next_const_id;
                            *next_const_id += 1;
                            visitor.declare_constant(lit, id);
                            ds.mark_bound(id);
                            id
                        }
                    }
                };
                let lhs = side_id(&cmp.lhs, ds, visitor);
                let rhs = side_id(&cmp.rhs, ds, visitor);
                match cmp.op {
                    ComparisonOp::Equal => {
                        visitor.assert_equal(lhs, rhs);
                        let merged = ds.union(lhs, rhs);
                        ds.mark_bound(merged);
                    }
                    ComparisonOp::NotEqual => visitor.assert_not_equal(lhs, rhs),
                    ComparisonOp::Less => visitor.assert_less(lhs, rhs),
                    ComparisonOp::Greater => visitor.assert_greater(lhs, rhs),
                }
                pending.remove(i);
                emitted = true;
            }
            if !emitted {
                break;
            }
        }
    }
}

/// Scores a permutation by the count and nesting depth of free-variable
/// introductions. Lower is better: orderings that bind everything early and
/// shallow win.
#[derive(Debug, Default)]
pub struct ComplexityScorer {
    depth: usize,
    pub score: usize,
    pub committed: bool,
}

impl SipsVisitor for ComplexityScorer {
    fn enter_select(
        &mut self,
        _pred: &ParsedPredicate,
        _where_cols: &[UseColumn],
        select_cols: &[UseColumn],
    ) {
        self.depth += 1;
        self.score += self.depth * select_cols.len();
    }

    fn exit_select(&mut self, _pred: &ParsedPredicate) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn enter_aggregation(
        &mut self,
        _agg: &ParsedAggregate,
        _group: &[UseColumn],
        _config: &[UseColumn],
        aggregate_cols: &[UseColumn],
        _summary: &[UseColumn],
    ) {
        self.depth += 1;
        self.score += self.depth * aggregate_cols.len();
    }

    fn commit(&mut self) {
        self.committed = true;
    }

    fn cancel(&mut self, _reason: &Cancellation) {
        self.committed = false;
    }
}

/// Run the generator over every permutation and return the best-scoring
/// ordering, if any permutation commits.
pub fn best_permutation(
    arena: &ParseArena,
    clause: &ParsedClause,
    assumption: Option<usize>,
) -> Option<(Vec<usize>, usize)> {
    let mut generator = match assumption {
        Some(index) => SipsGenerator::with_assumption(arena, clause, index),
        None => SipsGenerator::new(arena, clause),
    };
    let mut best: Option<(Vec<usize>, usize)> = None;
    loop {
        let mut scorer = ComplexityScorer::default();
        if generator.visit(&mut scorer) {
            let candidate = (generator.permutation.clone(), scorer.score);
            best = match best {
                Some(prior) if prior.1 <= candidate.1 => Some(prior),
                _ => Some(candidate),
            };
        }
        if !generator.advance() {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorLog;
    use crate::intern::StringPool;
    use crate::parser::Parser;

    fn session(text: &str) -> (StringPool, ParseArena, ModuleIndex) {
        let pool = StringPool::new();
        let log = ErrorLog::new();
        let mut arena = ParseArena::new();
        let index = {
            let mut parser = Parser::new(&pool, log.clone());
            parser.parse_string(&mut arena, "test.dl", text)
        };
        assert!(log.is_empty(), "parse failed: {:?}", log.snapshot());
        (pool, arena, index)
    }

    /// Records callback order for assertions.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        committed: bool,
    }

    impl SipsVisitor for Recorder {
        fn declare_parameter(&mut self, col: &UseColumn) {
            self.events.push(format!("param:{}", col.n));
        }
        fn assert_present(&mut self, _pred: &ParsedPredicate, _cols: &[UseColumn]) {
            self.events.push("present".into());
        }
        fn assert_absent(&mut self, _pred: &ParsedPredicate, _cols: &[UseColumn]) {
            self.events.push("absent".into());
        }
        fn enter_select(
            &mut self,
            _pred: &ParsedPredicate,
            where_cols: &[UseColumn],
            select_cols: &[UseColumn],
        ) {
            self.events.push(format!("select:{}/{}", where_cols.len(), select_cols.len()));
        }
        fn exit_select(&mut self, _pred: &ParsedPredicate) {
            self.events.push("exit".into());
        }
        fn insert(&mut self, _decl: DeclId, cols: &[UseColumn], _negated: bool) {
            self.events.push(format!("insert:{}", cols.len()));
        }
        fn commit(&mut self) {
            self.committed = true;
        }
        fn cancel(&mut self, reason: &Cancellation) {
            self.events.push(format!("cancel:{reason:?}"));
        }
    }

    #[test]
    fn disjoint_set_union_carries_bound() {
        let mut ds = DisjointSet::new(4);
        ds.mark_bound(1);
        assert!(!ds.is_bound(0));
        ds.union(0, 1);
        assert!(ds.is_bound(0));
        ds.union(2, 3);
        assert!(!ds.is_bound(2));
    }

    #[test]
    fn next_permutation_cycles() {
        let mut v = vec![1, 2, 3];
        assert!(next_permutation(&mut v));
        assert_eq!(v, vec![1, 3, 2]);
        assert!(next_permutation(&mut v));
        assert_eq!(v, vec![2, 1, 3]);
        let mut count = 2;
        while next_permutation(&mut v) {
            count += 1;
        }
        assert_eq!(count, 5); // 3! - 1 advances
    }

    #[test]
    fn assumption_binds_parameters_first() {
        let (_, arena, index) = session(
            "#message edge(u32 X, u32 Y).\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n",
        );
        let clause = &arena.module(index).clauses[0];
        let generator = SipsGenerator::with_assumption(&arena, clause, 0);
        let mut rec = Recorder::default();
        assert!(generator.visit(&mut rec));
        assert!(rec.committed);
        assert_eq!(rec.events, vec!["param:0", "param:1", "insert:2"]);
    }

    #[test]
    fn join_selects_with_bound_pivot() {
        let (_, arena, index) = session(
            "#message edge(u32 X, u32 Y).\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );
        let clause = &arena.module(index).clauses[0];
        // Assume edge (body index 1) arrives; tc(X, Y) must be selected with
        // Y bound, X free.
        let generator = SipsGenerator::with_assumption(&arena, clause, 1);
        let mut rec = Recorder::default();
        assert!(generator.visit(&mut rec));
        assert_eq!(
            rec.events,
            vec!["param:0", "param:1", "select:1/1", "insert:2", "exit"]
        );
    }

    #[test]
    fn message_not_left_corner_cancels() {
        let (_, arena, index) = session(
            "#message edge(u32 X, u32 Y).\n\
             #export p(u32 X).\n\
             #export q(u32 X, u32 Y).\n\
             q(X, Y) : p(X), edge(X, Y).\n",
        );
        let clause = &arena.module(index).clauses[0];
        // No assumption: the message in the body cannot be evaluated.
        let generator = SipsGenerator::new(&arena, clause);
        let mut rec = Recorder::default();
        assert!(!generator.visit(&mut rec));
        assert!(rec.events.iter().any(|e| e.starts_with("cancel:Message")));
    }

    #[test]
    fn contradiction_cancels() {
        let (_, arena, index) = session(
            "#message e(u32 X).\n\
             #export p(u32 X).\n\
             #export q(u32 X).\n\
             q(X) : e(X), p(X), !p(X).\n",
        );
        let clause = &arena.module(index).clauses[0];
        let generator = SipsGenerator::with_assumption(&arena, clause, 0);
        let mut rec = Recorder::default();
        assert!(!generator.visit(&mut rec));
        assert!(rec.events.iter().any(|e| e.starts_with("cancel:Contradiction")));
    }

    #[test]
    fn best_permutation_prefers_bound_first() {
        let (_, arena, index) = session(
            "#message start(u32 X).\n\
             #export edge2(u32 X, u32 Y).\n\
             #export out(u32 X, u32 Y).\n\
             out(X, Y) : start(X), edge2(X, Y).\n",
        );
        let clause = &arena.module(index).clauses[0];
        let best = best_permutation(&arena, clause, Some(0)).expect("some ordering commits");
        // Only one orderable atom; score reflects the single free column.
        assert_eq!(best.0.len(), 1);
        assert_eq!(best.1, 1);
    }

    #[test]
    fn functor_binding_failure_cancels_ordering() {
        let (_, arena, index) = session(
            "#message num(u32 X).\n\
             #functor add1(bound u32 X, free u32 Y).\n\
             #export succ(u32 X, u32 Y).\n\
             succ(X, Y) : add1(X, Y), num(X).\n",
        );
        let clause = &arena.module(index).clauses[0];
        // With no assumption, the ordering [add1, num] fails (X unbound at
        // the functor) but [num, add1] commits; best_permutation finds it.
        let best = best_permutation(&arena, clause, None).expect("some ordering");
        assert_eq!(best.0, vec![1, 0]);
    }
}
