//! # Semantic Checks
//!
//! Post-parse validation over the import closure of a root module:
//!
//! - **Range restriction**: every head parameter (and every compared
//!   variable) must be forced to a value by a positive predicate, an
//!   assignment, or an equality chain to such a variable.
//! - **Binding satisfaction**: each functor/query use must be consistent
//!   with at least one redeclaration's binding pattern.
//! - **Aggregation well-formedness**: aggregating functors need `aggregate`
//!   inputs fed by the aggregated predicate and `summary` outputs that do
//!   not leak into it.
//! - **Message placement**: at most one received message per clause body,
//!   never negated.
//! - **Stratification**: no dependency cycle may contain a negative edge.

pub mod stratify;

use crate::ast::*;
use crate::error::{ErrorLog, SemaError};
use crate::intern::StringPool;
use std::collections::HashSet;
use tracing::debug;

pub use stratify::{
    build_dependency_graph, find_sccs, stratify_with_negation, DependencyGraph, DependencyType,
    StratificationResult,
};

/// Run every check over the root module's import closure. Returns true when
/// no new errors were recorded.
pub fn check_module(
    pool: &StringPool,
    arena: &ParseArena,
    root: ModuleIndex,
    log: &ErrorLog,
) -> bool {
    let before = log.error_count();
    for clause in arena.clauses_in_dependency_order(root) {
        check_range_restriction(pool, arena, clause, log);
        check_binding_satisfaction(pool, arena, clause, log);
        check_aggregates(pool, arena, clause, log);
        check_message_placement(pool, arena, clause, log);
    }
    check_stratification(pool, arena, root, log);
    let ok = log.error_count() == before;
    debug!(ok, "semantic checks complete");
    ok
}

/// Variables bound by the clause body, closed under equality chains.
///
/// Functor uses do not bind on their own here: whether a functor's free
/// outputs count as bound depends on its inputs being satisfiable, which the
/// permutation search settles. For range restriction, a functor output
/// variable is treated as bound only when some redeclaration could produce
/// it, which for checking purposes means any functor use binds its `free` and
/// `summary` positions.
pub fn bound_variables(arena: &ParseArena, clause: &ParsedClause) -> HashSet<VarId> {
    let mut bound: HashSet<VarId> = HashSet::new();

    for item in &clause.body {
        match item {
            BodyItem::Predicate(pred) if !pred.negated => {
                let decl = arena.canonical(pred.decl);
                if decl.is_functor() {
                    // Outputs of a functor are values once its inputs are;
                    // inputs must come from elsewhere.
                    for (param, arg) in decl.params.iter().zip(&pred.args) {
                        if param.binding.is_some_and(Binding::accepts_free) {
                            if let Some(v) = arg.as_variable() {
                                bound.insert(v);
                            }
                        }
                    }
                } else {
                    for arg in &pred.args {
                        if let Some(v) = arg.as_variable() {
                            bound.insert(v);
                        }
                    }
                }
            }
            BodyItem::Assignment(assign) => {
                bound.insert(assign.var);
            }
            BodyItem::Aggregate(agg) => {
                // Group-by and summary outputs of the aggregation are bound;
                // so is everything the aggregated predicate produces.
                for arg in agg.functor.args.iter().chain(&agg.predicate.args) {
                    if let Some(v) = arg.as_variable() {
                        bound.insert(v);
                    }
                }
            }
            _ => {}
        }
    }

    // Close over `X = Y` equality chains.
    loop {
        let mut changed = false;
        for cmp in clause.comparisons() {
            if cmp.op != ComparisonOp::Equal {
                continue;
            }
            if let (Some(a), Some(b)) = (cmp.lhs.as_variable(), cmp.rhs.as_variable()) {
                if bound.contains(&a) && bound.insert(b) {
                    changed = true;
                }
                if bound.contains(&b) && bound.insert(a) {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    bound
}

/// Report every head parameter and compared variable that cannot be bound.
pub fn check_range_restriction(
    pool: &StringPool,
    arena: &ParseArena,
    clause: &ParsedClause,
    log: &ErrorLog,
) {
    let bound = bound_variables(arena, clause);

    for term in &clause.head_args {
        if let Some(v) = term.as_variable() {
            let var = clause.variable(v);
            if !bound.contains(&v) && !var.anonymous {
                log.error(
                    var.range,
                    SemaError::RangeRestriction { var: pool.get(var.name).to_string() },
                );
            }
        }
    }

    for cmp in clause.comparisons() {
        for term in [&cmp.lhs, &cmp.rhs] {
            if let Some(v) = term.as_variable() {
                let var = clause.variable(v);
                if !bound.contains(&v) {
                    log.error(
                        cmp.range,
                        SemaError::RangeRestriction { var: pool.get(var.name).to_string() },
                    );
                }
            }
        }
    }

    // Negated predicates may only mention bound variables.
    for pred in clause.negated_predicates() {
        for term in &pred.args {
            if let Some(v) = term.as_variable() {
                let var = clause.variable(v);
                if !bound.contains(&v) && !var.anonymous {
                    log.error(
                        pred.range,
                        SemaError::RangeRestriction { var: pool.get(var.name).to_string() },
                    );
                }
            }
        }
    }
}

/// Check that some redeclaration of each functor/query use tolerates the
/// use-site binding pattern. An argument bound elsewhere in the body can feed
/// any parameter (a `free` parameter generates, then a comparison filters);
/// an argument bound nowhere else needs a parameter that produces it.
pub fn check_binding_satisfaction(
    pool: &StringPool,
    arena: &ParseArena,
    clause: &ParsedClause,
    log: &ErrorLog,
) {
    for pred in clause.predicates() {
        let decl = arena.decl(pred.decl);
        if !matches!(decl.kind, DeclKind::Functor | DeclKind::Query) {
            continue;
        }

        // Variables bound without this use contributing.
        let bound = bound_variables_excluding(arena, clause, pred);
        let satisfiable = arena.redeclarations(pred.decl).iter().any(|&redecl| {
            let redecl = arena.decl(redecl);
            redecl.params.iter().zip(&pred.args).all(|(param, arg)| match arg {
                Term::Literal(_) => true,
                Term::Variable(v) => {
                    bound.contains(v)
                        || param.binding.is_none()
                        || param.binding.is_some_and(Binding::accepts_free)
                }
            })
        });
        if !satisfiable {
            log.error(
                pred.range,
                SemaError::BindingUnsatisfiable { name: pool.get(decl.name).to_string() },
            );
        }
    }
}

fn bound_variables_excluding(
    arena: &ParseArena,
    clause: &ParsedClause,
    skip: &ParsedPredicate,
) -> HashSet<VarId> {
    let mut bound: HashSet<VarId> = HashSet::new();
    for item in &clause.body {
        match item {
            BodyItem::Predicate(pred) if !pred.negated && !std::ptr::eq(pred, skip) => {
                let decl = arena.canonical(pred.decl);
                if decl.is_functor() {
                    continue;
                }
                for arg in &pred.args {
                    if let Some(v) = arg.as_variable() {
                        bound.insert(v);
                    }
                }
            }
            BodyItem::Assignment(assign) => {
                bound.insert(assign.var);
            }
            _ => {}
        }
    }
    bound
}

/// Aggregation rules: the functor must declare `aggregate` and `summary`
/// parameters; every `aggregate` parameter must be fed by a variable of the
/// aggregated predicate; `summary` outputs must not occur inside it.
pub fn check_aggregates(
    pool: &StringPool,
    arena: &ParseArena,
    clause: &ParsedClause,
    log: &ErrorLog,
) {
    for agg in clause.aggregates() {
        let functor = arena.canonical(agg.functor.decl);
        if !functor.is_functor() {
            log.error(
                agg.range,
                SemaError::AggregateMisuse(format!(
                    "'{}' is not a functor",
                    pool.get(functor.name)
                )),
            );
            continue;
        }
        let has_aggregate = functor
            .params
            .iter()
            .any(|p| matches!(p.binding, Some(Binding::Aggregate)));
        let has_summary = functor
            .params
            .iter()
            .any(|p| matches!(p.binding, Some(Binding::Summary)));
        if !has_aggregate || !has_summary {
            log.error(
                agg.range,
                SemaError::AggregateMisuse(format!(
                    "'{}' needs aggregate and summary parameters",
                    pool.get(functor.name)
                )),
            );
            continue;
        }

        let inner_vars: HashSet<VarId> =
            agg.predicate.args.iter().filter_map(Term::as_variable).collect();

        for (param, arg) in functor.params.iter().zip(&agg.functor.args) {
            let Some(v) = arg.as_variable() else { continue };
            match param.binding {
                Some(Binding::Aggregate) if !inner_vars.contains(&v) => {
                    log.error(
                        agg.range,
                        SemaError::AggregateMisuse(format!(
                            "aggregate parameter '{}' is not produced by the aggregated predicate",
                            pool.get(clause.variable(v).name)
                        )),
                    );
                }
                Some(Binding::Summary) if inner_vars.contains(&v) => {
                    log.error(
                        agg.range,
                        SemaError::AggregateMisuse(format!(
                            "summary output '{}' escapes into the aggregated predicate",
                            pool.get(clause.variable(v).name)
                        )),
                    );
                }
                _ => {}
            }
        }
    }
}

/// Message placement: a clause body may contain at most one received message
/// (its left corner) and may never negate one.
pub fn check_message_placement(
    pool: &StringPool,
    arena: &ParseArena,
    clause: &ParsedClause,
    log: &ErrorLog,
) {
    let mut seen: Option<&ParsedPredicate> = None;
    for pred in clause.predicates() {
        let decl = arena.decl(pred.decl);
        if !decl.is_message() {
            continue;
        }
        if pred.negated {
            log.error(
                pred.range,
                SemaError::MessagePlacement {
                    name: pool.get(decl.name).to_string(),
                    reason: "cannot be negated".to_string(),
                },
            );
            continue;
        }
        if let Some(first) = seen {
            let first_decl = arena.decl(first.decl);
            log.error(
                pred.range,
                SemaError::MessagePlacement {
                    name: pool.get(decl.name).to_string(),
                    reason: format!(
                        "is a second received message in this body (after '{}')",
                        pool.get(first_decl.name)
                    ),
                },
            );
        } else {
            seen = Some(pred);
        }
    }
}

/// Stratification over the whole import closure.
pub fn check_stratification(
    pool: &StringPool,
    arena: &ParseArena,
    root: ModuleIndex,
    log: &ErrorLog,
) -> Option<StratificationResult> {
    let graph = build_dependency_graph(arena, root);
    match stratify_with_negation(&graph) {
        Ok(result) => Some(result),
        Err(cycle) => {
            // Report one representative cycle.
            let names: Vec<String> = cycle
                .iter()
                .map(|&d| pool.get(arena.decl(d).name).to_string())
                .collect();
            let repr = names.join(" -> ");
            let range = cycle
                .first()
                .map_or(crate::display::DisplayRange::INVALID, |&d| arena.decl(d).range);
            log.error(range, SemaError::NegationInCycle(repr));
            None
        }
    }
}
