//! # Data-Flow Canonicalization
//!
//! Equivalence-preserving rewrites over the view graph. Every pass keeps the
//! set of derivable head tuples unchanged:
//!
//! - identity Tuple forwarding collapses into the producer;
//! - structurally identical views deduplicate (one Select per relation and
//!   projection, merged Compares, shared subgraphs);
//! - Compares whose operands come from a single Join input hoist below the
//!   Join so the filter runs before the match;
//! - Join pivot source sets canonicalize by column id.
//!
//! Passes iterate to fixpoint: a collapse can expose a new duplicate.

use super::*;
use std::collections::HashMap;
use tracing::trace;

/// Run all passes to fixpoint.
pub fn canonicalize(query: &mut Query) {
    loop {
        let mut changed = false;
        changed |= collapse_identity_tuples(query);
        changed |= dedupe_views(query);
        changed |= hoist_compares(query);
        if !changed {
            break;
        }
    }
    canonicalize_join_pivots(query);
}

/// Redirect every consumer of `old` to `new`. Columns map positionally.
pub fn replace_view(query: &mut Query, old: ViewId, new: ViewId) {
    let old_cols = query.view(old).columns.clone();
    let new_cols = query.view(new).columns.clone();
    debug_assert_eq!(old_cols.len(), new_cols.len());
    let col_map: HashMap<ColId, ColId> =
        old_cols.iter().copied().zip(new_cols.iter().copied()).collect();

    for i in 0..query.views.len() {
        if query.views[i].dead || query.views[i].id == old {
            continue;
        }
        let view = &mut query.views[i];
        for input in &mut view.inputs {
            if *input == old {
                *input = new;
            }
        }
        for col in &mut view.input_columns {
            if let Some(&mapped) = col_map.get(col) {
                *col = mapped;
            }
        }
        if let ViewKind::Join { ref mut pivot_sources, .. } = view.kind {
            for set in pivot_sources {
                for col in set {
                    if let Some(&mapped) = col_map.get(col) {
                        *col = mapped;
                    }
                }
            }
        }
    }
    query.view_mut(old).dead = true;
    trace!(?old, ?new, "replaced view");
}

/// A Tuple with no constants that forwards exactly its single input's
/// columns in order adds nothing; its consumers read the input directly.
/// Terminal tuples (feeding Inserts) are kept: the Insert's operand shape is
/// part of the emission contract.
fn collapse_identity_tuples(query: &mut Query) -> bool {
    let successors = query.successors();
    let mut to_replace = Vec::new();
    for view in query.live_views() {
        let ViewKind::Tuple { ref constants } = view.kind else { continue };
        if !constants.is_empty() || view.inputs.len() != 1 {
            continue;
        }
        let input = query.view(view.inputs[0]);
        if view.input_columns != input.columns {
            continue;
        }
        if !view.positive_conditions.is_empty() || !view.negative_conditions.is_empty() {
            continue;
        }
        let feeds_insert = successors
            .get(&view.id)
            .is_some_and(|succs| {
                succs.iter().any(|&s| matches!(query.view(s).kind, ViewKind::Insert { .. }))
            });
        if feeds_insert {
            continue;
        }
        to_replace.push((view.id, view.inputs[0]));
    }
    let changed = !to_replace.is_empty();
    for (old, new) in to_replace {
        replace_view(query, old, new);
    }
    changed
}

/// Structural key of a view for common-subexpression elimination. Two views
/// with equal keys compute the same rows with the same column layout.
fn structural_key(query: &Query, view: &QueryView) -> Option<String> {
    // Sinks and conditions are effects, not expressions.
    if matches!(view.kind, ViewKind::Insert { .. } | ViewKind::Condition { .. }) {
        return None;
    }
    let mut key = format!("{:?}|", std::mem::discriminant(&view.kind));
    match &view.kind {
        ViewKind::Select { source } => key.push_str(&format!("{source:?}")),
        ViewKind::Tuple { constants } => key.push_str(&format!("{constants:?}")),
        ViewKind::Join { pivots, pivot_sources } => {
            key.push_str(&format!("{pivots}|{pivot_sources:?}"));
        }
        ViewKind::Compare { op, rhs_literal } => {
            key.push_str(&format!("{op:?}|{:?}", rhs_literal.as_ref().map(|l| &l.value)));
        }
        ViewKind::Map { functor, copied, negated } => {
            key.push_str(&format!("{functor:?}|{copied}|{negated}"));
        }
        ViewKind::Aggregate { functor, group, config } => {
            key.push_str(&format!("{functor:?}|{group}|{config}"));
        }
        ViewKind::Negate { copied } => key.push_str(&format!("{copied}")),
        ViewKind::Merge => {}
        ViewKind::KVIndex { keys, merge_functors } => {
            key.push_str(&format!("{keys}|{merge_functors:?}"));
        }
        ViewKind::Insert { .. } | ViewKind::Condition { .. } => unreachable!(),
    }
    key.push('|');
    key.push_str(&format!(
        "{:?}|{:?}|{:?}|{:?}",
        view.inputs, view.input_columns, view.positive_conditions, view.negative_conditions
    ));
    let _ = query;
    Some(key)
}

fn dedupe_views(query: &mut Query) -> bool {
    let mut seen: HashMap<String, ViewId> = HashMap::new();
    let mut to_replace = Vec::new();
    for view in query.live_views() {
        let Some(key) = structural_key(query, view) else { continue };
        match seen.get(&key) {
            Some(&canonical) => to_replace.push((view.id, canonical)),
            None => {
                seen.insert(key, view.id);
            }
        }
    }
    let changed = !to_replace.is_empty();
    for (old, new) in to_replace {
        replace_view(query, old, new);
    }
    changed
}

/// Hoist a Compare below a Join when all its operand columns come from one
/// input of that Join. Only shape-preserving compares move (outputs
/// positionally identical to inputs), so consumers are unaffected.
fn hoist_compares(query: &mut Query) -> bool {
    let mut changed = false;
    for i in 0..query.views.len() {
        if query.views[i].dead {
            continue;
        }
        let cmp_id = query.views[i].id;
        let (op, rhs_literal) = match &query.views[i].kind {
            ViewKind::Compare { op, rhs_literal } => (*op, rhs_literal.clone()),
            _ => continue,
        };
        // Shape-preserving: outputs mirror the input columns one-to-one.
        let cmp = query.view(cmp_id);
        if cmp.inputs.len() != 1 {
            continue;
        }
        let operands = if rhs_literal.is_some() { 1 } else { 2 };
        let join_id = cmp.inputs[0];
        let join = query.view(join_id);
        let ViewKind::Join { pivots, .. } = join.kind else { continue };
        if cmp.input_columns.len() != operands + join.columns.len()
            || cmp.input_columns[operands..] != join.columns[..]
            || cmp.columns.len() != join.columns.len()
        {
            continue;
        }

        // Every operand must be a non-pivot passthrough of the same input.
        let mut source_view: Option<ViewId> = None;
        let mut mapped_operands = Vec::new();
        let mut ok = true;
        for &operand in &cmp.input_columns[..operands] {
            let pos = join.columns.iter().position(|&c| c == operand);
            let Some(pos) = pos else {
                ok = false;
                break;
            };
            if pos < pivots {
                ok = false;
                break;
            }
            let input_col = join.input_columns[pos - pivots];
            let owner = query.column(input_col).view;
            if source_view.is_some_and(|v| v != owner) {
                ok = false;
                break;
            }
            source_view = Some(owner);
            mapped_operands.push(input_col);
        }
        if !ok {
            continue;
        }
        let Some(source) = source_view else { continue };

        // Build the hoisted compare over the join input, mirroring its
        // column layout.
        let source_cols = query.view(source).columns.clone();
        let out_specs: Vec<(crate::types::TypeKind, crate::intern::StrId)> = source_cols
            .iter()
            .map(|&c| {
                let col = query.column(c);
                (col.ty, col.name)
            })
            .collect();
        let mut input_columns = mapped_operands.clone();
        input_columns.extend(source_cols.iter().copied());
        let hoisted = query.add_view(
            ViewKind::Compare { op, rhs_literal },
            vec![source],
            input_columns,
            &out_specs,
        );

        // The join now reads from the hoisted compare instead of `source`.
        let hoisted_cols = query.view(hoisted).columns.clone();
        let col_map: HashMap<ColId, ColId> = source_cols
            .iter()
            .copied()
            .zip(hoisted_cols.iter().copied())
            .collect();
        {
            let join = query.view_mut(join_id);
            for input in &mut join.inputs {
                if *input == source {
                    *input = hoisted;
                }
            }
            for col in &mut join.input_columns {
                if let Some(&mapped) = col_map.get(col) {
                    *col = mapped;
                }
            }
            if let ViewKind::Join { ref mut pivot_sources, .. } = join.kind {
                for set in pivot_sources {
                    for col in set {
                        if let Some(&mapped) = col_map.get(col) {
                            *col = mapped;
                        }
                    }
                }
            }
        }

        // Consumers of the compare read the join directly now.
        replace_view(query, cmp_id, join_id);
        changed = true;
    }
    changed
}

/// Sort each pivot source set by column id so equivalent joins compare
/// equal under the structural key.
fn canonicalize_join_pivots(query: &mut Query) {
    for view in &mut query.views {
        if view.dead {
            continue;
        }
        if let ViewKind::Join { ref mut pivot_sources, .. } = view.kind {
            for set in pivot_sources {
                set.sort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::DeclId;
    use crate::intern::StrId;
    use crate::types::TypeKind;

    fn ty() -> TypeKind {
        TypeKind::Unsigned(32)
    }

    fn select(q: &mut Query, decl: u32, arity: usize) -> ViewId {
        let outputs: Vec<(TypeKind, StrId)> = (0..arity).map(|_| (ty(), StrId::EMPTY)).collect();
        q.add_view(
            ViewKind::Select { source: Source::Relation(DeclId(decl)) },
            vec![],
            vec![],
            &outputs,
        )
    }

    #[test]
    fn duplicate_selects_dedupe() {
        let mut q = Query::new();
        let a = select(&mut q, 0, 2);
        let b = select(&mut q, 0, 2);
        let a_col = q.view(a).columns[0];
        let b_col = q.view(b).columns[0];
        let _ta = q.add_view(ViewKind::Tuple { constants: vec![] }, vec![a], vec![a_col], &[(ty(), StrId::EMPTY)]);
        let _tb = q.add_view(ViewKind::Tuple { constants: vec![] }, vec![b], vec![b_col], &[(ty(), StrId::EMPTY)]);

        canonicalize(&mut q);
        let live_selects = q
            .live_views()
            .filter(|v| matches!(v.kind, ViewKind::Select { .. }))
            .count();
        assert_eq!(live_selects, 1);
    }

    #[test]
    fn identity_tuple_collapses() {
        let mut q = Query::new();
        let a = select(&mut q, 0, 2);
        let cols = q.view(a).columns.clone();
        let t = q.add_view(
            ViewKind::Tuple { constants: vec![] },
            vec![a],
            cols.clone(),
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );
        let t_cols = q.view(t).columns.clone();
        let consumer = q.add_view(
            ViewKind::Compare { op: crate::ast::ComparisonOp::Less, rhs_literal: None },
            vec![t],
            vec![t_cols[0], t_cols[1], t_cols[0], t_cols[1]],
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );

        canonicalize(&mut q);
        assert!(q.view(t).dead);
        let consumer = q.view(consumer);
        assert_eq!(consumer.inputs, vec![a]);
        assert_eq!(consumer.input_columns[0], cols[0]);
    }

    #[test]
    fn terminal_tuple_survives() {
        let mut q = Query::new();
        let a = select(&mut q, 0, 1);
        let cols = q.view(a).columns.clone();
        let t = q.add_view(
            ViewKind::Tuple { constants: vec![] },
            vec![a],
            cols,
            &[(ty(), StrId::EMPTY)],
        );
        let t_cols = q.view(t).columns.clone();
        let _ins = q.add_view(
            ViewKind::Insert { sink: Sink::Relation(DeclId(1)), deletion: false },
            vec![t],
            t_cols,
            &[],
        );
        canonicalize(&mut q);
        assert!(!q.view(t).dead);
    }

    #[test]
    fn compare_hoists_below_join() {
        let mut q = Query::new();
        let left = select(&mut q, 0, 2);
        let right = select(&mut q, 1, 2);
        let lc = q.view(left).columns.clone();
        let rc = q.view(right).columns.clone();
        // Join on left.1 == right.0; outputs: pivot, left.0, right.1.
        let join = q.add_view(
            ViewKind::Join { pivots: 1, pivot_sources: vec![vec![lc[1], rc[0]]] },
            vec![left, right],
            vec![lc[0], rc[1]],
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );
        let jc = q.view(join).columns.clone();
        // Compare right.1 (join output 2) against a passthrough shape.
        let cmp = q.add_view(
            ViewKind::Compare {
                op: crate::ast::ComparisonOp::Less,
                rhs_literal: Some(crate::ast::Literal {
                    value: crate::ast::LiteralValue::Int(5),
                    spelling: StrId::EMPTY,
                    ty: ty(),
                    range: crate::display::DisplayRange::INVALID,
                }),
            },
            vec![join],
            vec![jc[2], jc[0], jc[1], jc[2]],
            &[(ty(), StrId::EMPTY), (ty(), StrId::EMPTY), (ty(), StrId::EMPTY)],
        );

        canonicalize(&mut q);
        // The compare folded into a filter on `right`, below the join.
        assert!(q.view(cmp).dead);
        let join_view = q.view(join);
        assert!(join_view
            .inputs
            .iter()
            .any(|&i| matches!(q.view(i).kind, ViewKind::Compare { .. })));
    }
}
