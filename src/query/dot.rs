//! # Data-Flow Dumps
//!
//! DOT and JSON renderings of the view graph for `--dot` output and
//! machine-readable inspection.

use super::*;
use crate::intern::StringPool;
use serde::Serialize;
use std::fmt::Write as _;

/// Render the live graph in GraphViz DOT form. Views become record nodes
/// listing their output columns; edges follow inputs.
pub fn to_dot(pool: &StringPool, query: &Query) -> String {
    let mut out = String::from("digraph dataflow {\n  rankdir=BT;\n  node [shape=record];\n");
    for view in query.live_views() {
        let mut label = format!("{} v{}", view.kind.name(), view.id.0);
        if view.can_produce_deletions {
            label.push_str(" [diff]");
        }
        let cols: Vec<String> = view
            .columns
            .iter()
            .map(|&c| {
                let col = query.column(c);
                let name = pool.get(col.name);
                if name.is_empty() {
                    format!("c{}", col.id.0)
                } else {
                    name.to_string()
                }
            })
            .collect();
        let _ = writeln!(
            out,
            "  v{} [label=\"{{{}|{}}}\"];",
            view.id.0,
            label,
            cols.join("|")
        );
        for &input in &view.inputs {
            let _ = writeln!(out, "  v{} -> v{};", input.0, view.id.0);
        }
        for &cond in &view.positive_conditions {
            let _ = writeln!(out, "  v{} -> v{} [style=dashed, label=\"+\"];", cond.0, view.id.0);
        }
        for &cond in &view.negative_conditions {
            let _ = writeln!(out, "  v{} -> v{} [style=dashed, label=\"-\"];", cond.0, view.id.0);
        }
    }
    out.push_str("}\n");
    out
}

#[derive(Serialize)]
struct ViewDump {
    id: u32,
    kind: &'static str,
    columns: Vec<ColumnDump>,
    inputs: Vec<u32>,
    can_receive_deletions: bool,
    can_produce_deletions: bool,
}

#[derive(Serialize)]
struct ColumnDump {
    id: u32,
    name: String,
    ty: String,
}

/// Machine-readable dump of the live graph.
pub fn to_json(pool: &StringPool, query: &Query) -> serde_json::Result<String> {
    let views: Vec<ViewDump> = query
        .live_views()
        .map(|view| ViewDump {
            id: view.id.0,
            kind: view.kind.name(),
            columns: view
                .columns
                .iter()
                .map(|&c| {
                    let col = query.column(c);
                    ColumnDump {
                        id: col.id.0,
                        name: pool.get(col.name).to_string(),
                        ty: col.ty.to_string(),
                    }
                })
                .collect(),
            inputs: view.inputs.iter().map(|v| v.0).collect(),
            can_receive_deletions: view.can_receive_deletions,
            can_produce_deletions: view.can_produce_deletions,
        })
        .collect();
    serde_json::to_string_pretty(&views)
}
