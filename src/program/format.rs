//! # Program Listing
//!
//! Renders a [`Program`] as an indented procedural listing: one block per
//! table, index, vector, condition, and procedure. Code emitters for
//! concrete targets translate this same structure; the listing is the
//! target-neutral reference output written by `-o`.

use super::*;
use crate::ast::ParseArena;
use crate::intern::StringPool;
use std::fmt::Write as _;

pub struct ProgramFormatter<'a> {
    pool: &'a StringPool,
    arena: &'a ParseArena,
    program: &'a Program,
}

impl<'a> ProgramFormatter<'a> {
    pub fn new(pool: &'a StringPool, arena: &'a ParseArena, program: &'a Program) -> Self {
        ProgramFormatter { pool, arena, program }
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        for table in &self.program.tables {
            let name = match table.source {
                TableSource::Relation(decl) => {
                    self.pool.get(self.arena.canonical(decl).name).to_string()
                }
                TableSource::View(view) => format!("view_{}", view.0),
            };
            let cols: Vec<String> = table.columns.iter().map(ToString::to_string).collect();
            let _ = writeln!(out, "table t{} {} ({})", table.id.0, name, cols.join(", "));
            for &index in &table.indexes {
                let idx = self.program.index(index);
                let keys: Vec<String> = idx.key_columns.iter().map(ToString::to_string).collect();
                let covering = if idx.is_covering() { " covering" } else { "" };
                let _ = writeln!(out, "  index i{} [{}]{}", idx.id.0, keys.join(", "), covering);
            }
        }
        for vector in &self.program.vectors {
            let kind = match vector.kind {
                VectorKind::InputAdded => "added",
                VectorKind::InputRemoved => "removed",
                VectorKind::Induction => "induction",
                VectorKind::InductionSwap => "swap",
                VectorKind::Output => "output",
            };
            let cols: Vec<String> = vector.columns.iter().map(ToString::to_string).collect();
            let _ = writeln!(
                out,
                "vector v{} {} ({}) worker={}",
                vector.id.0,
                kind,
                cols.join(", "),
                vector.worker
            );
        }
        for condition in &self.program.conditions {
            let _ = writeln!(
                out,
                "condition {} refcount=${}",
                self.pool.get(self.arena.canonical(condition.decl).name),
                condition.variable.0
            );
        }
        for procedure in &self.program.procedures {
            self.procedure(&mut out, procedure);
        }
        out
    }

    fn procedure(&self, out: &mut String, procedure: &Procedure) {
        let kind = match procedure.kind {
            ProcedureKind::Initializer => "init".to_string(),
            ProcedureKind::MessageHandler(d) => {
                format!("on_{}", self.pool.get(self.arena.canonical(d).name))
            }
            ProcedureKind::TupleFinder(d) => {
                format!("find_{}", self.pool.get(self.arena.canonical(d).name))
            }
            ProcedureKind::TupleRemover(d) => {
                format!("remove_{}", self.pool.get(self.arena.canonical(d).name))
            }
            ProcedureKind::InductionCycleHandler => "induction_cycle".to_string(),
            ProcedureKind::InductionOutputHandler => "induction_output".to_string(),
        };
        let params: Vec<String> = procedure.params.iter().map(|p| self.var(*p)).collect();
        let vecs: Vec<String> =
            procedure.vector_params.iter().map(|v| format!("v{}", v.0)).collect();
        let _ = writeln!(
            out,
            "proc p{} {}({}) vectors=[{}]",
            procedure.id.0,
            kind,
            params.join(", "),
            vecs.join(", ")
        );
        self.region(out, &procedure.body, 1);
    }

    fn var(&self, id: VariableId) -> String {
        let v = self.program.variable(id);
        let name = self.pool.get(v.name);
        if name.is_empty() {
            format!("${}", id.0)
        } else {
            format!("${}:{}", id.0, name)
        }
    }

    fn vars(&self, ids: &[VariableId]) -> String {
        ids.iter().map(|&v| self.var(v)).collect::<Vec<_>>().join(", ")
    }

    fn region(&self, out: &mut String, region: &Region, depth: usize) {
        let pad = "  ".repeat(depth);
        match region {
            Region::Series(children) => {
                let _ = writeln!(out, "{pad}series");
                for child in children {
                    self.region(out, child, depth + 1);
                }
            }
            Region::Parallel(children) => {
                let _ = writeln!(out, "{pad}parallel");
                for child in children {
                    self.region(out, child, depth + 1);
                }
            }
            Region::LetBinding { vars, body } => {
                let _ = writeln!(out, "{pad}let {}", self.vars(vars));
                self.region(out, body, depth + 1);
            }
            Region::Call { procedure, args, result } => {
                let result = result.map_or(String::new(), |r| format!(" -> {}", self.var(r)));
                let _ = writeln!(out, "{pad}call p{}({}){}", procedure.0, self.vars(args), result);
            }
            Region::Return { value } => {
                let value = match value {
                    Some(true) => " true",
                    Some(false) => " false",
                    None => "",
                };
                let _ = writeln!(out, "{pad}return{value}");
            }
            Region::ExistenceAssertion { condition, increment } => {
                let op = if *increment { "increment" } else { "decrement" };
                let _ = writeln!(out, "{pad}{op} {}", self.var(*condition));
            }
            Region::ExistenceCheck { condition, expect_nonzero, body } => {
                let cmp = if *expect_nonzero { "!= 0" } else { "== 0" };
                let _ = writeln!(out, "{pad}if {} {cmp}", self.var(*condition));
                self.region(out, body, depth + 1);
            }
            Region::Generate { functor, inputs, outputs, negated, body } => {
                let name = self.pool.get(self.arena.canonical(*functor).name);
                let neg = if *negated { "!" } else { "" };
                let _ = writeln!(
                    out,
                    "{pad}generate {neg}{name}({}) -> ({})",
                    self.vars(inputs),
                    self.vars(outputs)
                );
                self.region(out, body, depth + 1);
            }
            Region::Induction { vectors, cycle, output } => {
                let vecs: Vec<String> = vectors.iter().map(|v| format!("v{}", v.0)).collect();
                let _ = writeln!(out, "{pad}induction [{}]", vecs.join(", "));
                let _ = writeln!(out, "{pad}cycle:");
                self.region(out, cycle, depth + 1);
                let _ = writeln!(out, "{pad}output:");
                self.region(out, output, depth + 1);
            }
            Region::VectorAppend { vector, vars } => {
                let _ = writeln!(out, "{pad}append v{} ({})", vector.0, self.vars(vars));
            }
            Region::VectorLoop { vector, vars, body } => {
                let _ = writeln!(out, "{pad}for v{} ({})", vector.0, self.vars(vars));
                self.region(out, body, depth + 1);
            }
            Region::VectorClear { vector } => {
                let _ = writeln!(out, "{pad}clear v{}", vector.0);
            }
            Region::VectorSwap { lhs, rhs } => {
                let _ = writeln!(out, "{pad}swap v{} v{}", lhs.0, rhs.0);
            }
            Region::VectorUnique { vector } => {
                let _ = writeln!(out, "{pad}unique v{}", vector.0);
            }
            Region::TransitionState { table, transition, vars, body } => {
                let arrow = match transition {
                    StateTransition::AbsentToPresent => "absent->present",
                    StateTransition::PresentToUnknown => "present->unknown",
                    StateTransition::UnknownToPresent => "unknown->present",
                    StateTransition::UnknownToAbsent => "unknown->absent",
                };
                let _ = writeln!(out, "{pad}transition t{} {arrow} ({})", table.0, self.vars(vars));
                self.region(out, body, depth + 1);
            }
            Region::CheckState { table, vars, branches } => {
                let _ = writeln!(out, "{pad}check t{} ({})", table.0, self.vars(vars));
                if let Some(present) = &branches.present {
                    let _ = writeln!(out, "{pad}present:");
                    self.region(out, present, depth + 1);
                }
                if let Some(absent) = &branches.absent {
                    let _ = writeln!(out, "{pad}absent:");
                    self.region(out, absent, depth + 1);
                }
                if let Some(unknown) = &branches.unknown {
                    let _ = writeln!(out, "{pad}unknown:");
                    self.region(out, unknown, depth + 1);
                }
            }
            Region::TableJoin { table, index, key_vars, out_vars, body } => {
                let _ = writeln!(
                    out,
                    "{pad}join t{} i{} keys=({}) -> ({})",
                    table.0,
                    index.0,
                    self.vars(key_vars),
                    self.vars(out_vars)
                );
                self.region(out, body, depth + 1);
            }
            Region::TableProduct { tables, out_vars, body } => {
                let ts: Vec<String> = tables.iter().map(|t| format!("t{}", t.0)).collect();
                let vs: Vec<String> = out_vars.iter().map(|v| self.vars(v)).collect();
                let _ = writeln!(out, "{pad}product [{}] -> ({})", ts.join(", "), vs.join("; "));
                self.region(out, body, depth + 1);
            }
            Region::TableScan { table, out_vars, body } => {
                let _ = writeln!(out, "{pad}scan t{} -> ({})", table.0, self.vars(out_vars));
                self.region(out, body, depth + 1);
            }
            Region::TupleCompare { op, lhs, rhs, body } => {
                let _ = writeln!(
                    out,
                    "{pad}if ({}) {} ({})",
                    self.vars(lhs),
                    op.spelling(),
                    self.vars(rhs)
                );
                self.region(out, body, depth + 1);
            }
            Region::Publish { message, vars, added } => {
                let name = self.pool.get(self.arena.canonical(*message).name);
                let tag = if *added { "+" } else { "-" };
                let _ = writeln!(out, "{pad}publish {tag}{name}({})", self.vars(vars));
            }
        }
    }
}
