//! # Module Pretty-Printer
//!
//! Renders a parsed module back to source text in a canonical layout:
//! imports, foreign types, constants, declarations, clauses, then inline
//! code blocks. The printer is idempotent on its own output, which is the
//! backbone of the parse/print round-trip property.
//!
//! Options support the amalgamation transform: `keep_imports = false` splices
//! the transitive import closure into one listing, and `rename_locals` gives
//! local predicates collision-free stable names for combined output.

use super::*;
use crate::intern::StringPool;
use std::fmt::Write as _;

/// Printer options.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Print `#import` lines as written; when false, inline the imported
    /// modules' contents in dependency order instead.
    pub keep_imports: bool,
    /// Rename `#local` predicates to `local_<id>` for stable diffable output
    /// of combined modules.
    pub rename_locals: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions { keep_imports: true, rename_locals: false }
    }
}

/// Render one module (or, with `keep_imports = false`, its whole import
/// closure) to canonical source text.
pub fn format_module(
    pool: &StringPool,
    arena: &ParseArena,
    root: ModuleIndex,
    opts: &FormatOptions,
) -> String {
    let mut out = String::new();
    let printer = Printer { pool, arena, opts };
    if opts.keep_imports {
        printer.module(&mut out, arena.module(root), true);
    } else {
        for index in arena.modules_in_dependency_order(root) {
            printer.module(&mut out, arena.module(index), false);
        }
    }
    out
}

struct Printer<'a> {
    pool: &'a StringPool,
    arena: &'a ParseArena,
    opts: &'a FormatOptions,
}

impl Printer<'_> {
    fn module(&self, out: &mut String, module: &ParsedModule, with_imports: bool) {
        if with_imports {
            for import in &module.imports {
                let _ = writeln!(out, "#import \"{}\".", self.pool.get(import.path));
            }
        }
        for foreign in &module.foreign_types {
            self.foreign_type(out, foreign);
        }
        for constant in &module.foreign_constants {
            self.foreign_constant(out, constant);
        }
        for &decl_id in &module.declarations {
            self.declaration(out, self.arena.decl(decl_id));
        }
        for clause in &module.clauses {
            self.clause(out, clause);
        }
        for inline in &module.inlines {
            let stage = match inline.stage {
                InlineStage::Prologue => "prologue",
                InlineStage::Epilogue => "epilogue",
            };
            let _ = writeln!(
                out,
                "#{} ```{}{}```.",
                stage,
                self.pool.get(inline.language),
                self.pool.get(inline.code)
            );
        }
    }

    fn decl_name(&self, decl: &ParsedDeclaration) -> String {
        if self.opts.rename_locals && decl.kind == DeclKind::Local {
            // Rename against the class head so redeclarations stay unified.
            let canonical = self.arena.redeclarations(decl.id)[0];
            format!("local_{}", canonical.0)
        } else {
            self.pool.get(decl.name).to_string()
        }
    }

    fn foreign_type(&self, out: &mut String, foreign: &ForeignType) {
        let name = self.pool.get(foreign.name);
        for (language, code, constructor) in &foreign.representations {
            let _ = write!(out, "#foreign {} ```{}{}```", name, self.pool.get(*language), self.pool.get(*code));
            if let Some(suffix) = constructor {
                let _ = write!(out, " ```{}```", self.pool.get(*suffix));
            }
            let _ = writeln!(out, ".");
        }
    }

    fn foreign_constant(&self, out: &mut String, constant: &ForeignConstant) {
        let _ = writeln!(
            out,
            "#constant {} {} {}.",
            constant.ty,
            self.pool.get(constant.name),
            self.literal(&constant.value)
        );
    }

    fn declaration(&self, out: &mut String, decl: &ParsedDeclaration) {
        let _ = write!(out, "#{} {}", decl.kind.directive_spelling(), self.decl_name(decl));
        if !decl.params.is_empty() {
            let _ = write!(out, "(");
            for (i, param) in decl.params.iter().enumerate() {
                if i > 0 {
                    let _ = write!(out, ", ");
                }
                if let Some(binding) = param.binding {
                    match binding {
                        Binding::Bound => {
                            let _ = write!(out, "bound ");
                        }
                        Binding::Free => {
                            let _ = write!(out, "free ");
                        }
                        Binding::Aggregate => {
                            let _ = write!(out, "aggregate ");
                        }
                        Binding::Summary => {
                            let _ = write!(out, "summary ");
                        }
                        Binding::Mutable(merge) => {
                            let _ = write!(out, "mutable({}) ", self.pool.get(merge));
                        }
                    }
                }
                let _ = write!(out, "{} {}", self.type_name(param.ty), self.pool.get(param.name));
            }
            let _ = write!(out, ")");
        }
        let p = decl.pragmas;
        for (set, text) in [
            (p.highlight, "@highlight"),
            (p.impure, "@impure"),
            (p.product, "@product"),
            (p.inline, "@inline"),
            (p.differential, "@differential"),
            (p.transparent, "@transparent"),
        ] {
            if set {
                let _ = write!(out, " {text}");
            }
        }
        if decl.is_functor() && decl.range_hint != FunctorRange::OneToOne {
            let _ = write!(out, " @range({})", decl.range_hint.spelling());
        }
        let _ = writeln!(out, ".");
    }

    fn type_name(&self, ty: TypeKind) -> String {
        match ty {
            TypeKind::Foreign(name) => self.pool.get(name).to_string(),
            other => other.to_string(),
        }
    }

    fn clause(&self, out: &mut String, clause: &ParsedClause) {
        if clause.negated_head {
            let _ = write!(out, "!");
        }
        let head = self.arena.decl(clause.head);
        let _ = write!(out, "{}", self.decl_name(head));
        self.args(out, clause, &clause.head_args);
        if !clause.body.is_empty() {
            let _ = write!(out, " : ");
            for (i, item) in clause.body.iter().enumerate() {
                if i > 0 {
                    let _ = write!(out, ", ");
                }
                self.body_item(out, clause, item);
            }
        }
        let _ = writeln!(out, ".");
    }

    fn body_item(&self, out: &mut String, clause: &ParsedClause, item: &BodyItem) {
        match item {
            BodyItem::Predicate(pred) => self.predicate(out, clause, pred),
            BodyItem::Comparison(cmp) => {
                self.term(out, clause, &cmp.lhs);
                let _ = write!(out, " {} ", cmp.op.spelling());
                self.term(out, clause, &cmp.rhs);
            }
            BodyItem::Assignment(assign) => {
                let _ = write!(
                    out,
                    "{} = {}",
                    self.pool.get(clause.variable(assign.var).name),
                    self.literal(&assign.value)
                );
            }
            BodyItem::Aggregate(agg) => {
                self.predicate(out, clause, &agg.functor);
                let _ = write!(out, " over ");
                self.predicate(out, clause, &agg.predicate);
            }
        }
    }

    fn predicate(&self, out: &mut String, clause: &ParsedClause, pred: &ParsedPredicate) {
        if pred.negated {
            let _ = write!(out, "!");
        }
        let _ = write!(out, "{}", self.decl_name(self.arena.decl(pred.decl)));
        self.args(out, clause, &pred.args);
    }

    fn args(&self, out: &mut String, clause: &ParsedClause, args: &[Term]) {
        if args.is_empty() {
            return;
        }
        let _ = write!(out, "(");
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                let _ = write!(out, ", ");
            }
            self.term(out, clause, arg);
        }
        let _ = write!(out, ")");
    }

    fn term(&self, out: &mut String, clause: &ParsedClause, term: &Term) {
        match term {
            Term::Variable(v) => {
                let var = clause.variable(*v);
                if var.anonymous {
                    let _ = write!(out, "_");
                } else {
                    let _ = write!(out, "{}", self.pool.get(var.name));
                }
            }
            Term::Literal(lit) => {
                let _ = write!(out, "{}", self.literal(lit));
            }
        }
    }

    fn literal(&self, lit: &Literal) -> String {
        match &lit.value {
            LiteralValue::String(id) => {
                let mut s = String::from("\"");
                for ch in self.pool.get(*id).chars() {
                    match ch {
                        '\n' => s.push_str("\\n"),
                        '\t' => s.push_str("\\t"),
                        '\r' => s.push_str("\\r"),
                        '\\' => s.push_str("\\\\"),
                        '"' => s.push_str("\\\""),
                        '\0' => s.push_str("\\0"),
                        other => s.push(other),
                    }
                }
                s.push('"');
                s
            }
            _ => self.pool.get(lit.spelling).to_string(),
        }
    }
}
