//! # Module Transforms
//!
//! Source-to-source rewrites that run between parsing and lowering:
//!
//! - [`combine_modules`] amalgamates a root module's transitive import
//!   closure into one module, renaming locals so same-named helpers from
//!   different files cannot collide.
//! - [`proxy_externals_with_exports`] rewrites queries into plain exported
//!   relations fronted by a one-clause trampoline that keeps the query's
//!   binding pattern at a single definition site, where the scheduler turns
//!   it into an explicit join against the request input.
//!
//! Both are implemented as print-then-reparse: the rewritten module is
//! rendered to text and fed back through the parser, so every transform
//! output is by construction something the front end accepts.

use crate::ast::format::{format_module, FormatOptions};
use crate::ast::*;
use crate::error::ErrorLog;
use crate::intern::StringPool;
use crate::parser::Parser;
use std::collections::HashSet;
use std::fmt::Write as _;
use tracing::debug;

/// Combine `root` and everything it imports into a single new module. When
/// the root has no imports it is already combined and is returned as is.
pub fn combine_modules(
    pool: &StringPool,
    arena: &mut ParseArena,
    log: &ErrorLog,
    root: ModuleIndex,
) -> ModuleIndex {
    if arena.module(root).imports.is_empty() {
        return root;
    }
    let text = format_module(
        pool,
        arena,
        root,
        &FormatOptions { keep_imports: false, rename_locals: true },
    );
    debug!(bytes = text.len(), "amalgamating modules");
    let mut parser = Parser::new(pool, log.clone());
    parser.parse_string(arena, "<amalgamation>", &text)
}

/// Rewrite queries into proxied exports. A query is proxied when it has
/// bound parameters, more than one defining clause, or uses in other clause
/// bodies; its clauses then define `<name>_proxy` and the query keeps one
/// trampoline clause `q(..) : q_proxy(..).`.
pub fn proxy_externals_with_exports(
    pool: &StringPool,
    arena: &mut ParseArena,
    log: &ErrorLog,
    root: ModuleIndex,
) -> ModuleIndex {
    let combined = combine_modules(pool, arena, log, root);
    let module = arena.module(combined).clone();

    // Queries that need a proxy: keyed by canonical declaration.
    let mut proxied: HashSet<DeclId> = HashSet::new();
    for &decl_id in &module.declarations {
        let decl = arena.decl(decl_id);
        if decl.kind != DeclKind::Query || decl.redecl_index != 0 {
            continue;
        }
        let canonical = arena.redeclarations(decl_id)[0];
        let has_bound = decl
            .params
            .iter()
            .any(|p| matches!(p.binding, Some(Binding::Bound)));
        let num_clauses = module
            .clauses
            .iter()
            .filter(|c| arena.redeclarations(c.head)[0] == canonical)
            .count();
        let used = module.clauses.iter().any(|c| {
            c.predicates().any(|p| arena.redeclarations(p.decl)[0] == canonical)
        });
        if has_bound || num_clauses > 1 || used {
            proxied.insert(canonical);
        }
    }

    if proxied.is_empty() {
        return combined;
    }

    let emitter = ProxyEmitter { pool, arena, proxied: &proxied };
    let text = emitter.emit(&module);
    debug!(bytes = text.len(), proxied = proxied.len(), "proxying externals");
    let mut parser = Parser::new(pool, log.clone());
    parser.parse_string(arena, "<proxy-externals>", &text)
}

struct ProxyEmitter<'a> {
    pool: &'a StringPool,
    arena: &'a ParseArena,
    proxied: &'a HashSet<DeclId>,
}

impl ProxyEmitter<'_> {
    fn emit(&self, module: &ParsedModule) -> String {
        let mut out = String::new();

        for foreign in &module.foreign_types {
            let name = self.pool.get(foreign.name);
            for (language, code, constructor) in &foreign.representations {
                let _ = write!(
                    out,
                    "#foreign {} ```{}{}```",
                    name,
                    self.pool.get(*language),
                    self.pool.get(*code)
                );
                if let Some(suffix) = constructor {
                    let _ = write!(out, " ```{}```", self.pool.get(*suffix));
                }
                let _ = writeln!(out, ".");
            }
        }
        for constant in &module.foreign_constants {
            let value = match &constant.value.value {
                LiteralValue::String(id) => format!("\"{}\"", self.pool.get(*id)),
                _ => self.pool.get(constant.value.spelling).to_string(),
            };
            let _ = writeln!(
                out,
                "#constant {} {} {}.",
                constant.ty,
                self.pool.get(constant.name),
                value
            );
        }

        // Non-query declarations pass through unchanged; queries may grow a
        // proxy declaration plus a trampoline clause.
        let mut trampolines = String::new();
        for &decl_id in &module.declarations {
            let decl = self.arena.decl(decl_id);
            if decl.kind != DeclKind::Query {
                let _ = writeln!(out, "{}", self.declaration_text(decl, None));
                continue;
            }
            let canonical = self.arena.redeclarations(decl_id)[0];
            let _ = writeln!(out, "{}", self.declaration_text(decl, None));
            if self.proxied.contains(&canonical) && decl.redecl_index == 0 {
                let proxy_name = self.proxy_name(decl);
                let _ = writeln!(out, "{}", self.proxy_declaration_text(decl, &proxy_name));
                // q(P..) : q_proxy(P..).
                let params: Vec<String> = decl
                    .params
                    .iter()
                    .map(|p| self.pool.get(p.name).to_string())
                    .collect();
                let _ = writeln!(
                    trampolines,
                    "{}({}) : {}({}).",
                    self.pool.get(decl.name),
                    params.join(", "),
                    proxy_name,
                    params.join(", "),
                );
            }
        }

        for clause in &module.clauses {
            self.clause_text(&mut out, clause);
        }
        out.push_str(&trampolines);

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
        out
    }

    fn proxy_name(&self, decl: &ParsedDeclaration) -> String {
        format!("{}_proxy", self.pool.get(decl.name))
    }

    fn declaration_text(&self, decl: &ParsedDeclaration, rename: Option<&str>) -> String {
        let mut s = format!(
            "#{} {}",
            decl.kind.directive_spelling(),
            rename.map_or_else(|| self.pool.get(decl.name).to_string(), str::to_string)
        );
        if !decl.params.is_empty() {
            s.push('(');
            for (i, param) in decl.params.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                if let Some(binding) = param.binding {
                    match binding {
                        Binding::Bound => s.push_str("bound "),
                        Binding::Free => s.push_str("free "),
                        Binding::Aggregate => s.push_str("aggregate "),
                        Binding::Summary => s.push_str("summary "),
                        Binding::Mutable(m) => {
                            let _ = write!(s, "mutable({}) ", self.pool.get(m));
                        }
                    }
                }
                let ty = match param.ty {
                    crate::types::TypeKind::Foreign(name) => self.pool.get(name).to_string(),
                    other => other.to_string(),
                };
                let _ = write!(s, "{} {}", ty, self.pool.get(param.name));
            }
            s.push(')');
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
                s.push(' ');
                s.push_str(text);
            }
        }
        if decl.is_functor() && decl.range_hint != FunctorRange::OneToOne {
            let _ = write!(s, " @range({})", decl.range_hint.spelling());
        }
        s.push('.');
        s
    }

    /// The proxy is a plain export with the query's canonical types and no
    /// binding attributes.
    fn proxy_declaration_text(&self, decl: &ParsedDeclaration, proxy_name: &str) -> String {
        let mut s = format!("#export {proxy_name}");
        if !decl.params.is_empty() {
            s.push('(');
            for (i, param) in decl.params.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                let ty = match param.ty {
                    crate::types::TypeKind::Foreign(name) => self.pool.get(name).to_string(),
                    other => other.to_string(),
                };
                let _ = write!(s, "{} {}", ty, self.pool.get(param.name));
            }
            s.push(')');
        }
        s.push('.');
        s
    }

    fn clause_text(&self, out: &mut String, clause: &ParsedClause) {
        if clause.negated_head {
            out.push('!');
        }
        let head = self.arena.decl(clause.head);
        let head_canonical = self.arena.redeclarations(clause.head)[0];
        if self.proxied.contains(&head_canonical) {
            let _ = write!(out, "{}", self.proxy_name(head));
        } else {
            let _ = write!(out, "{}", self.pool.get(head.name));
        }
        self.args_text(out, clause, &clause.head_args);
        if !clause.body.is_empty() {
            out.push_str(" : ");
            for (i, item) in clause.body.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match item {
                    BodyItem::Predicate(pred) => self.predicate_text(out, clause, pred),
                    BodyItem::Comparison(cmp) => {
                        self.term_text(out, clause, &cmp.lhs);
                        let _ = write!(out, " {} ", cmp.op.spelling());
                        self.term_text(out, clause, &cmp.rhs);
                    }
                    BodyItem::Assignment(assign) => {
                        let value = match &assign.value.value {
                            LiteralValue::String(id) => {
                                format!("\"{}\"", self.pool.get(*id))
                            }
                            _ => self.pool.get(assign.value.spelling).to_string(),
                        };
                        let _ = write!(
                            out,
                            "{} = {}",
                            self.pool.get(clause.variable(assign.var).name),
                            value
                        );
                    }
                    BodyItem::Aggregate(agg) => {
                        self.predicate_text(out, clause, &agg.functor);
                        out.push_str(" over ");
                        self.predicate_text(out, clause, &agg.predicate);
                    }
                }
            }
        }
        out.push_str(".\n");
    }

    fn predicate_text(&self, out: &mut String, clause: &ParsedClause, pred: &ParsedPredicate) {
        if pred.negated {
            out.push('!');
        }
        let decl = self.arena.decl(pred.decl);
        let canonical = self.arena.redeclarations(pred.decl)[0];
        if self.proxied.contains(&canonical) {
            let _ = write!(out, "{}", self.proxy_name(decl));
        } else {
            let _ = write!(out, "{}", self.pool.get(decl.name));
        }
        self.args_text(out, clause, &pred.args);
    }

    fn args_text(&self, out: &mut String, clause: &ParsedClause, args: &[Term]) {
        if args.is_empty() {
            return;
        }
        out.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.term_text(out, clause, arg);
        }
        out.push(')');
    }

    fn term_text(&self, out: &mut String, clause: &ParsedClause, term: &Term) {
        match term {
            Term::Variable(v) => {
                let var = clause.variable(*v);
                if var.anonymous {
                    out.push('_');
                } else {
                    let _ = write!(out, "{}", self.pool.get(var.name));
                }
            }
            Term::Literal(lit) => match &lit.value {
                LiteralValue::String(id) => {
                    let _ = write!(out, "\"{}\"", self.pool.get(*id));
                }
                _ => {
                    let _ = write!(out, "{}", self.pool.get(lit.spelling));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(text: &str) -> (StringPool, ParseArena, ModuleIndex, ErrorLog) {
        let pool = StringPool::new();
        let log = ErrorLog::new();
        let mut arena = ParseArena::new();
        let index = {
            let mut parser = Parser::new(&pool, log.clone());
            parser.parse_string(&mut arena, "test.dl", text)
        };
        assert!(log.is_empty(), "parse failed: {:?}", log.snapshot());
        (pool, arena, index, log)
    }

    #[test]
    fn import_free_module_combines_to_itself() {
        let (pool, mut arena, index, log) = session(
            "#message e(u32 X, u32 Y).\n\
             #export p(u32 X).\n\
             p(X) : e(X, _).\n",
        );
        let combined = combine_modules(&pool, &mut arena, &log, index);
        assert_eq!(combined, index);
    }

    #[test]
    fn bound_query_is_proxied() {
        let (pool, mut arena, index, log) = session(
            "#message knows(utf8 A, utf8 B).\n\
             #query who_knows(bound utf8 Name, free utf8 Friend).\n\
             who_knows(N, F) : knows(N, F).\n",
        );
        let rewritten = proxy_externals_with_exports(&pool, &mut arena, &log, index);
        assert!(log.is_empty(), "{:?}", log.snapshot());
        assert_ne!(rewritten, index);

        let module = arena.module(rewritten);
        // The proxy export exists and the original clause now defines it.
        let proxy = module
            .declarations
            .iter()
            .map(|&d| arena.decl(d))
            .find(|d| &*pool.get(d.name) == "who_knows_proxy")
            .expect("proxy declared");
        assert_eq!(proxy.kind, DeclKind::Export);
        assert_eq!(proxy.arity(), 2);

        // One clause defines the proxy, one trampolines the query to it.
        let proxy_defs = module
            .clauses
            .iter()
            .filter(|c| arena.decl(c.head).name == proxy.name)
            .count();
        assert_eq!(proxy_defs, 1);
        let trampoline = module
            .clauses
            .iter()
            .find(|c| &*pool.get(arena.decl(c.head).name) == "who_knows")
            .expect("trampoline clause");
        assert_eq!(trampoline.predicates().count(), 1);
    }

    #[test]
    fn free_only_single_clause_query_is_untouched() {
        let (pool, mut arena, index, log) = session(
            "#message e(u32 X, u32 Y).\n\
             #query dump(free u32 X, free u32 Y).\n\
             dump(X, Y) : e(X, Y).\n",
        );
        let rewritten = proxy_externals_with_exports(&pool, &mut arena, &log, index);
        assert!(log.is_empty());
        assert_eq!(rewritten, index);
    }

    #[test]
    fn multi_clause_query_is_proxied() {
        let (pool, mut arena, index, log) = session(
            "#message a(u32 X).\n\
             #message b(u32 X).\n\
             #query all(free u32 X).\n\
             all(X) : a(X).\n\
             all(X) : b(X).\n",
        );
        let rewritten = proxy_externals_with_exports(&pool, &mut arena, &log, index);
        assert!(log.is_empty(), "{:?}", log.snapshot());
        let module = arena.module(rewritten);
        let proxy_defs = module
            .clauses
            .iter()
            .filter(|c| &*pool.get(arena.decl(c.head).name) == "all_proxy")
            .count();
        assert_eq!(proxy_defs, 2);
    }
}
