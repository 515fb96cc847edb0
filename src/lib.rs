//! # Riverlog
//!
//! An incremental Datalog compiler. Source programs declare relations,
//! functors, foreign types, and Horn clauses; the compiler lowers them
//! through a relational data-flow IR and a control-flow IR into a
//! target-independent program that maintains the full relational fixed
//! point under streaming inserts and deletes of message tuples, and
//! services query requests against materialized relations.
//!
//! ## Pipeline
//!
//! ```text
//! Datalog Source
//!     ↓
//! [Lexer]                 → tokens with display positions
//!     ↓
//! [Parser]                → ParsedModule (imports resolved)
//!     ↓
//! [Semantic Checks]       → range restriction, bindings, stratification
//!     ↓
//! [Transforms]            → amalgamation, proxied exports
//!     ↓
//! [SIPS + Data-Flow IR]   → Query view graph, canonicalized + labelled
//!     ↓
//! [Control-Flow IR]       → Program: tables, indexes, procedures
//!     ↓
//! [Emission]              → program listing, interface schema, DOT dump
//! ```
//!
//! The [`runtime`] module is the storage contract generated programs run
//! against: tables with ternary tuple states, secondary indexes, vectors,
//! condition reference counts, and a checksummed superblock.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use riverlog::Compiler;
//!
//! let mut compiler = Compiler::new();
//! let outcome = compiler.compile_file(Path::new("tc.dl"))?;
//! println!("{}", outcome.database);
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod display;
pub mod error;
pub mod intern;
pub mod lex;
pub mod parser;
pub mod program;
pub mod query;
pub mod runtime;
pub mod sema;
pub mod sips;
pub mod transform;
pub mod types;

pub use ast::{ModuleIndex, ParseArena, ParsedModule};
pub use config::Config;
pub use error::{BuildError, Diagnostic, ErrorLog, LexError, ParseError, SemaError};
pub use intern::{StrId, StringPool};
pub use program::Program;
pub use query::Query;
pub use types::TypeKind;

use ast::format::{format_module, FormatOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::info_span;

/// Everything one compilation produces.
pub struct CompileOutcome {
    pub arena: ParseArena,
    pub root: ModuleIndex,
    /// The module actually lowered (after amalgamation and proxying).
    pub lowered: ModuleIndex,
    pub query: Query,
    pub program: Program,
    /// The program IR listing with inline code spliced in.
    pub database: String,
    /// FlatBuffers interface schema.
    pub interface: String,
    /// Canonical single-module rendition of the whole input.
    pub amalgamation: String,
    /// DOT rendering of the data-flow graph.
    pub dot: String,
}

/// The compiler: pipeline orchestration over a shared string pool and
/// error log.
pub struct Compiler {
    pool: Arc<StringPool>,
    log: ErrorLog,
    config: Config,
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Compiler { pool: Arc::new(StringPool::new()), log: ErrorLog::new(), config }
    }

    pub fn log(&self) -> &ErrorLog {
        &self.log
    }

    pub fn pool(&self) -> &StringPool {
        &self.pool
    }

    fn parser<'p>(&self, pool: &'p StringPool) -> parser::Parser<'p> {
        let mut p = parser::Parser::new(pool, self.log.clone());
        p.set_display_config(self.config.display_config());
        for path in &self.config.modules.search_paths {
            p.add_search_path(path.clone());
        }
        for path in &self.config.modules.system_paths {
            p.add_search_path(path.clone());
        }
        p
    }

    /// Compile a file from disk. Returns `None` when any phase reported a
    /// user error; diagnostics stay on [`Compiler::log`].
    pub fn compile_file(&mut self, path: &Path) -> Option<CompileOutcome> {
        let pool = Arc::clone(&self.pool);
        let mut arena = ParseArena::new();
        let root = {
            let _span = info_span!("parse").entered();
            self.parser(&pool).parse_file(&mut arena, path)?
        };
        self.compile_parsed(arena, root)
    }

    /// Compile an in-memory module (imports still resolve via the search
    /// paths).
    pub fn compile_string(&mut self, name: &str, text: &str) -> Option<CompileOutcome> {
        let pool = Arc::clone(&self.pool);
        let mut arena = ParseArena::new();
        let root = {
            let _span = info_span!("parse").entered();
            self.parser(&pool).parse_string(&mut arena, name, text)
        };
        self.compile_parsed(arena, root)
    }

    fn compile_parsed(&mut self, mut arena: ParseArena, root: ModuleIndex) -> Option<CompileOutcome> {
        if !self.log.is_empty() {
            return None;
        }
        let pool = Arc::clone(&self.pool);

        {
            let _span = info_span!("sema").entered();
            if !sema::check_module(&pool, &arena, root, &self.log) {
                return None;
            }
        }

        let lowered = {
            let _span = info_span!("transform").entered();
            let lowered = transform::proxy_externals_with_exports(&pool, &mut arena, &self.log, root);
            if !self.log.is_empty() {
                return None;
            }
            // Proxying may introduce helper relations; re-check the result.
            if !sema::check_module(&pool, &arena, lowered, &self.log) {
                return None;
            }
            lowered
        };

        let query = {
            let _span = info_span!("dataflow").entered();
            let query = query::builder::QueryBuilder::new(&pool, &arena, self.log.clone())
                .build(lowered)
                .ok()?;
            if !self.log.is_empty() {
                return None;
            }
            query
        };

        let program = {
            let _span = info_span!("controlflow").entered();
            program::builder::build_program(&pool, &arena, &query).ok()?
        };

        let database = codegen::generate_database(&pool, &arena, lowered, &program);
        let interface = codegen::generate_interface(
            &pool,
            &arena,
            root,
            &self.config.emit.interface_namespace,
        );
        let amalgamation = format_module(
            &pool,
            &arena,
            root,
            &FormatOptions { keep_imports: false, rename_locals: true },
        );
        let dot = query::dot::to_dot(&pool, &query);

        Some(CompileOutcome {
            arena,
            root,
            lowered,
            query,
            program,
            database,
            interface,
            amalgamation,
            dot,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_transitive_closure() {
        let mut compiler = Compiler::new();
        let outcome = compiler
            .compile_string(
                "tc.dl",
                "#message edge(u32 X, u32 Y) @differential.\n\
                 #export tc(u32 X, u32 Y).\n\
                 tc(X, Y) : edge(X, Y).\n\
                 tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
            )
            .expect("compiles");
        assert!(compiler.log().is_empty());
        assert!(outcome.database.contains("proc"));
        assert!(outcome.interface.contains("rpc_service Datalog"));
        assert!(outcome.dot.starts_with("digraph"));
    }

    #[test]
    fn user_errors_fail_compilation() {
        let mut compiler = Compiler::new();
        let outcome = compiler.compile_string("bad.dl", "p(X) : q(X).\n");
        assert!(outcome.is_none());
        assert!(!compiler.log().is_empty());
    }

    #[test]
    fn stratification_errors_fail_compilation() {
        let mut compiler = Compiler::new();
        let outcome = compiler.compile_string(
            "bad.dl",
            "#message seed(u32 X).\n\
             #export p(u32 X).\n\
             #export q(u32 X).\n\
             p(X) : seed(X), !q(X).\n\
             q(X) : seed(X), !p(X).\n",
        );
        assert!(outcome.is_none());
    }
}
