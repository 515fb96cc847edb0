//! # Code Emission
//!
//! Target-independent outputs of the compiler: the program IR listing (the
//! reference form of the generated database) and the FlatBuffers interface
//! schema declaring messages, queries, and the `Datalog` RPC service.
//! Per-language backends translate the same program structure and are
//! external collaborators.

pub mod interface;

use crate::ast::{InlineStage, ModuleIndex, ParseArena};
use crate::intern::StringPool;
use crate::program::format::ProgramFormatter;
use crate::program::Program;

pub use interface::generate_interface;

/// Render the generated database: prologue code blocks, the program
/// listing, then epilogue code blocks, in module order.
pub fn generate_database(
    pool: &StringPool,
    arena: &ParseArena,
    root: ModuleIndex,
    program: &Program,
) -> String {
    let mut out = String::new();
    for index in arena.modules_in_dependency_order(root) {
        for inline in &arena.module(index).inlines {
            if inline.stage == InlineStage::Prologue {
                out.push_str(&pool.get(inline.code));
                out.push('\n');
            }
        }
    }

    out.push_str(&ProgramFormatter::new(pool, arena, program).format());

    for index in arena.modules_in_dependency_order(root) {
        for inline in &arena.module(index).inlines {
            if inline.stage == InlineStage::Epilogue {
                out.push_str(&pool.get(inline.code));
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorLog;
    use crate::parser::Parser;
    use crate::program::builder::build_program;
    use crate::query::builder::QueryBuilder;

    #[test]
    fn database_listing_splices_inline_code() {
        let pool = StringPool::new();
        let log = ErrorLog::new();
        let mut arena = ParseArena::new();
        let index = {
            let mut parser = Parser::new(&pool, log.clone());
            parser.parse_string(
                &mut arena,
                "test.dl",
                "#prologue ```c++\n#include <cstdint>\n```.\n\
                 #message tick(u32 T).\n\
                 #export seen(u32 T).\n\
                 seen(T) : tick(T).\n\
                 #epilogue ```c++\n// done\n```.\n",
            )
        };
        assert!(log.is_empty(), "{:?}", log.snapshot());
        let query = QueryBuilder::new(&pool, &arena, log.clone())
            .build(index)
            .expect("query");
        let program = build_program(&pool, &arena, &query).expect("program");

        let text = generate_database(&pool, &arena, index, &program);
        let include_at = text.find("#include <cstdint>").expect("prologue first");
        let table_at = text.find("table t").expect("listing present");
        let done_at = text.find("// done").expect("epilogue last");
        assert!(include_at < table_at && table_at < done_at);
    }
}
