//! Parse/print round-trip tests.
//!
//! The pretty-printer is idempotent on its own output: printing a parsed
//! module and re-parsing yields a byte-identical print. Includes a
//! property-based sweep over generated modules.

use proptest::prelude::*;
use riverlog::ast::format::{format_module, FormatOptions};
use riverlog::ast::ParseArena;
use riverlog::parser::Parser;
use riverlog::{ErrorLog, StringPool};

fn print_of(source: &str) -> Result<String, String> {
    let pool = StringPool::new();
    let log = ErrorLog::new();
    let mut arena = ParseArena::new();
    let index = {
        let mut parser = Parser::new(&pool, log.clone());
        parser.parse_string(&mut arena, "test.dl", source)
    };
    if !log.is_empty() {
        return Err(format!("{:?}", log.snapshot()));
    }
    Ok(format_module(&pool, &arena, index, &FormatOptions::default()))
}

/// parse → print → parse → print must be a fixed point.
fn assert_round_trips(source: &str) {
    let first = print_of(source).expect("first parse");
    let second = print_of(&first).expect("printed output parses");
    assert_eq!(first, second, "printer not idempotent for:\n{source}");
}

#[test]
fn transitive_closure_round_trips() {
    assert_round_trips(
        "#message edge(u32 X, u32 Y).\n\
         #export tc(u32 X, u32 Y).\n\
         tc(X, Y) : edge(X, Y).\n\
         tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
    );
}

#[test]
fn every_directive_form_round_trips() {
    // One of every directive and clause-body kind.
    assert_round_trips(concat!(
        "#foreign handle ```c++ uint64_t ```.\n",
        "#constant u32 max_depth 64.\n",
        "#message edge(u32 X, u32 Y) @differential.\n",
        "#message node(u32 X).\n",
        "#export tc(u32 X, u32 Y).\n",
        "#export unreach(u32 X).\n",
        "#export reach(u32 X).\n",
        "#export flag.\n",
        "#local helper(u32 X, u32 Y).\n",
        "#query find_path(bound u32 From, free u32 To).\n",
        "#functor add1(bound u32 X, free u32 Y) @range(.).\n",
        "#functor count_per(bound u32 G, aggregate u32 V, summary u32 N).\n",
        "#export counts(u32 G, u32 N).\n",
        "#export nexts(u32 X, u32 Y).\n",
        "flag.\n",
        "tc(X, Y) : edge(X, Y).\n",
        "tc(X, Z) : tc(X, Y), edge(Y, Z), X != Z.\n",
        "reach(X) : node(X), X = 1.\n",
        "unreach(X) : node(X), !reach(X), flag.\n",
        "helper(X, Y) : edge(X, Y), X < Y.\n",
        "nexts(X, Y) : node(X), add1(X, Y).\n",
        "counts(G, N) : count_per(G, V, N) over edge(G, V).\n",
        "find_path(From, To) : tc(From, To).\n",
        "!reach(X) : node(X), X = 99.\n",
        "#prologue ```c++\n#include <cstdint>\n```.\n",
        "#epilogue ```python\npass\n```.\n",
    ));
}

#[test]
fn literal_spellings_are_preserved() {
    let printed = print_of(
        "#message m(u32 X, utf8 S, bool B).\n\
         #export p(u32 X).\n\
         p(X) : m(X, \"a\\nb\", true), X = 0x1f.\n",
    )
    .expect("parses");
    assert!(printed.contains("0x1f"));
    assert!(printed.contains("\"a\\nb\""));
    assert!(printed.contains("true"));
    assert_round_trips(&printed);
}

#[test]
fn anonymous_variables_round_trip() {
    assert_round_trips(
        "#message e(u32 X, u32 Y).\n\
         #export p(u32 X).\n\
         p(X) : e(X, _), e(_, X).\n",
    );
}

// ---------------------------------------------------------------------
// Property-based sweep
// ---------------------------------------------------------------------

fn ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}".prop_filter("reserved words", |s| {
        !matches!(
            s.as_str(),
            "bound" | "free" | "aggregate" | "summary" | "mutable" | "over" | "true" | "false"
                | "bool" | "utf8" | "ascii" | "bytes" | "uuid"
        ) && !(s.len() >= 2
            && matches!(&s[..1], "i" | "u" | "f")
            && s[1..].bytes().all(|b| b.is_ascii_digit()))
    })
}

fn type_name() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["bool", "u8", "u32", "u64", "i32", "i64", "f64", "utf8"])
}

prop_compose! {
    /// A tiny random module: a couple of relations plus single-join rules
    /// over them, always well-formed.
    fn module()(
        rel_a in ident(),
        rel_b in ident(),
        head in ident(),
        ty in type_name(),
        facts in prop::collection::vec(0u32..100, 0..4),
    ) -> Option<String> {
        if rel_a == rel_b || rel_a == head || rel_b == head {
            return None;
        }
        let mut src = String::new();
        src.push_str(&format!("#message {rel_a}({ty} X, {ty} Y).\n"));
        src.push_str(&format!("#export {rel_b}({ty} X, {ty} Y).\n"));
        src.push_str(&format!("#export {head}({ty} X, {ty} Y).\n"));
        src.push_str(&format!("{rel_b}(X, Y) : {rel_a}(X, Y).\n"));
        src.push_str(&format!("{head}(X, Z) : {rel_b}(X, Y), {rel_a}(Y, Z).\n"));
        for (i, f) in facts.iter().enumerate() {
            match ty {
                "bool" => {}
                "utf8" => src.push_str(&format!("{rel_b}(\"a{i}\", \"b{f}\").\n")),
                _ => src.push_str(&format!("{rel_b}({i}, {f}).\n")),
            }
        }
        Some(src)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn generated_modules_round_trip(source in module()) {
        if let Some(source) = source {
            let first = print_of(&source).expect("generated module parses");
            let second = print_of(&first).expect("print parses");
            prop_assert_eq!(first, second);
        }
    }
}
