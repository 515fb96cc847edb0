//! # Interface Schema
//!
//! FlatBuffers schema for the compiled database's wire surface: one table
//! per message with a field per parameter, `InputMessage` /
//! `OutputMessage` wrappers carrying `added` (and, for differential
//! messages, `removed`) vectors, request/response tables per query, and a
//! `Datalog` service with one RPC per query plus `Publish` and `Subscribe`.
//! A query RPC streams whenever any parameter is free.

use crate::ast::{Binding, DeclKind, ModuleIndex, ParseArena, ParsedDeclaration};
use crate::intern::StringPool;
use crate::types::TypeKind;
use std::fmt::Write as _;

/// FlatBuffers spelling of a parameter type.
fn fbs_type(pool: &StringPool, ty: TypeKind) -> String {
    match ty {
        TypeKind::Bool => "bool".to_string(),
        TypeKind::Signed(8) => "int8".to_string(),
        TypeKind::Signed(16) => "int16".to_string(),
        TypeKind::Signed(32) => "int32".to_string(),
        TypeKind::Signed(_) => "int64".to_string(),
        TypeKind::Unsigned(8) => "uint8".to_string(),
        TypeKind::Unsigned(16) => "uint16".to_string(),
        TypeKind::Unsigned(32) => "uint32".to_string(),
        TypeKind::Unsigned(_) => "uint64".to_string(),
        TypeKind::Float(32) => "float32".to_string(),
        TypeKind::Float(_) => "float64".to_string(),
        TypeKind::Utf8 | TypeKind::Ascii => "string".to_string(),
        TypeKind::Bytes | TypeKind::Uuid => "[uint8]".to_string(),
        TypeKind::Foreign(name) => pool.get(name).to_string(),
        TypeKind::Invalid => "uint64".to_string(),
    }
}

fn message_table(pool: &StringPool, out: &mut String, decl: &ParsedDeclaration) {
    let _ = writeln!(out, "table {}_{} {{", pool.get(decl.name), decl.arity());
    for param in &decl.params {
        let _ = writeln!(
            out,
            "  {}:{};",
            pool.get(param.name).to_lowercase(),
            fbs_type(pool, param.ty)
        );
    }
    out.push_str("}\n\n");
}

/// Generate the full `.fbs` text for the root module's import closure.
pub fn generate_interface(
    pool: &StringPool,
    arena: &ParseArena,
    root: ModuleIndex,
    namespace: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "namespace {namespace};\n");

    // Canonical declarations across the closure, in declaration order.
    let mut messages: Vec<&ParsedDeclaration> = Vec::new();
    let mut queries: Vec<&ParsedDeclaration> = Vec::new();
    for index in arena.modules_in_dependency_order(root) {
        for &decl_id in &arena.module(index).declarations {
            let decl = arena.decl(decl_id);
            if decl.redecl_index != 0 {
                continue;
            }
            match decl.kind {
                DeclKind::Message => messages.push(decl),
                DeclKind::Query => queries.push(decl),
                _ => {}
            }
        }
    }

    // Received messages are those defined by the outside world: every
    // message a clause body consumes. Published messages appear as heads.
    let mut received: Vec<&ParsedDeclaration> = Vec::new();
    let mut published: Vec<&ParsedDeclaration> = Vec::new();
    for message in &messages {
        let canonical = arena.redeclarations(message.id)[0];
        let mut is_published = false;
        let mut is_received = false;
        for index in arena.modules_in_dependency_order(root) {
            for clause in &arena.module(index).clauses {
                if arena.redeclarations(clause.head)[0] == canonical {
                    is_published = true;
                }
                if clause
                    .predicates()
                    .any(|p| arena.redeclarations(p.decl)[0] == canonical)
                {
                    is_received = true;
                }
            }
        }
        if is_published {
            published.push(message);
        }
        if is_received || !is_published {
            received.push(message);
        }
    }

    for &message in &messages {
        message_table(pool, &mut out, message);
    }

    let any_differential = received.iter().any(|m| m.pragmas.differential);

    out.push_str("table AddedInputMessage {\n");
    for message in &received {
        let _ = writeln!(
            out,
            "  {}:[{}_{}];",
            pool.get(message.name).to_lowercase(),
            pool.get(message.name),
            message.arity()
        );
    }
    out.push_str("}\n\n");

    if any_differential {
        out.push_str("table RemovedInputMessage {\n");
        for message in &received {
            if message.pragmas.differential {
                let _ = writeln!(
                    out,
                    "  {}:[{}_{}];",
                    pool.get(message.name).to_lowercase(),
                    pool.get(message.name),
                    message.arity()
                );
            }
        }
        out.push_str("}\n\n");
    }

    out.push_str("table InputMessage {\n  added:AddedInputMessage;\n");
    if any_differential {
        out.push_str("  removed:RemovedInputMessage;\n");
    }
    out.push_str("}\n\n");

    out.push_str("table AddedOutputMessage {\n");
    for message in &published {
        let _ = writeln!(
            out,
            "  {}:[{}_{}];",
            pool.get(message.name).to_lowercase(),
            pool.get(message.name),
            message.arity()
        );
    }
    out.push_str("}\n\n");

    let any_published_differential = published.iter().any(|m| m.pragmas.differential);
    if any_published_differential {
        out.push_str("table RemovedOutputMessage {\n");
        for message in &published {
            if message.pragmas.differential {
                let _ = writeln!(
                    out,
                    "  {}:[{}_{}];",
                    pool.get(message.name).to_lowercase(),
                    pool.get(message.name),
                    message.arity()
                );
            }
        }
        out.push_str("}\n\n");
    }

    out.push_str("table OutputMessage {\n  added:AddedOutputMessage;\n");
    if any_published_differential {
        out.push_str("  removed:RemovedOutputMessage;\n");
    }
    out.push_str("}\n\n");

    // Query request/response pairs.
    for query in &queries {
        let _ = writeln!(out, "table {}_{}_Request {{", pool.get(query.name), query.arity());
        for param in &query.params {
            if matches!(param.binding, Some(Binding::Bound)) {
                let _ = writeln!(
                    out,
                    "  {}:{};",
                    pool.get(param.name).to_lowercase(),
                    fbs_type(pool, param.ty)
                );
            }
        }
        out.push_str("}\n\n");

        let _ = writeln!(out, "table {}_{}_Response {{", pool.get(query.name), query.arity());
        for param in &query.params {
            let _ = writeln!(
                out,
                "  {}:{};",
                pool.get(param.name).to_lowercase(),
                fbs_type(pool, param.ty)
            );
        }
        out.push_str("}\n\n");
    }

    out.push_str("table Client {\n  id:[uint8];\n}\n\ntable Empty {}\n\nrpc_service Datalog {\n");
    for query in &queries {
        let streams = query
            .params
            .iter()
            .any(|p| matches!(p.binding, Some(Binding::Free)));
        let name = pool.get(query.name);
        if streams {
            let _ = writeln!(
                out,
                "  {name}({name}_{}_Request):{name}_{}_Response (streaming: \"server\");",
                query.arity(),
                query.arity()
            );
        } else {
            let _ = writeln!(
                out,
                "  {name}({name}_{}_Request):{name}_{}_Response;",
                query.arity(),
                query.arity()
            );
        }
    }
    out.push_str("  Publish(InputMessage):Empty;\n");
    out.push_str("  Subscribe(Client):OutputMessage (streaming: \"server\");\n");
    out.push_str("}\n\nroot_type InputMessage;\n");
    out
}
