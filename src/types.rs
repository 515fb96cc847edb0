//! # Value Types
//!
//! The type vocabulary shared by tokens, declarations, IR columns, and the
//! runtime. Built-in types are spelled `bool`, `iN`/`uN`/`fN` for sized
//! numbers, `utf8`, `ascii`, `bytes`, and `uuid`; foreign types are declared
//! with `#foreign` and referenced by name.

use crate::intern::StrId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A declared or built-in value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// Placeholder before type resolution.
    Invalid,
    Bool,
    /// Signed integer of the given bit width (8, 16, 32, 64).
    Signed(u16),
    /// Unsigned integer of the given bit width (8, 16, 32, 64).
    Unsigned(u16),
    /// IEEE float of the given bit width (32, 64).
    Float(u16),
    Utf8,
    Ascii,
    Bytes,
    Uuid,
    /// A `#foreign` type, named by its interned identifier.
    Foreign(StrId),
}

impl TypeKind {
    /// Parse a built-in type spelling. Foreign types resolve in the parser,
    /// not here.
    pub fn from_spelling(s: &str) -> Option<TypeKind> {
        match s {
            "bool" => return Some(TypeKind::Bool),
            "utf8" => return Some(TypeKind::Utf8),
            "ascii" => return Some(TypeKind::Ascii),
            "bytes" => return Some(TypeKind::Bytes),
            "uuid" => return Some(TypeKind::Uuid),
            _ => {}
        }
        let (head, rest) = s.split_at(1);
        let width: u16 = rest.parse().ok()?;
        match (head, width) {
            ("i", 8 | 16 | 32 | 64) => Some(TypeKind::Signed(width)),
            ("u", 8 | 16 | 32 | 64) => Some(TypeKind::Unsigned(width)),
            ("f", 32 | 64) => Some(TypeKind::Float(width)),
            _ => None,
        }
    }

    /// Whether a spelling is shaped like a built-in type name (and so must
    /// lex as a type token, valid or not).
    pub fn looks_like_type(s: &str) -> bool {
        matches!(s, "bool" | "utf8" | "ascii" | "bytes" | "uuid")
            || (s.len() >= 2
                && matches!(&s[..1], "i" | "u" | "f")
                && s[1..].bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, TypeKind::Invalid)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeKind::Signed(_) | TypeKind::Unsigned(_) | TypeKind::Float(_))
    }

    /// Spelling of a built-in type; foreign types render through the pool.
    pub fn builtin_spelling(&self) -> Option<String> {
        match self {
            TypeKind::Bool => Some("bool".to_string()),
            TypeKind::Signed(w) => Some(format!("i{w}")),
            TypeKind::Unsigned(w) => Some(format!("u{w}")),
            TypeKind::Float(w) => Some(format!("f{w}")),
            TypeKind::Utf8 => Some("utf8".to_string()),
            TypeKind::Ascii => Some("ascii".to_string()),
            TypeKind::Bytes => Some("bytes".to_string()),
            TypeKind::Uuid => Some("uuid".to_string()),
            TypeKind::Invalid | TypeKind::Foreign(_) => None,
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.builtin_spelling() {
            Some(s) => write!(f, "{s}"),
            None => match self {
                TypeKind::Foreign(id) => write!(f, "<foreign #{}>", id.0),
                _ => write!(f, "<invalid>"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtins() {
        assert_eq!(TypeKind::from_spelling("bool"), Some(TypeKind::Bool));
        assert_eq!(TypeKind::from_spelling("i32"), Some(TypeKind::Signed(32)));
        assert_eq!(TypeKind::from_spelling("u8"), Some(TypeKind::Unsigned(8)));
        assert_eq!(TypeKind::from_spelling("f64"), Some(TypeKind::Float(64)));
        assert_eq!(TypeKind::from_spelling("uuid"), Some(TypeKind::Uuid));
    }

    #[test]
    fn rejects_bad_widths() {
        assert_eq!(TypeKind::from_spelling("i7"), None);
        assert_eq!(TypeKind::from_spelling("f16"), None);
        assert_eq!(TypeKind::from_spelling("x32"), None);
        assert!(TypeKind::looks_like_type("i7"));
        assert!(!TypeKind::looks_like_type("edge"));
    }

    #[test]
    fn spelling_round_trips() {
        for s in ["bool", "i8", "i64", "u16", "f32", "utf8", "ascii", "bytes", "uuid"] {
            let t = TypeKind::from_spelling(s).expect("builtin");
            assert_eq!(t.builtin_spelling().as_deref(), Some(s));
        }
    }
}
