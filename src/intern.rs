//! # String Pool
//!
//! Process-wide interning of identifier, string, and code-block spellings.
//! Tokens carry a [`StrId`] instead of owned text so the AST and both IRs can
//! compare names by id. Entries live for the life of the compiler process and
//! are never freed piecewise.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handle into the string pool. Id 0 is always the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrId(pub u32);

impl StrId {
    pub const EMPTY: StrId = StrId(0);
}

struct PoolInner {
    strings: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, StrId>,
}

/// Interning table shared by the lexer, parser, and printers.
pub struct StringPool {
    inner: RwLock<PoolInner>,
}

impl StringPool {
    pub fn new() -> Self {
        let empty: Arc<str> = Arc::from("");
        let mut ids = HashMap::new();
        ids.insert(Arc::clone(&empty), StrId::EMPTY);
        StringPool {
            inner: RwLock::new(PoolInner { strings: vec![empty], ids }),
        }
    }

    /// Intern `text`, returning the existing id when already present.
    pub fn intern(&self, text: &str) -> StrId {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.ids.get(text) {
                return id;
            }
        }
        let mut inner = self.inner.write();
        // A racing writer may have inserted between the read and write locks.
        if let Some(&id) = inner.ids.get(text) {
            return id;
        }
        let id = StrId(inner.strings.len() as u32);
        let entry: Arc<str> = Arc::from(text);
        inner.strings.push(Arc::clone(&entry));
        inner.ids.insert(entry, id);
        id
    }

    /// Resolve an id back to its spelling.
    pub fn get(&self, id: StrId) -> Arc<str> {
        let inner = self.inner.read();
        Arc::clone(&inner.strings[id.0 as usize])
    }

    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        // The empty string is pre-seeded, so the pool is never truly empty.
        false
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StringPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringPool").field("len", &self.len()).finish()
    }
}
