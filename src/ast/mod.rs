//! # Parsed AST
//!
//! The tree produced by the parser: modules owning declarations, clauses,
//! foreign types/constants, and inline code blocks. Declarations live in a
//! session-wide arena ([`ParseArena`]) so clauses in one module can reference
//! declarations imported from another by stable [`DeclId`].
//!
//! Redeclarations of the same `(name, arity)` form an equivalence class; the
//! first member fixes the canonical parameter types, later members may only
//! vary parameter bindings.

pub mod format;

use crate::display::{DisplayId, DisplayRange};
use crate::intern::StrId;
use crate::lex::NumberValue;
use crate::types::TypeKind;
use std::collections::HashMap;

/// Stable identity of a declaration within one parse session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

/// Identity of a clause within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClauseId(pub u32);

/// Clause-local variable id. All syntactic occurrences of one name inside a
/// clause share the id; each `_` gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// What kind of predicate a declaration introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKind {
    Local,
    Export,
    Query,
    Message,
    Functor,
}

impl DeclKind {
    pub fn directive_spelling(self) -> &'static str {
        match self {
            DeclKind::Local => "local",
            DeclKind::Export => "export",
            DeclKind::Query => "query",
            DeclKind::Message => "message",
            DeclKind::Functor => "functor",
        }
    }
}

/// Per-parameter binding attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Bound,
    Free,
    Aggregate,
    Summary,
    /// `mutable(merge_fn)`; the payload names the merge functor.
    Mutable(StrId),
}

impl Binding {
    /// Whether an argument that is already bound at the use site satisfies
    /// this attribute.
    pub fn accepts_bound(self) -> bool {
        matches!(self, Binding::Bound | Binding::Aggregate | Binding::Mutable(_))
    }

    /// Whether an unbound argument satisfies this attribute.
    pub fn accepts_free(self) -> bool {
        matches!(self, Binding::Free | Binding::Summary)
    }
}

/// A declared parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub binding: Option<Binding>,
    pub ty: TypeKind,
    pub name: StrId,
    pub range: DisplayRange,
}

/// Output multiplicity of a functor per input binding, from `@range(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctorRange {
    /// `?`: zero or one output.
    ZeroOrOne,
    /// `*`: any number of outputs.
    ZeroOrMore,
    /// `.`: exactly one output (a pure function).
    #[default]
    OneToOne,
    /// `+`: one or more outputs.
    OneOrMore,
}

impl FunctorRange {
    pub fn spelling(self) -> &'static str {
        match self {
            FunctorRange::ZeroOrOne => "?",
            FunctorRange::ZeroOrMore => "*",
            FunctorRange::OneToOne => ".",
            FunctorRange::OneOrMore => "+",
        }
    }
}

/// Pragma flags attached to a declaration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclPragmas {
    pub highlight: bool,
    pub impure: bool,
    pub product: bool,
    pub inline: bool,
    pub differential: bool,
    pub transparent: bool,
}

/// A declared predicate prototype.
#[derive(Debug, Clone)]
pub struct ParsedDeclaration {
    pub id: DeclId,
    pub kind: DeclKind,
    pub name: StrId,
    pub params: Vec<Parameter>,
    pub pragmas: DeclPragmas,
    /// Functor output multiplicity; meaningless for non-functors.
    pub range_hint: FunctorRange,
    pub range: DisplayRange,
    /// Index of this declaration within its redeclaration class.
    pub redecl_index: usize,
}

impl ParsedDeclaration {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_functor(&self) -> bool {
        self.kind == DeclKind::Functor
    }

    pub fn is_message(&self) -> bool {
        self.kind == DeclKind::Message
    }

    /// A zero-arity non-functor is a condition: a boolean fact implemented as
    /// a reference count.
    pub fn is_condition(&self) -> bool {
        self.params.is_empty() && self.kind != DeclKind::Functor
    }

    /// Functors whose outputs need no memoization: pure and exactly-one.
    pub fn is_pure_function(&self) -> bool {
        self.is_functor() && !self.pragmas.impure && self.range_hint == FunctorRange::OneToOne
    }
}

/// A literal constant appearing in a clause or `#constant`.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Bool(bool),
    Int(u128),
    Float(f64),
    String(StrId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: LiteralValue,
    /// Original spelling, kept so the printer reproduces hex/binary forms.
    pub spelling: StrId,
    pub ty: TypeKind,
    pub range: DisplayRange,
}

/// An argument position: either a clause variable or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Variable(VarId),
    Literal(Literal),
}

impl Term {
    pub fn as_variable(&self) -> Option<VarId> {
        match self {
            Term::Variable(v) => Some(*v),
            Term::Literal(_) => None,
        }
    }
}

/// A clause-local variable.
#[derive(Debug, Clone)]
pub struct ParsedVariable {
    pub id: VarId,
    pub name: StrId,
    /// `_` occurrences are anonymous: never unified by name.
    pub anonymous: bool,
    pub range: DisplayRange,
}

/// A positive or negated use of a declared predicate in a clause body.
#[derive(Debug, Clone)]
pub struct ParsedPredicate {
    pub decl: DeclId,
    pub args: Vec<Term>,
    pub negated: bool,
    pub range: DisplayRange,
}

/// Comparison operators permitted in clause bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

impl ComparisonOp {
    pub fn spelling(self) -> &'static str {
        match self {
            ComparisonOp::Equal => "=",
            ComparisonOp::NotEqual => "!=",
            ComparisonOp::Less => "<",
            ComparisonOp::Greater => ">",
        }
    }

    pub fn mirror(self) -> ComparisonOp {
        match self {
            ComparisonOp::Less => ComparisonOp::Greater,
            ComparisonOp::Greater => ComparisonOp::Less,
            other => other,
        }
    }
}

/// `lhs op rhs` between two terms.
#[derive(Debug, Clone)]
pub struct ParsedComparison {
    pub op: ComparisonOp,
    pub lhs: Term,
    pub rhs: Term,
    pub range: DisplayRange,
}

/// `Var = literal` constant assignment.
#[derive(Debug, Clone)]
pub struct ParsedAssignment {
    pub var: VarId,
    pub value: Literal,
    pub range: DisplayRange,
}

/// `functor(...) over predicate(...)` aggregation.
#[derive(Debug, Clone)]
pub struct ParsedAggregate {
    pub functor: ParsedPredicate,
    pub predicate: ParsedPredicate,
    pub range: DisplayRange,
}

/// One body item in written order.
#[derive(Debug, Clone)]
pub enum BodyItem {
    Predicate(ParsedPredicate),
    Comparison(ParsedComparison),
    Assignment(ParsedAssignment),
    Aggregate(ParsedAggregate),
}

/// A Horn clause. A negated head marks a deletion clause: its body proves
/// that the head tuple must be retracted.
#[derive(Debug, Clone)]
pub struct ParsedClause {
    pub id: ClauseId,
    pub head: DeclId,
    pub head_args: Vec<Term>,
    pub negated_head: bool,
    pub variables: Vec<ParsedVariable>,
    pub body: Vec<BodyItem>,
    pub range: DisplayRange,
}

impl ParsedClause {
    pub fn variable(&self, id: VarId) -> &ParsedVariable {
        &self.variables[id.0 as usize]
    }

    pub fn predicates(&self) -> impl Iterator<Item = &ParsedPredicate> {
        self.body.iter().filter_map(|item| match item {
            BodyItem::Predicate(p) => Some(p),
            _ => None,
        })
    }

    pub fn positive_predicates(&self) -> impl Iterator<Item = &ParsedPredicate> {
        self.predicates().filter(|p| !p.negated)
    }

    pub fn negated_predicates(&self) -> impl Iterator<Item = &ParsedPredicate> {
        self.predicates().filter(|p| p.negated)
    }

    pub fn comparisons(&self) -> impl Iterator<Item = &ParsedComparison> {
        self.body.iter().filter_map(|item| match item {
            BodyItem::Comparison(c) => Some(c),
            _ => None,
        })
    }

    pub fn assignments(&self) -> impl Iterator<Item = &ParsedAssignment> {
        self.body.iter().filter_map(|item| match item {
            BodyItem::Assignment(a) => Some(a),
            _ => None,
        })
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &ParsedAggregate> {
        self.body.iter().filter_map(|item| match item {
            BodyItem::Aggregate(a) => Some(a),
            _ => None,
        })
    }

    /// Head variables in parameter order (literals skipped).
    pub fn head_variables(&self) -> Vec<VarId> {
        self.head_args.iter().filter_map(Term::as_variable).collect()
    }
}

/// A `#foreign` type declaration with per-language representations.
#[derive(Debug, Clone)]
pub struct ForeignType {
    pub name: StrId,
    /// `(language, code, optional constructor suffix)` triples.
    pub representations: Vec<(StrId, StrId, Option<StrId>)>,
    pub range: DisplayRange,
}

/// A `#constant` declaration naming a typed foreign value.
#[derive(Debug, Clone)]
pub struct ForeignConstant {
    pub ty: TypeKind,
    pub name: StrId,
    pub value: Literal,
    pub range: DisplayRange,
}

/// Where an inline code block is spliced into emitted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineStage {
    Prologue,
    Epilogue,
}

#[derive(Debug, Clone)]
pub struct InlineCode {
    pub stage: InlineStage,
    pub language: StrId,
    pub code: StrId,
    pub range: DisplayRange,
}

/// An `#import "path"` reference, resolved to another module in the session.
#[derive(Debug, Clone)]
pub struct Import {
    pub path: StrId,
    pub module: ModuleIndex,
    pub range: DisplayRange,
}

/// Index of a module within its [`ParseArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIndex(pub u32);

/// Root of one source file's AST.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub index: ModuleIndex,
    pub display: DisplayId,
    /// The path this module was loaded from, interned.
    pub path: StrId,
    pub imports: Vec<Import>,
    /// Declarations introduced by this module, in order.
    pub declarations: Vec<DeclId>,
    pub clauses: Vec<ParsedClause>,
    pub foreign_types: Vec<ForeignType>,
    pub foreign_constants: Vec<ForeignConstant>,
    pub inlines: Vec<InlineCode>,
}

/// Session-wide ownership of declarations and modules. Declarations are
/// allocated here so modules can share them across imports.
#[derive(Debug, Default)]
pub struct ParseArena {
    pub declarations: Vec<ParsedDeclaration>,
    pub modules: Vec<ParsedModule>,
    /// `(name, arity)` → redeclaration class.
    redecl_classes: HashMap<(StrId, usize), Vec<DeclId>>,
}

impl ParseArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decl(&self, id: DeclId) -> &ParsedDeclaration {
        &self.declarations[id.0 as usize]
    }

    pub fn module(&self, index: ModuleIndex) -> &ParsedModule {
        &self.modules[index.0 as usize]
    }

    /// All declarations sharing `id`'s name and arity, in declaration order.
    pub fn redeclarations(&self, id: DeclId) -> &[DeclId] {
        let decl = self.decl(id);
        self.redecl_classes
            .get(&(decl.name, decl.arity()))
            .map_or(&[], Vec::as_slice)
    }

    /// The canonical (first) declaration of `id`'s class. Its parameter
    /// types are authoritative.
    pub fn canonical(&self, id: DeclId) -> &ParsedDeclaration {
        self.decl(self.redeclarations(id)[0])
    }

    /// Look up a declaration class by name and arity.
    pub fn lookup(&self, name: StrId, arity: usize) -> Option<DeclId> {
        self.redecl_classes.get(&(name, arity)).and_then(|c| c.first().copied())
    }

    /// Allocate a declaration and register it in its redeclaration class.
    pub fn add_declaration(&mut self, mut decl: ParsedDeclaration) -> DeclId {
        let id = DeclId(self.declarations.len() as u32);
        let class = self.redecl_classes.entry((decl.name, decl.arity())).or_default();
        decl.id = id;
        decl.redecl_index = class.len();
        class.push(id);
        self.declarations.push(decl);
        id
    }

    /// Modules in dependency order, leaves first, ending with `root`.
    pub fn modules_in_dependency_order(&self, root: ModuleIndex) -> Vec<ModuleIndex> {
        let mut order = Vec::new();
        let mut seen = vec![false; self.modules.len()];
        self.post_order(root, &mut seen, &mut order);
        order
    }

    fn post_order(&self, at: ModuleIndex, seen: &mut [bool], order: &mut Vec<ModuleIndex>) {
        if seen[at.0 as usize] {
            return;
        }
        seen[at.0 as usize] = true;
        for import in &self.module(at).imports {
            self.post_order(import.module, seen, order);
        }
        order.push(at);
    }

    /// All clauses of the transitive import closure of `root`, leaves first.
    pub fn clauses_in_dependency_order(&self, root: ModuleIndex) -> Vec<&ParsedClause> {
        self.modules_in_dependency_order(root)
            .into_iter()
            .flat_map(|m| self.module(m).clauses.iter())
            .collect()
    }
}

/// Interpret a lexed number against a declared type, for literal typing.
pub fn literal_value_for(value: NumberValue, ty: TypeKind) -> LiteralValue {
    match (value, ty) {
        (NumberValue::Int(v), TypeKind::Bool) => LiteralValue::Bool(v != 0),
        (NumberValue::Int(v), _) => LiteralValue::Int(v),
        (NumberValue::Float(v), _) => LiteralValue::Float(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DisplayRange;

    fn decl(name: StrId, arity: usize, kind: DeclKind) -> ParsedDeclaration {
        ParsedDeclaration {
            id: DeclId(0),
            kind,
            name,
            params: (0..arity)
                .map(|_| Parameter {
                    binding: None,
                    ty: TypeKind::Unsigned(32),
                    name: StrId::EMPTY,
                    range: DisplayRange::INVALID,
                })
                .collect(),
            pragmas: DeclPragmas::default(),
            range_hint: FunctorRange::default(),
            range: DisplayRange::INVALID,
            redecl_index: 0,
        }
    }

    #[test]
    fn redeclaration_classes() {
        let mut arena = ParseArena::new();
        let name = StrId(7);
        let a = arena.add_declaration(decl(name, 2, DeclKind::Query));
        let b = arena.add_declaration(decl(name, 2, DeclKind::Query));
        let c = arena.add_declaration(decl(name, 3, DeclKind::Local));

        assert_eq!(arena.redeclarations(a), &[a, b]);
        assert_eq!(arena.redeclarations(b), &[a, b]);
        assert_eq!(arena.redeclarations(c), &[c]);
        assert_eq!(arena.decl(b).redecl_index, 1);
        assert_eq!(arena.canonical(b).id, a);
    }

    #[test]
    fn condition_is_zero_arity_non_functor() {
        let mut arena = ParseArena::new();
        let cond = arena.add_declaration(decl(StrId(1), 0, DeclKind::Export));
        let func = arena.add_declaration(decl(StrId(2), 0, DeclKind::Functor));
        assert!(arena.decl(cond).is_condition());
        assert!(!arena.decl(func).is_condition());
    }
}
