//! # Parser
//!
//! A hand-written recursive-descent parser driven by lookahead on directive
//! tokens. Builds declarations (unifying redeclarations), clauses (resolving
//! variable occurrences to clause-local ids), foreign types and constants,
//! and inline code blocks. `#import`s resolve transitively through the
//! search path; cycles are errors.
//!
//! All user errors land in the shared [`ErrorLog`] and parsing continues at
//! the next `.` so one run reports as much as possible.

use crate::ast::*;
use crate::display::{DisplayConfig, DisplayId, DisplayRange};
use crate::error::{ErrorLog, ParseError};
use crate::intern::{StrId, StringPool};
use crate::lex::{Directive, Keyword, Lexer, NumberValue, Punct, Token, TokenKind};
use crate::types::TypeKind;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parser session state: the string pool, error log, module search paths,
/// and the import-resolution bookkeeping shared across recursive loads.
pub struct Parser<'p> {
    pool: &'p StringPool,
    log: ErrorLog,
    search_paths: Vec<PathBuf>,
    display_config: DisplayConfig,
    loaded: HashMap<PathBuf, ModuleIndex>,
    loading: Vec<PathBuf>,
}

impl<'p> Parser<'p> {
    pub fn new(pool: &'p StringPool, log: ErrorLog) -> Self {
        Parser {
            pool,
            log,
            search_paths: vec![PathBuf::from(".")],
            display_config: DisplayConfig::default(),
            loaded: HashMap::new(),
            loading: Vec::new(),
        }
    }

    /// Append a directory searched by `#import`.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    pub fn set_display_config(&mut self, config: DisplayConfig) {
        self.display_config = config;
    }

    pub fn log(&self) -> &ErrorLog {
        &self.log
    }

    /// Parse a file from disk, resolving imports relative to the search
    /// paths. Returns `None` when the file cannot be read.
    pub fn parse_file(&mut self, arena: &mut ParseArena, path: &Path) -> Option<ModuleIndex> {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if let Some(&index) = self.loaded.get(&canonical) {
            return Some(index);
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                self.log.error(
                    DisplayRange::INVALID,
                    ParseError::UnresolvedImport(format!("{}: {err}", path.display())),
                );
                return None;
            }
        };
        Some(self.parse_source(arena, canonical, &text))
    }

    /// Parse an in-memory module. Imports still resolve through the search
    /// paths.
    pub fn parse_string(
        &mut self,
        arena: &mut ParseArena,
        name: &str,
        text: &str,
    ) -> ModuleIndex {
        self.parse_source(arena, PathBuf::from(name), text)
    }

    fn parse_source(&mut self, arena: &mut ParseArena, path: PathBuf, text: &str) -> ModuleIndex {
        let index = ModuleIndex(arena.modules.len() as u32);
        let display = DisplayId(index.0);
        let path_id = self.pool.intern(&path.to_string_lossy());
        // Reserve the slot before descending into imports so indexes are
        // stable and self-imports are detectable.
        arena.modules.push(ParsedModule {
            index,
            display,
            path: path_id,
            imports: Vec::new(),
            declarations: Vec::new(),
            clauses: Vec::new(),
            foreign_types: Vec::new(),
            foreign_constants: Vec::new(),
            inlines: Vec::new(),
        });
        self.loaded.insert(path.clone(), index);
        self.loading.push(path);

        let tokens: Vec<Token> = Lexer::new(self.pool, display, self.display_config, text)
            .filter(|t| !t.is_trivia())
            .collect();
        debug!(module = index.0, tokens = tokens.len(), "parsing module");

        let mut module = ModuleParser { parser: self, arena, index, tokens, cursor: 0 };
        module.run();

        self.loading.pop();
        index
    }

    /// Resolve an import path against the search directories.
    fn resolve_import(&mut self, arena: &mut ParseArena, spelling: &str, range: DisplayRange)
        -> Option<ModuleIndex>
    {
        for dir in &self.search_paths.clone() {
            let candidate = dir.join(spelling);
            if !candidate.is_file() {
                continue;
            }
            let canonical = fs::canonicalize(&candidate).unwrap_or(candidate);
            if self.loading.contains(&canonical) {
                self.log.error(range, ParseError::ImportCycle(spelling.to_string()));
                return None;
            }
            if let Some(&index) = self.loaded.get(&canonical) {
                return Some(index);
            }
            let text = match fs::read_to_string(&canonical) {
                Ok(text) => text,
                Err(err) => {
                    self.log.error(
                        range,
                        ParseError::UnresolvedImport(format!("{spelling}: {err}")),
                    );
                    return None;
                }
            };
            return Some(self.parse_source(arena, canonical, &text));
        }
        self.log.error(range, ParseError::UnresolvedImport(spelling.to_string()));
        None
    }
}

/// Per-module cursor over the trivia-stripped token stream.
struct ModuleParser<'a, 'p> {
    parser: &'a mut Parser<'p>,
    arena: &'a mut ParseArena,
    index: ModuleIndex,
    tokens: Vec<Token>,
    cursor: usize,
}

/// Clause-local variable table.
struct ClauseContext {
    variables: Vec<ParsedVariable>,
    by_name: HashMap<StrId, VarId>,
    types: HashMap<VarId, TypeKind>,
}

impl ClauseContext {
    fn new() -> Self {
        ClauseContext { variables: Vec::new(), by_name: HashMap::new(), types: HashMap::new() }
    }

    fn variable(&mut self, pool: &StringPool, name: StrId, range: DisplayRange) -> VarId {
        let anonymous = &*pool.get(name) == "_";
        if !anonymous {
            if let Some(&id) = self.by_name.get(&name) {
                return id;
            }
        }
        let id = VarId(self.variables.len() as u32);
        self.variables.push(ParsedVariable { id, name, anonymous, range });
        if !anonymous {
            self.by_name.insert(name, id);
        }
        id
    }
}

impl ModuleParser<'_, '_> {
    fn run(&mut self) {
        while self.cursor < self.tokens.len() {
            self.item();
        }
    }

    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(tok)
    }

    fn at_punct(&self, p: Punct) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Punct(q), .. }) if *q == p)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn here(&self) -> DisplayRange {
        self.peek().map_or(DisplayRange::INVALID, |t| t.range)
    }

    fn expect_punct(&mut self, p: Punct) -> bool {
        if self.eat_punct(p) {
            return true;
        }
        let found = self.peek().map_or("end of input".to_string(), ToString::to_string);
        self.parser.log.error(
            self.here(),
            ParseError::UnexpectedToken(format!("expected '{}', found {found}", p.spelling())),
        );
        false
    }

    /// Error recovery: skip past the next `.` (or end of input).
    fn recover(&mut self) {
        while let Some(tok) = self.bump() {
            if matches!(tok.kind, TokenKind::Punct(Punct::Period)) {
                break;
            }
        }
    }

    fn error(&mut self, range: DisplayRange, err: ParseError) {
        self.parser.log.error(range, err);
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    fn item(&mut self) {
        let Some(tok) = self.peek().cloned() else { return };
        match tok.kind {
            TokenKind::Directive(directive) => {
                self.cursor += 1;
                self.directive(directive, tok.range);
            }
            TokenKind::Atom(_) | TokenKind::Punct(Punct::Bang) => {
                self.clause();
            }
            TokenKind::Invalid(err) => {
                self.cursor += 1;
                self.error(tok.range, ParseError::Lex(err));
            }
            _ => {
                self.cursor += 1;
                self.error(
                    tok.range,
                    ParseError::UnexpectedToken(format!("expected a directive or clause, found {tok}")),
                );
                self.recover();
            }
        }
    }

    fn directive(&mut self, directive: Directive, range: DisplayRange) {
        match directive {
            Directive::Local => self.declaration(DeclKind::Local),
            Directive::Export => self.declaration(DeclKind::Export),
            Directive::Query => self.declaration(DeclKind::Query),
            Directive::Message => self.declaration(DeclKind::Message),
            Directive::Functor => self.declaration(DeclKind::Functor),
            Directive::Import => self.import(range),
            Directive::Foreign => self.foreign_type(range),
            Directive::Constant => self.foreign_constant(range),
            Directive::Prologue => self.inline_code(InlineStage::Prologue, range),
            Directive::Epilogue => self.inline_code(InlineStage::Epilogue, range),
        }
    }

    fn import(&mut self, range: DisplayRange) {
        let Some(tok) = self.bump() else {
            self.error(range, ParseError::UnexpectedToken("expected import path".into()));
            return;
        };
        let TokenKind::String(path_id) = tok.kind else {
            self.error(tok.range, ParseError::UnexpectedToken("expected a quoted import path".into()));
            self.recover();
            return;
        };
        self.expect_punct(Punct::Period);
        let spelling = self.parser.pool.get(path_id).to_string();
        if let Some(target) = self.parser.resolve_import(self.arena, &spelling, tok.range) {
            self.arena.modules[self.index.0 as usize].imports.push(Import {
                path: path_id,
                module: target,
                range: range.union(tok.range),
            });
        }
    }

    fn foreign_type(&mut self, range: DisplayRange) {
        let Some(name) = self.atom_name() else {
            self.recover();
            return;
        };
        let mut representations = Vec::new();
        while let Some(Token { kind: TokenKind::CodeBlock { .. }, .. }) = self.peek() {
            let Some(Token { kind: TokenKind::CodeBlock { language, code }, .. }) = self.bump()
            else {
                break;
            };
            // An immediately following bare code block is the constructor
            // suffix for this representation.
            let constructor = match self.peek() {
                Some(Token { kind: TokenKind::CodeBlock { language: l, code: c }, .. })
                    if *l == StrId::EMPTY =>
                {
                    let c = *c;
                    self.cursor += 1;
                    Some(c)
                }
                _ => None,
            };
            representations.push((language, code, constructor));
        }
        self.expect_punct(Punct::Period);
        self.arena.modules[self.index.0 as usize].foreign_types.push(ForeignType {
            name,
            representations,
            range,
        });
    }

    fn foreign_constant(&mut self, range: DisplayRange) {
        let Some(ty) = self.type_ref() else {
            self.recover();
            return;
        };
        let Some(name) = self.atom_name() else {
            self.recover();
            return;
        };
        let Some(value) = self.literal(ty) else {
            self.recover();
            return;
        };
        self.expect_punct(Punct::Period);
        self.arena.modules[self.index.0 as usize].foreign_constants.push(ForeignConstant {
            ty,
            name,
            value,
            range,
        });
    }

    fn inline_code(&mut self, stage: InlineStage, range: DisplayRange) {
        match self.bump() {
            Some(Token { kind: TokenKind::CodeBlock { language, code }, .. }) => {
                self.expect_punct(Punct::Period);
                self.arena.modules[self.index.0 as usize].inlines.push(InlineCode {
                    stage,
                    language,
                    code,
                    range,
                });
            }
            other => {
                let r = other.map_or(range, |t| t.range);
                self.error(r, ParseError::UnexpectedToken("expected a code block".into()));
                self.recover();
            }
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn atom_name(&mut self) -> Option<StrId> {
        match self.peek() {
            Some(Token { kind: TokenKind::Atom(name), .. }) => {
                let name = *name;
                self.cursor += 1;
                Some(name)
            }
            _ => {
                let found = self.peek().map_or("end of input".to_string(), ToString::to_string);
                let range = self.here();
                self.error(
                    range,
                    ParseError::UnexpectedToken(format!("expected a name, found {found}")),
                );
                None
            }
        }
    }

    fn type_ref(&mut self) -> Option<TypeKind> {
        match self.peek() {
            Some(Token { kind: TokenKind::Type(ty), .. }) => {
                let ty = *ty;
                self.cursor += 1;
                Some(ty)
            }
            Some(Token { kind: TokenKind::Atom(name), .. }) => {
                let name = *name;
                self.cursor += 1;
                Some(TypeKind::Foreign(name))
            }
            _ => {
                let found = self.peek().map_or("end of input".to_string(), ToString::to_string);
                let range = self.here();
                self.error(
                    range,
                    ParseError::UnexpectedToken(format!("expected a type, found {found}")),
                );
                None
            }
        }
    }

    fn declaration(&mut self, kind: DeclKind) {
        let start = self.here();
        let Some(name) = self.atom_name() else {
            self.recover();
            return;
        };

        let mut params = Vec::new();
        if self.eat_punct(Punct::OpenParen) {
            loop {
                let Some(param) = self.parameter(kind) else {
                    self.recover();
                    return;
                };
                params.push(param);
                if self.eat_punct(Punct::Comma) {
                    continue;
                }
                if !self.expect_punct(Punct::CloseParen) {
                    self.recover();
                    return;
                }
                break;
            }
        }

        let mut pragmas = DeclPragmas::default();
        let mut range_hint = FunctorRange::default();
        while let Some(Token { kind: TokenKind::Pragma(pragma), range }) = self.peek().cloned() {
            self.cursor += 1;
            match pragma {
                crate::lex::Pragma::Highlight => pragmas.highlight = true,
                crate::lex::Pragma::Impure => pragmas.impure = true,
                crate::lex::Pragma::Product => pragmas.product = true,
                crate::lex::Pragma::Inline => pragmas.inline = true,
                crate::lex::Pragma::Differential => pragmas.differential = true,
                crate::lex::Pragma::Transparent => pragmas.transparent = true,
                crate::lex::Pragma::Range => {
                    if !self.expect_punct(Punct::OpenParen) {
                        self.recover();
                        return;
                    }
                    range_hint = match self.bump() {
                        Some(Token { kind: TokenKind::Punct(Punct::Question), .. }) => {
                            FunctorRange::ZeroOrOne
                        }
                        Some(Token { kind: TokenKind::Punct(Punct::Asterisk), .. }) => {
                            FunctorRange::ZeroOrMore
                        }
                        Some(Token { kind: TokenKind::Punct(Punct::Period), .. }) => {
                            FunctorRange::OneToOne
                        }
                        Some(Token { kind: TokenKind::Punct(Punct::Plus), .. }) => {
                            FunctorRange::OneOrMore
                        }
                        other => {
                            let r = other.map_or(range, |t| t.range);
                            self.error(
                                r,
                                ParseError::UnexpectedToken(
                                    "expected one of '?', '*', '.', '+' in @range".into(),
                                ),
                            );
                            self.recover();
                            return;
                        }
                    };
                    if !self.expect_punct(Punct::CloseParen) {
                        self.recover();
                        return;
                    }
                }
            }
        }
        let end = self.here();
        self.expect_punct(Punct::Period);

        let decl = ParsedDeclaration {
            id: DeclId(0),
            kind,
            name,
            params,
            pragmas,
            range_hint,
            range: start.union(end),
            redecl_index: 0,
        };

        // Redeclaration check: the canonical member fixes kind and types.
        if let Some(first) = self.arena.lookup(name, decl.arity()) {
            let canonical = self.arena.decl(first);
            let compatible = canonical.kind == decl.kind
                && canonical
                    .params
                    .iter()
                    .zip(decl.params.iter())
                    .all(|(a, b)| a.ty == b.ty);
            if !compatible {
                let name_str = self.parser.pool.get(name).to_string();
                let prior = canonical.range;
                self.parser
                    .log
                    .error(
                        decl.range,
                        ParseError::RedeclarationMismatch { name: name_str, arity: decl.arity() },
                    )
                    .note(prior, "previous declaration is here");
                return;
            }
        }

        let id = self.arena.add_declaration(decl);
        self.arena.modules[self.index.0 as usize].declarations.push(id);
    }

    fn parameter(&mut self, kind: DeclKind) -> Option<Parameter> {
        let start = self.here();
        let binding = match self.peek() {
            Some(Token { kind: TokenKind::Keyword(kw), .. }) => {
                let kw = *kw;
                self.cursor += 1;
                Some(match kw {
                    Keyword::Bound => Binding::Bound,
                    Keyword::Free => Binding::Free,
                    Keyword::Aggregate => Binding::Aggregate,
                    Keyword::Summary => Binding::Summary,
                    Keyword::Mutable => {
                        if !self.expect_punct(Punct::OpenParen) {
                            return None;
                        }
                        let merge = self.atom_name()?;
                        if !self.expect_punct(Punct::CloseParen) {
                            return None;
                        }
                        Binding::Mutable(merge)
                    }
                    Keyword::Over => {
                        self.error(
                            start,
                            ParseError::UnexpectedToken("'over' is not a binding".into()),
                        );
                        return None;
                    }
                })
            }
            _ => None,
        };

        // Functors and queries require explicit bindings on every parameter.
        if binding.is_none() && matches!(kind, DeclKind::Functor | DeclKind::Query) {
            self.error(
                start,
                ParseError::UnexpectedToken(
                    "functor and query parameters need a binding (bound/free/...)".into(),
                ),
            );
            return None;
        }

        let ty = self.type_ref()?;
        let (name, range) = match self.bump() {
            Some(Token { kind: TokenKind::Variable(name), range }) => (name, range),
            other => {
                let r = other.map_or(start, |t| t.range);
                self.error(
                    r,
                    ParseError::UnexpectedToken("expected a parameter name".into()),
                );
                return None;
            }
        };
        Some(Parameter { binding, ty, name, range: start.union(range) })
    }

    // ------------------------------------------------------------------
    // Clauses
    // ------------------------------------------------------------------

    fn clause(&mut self) {
        let start = self.here();
        let negated_head = self.eat_punct(Punct::Bang);
        let Some(name) = self.atom_name() else {
            self.recover();
            return;
        };
        let mut ctx = ClauseContext::new();

        let Some((head, head_args)) = self.predicate_use(&mut ctx, name, start) else {
            self.recover();
            return;
        };

        let mut body = Vec::new();
        if self.eat_punct(Punct::Colon) {
            loop {
                let Some(item) = self.body_item(&mut ctx) else {
                    self.recover();
                    return;
                };
                body.push(item);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        let end = self.here();
        self.expect_punct(Punct::Period);

        let module = &mut self.arena.modules[self.index.0 as usize];
        let id = ClauseId(module.clauses.len() as u32);
        module.clauses.push(ParsedClause {
            id,
            head,
            head_args,
            negated_head,
            variables: ctx.variables,
            body,
            range: start.union(end),
        });
    }

    /// Parse the argument list of a use of `name` and resolve it against the
    /// declaration table.
    fn predicate_use(
        &mut self,
        ctx: &mut ClauseContext,
        name: StrId,
        start: DisplayRange,
    ) -> Option<(DeclId, Vec<Term>)> {
        let mut raw_args: Vec<(RawTerm, DisplayRange)> = Vec::new();
        if self.eat_punct(Punct::OpenParen) {
            loop {
                let range = self.here();
                let term = self.raw_term()?;
                raw_args.push((term, range));
                if self.eat_punct(Punct::Comma) {
                    continue;
                }
                if !self.expect_punct(Punct::CloseParen) {
                    return None;
                }
                break;
            }
        }

        let arity = raw_args.len();
        let Some(decl_id) = self.arena.lookup(name, arity) else {
            // Distinguish a wrong-arity use from a wholly unknown name.
            let name_str = self.parser.pool.get(name).to_string();
            let known_arity = self
                .arena
                .declarations
                .iter()
                .find(|d| d.name == name)
                .map(ParsedDeclaration::arity);
            match known_arity {
                Some(expected) => self.error(
                    start,
                    ParseError::ArityMismatch { name: name_str, expected, found: arity },
                ),
                None => self.error(
                    start,
                    ParseError::UnknownDeclaration { name: name_str, arity },
                ),
            }
            return None;
        };

        // Type arguments against the canonical declaration.
        let canonical = self.arena.canonical(decl_id).clone();
        let mut args = Vec::with_capacity(arity);
        for (i, (raw, range)) in raw_args.into_iter().enumerate() {
            let expected = canonical.params[i].ty;
            let term = self.typed_term(ctx, raw, expected, range, &canonical, i)?;
            args.push(term);
        }
        Some((decl_id, args))
    }

    fn typed_term(
        &mut self,
        ctx: &mut ClauseContext,
        raw: RawTerm,
        expected: TypeKind,
        range: DisplayRange,
        decl: &ParsedDeclaration,
        param: usize,
    ) -> Option<Term> {
        match raw {
            RawTerm::Variable(name) => {
                let id = ctx.variable(self.parser.pool, name, range);
                if let Some(&prior) = ctx.types.get(&id) {
                    if prior != expected {
                        let name_str = self.parser.pool.get(decl.name).to_string();
                        self.error(
                            range,
                            ParseError::TypeMismatch {
                                name: name_str,
                                param,
                                expected: expected.to_string(),
                                found: prior.to_string(),
                            },
                        );
                        return None;
                    }
                } else {
                    ctx.types.insert(id, expected);
                }
                Some(Term::Variable(id))
            }
            RawTerm::Literal(lit) => {
                let ok = match (&lit, expected) {
                    (RawLiteral::Number(NumberValue::Int(_), _), t) => {
                        t.is_numeric() || matches!(t, TypeKind::Bool | TypeKind::Uuid | TypeKind::Foreign(_))
                    }
                    (RawLiteral::Number(NumberValue::Float(_), _), TypeKind::Float(_)) => true,
                    (RawLiteral::Number(NumberValue::Float(_), _), _) => false,
                    (
                        RawLiteral::String(_),
                        TypeKind::Utf8 | TypeKind::Ascii | TypeKind::Bytes | TypeKind::Uuid
                        | TypeKind::Foreign(_),
                    ) => true,
                    (RawLiteral::String(_), _) => false,
                    (RawLiteral::Bool(_, _), TypeKind::Bool) => true,
                    (RawLiteral::Bool(_, _), _) => false,
                };
                if !ok {
                    let name_str = self.parser.pool.get(decl.name).to_string();
                    self.error(
                        range,
                        ParseError::TypeMismatch {
                            name: name_str,
                            param,
                            expected: expected.to_string(),
                            found: lit.describe().to_string(),
                        },
                    );
                    return None;
                }
                Some(Term::Literal(lit.into_literal(expected, range)))
            }
        }
    }

    fn raw_term(&mut self) -> Option<RawTerm> {
        match self.bump() {
            Some(Token { kind: TokenKind::Variable(name), .. }) => Some(RawTerm::Variable(name)),
            Some(Token { kind: TokenKind::Atom(name), .. }) => {
                // `true` / `false` are ordinary atoms with literal meaning.
                match &*self.parser.pool.get(name) {
                    "true" => Some(RawTerm::Literal(RawLiteral::Bool(true, name))),
                    "false" => Some(RawTerm::Literal(RawLiteral::Bool(false, name))),
                    other => {
                        let msg = format!("unexpected atom '{other}' in argument position");
                        let range = self.here();
                        self.error(range, ParseError::UnexpectedToken(msg));
                        None
                    }
                }
            }
            Some(Token { kind: TokenKind::Number { spelling, value }, .. }) => {
                Some(RawTerm::Literal(RawLiteral::Number(value, spelling)))
            }
            Some(Token { kind: TokenKind::String(id), .. }) => {
                Some(RawTerm::Literal(RawLiteral::String(id)))
            }
            other => {
                let r = other.as_ref().map_or(DisplayRange::INVALID, |t| t.range);
                let found = other.map_or("end of input".to_string(), |t| t.to_string());
                self.error(
                    r,
                    ParseError::UnexpectedToken(format!("expected an argument, found {found}")),
                );
                None
            }
        }
    }

    fn literal(&mut self, ty: TypeKind) -> Option<Literal> {
        let range = self.here();
        match self.raw_term()? {
            RawTerm::Literal(lit) => Some(lit.into_literal(ty, range)),
            RawTerm::Variable(_) => {
                self.error(range, ParseError::UnexpectedToken("expected a literal".into()));
                None
            }
        }
    }

    fn body_item(&mut self, ctx: &mut ClauseContext) -> Option<BodyItem> {
        let start = self.here();

        // Negated predicate.
        if self.eat_punct(Punct::Bang) {
            let name = self.atom_name()?;
            let (decl, args) = self.predicate_use(ctx, name, start)?;
            return Some(BodyItem::Predicate(ParsedPredicate {
                decl,
                args,
                negated: true,
                range: start.union(self.here()),
            }));
        }

        // Positive predicate, possibly an aggregation's functor.
        if let Some(Token { kind: TokenKind::Atom(name), .. }) = self.peek() {
            let name = *name;
            self.cursor += 1;
            let (decl, args) = self.predicate_use(ctx, name, start)?;
            let pred = ParsedPredicate { decl, args, negated: false, range: start.union(self.here()) };
            if let Some(Token { kind: TokenKind::Keyword(Keyword::Over), .. }) = self.peek() {
                self.cursor += 1;
                let inner_start = self.here();
                let inner_name = self.atom_name()?;
                let (inner_decl, inner_args) = self.predicate_use(ctx, inner_name, inner_start)?;
                let inner = ParsedPredicate {
                    decl: inner_decl,
                    args: inner_args,
                    negated: false,
                    range: inner_start.union(self.here()),
                };
                return Some(BodyItem::Aggregate(ParsedAggregate {
                    functor: pred,
                    predicate: inner,
                    range: start.union(self.here()),
                }));
            }
            return Some(BodyItem::Predicate(pred));
        }

        // Comparison or assignment: term op term.
        let lhs_range = self.here();
        let lhs = self.raw_term()?;
        let op = match self.bump() {
            Some(Token { kind: TokenKind::Punct(Punct::Equals), .. }) => ComparisonOp::Equal,
            Some(Token { kind: TokenKind::Punct(Punct::NotEquals), .. }) => ComparisonOp::NotEqual,
            Some(Token { kind: TokenKind::Punct(Punct::Less), .. }) => ComparisonOp::Less,
            Some(Token { kind: TokenKind::Punct(Punct::Greater), .. }) => ComparisonOp::Greater,
            other => {
                let r = other.map_or(lhs_range, |t| t.range);
                self.error(
                    r,
                    ParseError::UnexpectedToken("expected a comparison operator".into()),
                );
                return None;
            }
        };
        let rhs_range = self.here();
        let rhs = self.raw_term()?;
        let end = self.here();

        // `V = literal` (either side) is a constant assignment; everything
        // else is a comparison. Comparison types unify through the variable
        // table when one side is an untyped literal.
        match (lhs, rhs, op) {
            (RawTerm::Variable(name), RawTerm::Literal(lit), ComparisonOp::Equal)
            | (RawTerm::Literal(lit), RawTerm::Variable(name), ComparisonOp::Equal) => {
                let var = ctx.variable(self.parser.pool, name, lhs_range);
                let ty = ctx.types.get(&var).copied().unwrap_or(lit.natural_type());
                ctx.types.entry(var).or_insert(ty);
                Some(BodyItem::Assignment(ParsedAssignment {
                    var,
                    value: lit.into_literal(ty, rhs_range),
                    range: start.union(end),
                }))
            }
            (lhs, rhs, op) => {
                let lhs = self.comparison_term(ctx, lhs, lhs_range);
                let rhs = self.comparison_term(ctx, rhs, rhs_range);
                Some(BodyItem::Comparison(ParsedComparison {
                    op,
                    lhs,
                    rhs,
                    range: start.union(end),
                }))
            }
        }
    }

    fn comparison_term(&mut self, ctx: &mut ClauseContext, raw: RawTerm, range: DisplayRange) -> Term {
        match raw {
            RawTerm::Variable(name) => {
                Term::Variable(ctx.variable(self.parser.pool, name, range))
            }
            RawTerm::Literal(lit) => {
                let ty = lit.natural_type();
                Term::Literal(lit.into_literal(ty, range))
            }
        }
    }
}

/// Unresolved argument, before declaration types are known.
enum RawTerm {
    Variable(StrId),
    Literal(RawLiteral),
}

enum RawLiteral {
    Number(NumberValue, StrId),
    String(StrId),
    Bool(bool, StrId),
}

impl RawLiteral {
    fn describe(&self) -> &'static str {
        match self {
            RawLiteral::Number(NumberValue::Int(_), _) => "integer literal",
            RawLiteral::Number(NumberValue::Float(_), _) => "float literal",
            RawLiteral::String(_) => "string literal",
            RawLiteral::Bool(_, _) => "boolean literal",
        }
    }

    fn natural_type(&self) -> TypeKind {
        match self {
            RawLiteral::Number(NumberValue::Int(_), _) => TypeKind::Signed(64),
            RawLiteral::Number(NumberValue::Float(_), _) => TypeKind::Float(64),
            RawLiteral::String(_) => TypeKind::Utf8,
            RawLiteral::Bool(_, _) => TypeKind::Bool,
        }
    }

    fn into_literal(self, ty: TypeKind, range: DisplayRange) -> Literal {
        match self {
            RawLiteral::Number(value, spelling) => Literal {
                value: literal_value_for(value, ty),
                spelling,
                ty,
                range,
            },
            RawLiteral::String(id) => Literal {
                value: LiteralValue::String(id),
                spelling: id,
                ty,
                range,
            },
            RawLiteral::Bool(b, spelling) => Literal {
                value: LiteralValue::Bool(b),
                spelling,
                ty,
                range,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::format::{format_module, FormatOptions};

    fn parse(text: &str) -> (StringPool, ParseArena, ModuleIndex, ErrorLog) {
        let pool = StringPool::new();
        let log = ErrorLog::new();
        let mut arena = ParseArena::new();
        let index = {
            let mut parser = Parser::new(&pool, log.clone());
            parser.parse_string(&mut arena, "test.dl", text)
        };
        (pool, arena, index, log)
    }

    #[test]
    fn parses_declarations_and_clauses() {
        let (_, arena, index, log) = parse(
            "#message edge(u32 X, u32 Y).\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );
        assert!(log.is_empty(), "{:?}", log.snapshot());
        let module = arena.module(index);
        assert_eq!(module.declarations.len(), 2);
        assert_eq!(module.clauses.len(), 2);

        let recursive = &module.clauses[1];
        assert_eq!(recursive.variables.len(), 3);
        assert_eq!(recursive.predicates().count(), 2);
    }

    #[test]
    fn variable_occurrences_unify() {
        let (_, arena, index, log) = parse(
            "#message e(u32 X, u32 Y).\n\
             #export p(u32 X).\n\
             p(X) : e(X, X).\n",
        );
        assert!(log.is_empty());
        let clause = &arena.module(index).clauses[0];
        // X in head and both body positions share one id; total vars == 1.
        assert_eq!(clause.variables.len(), 1);
    }

    #[test]
    fn anonymous_variables_stay_distinct() {
        let (_, arena, index, log) = parse(
            "#message e(u32 X, u32 Y).\n\
             #export p(u32 X).\n\
             p(X) : e(X, _), e(_, X).\n",
        );
        assert!(log.is_empty());
        let clause = &arena.module(index).clauses[0];
        assert_eq!(clause.variables.len(), 3);
    }

    #[test]
    fn unknown_declaration_is_reported() {
        let (_, _, _, log) = parse("p(X) : q(X).\n");
        assert!(!log.is_empty());
        assert!(log.snapshot()[0].message.contains("unknown declaration"));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let (_, _, _, log) = parse(
            "#message e(u32 X, u32 Y).\n\
             #export p(u32 X).\n\
             p(X) : e(X).\n",
        );
        let msgs: Vec<_> = log.snapshot().iter().map(|d| d.message.clone()).collect();
        assert!(msgs.iter().any(|m| m.contains("2")), "{msgs:?}");
    }

    #[test]
    fn redeclaration_mismatch_notes_prior() {
        let (_, _, _, log) = parse(
            "#query who(bound utf8 Name, free u32 Id).\n\
             #query who(bound u64 Name, free u32 Id).\n",
        );
        let diags = log.snapshot();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("redeclaration"));
        assert_eq!(diags[0].notes.len(), 1);
    }

    #[test]
    fn compatible_redeclaration_varies_bindings() {
        let (_, arena, index, log) = parse(
            "#query who(bound utf8 Name, free u32 Id).\n\
             #query who(free utf8 Name, bound u32 Id).\n",
        );
        assert!(log.is_empty(), "{:?}", log.snapshot());
        let module = arena.module(index);
        let first = module.declarations[0];
        assert_eq!(arena.redeclarations(first).len(), 2);
    }

    #[test]
    fn negation_comparison_assignment_aggregate() {
        let (_, arena, index, log) = parse(
            "#message node(u32 X).\n\
             #message edge(u32 X, u32 Y).\n\
             #export unreach(u32 X).\n\
             #export reach(u32 X).\n\
             #functor count_per(bound u32 G, aggregate u32 V, summary u32 N).\n\
             #export counts(u32 G, u32 N).\n\
             unreach(X) : node(X), !reach(X).\n\
             reach(X) : node(X), X = 1.\n\
             reach(Y) : reach(X), edge(X, Y), X < Y.\n\
             counts(G, N) : count_per(G, V, N) over edge(G, V).\n",
        );
        assert!(log.is_empty(), "{:?}", log.snapshot());
        let module = arena.module(index);
        let unreach = &module.clauses[0];
        assert_eq!(unreach.negated_predicates().count(), 1);
        let assigned = &module.clauses[1];
        assert_eq!(assigned.assignments().count(), 1);
        let compared = &module.clauses[2];
        assert_eq!(compared.comparisons().count(), 1);
        let agg = &module.clauses[3];
        assert_eq!(agg.aggregates().count(), 1);
    }

    #[test]
    fn deletion_clause_has_negated_head() {
        let (_, arena, index, log) = parse(
            "#message retract(u32 X).\n\
             #export fact(u32 X).\n\
             !fact(X) : retract(X).\n",
        );
        assert!(log.is_empty(), "{:?}", log.snapshot());
        assert!(arena.module(index).clauses[0].negated_head);
    }

    #[test]
    fn recovery_continues_after_bad_item() {
        let (_, arena, index, log) = parse(
            "#message e(u32 X, u32 Y).\n\
             #export p(u32 ).\n\
             #export q(u32 X).\n\
             q(X) : e(X, _).\n",
        );
        assert!(!log.is_empty());
        // The bad declaration is skipped; later items still parse.
        let module = arena.module(index);
        assert_eq!(module.clauses.len(), 1);
    }

    #[test]
    fn print_parse_print_is_stable() {
        let (pool, arena, index, log) = parse(
            "#message edge(u32 X, u32 Y) @differential.\n\
             #export tc(u32 X, u32 Y).\n\
             tc(X, Y) : edge(X, Y).\n\
             tc(X, Z) : tc(X, Y), edge(Y, Z).\n",
        );
        assert!(log.is_empty());
        let printed = format_module(&pool, &arena, index, &FormatOptions::default());

        let pool2 = StringPool::new();
        let log2 = ErrorLog::new();
        let mut arena2 = ParseArena::new();
        let index2 = {
            let mut parser = Parser::new(&pool2, log2.clone());
            parser.parse_string(&mut arena2, "test.dl", &printed)
        };
        assert!(log2.is_empty(), "{:?}", log2.snapshot());
        let reprinted = format_module(&pool2, &arena2, index2, &FormatOptions::default());
        assert_eq!(printed, reprinted);
    }
}
