//! # Lexer
//!
//! Turns a display (a byte stream with a tab configuration) into a lazy
//! sequence of tokens. Whitespace is compressed but line-break counts are
//! preserved so the pretty-printer can reproduce blank-line structure.
//! Identifier, string, and code spellings are interned into the shared
//! [`StringPool`]. Lexical errors become [`TokenKind::Invalid`] tokens
//! carrying the offending error; lexing always continues.

use crate::display::{DisplayConfig, DisplayId, DisplayPosition, DisplayRange};
use crate::error::LexError;
use crate::intern::{StrId, StringPool};
use crate::types::TypeKind;
use std::fmt;
use std::sync::Arc;

/// Directive tokens (`#local`, `#export`, ...). Directives drive the
/// parser's lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    Local,
    Export,
    Query,
    Message,
    Functor,
    Foreign,
    Constant,
    Import,
    Prologue,
    Epilogue,
}

impl Directive {
    pub fn from_spelling(s: &str) -> Option<Directive> {
        Some(match s {
            "local" => Directive::Local,
            "export" => Directive::Export,
            "query" => Directive::Query,
            "message" => Directive::Message,
            "functor" => Directive::Functor,
            "foreign" => Directive::Foreign,
            "constant" => Directive::Constant,
            "import" => Directive::Import,
            "prologue" => Directive::Prologue,
            "epilogue" => Directive::Epilogue,
            _ => return None,
        })
    }

    pub fn spelling(self) -> &'static str {
        match self {
            Directive::Local => "local",
            Directive::Export => "export",
            Directive::Query => "query",
            Directive::Message => "message",
            Directive::Functor => "functor",
            Directive::Foreign => "foreign",
            Directive::Constant => "constant",
            Directive::Import => "import",
            Directive::Prologue => "prologue",
            Directive::Epilogue => "epilogue",
        }
    }
}

/// Parameter binding keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Bound,
    Free,
    Aggregate,
    Summary,
    Mutable,
    Over,
}

impl Keyword {
    pub fn from_spelling(s: &str) -> Option<Keyword> {
        Some(match s {
            "bound" => Keyword::Bound,
            "free" => Keyword::Free,
            "aggregate" => Keyword::Aggregate,
            "summary" => Keyword::Summary,
            "mutable" => Keyword::Mutable,
            "over" => Keyword::Over,
            _ => return None,
        })
    }

    pub fn spelling(self) -> &'static str {
        match self {
            Keyword::Bound => "bound",
            Keyword::Free => "free",
            Keyword::Aggregate => "aggregate",
            Keyword::Summary => "summary",
            Keyword::Mutable => "mutable",
            Keyword::Over => "over",
        }
    }
}

/// Pragmas (`@impure`, `@range(...)`, ...). `@range`'s argument is read by
/// the parser from the following tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pragma {
    Highlight,
    Impure,
    Product,
    Range,
    Inline,
    Differential,
    Transparent,
}

impl Pragma {
    pub fn from_spelling(s: &str) -> Option<Pragma> {
        Some(match s {
            "highlight" => Pragma::Highlight,
            "impure" => Pragma::Impure,
            "product" => Pragma::Product,
            "range" => Pragma::Range,
            "inline" => Pragma::Inline,
            "differential" => Pragma::Differential,
            "transparent" => Pragma::Transparent,
            _ => return None,
        })
    }

    pub fn spelling(self) -> &'static str {
        match self {
            Pragma::Highlight => "highlight",
            Pragma::Impure => "impure",
            Pragma::Product => "product",
            Pragma::Range => "range",
            Pragma::Inline => "inline",
            Pragma::Differential => "differential",
            Pragma::Transparent => "transparent",
        }
    }
}

/// Punctuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    Comma,
    Period,
    Colon,
    Bang,
    Equals,
    NotEquals,
    Less,
    Greater,
    Question,
    Asterisk,
    Plus,
}

impl Punct {
    pub fn spelling(self) -> &'static str {
        match self {
            Punct::OpenParen => "(",
            Punct::CloseParen => ")",
            Punct::OpenBrace => "{",
            Punct::CloseBrace => "}",
            Punct::Comma => ",",
            Punct::Period => ".",
            Punct::Colon => ":",
            Punct::Bang => "!",
            Punct::Equals => "=",
            Punct::NotEquals => "!=",
            Punct::Less => "<",
            Punct::Greater => ">",
            Punct::Question => "?",
            Punct::Asterisk => "*",
            Punct::Plus => "+",
        }
    }
}

/// Parsed payload of a number literal. The original spelling is kept so the
/// printer can reproduce hex and binary forms byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberValue {
    Int(u128),
    Float(f64),
}

/// What a token is.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Compressed whitespace; `newlines` counts the line breaks it covered.
    Whitespace { newlines: u32 },
    /// A `;` comment through end of line.
    Comment(StrId),
    Directive(Directive),
    Type(TypeKind),
    Keyword(Keyword),
    Pragma(Pragma),
    /// Lower-case-initial identifier (an atom).
    Atom(StrId),
    /// Upper-case-initial or `_` identifier (a variable).
    Variable(StrId),
    Number { spelling: StrId, value: NumberValue },
    String(StrId),
    /// Triple-backtick fenced code with a language tag.
    CodeBlock { language: StrId, code: StrId },
    Punct(Punct),
    /// A lexical error, recorded in place so parsing can continue.
    Invalid(LexError),
}

/// One token with its spelling range.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub range: DisplayRange,
}

impl Token {
    pub fn position(&self) -> DisplayPosition {
        self.range.from
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace { .. } | TokenKind::Comment(_))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TokenKind::Whitespace { .. } => write!(f, " "),
            TokenKind::Comment(_) => write!(f, "<comment>"),
            TokenKind::Directive(d) => write!(f, "#{}", d.spelling()),
            TokenKind::Type(t) => write!(f, "{t}"),
            TokenKind::Keyword(k) => write!(f, "{}", k.spelling()),
            TokenKind::Pragma(p) => write!(f, "@{}", p.spelling()),
            TokenKind::Atom(_) | TokenKind::Variable(_) => write!(f, "<ident>"),
            TokenKind::Number { .. } => write!(f, "<number>"),
            TokenKind::String(_) => write!(f, "<string>"),
            TokenKind::CodeBlock { .. } => write!(f, "<code>"),
            TokenKind::Punct(p) => write!(f, "{}", p.spelling()),
            TokenKind::Invalid(e) => write!(f, "<invalid: {e}>"),
        }
    }
}

/// The lexer. Call [`Lexer::next_token`] until it returns `None`, or use the
/// [`Iterator`] impl.
pub struct Lexer<'p> {
    pool: &'p StringPool,
    display: DisplayId,
    config: DisplayConfig,
    src: Vec<char>,
    /// Byte offsets for each char, plus one final entry for EOF.
    offsets: Vec<u64>,
    cursor: usize,
    line: u64,
    column: u64,
}

impl<'p> Lexer<'p> {
    pub fn new(pool: &'p StringPool, display: DisplayId, config: DisplayConfig, text: &str) -> Self {
        let mut src = Vec::with_capacity(text.len());
        let mut offsets = Vec::with_capacity(text.len() + 1);
        for (off, ch) in text.char_indices() {
            src.push(ch);
            offsets.push(off as u64);
        }
        offsets.push(text.len() as u64);
        Lexer { pool, display, config, src, offsets, cursor: 0, line: 1, column: 1 }
    }

    /// Lex the whole display eagerly.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token() {
            out.push(tok);
        }
        out
    }

    fn pos(&self) -> DisplayPosition {
        DisplayPosition::new(self.display, self.offsets[self.cursor], self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.cursor).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.src.get(self.cursor + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.cursor += 1;
        match ch {
            '\n' => {
                self.line += 1;
                self.column = 1;
            }
            '\t' => {
                self.column = self.config.next_tab_column(self.column);
            }
            _ => {
                self.column += 1;
            }
        }
        Some(ch)
    }

    fn token(&self, kind: TokenKind, from: DisplayPosition) -> Token {
        Token { kind, range: DisplayRange::new(from, self.pos()) }
    }

    fn take_while(&mut self, mut pred: impl FnMut(char) -> bool) -> String {
        let mut s = String::new();
        while let Some(ch) = self.peek() {
            if !pred(ch) {
                break;
            }
            s.push(ch);
            self.bump();
        }
        s
    }

    pub fn next_token(&mut self) -> Option<Token> {
        let from = self.pos();
        let ch = self.peek()?;

        // Whitespace run.
        if ch.is_whitespace() {
            let mut newlines = 0u32;
            while let Some(c) = self.peek() {
                if !c.is_whitespace() {
                    break;
                }
                if c == '\n' {
                    newlines += 1;
                }
                self.bump();
            }
            return Some(self.token(TokenKind::Whitespace { newlines }, from));
        }

        // Comment through end of line.
        if ch == ';' {
            self.bump();
            let text = self.take_while(|c| c != '\n');
            let id = self.pool.intern(text.trim_end());
            return Some(self.token(TokenKind::Comment(id), from));
        }

        // Directive.
        if ch == '#' {
            self.bump();
            let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
            return Some(match Directive::from_spelling(&word) {
                Some(d) => self.token(TokenKind::Directive(d), from),
                None => self.token(TokenKind::Invalid(LexError::InvalidChar('#')), from),
            });
        }

        // Pragma.
        if ch == '@' {
            self.bump();
            let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
            return Some(match Pragma::from_spelling(&word) {
                Some(p) => self.token(TokenKind::Pragma(p), from),
                None => self.token(TokenKind::Invalid(LexError::InvalidChar('@')), from),
            });
        }

        // String literal.
        if ch == '"' {
            return Some(self.lex_string(from));
        }

        // Code block.
        if ch == '`' && self.peek2() == Some('`') {
            return Some(self.lex_code_block(from));
        }

        // Number.
        if ch.is_ascii_digit() {
            return Some(self.lex_number(from));
        }

        // Identifier, keyword, type, or variable.
        if ch.is_ascii_alphabetic() || ch == '_' {
            let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
            let kind = if let Some(kw) = Keyword::from_spelling(&word) {
                TokenKind::Keyword(kw)
            } else if TypeKind::looks_like_type(&word) {
                match TypeKind::from_spelling(&word) {
                    Some(t) => TokenKind::Type(t),
                    None => TokenKind::Invalid(LexError::InvalidTypeName(word)),
                }
            } else if word.starts_with(|c: char| c.is_ascii_uppercase()) || word.starts_with('_') {
                TokenKind::Variable(self.pool.intern(&word))
            } else {
                TokenKind::Atom(self.pool.intern(&word))
            };
            return Some(self.token(kind, from));
        }

        // Punctuation.
        let punct = match ch {
            '(' => Some(Punct::OpenParen),
            ')' => Some(Punct::CloseParen),
            '{' => Some(Punct::OpenBrace),
            '}' => Some(Punct::CloseBrace),
            ',' => Some(Punct::Comma),
            '.' => Some(Punct::Period),
            ':' => Some(Punct::Colon),
            '=' => Some(Punct::Equals),
            '<' => Some(Punct::Less),
            '>' => Some(Punct::Greater),
            '?' => Some(Punct::Question),
            '*' => Some(Punct::Asterisk),
            '+' => Some(Punct::Plus),
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    return Some(self.token(TokenKind::Punct(Punct::NotEquals), from));
                }
                return Some(self.token(TokenKind::Punct(Punct::Bang), from));
            }
            _ => None,
        };
        if let Some(p) = punct {
            self.bump();
            return Some(self.token(TokenKind::Punct(p), from));
        }

        self.bump();
        Some(self.token(TokenKind::Invalid(LexError::InvalidChar(ch)), from))
    }

    fn lex_string(&mut self, from: DisplayPosition) -> Token {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return self.token(TokenKind::Invalid(LexError::UnterminatedString), from);
                }
                Some('"') => {
                    self.bump();
                    let id = self.pool.intern(&text);
                    return self.token(TokenKind::String(id), from);
                }
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('r') => text.push('\r'),
                        Some('\\') => text.push('\\'),
                        Some('"') => text.push('"'),
                        Some('0') => text.push('\0'),
                        Some(other) => {
                            text.push('\\');
                            text.push(other);
                        }
                        None => {
                            return self
                                .token(TokenKind::Invalid(LexError::UnterminatedString), from);
                        }
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_code_block(&mut self, from: DisplayPosition) -> Token {
        // Expect exactly three backticks.
        for _ in 0..3 {
            if self.peek() != Some('`') {
                return self.token(TokenKind::Invalid(LexError::InvalidChar('`')), from);
            }
            self.bump();
        }
        let language = self.take_while(|c| c != '\n' && c != '`');
        let mut code = String::new();
        loop {
            match self.peek() {
                None => return self.token(TokenKind::Invalid(LexError::UnterminatedCode), from),
                Some('`') if self.src.get(self.cursor + 1) == Some(&'`')
                    && self.src.get(self.cursor + 2) == Some(&'`') =>
                {
                    self.bump();
                    self.bump();
                    self.bump();
                    let language = self.pool.intern(language.trim());
                    let code = self.pool.intern(&code);
                    return self.token(TokenKind::CodeBlock { language, code }, from);
                }
                Some(c) => {
                    code.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_number(&mut self, from: DisplayPosition) -> Token {
        let mut spelling = String::new();
        if self.peek() == Some('0') && matches!(self.peek2(), Some('x' | 'b')) {
            spelling.push('0');
            self.bump();
            let base_ch = self.bump().unwrap_or('x');
            spelling.push(base_ch);
            let digits = self.take_while(|c| c.is_ascii_alphanumeric());
            spelling.push_str(&digits);
            let radix = if base_ch == 'x' { 16 } else { 2 };
            return match u128::from_str_radix(&digits, radix) {
                Ok(v) if !digits.is_empty() => {
                    let id = self.pool.intern(&spelling);
                    self.token(
                        TokenKind::Number { spelling: id, value: NumberValue::Int(v) },
                        from,
                    )
                }
                _ => self.token(TokenKind::Invalid(LexError::InvalidNumber(spelling)), from),
            };
        }

        spelling.push_str(&self.take_while(|c| c.is_ascii_digit()));
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            spelling.push('.');
            self.bump();
            spelling.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        // A trailing alphabetic character makes the whole literal invalid
        // rather than splitting into number-then-ident.
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
            spelling.push_str(&self.take_while(|c| c.is_ascii_alphanumeric() || c == '_'));
            return self.token(TokenKind::Invalid(LexError::InvalidNumber(spelling)), from);
        }
        let id = self.pool.intern(&spelling);
        let value = if is_float {
            match spelling.parse::<f64>() {
                Ok(v) => NumberValue::Float(v),
                Err(_) => return self.token(TokenKind::Invalid(LexError::InvalidNumber(spelling)), from),
            }
        } else {
            match spelling.parse::<u128>() {
                Ok(v) => NumberValue::Int(v),
                Err(_) => return self.token(TokenKind::Invalid(LexError::InvalidNumber(spelling)), from),
            }
        };
        self.token(TokenKind::Number { spelling: id, value }, from)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.next_token()
    }
}

/// Convenience wrapper: lex `text` against a fresh display id.
pub fn tokenize(pool: &StringPool, display: DisplayId, text: &str) -> Vec<Token> {
    Lexer::new(pool, display, DisplayConfig::default(), text).tokenize()
}

/// Resolve a token's interned spelling, if it has one.
pub fn spelling(pool: &StringPool, token: &Token) -> Option<Arc<str>> {
    match &token.kind {
        TokenKind::Atom(id)
        | TokenKind::Variable(id)
        | TokenKind::String(id)
        | TokenKind::Comment(id)
        | TokenKind::Number { spelling: id, .. } => Some(pool.get(*id)),
        TokenKind::CodeBlock { code, .. } => Some(pool.get(*code)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> (StringPool, Vec<Token>) {
        let pool = StringPool::new();
        let toks = tokenize(&pool, DisplayId(0), text);
        (pool, toks)
    }

    fn kinds(text: &str) -> Vec<TokenKind> {
        lex(text).1.into_iter().filter(|t| !t.is_trivia()).map(|t| t.kind).collect()
    }

    #[test]
    fn directives_and_types() {
        let ks = kinds("#message edge(u32 X, u32 Y).");
        assert_eq!(ks[0], TokenKind::Directive(Directive::Message));
        assert!(matches!(ks[1], TokenKind::Atom(_)));
        assert_eq!(ks[2], TokenKind::Punct(Punct::OpenParen));
        assert_eq!(ks[3], TokenKind::Type(TypeKind::Unsigned(32)));
        assert!(matches!(ks[4], TokenKind::Variable(_)));
    }

    #[test]
    fn variables_vs_atoms() {
        let ks = kinds("tc(X, _Y, z)");
        assert!(matches!(ks[0], TokenKind::Atom(_)));
        assert!(matches!(ks[2], TokenKind::Variable(_)));
        assert!(matches!(ks[4], TokenKind::Variable(_)));
        assert!(matches!(ks[6], TokenKind::Atom(_)));
    }

    #[test]
    fn bang_and_not_equals() {
        let ks = kinds("!p, X != Y");
        assert_eq!(ks[0], TokenKind::Punct(Punct::Bang));
        assert_eq!(ks[4], TokenKind::Punct(Punct::NotEquals));
    }

    #[test]
    fn numbers() {
        let ks = kinds("42 0x1f 0b101 3.5");
        assert!(matches!(ks[0], TokenKind::Number { value: NumberValue::Int(42), .. }));
        assert!(matches!(ks[1], TokenKind::Number { value: NumberValue::Int(31), .. }));
        assert!(matches!(ks[2], TokenKind::Number { value: NumberValue::Int(5), .. }));
        assert!(matches!(ks[3], TokenKind::Number { value: NumberValue::Float(_), .. }));
    }

    #[test]
    fn invalid_number_is_single_token() {
        let ks = kinds("12abc");
        assert_eq!(ks.len(), 1);
        assert!(matches!(ks[0], TokenKind::Invalid(LexError::InvalidNumber(_))));
    }

    #[test]
    fn strings_unescape() {
        let (pool, toks) = lex(r#""a\nb""#);
        let tok = toks.into_iter().find(|t| !t.is_trivia()).expect("token");
        match tok.kind {
            TokenKind::String(id) => assert_eq!(&*pool.get(id), "a\nb"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_recovers() {
        let ks = kinds("\"abc\nedge");
        assert!(matches!(ks[0], TokenKind::Invalid(LexError::UnterminatedString)));
        assert!(matches!(ks[1], TokenKind::Atom(_)));
    }

    #[test]
    fn code_blocks() {
        let (pool, toks) = lex("```c++\nint f();\n```");
        let tok = toks.into_iter().find(|t| !t.is_trivia()).expect("token");
        match tok.kind {
            TokenKind::CodeBlock { language, code } => {
                assert_eq!(&*pool.get(language), "c++");
                assert_eq!(&*pool.get(code), "\nint f();\n");
            }
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_preserves_newline_count() {
        let (_, toks) = lex("a\n\n\nb");
        let ws: Vec<_> = toks
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Whitespace { newlines } => Some(newlines),
                _ => None,
            })
            .collect();
        assert_eq!(ws, vec![3]);
    }

    #[test]
    fn positions_track_lines() {
        let (_, toks) = lex("a\n  b");
        let b = toks.iter().filter(|t| !t.is_trivia()).nth(1).expect("b");
        assert_eq!(b.position().line(), 2);
        assert_eq!(b.position().column(), 3);
    }

    #[test]
    fn pragmas() {
        let ks = kinds("@impure @range @differential");
        assert_eq!(ks[0], TokenKind::Pragma(Pragma::Impure));
        assert_eq!(ks[1], TokenKind::Pragma(Pragma::Range));
        assert_eq!(ks[2], TokenKind::Pragma(Pragma::Differential));
    }
}
