//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.  For string literals this
    /// is the raw bytes between the quotes, with no escape processing.
    pub text: &'src str,
}

impl Token<'_> {
    /// The numeric payload of a `Num` token.  Accumulates digits with
    /// wrapping arithmetic, so oversized literals wrap modulo 2^64.
    pub fn number(&self) -> u64 {
        self.text
            .bytes()
            .fold(0u64, |n, d| n.wrapping_mul(10).wrapping_add((d - b'0') as u64))
    }
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("while")]
    While,
    #[display("if")]
    If,
    #[display("for")]
    For,
    #[display("return")]
    Return,
    #[display("char")]
    Char,
    #[display("int")]
    Int,
    #[display("void")]
    Void,
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("string")]
    Str,
    #[display("..")]
    Ellipsis,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display(";")]
    Semi,
    #[display(",")]
    Comma,
    #[display("=")]
    Assign,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display(".")]
    Dot,
}

#[derive(Clone, Copy, PartialEq, Eq, Display)]
#[display("Lexer error: unexpected character {_1:?} at {_0}")]
pub struct LexError(pub usize, pub char);

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;

        // Tried in order, so keywords come before `Id` and `..` before `.`.
        let table: &[(&str, TokenKind)] = &[
            (r"\Awhile\b", While),
            (r"\Aif\b", If),
            (r"\Afor\b", For),
            (r"\Areturn\b", Return),
            (r"\Achar\b", Char),
            (r"\Aint\b", Int),
            (r"\Avoid\b", Void),
            (r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
            (r"\A[0-9]+", Num),
            (r#"\A"[^"]*""#, Str),
            // The source form is two dots; the conventional three-dot
            // spelling lexes to the same token.
            (r"\A\.\.\.?", Ellipsis),
            (r"\A\(", LParen),
            (r"\A\)", RParen),
            (r"\A\{", LBrace),
            (r"\A\}", RBrace),
            (r"\A;", Semi),
            (r"\A,", Comma),
            (r"\A=", Assign),
            (r"\A\+", Plus),
            (r"\A-", Minus),
            (r"\A\*", Star),
            (r"\A<", Lt),
            (r"\A>", Gt),
            (r"\A\.", Dot),
        ];

        Lexer {
            input,
            pos: 0,
            whitespace: Regex::new(r"\A[ \t\f\r\n\v]*").unwrap(),
            matchers: table
                .iter()
                .map(|(pat, kind)| (Regex::new(pat).unwrap(), *kind))
                .collect(),
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip whitespace (the language has no comments)
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }

        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let text = &rest[..m.end()];
                // Strip the quotes from string literals; the raw bytes
                // between them are carried through untouched.
                let text = if *kind == TokenKind::Str {
                    &text[1..text.len() - 1]
                } else {
                    text
                };
                self.pos += m.end();
                return Ok(Some(Token { kind: *kind, text }));
            }
        }

        let ch = rest.chars().next().unwrap();
        Err(LexError(self.pos, ch))
    }
}
