//! Boolean tag-expression language.
//!
//! ```text
//! expr    := orExpr
//! orExpr  := andExpr ( "OR" andExpr )*
//! andExpr := notExpr ( "AND" notExpr )*
//! notExpr := "NOT" notExpr | atom
//! atom    := tagLiteral | "(" expr ")"
//! ```
//!
//! Keywords are case-insensitive; precedence is NOT > AND > OR with
//! parentheses overriding. Tag literals are bare identifiers or quoted
//! strings (`"room: a"`), so tags containing spaces or keyword spellings stay
//! expressible. A bare literal containing `*` is a wildcard and matches when
//! any tag in the set matches the glob; quoted literals always match exactly.
//!
//! Parsing produces an immutable tree evaluated by structural recursion —
//! expressions compile once and run against every connection's tag set.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;

use crate::error::{HubError, Result};

/// Characters allowed in a bare tag literal.
fn is_bare_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '*' | '.' | ':' | '/' | '@' | '#')
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Literal { text: String, quoted: bool },
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::Literal { text, .. } => write!(f, "'{text}'"),
        }
    }
}

fn lex(input: &str) -> Result<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '(' => {
                chars.next();
                tokens.push((pos, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((pos, Token::RParen));
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, qc) in chars.by_ref() {
                    if qc == c {
                        closed = true;
                        break;
                    }
                    text.push(qc);
                }
                if !closed {
                    return Err(HubError::syntax(pos, "unterminated quoted tag"));
                }
                tokens.push((pos, Token::Literal { text, quoted: true }));
            }
            c if is_bare_char(c) => {
                let mut text = String::new();
                while let Some(&(_, bc)) = chars.peek() {
                    if !is_bare_char(bc) {
                        break;
                    }
                    text.push(bc);
                    chars.next();
                }
                let token = match text.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Literal {
                        text,
                        quoted: false,
                    },
                };
                tokens.push((pos, token));
            }
            other => {
                return Err(HubError::syntax(pos, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

/// A single tag test: exact membership, or a glob over the whole tag set.
#[derive(Debug, Clone)]
pub enum TagLiteral {
    Exact(String),
    Wildcard { pattern: String, regex: Regex },
}

impl TagLiteral {
    fn compile(text: String, quoted: bool, pos: usize) -> Result<Self> {
        if !quoted && text.contains('*') {
            let escaped = regex::escape(&text).replace(r"\*", ".*");
            let regex = Regex::new(&format!("^{escaped}$"))
                .map_err(|e| HubError::syntax(pos, format!("invalid wildcard tag: {e}")))?;
            Ok(TagLiteral::Wildcard {
                pattern: text,
                regex,
            })
        } else {
            Ok(TagLiteral::Exact(text))
        }
    }

    fn holds(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagLiteral::Exact(tag) => tags.contains(tag),
            TagLiteral::Wildcard { regex, .. } => tags.iter().any(|t| regex.is_match(t)),
        }
    }
}

impl fmt::Display for TagLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagLiteral::Exact(tag) => write!(f, "{tag:?}"),
            TagLiteral::Wildcard { pattern, .. } => write!(f, "{pattern:?}"),
        }
    }
}

/// Parsed tag expression.
#[derive(Debug, Clone)]
pub enum TagExpr {
    Literal(TagLiteral),
    Not(Box<TagExpr>),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
}

impl TagExpr {
    /// Parse an expression. Malformed or empty input fails with
    /// [`HubError::Syntax`] carrying the offending position.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Err(HubError::syntax(0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            index: 0,
            end: input.len(),
        };
        let expr = parser.or_expr()?;
        if let Some((pos, token)) = parser.peek() {
            return Err(HubError::syntax(
                *pos,
                format!("unexpected {token} after expression"),
            ));
        }
        Ok(expr)
    }

    /// True iff the formula holds with each literal replaced by membership in
    /// `tags`.
    pub fn evaluate(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagExpr::Literal(literal) => literal.holds(tags),
            TagExpr::Not(inner) => !inner.evaluate(tags),
            TagExpr::And(left, right) => left.evaluate(tags) && right.evaluate(tags),
            TagExpr::Or(left, right) => left.evaluate(tags) || right.evaluate(tags),
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    index: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.index)
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.index).cloned();
        if token.is_some() {
            self.index += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<TagExpr> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.advance();
            let right = self.and_expr()?;
            left = TagExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<TagExpr> {
        let mut left = self.not_expr()?;
        while matches!(self.peek(), Some((_, Token::And))) {
            self.advance();
            let right = self.not_expr()?;
            left = TagExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<TagExpr> {
        if matches!(self.peek(), Some((_, Token::Not))) {
            self.advance();
            let inner = self.not_expr()?;
            return Ok(TagExpr::Not(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<TagExpr> {
        match self.advance() {
            Some((pos, Token::Literal { text, quoted })) => {
                Ok(TagExpr::Literal(TagLiteral::compile(text, quoted, pos)?))
            }
            Some((pos, Token::LParen)) => {
                let expr = self.or_expr()?;
                match self.advance() {
                    Some((_, Token::RParen)) => Ok(expr),
                    Some((p, token)) => {
                        Err(HubError::syntax(p, format!("expected ')', found {token}")))
                    }
                    None => Err(HubError::syntax(pos, "unclosed '('")),
                }
            }
            Some((pos, token)) => Err(HubError::syntax(
                pos,
                format!("expected tag or '(', found {token}"),
            )),
            None => Err(HubError::syntax(self.end, "expected tag or '('")),
        }
    }
}
