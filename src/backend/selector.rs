//! Selector expressions over tabular columns.
//!
//! A selector is a filter predicate such as
//! `(ref_genome == "hg18") & (global_pos > 2909900) & (global_pos < 298129829)`.
//! The supported grammar:
//!
//! ```text
//! expr       := or
//! or         := and ('|' and)*
//! and        := unary ('&' unary)*
//! unary      := '~' unary | '(' expr ')' | comparison | column
//! comparison := operand ('==' | '!=' | '<' | '<=' | '>' | '>=') operand
//! operand    := column | string | integer | float | 'True' | 'False'
//! ```
//!
//! Strings are enclosed in double or single quotes.
//! A bare column is only valid for boolean columns.
//! Selectors are parsed once and checked against a table when they are evaluated.

use super::tables::{ColumnKind, Table};
use crate::{KBError, Result};

use rusqlite::types::Value as SqlValue;

use std::fmt::Display;
use std::str::FromStr;


//-----------------------------------------------------------------------------

/// A literal value in a selector.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Str(Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// One side of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Column(String),
    Literal(Literal),
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Parsed selector expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Compare(Operand, CmpOp, Operand),
    Column(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

//-----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(Vec<u8>),
    Int(i64),
    Float(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut result = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => { i += 1; },
            b'(' => { result.push(Token::Open); i += 1; },
            b')' => { result.push(Token::Close); i += 1; },
            b'&' => { result.push(Token::And); i += 1; },
            b'|' => { result.push(Token::Or); i += 1; },
            b'~' => { result.push(Token::Not); i += 1; },
            b'=' | b'!' | b'<' | b'>' => {
                let followed_by_eq = i + 1 < bytes.len() && bytes[i + 1] == b'=';
                let op = match (c, followed_by_eq) {
                    (b'=', true) => CmpOp::Eq,
                    (b'!', true) => CmpOp::Ne,
                    (b'<', true) => CmpOp::Le,
                    (b'>', true) => CmpOp::Ge,
                    (b'<', false) => CmpOp::Lt,
                    (b'>', false) => CmpOp::Gt,
                    _ => return Err(KBError::Selector(format!("unexpected '{}' at offset {} in {}", c as char, i, source))),
                };
                result.push(Token::Op(op));
                i += if followed_by_eq { 2 } else { 1 };
            },
            b'"' | b'\'' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] != c {
                    end += 1;
                }
                if end >= bytes.len() {
                    return Err(KBError::Selector(format!("unterminated string at offset {} in {}", i, source)));
                }
                result.push(Token::Str(bytes[start..end].to_vec()));
                i = end + 1;
            },
            b'0'..=b'9' | b'-' | b'.' => {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || matches!(bytes[i], b'.' | b'e' | b'E')
                    || (matches!(bytes[i], b'+' | b'-') && matches!(bytes[i - 1], b'e' | b'E'))) {
                    i += 1;
                }
                let text = &source[start..i];
                if let Ok(value) = text.parse::<i64>() {
                    result.push(Token::Int(value));
                } else if let Ok(value) = text.parse::<f64>() {
                    result.push(Token::Float(value));
                } else {
                    return Err(KBError::Selector(format!("invalid number {} in {}", text, source)));
                }
            },
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                result.push(Token::Ident(source[start..i].to_string()));
            },
            _ => {
                return Err(KBError::Selector(format!("unexpected character at offset {} in {}", i, source)));
            },
        }
    }
    Ok(result)
}

//-----------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    offset: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.offset).cloned();
        if token.is_some() {
            self.offset += 1;
        }
        token
    }

    fn error(&self, message: &str) -> KBError {
        KBError::Selector(format!("{} (token {}) in {}", message, self.offset, self.source))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.offset += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.offset += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.offset += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            },
            Some(Token::Open) => {
                self.offset += 1;
                let inner = self.parse_or()?;
                if self.next() != Some(Token::Close) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            },
            _ => self.parse_comparison(),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "True" => Ok(Operand::Literal(Literal::Bool(true))),
                "False" => Ok(Operand::Literal(Literal::Bool(false))),
                _ => Ok(Operand::Column(name)),
            },
            Some(Token::Str(value)) => Ok(Operand::Literal(Literal::Str(value))),
            Some(Token::Int(value)) => Ok(Operand::Literal(Literal::Int(value))),
            Some(Token::Float(value)) => Ok(Operand::Literal(Literal::Float(value))),
            _ => Err(self.error("expected a column or a literal")),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.offset += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        match left {
            Operand::Column(name) => Ok(Expr::Column(name)),
            Operand::Literal(_) => Err(self.error("a literal is not a predicate")),
        }
    }
}

//-----------------------------------------------------------------------------

/// A parsed selector expression.
///
/// # Examples
///
/// ```
/// use genokb::backend::Selector;
///
/// let selector = Selector::parse("(source == \"affymetrix\") & (context == \"GW6.0\")");
/// assert!(selector.is_ok());
/// assert!(Selector::parse("(source == ").is_err());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Selector {
    source: String,
    expr: Expr,
}

// Value category used for type checking comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    Bytes,
    Number,
    Bool,
}

impl Selector {
    /// Parses a selector expression.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(KBError::Selector(String::from("empty selector")));
        }
        let mut parser = Parser { source, tokens, offset: 0 };
        let expr = parser.parse_or()?;
        if parser.offset != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Selector { source: source.to_string(), expr })
    }

    /// Returns the parsed expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Returns the source text of the selector.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Translates the selector into an SQL condition over the columns of the table.
    ///
    /// Returns the condition and the values for its `?` placeholders in order.
    /// Fails if the selector refers to unknown columns or compares values of incompatible types.
    pub fn to_sql(&self, table: &Table) -> Result<(String, Vec<SqlValue>)> {
        let mut params = Vec::new();
        let sql = self.translate(&self.expr, table, &mut params)?;
        Ok((sql, params))
    }

    fn translate(&self, expr: &Expr, table: &Table, params: &mut Vec<SqlValue>) -> Result<String> {
        match expr {
            Expr::Compare(left, op, right) => {
                let left_category = self.category(left, table)?;
                let right_category = self.category(right, table)?;
                if left_category != right_category {
                    return Err(KBError::Selector(format!(
                        "cannot compare {:?} with {:?} in {} on table {}", left, right, self.source, table.name()
                    )));
                }
                let left = Self::operand_sql(left, params);
                let right = Self::operand_sql(right, params);
                Ok(format!("({} {} {})", left, op.sql(), right))
            },
            Expr::Column(name) => {
                let column = self.column_kind(name, table)?;
                if column != ColumnKind::Bool {
                    return Err(KBError::Selector(format!("column {} is not boolean in {}", name, self.source)));
                }
                Ok(format!("(\"{}\" != 0)", name))
            },
            Expr::And(left, right) => {
                let left = self.translate(left, table, params)?;
                let right = self.translate(right, table, params)?;
                Ok(format!("({} AND {})", left, right))
            },
            Expr::Or(left, right) => {
                let left = self.translate(left, table, params)?;
                let right = self.translate(right, table, params)?;
                Ok(format!("({} OR {})", left, right))
            },
            Expr::Not(inner) => {
                let inner = self.translate(inner, table, params)?;
                Ok(format!("(NOT {})", inner))
            },
        }
    }

    fn column_kind(&self, name: &str, table: &Table) -> Result<ColumnKind> {
        table.column(name).map(|(_, column)| column.kind).ok_or_else(|| KBError::Selector(
            format!("unknown column {} in {} on table {}", name, self.source, table.name())
        ))
    }

    fn category(&self, operand: &Operand, table: &Table) -> Result<Category> {
        match operand {
            Operand::Column(name) => match self.column_kind(name, table)? {
                ColumnKind::String(_) => Ok(Category::Bytes),
                ColumnKind::Long | ColumnKind::Float => Ok(Category::Number),
                ColumnKind::Bool => Ok(Category::Bool),
            },
            Operand::Literal(Literal::Str(_)) => Ok(Category::Bytes),
            Operand::Literal(Literal::Int(_)) | Operand::Literal(Literal::Float(_)) => Ok(Category::Number),
            Operand::Literal(Literal::Bool(_)) => Ok(Category::Bool),
        }
    }

    fn operand_sql(operand: &Operand, params: &mut Vec<SqlValue>) -> String {
        match operand {
            Operand::Column(name) => format!("\"{}\"", name),
            Operand::Literal(literal) => {
                let value = match literal {
                    // Stored strings never carry trailing NULs.
                    Literal::Str(bytes) => SqlValue::Blob(super::tables::trim_nuls(bytes).to_vec()),
                    Literal::Int(value) => SqlValue::Integer(*value),
                    Literal::Float(value) => SqlValue::Real(*value),
                    Literal::Bool(value) => SqlValue::Integer(*value as i64),
                };
                params.push(value);
                String::from("?")
            },
        }
    }
}

impl FromStr for Selector {
    type Err = KBError;

    fn from_str(source: &str) -> Result<Self> {
        Self::parse(source)
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

//-----------------------------------------------------------------------------
