//! Row filters for population views.
//!
//! A query is a small boolean expression over column values, e.g.
//! `alive == true and sex == 'Female'` or `not tracked`. A bare column name
//! is shorthand for `column == true`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::column::{Column, Scalar};
use super::PopulationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Parsed boolean row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Compare { column: String, op: CmpOp, value: Scalar },
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn parse(text: &str) -> Result<Self, PopulationError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let query = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(PopulationError::Query(format!(
                "unexpected trailing input in '{}'",
                text
            )));
        }
        Ok(query)
    }

    /// `column == value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Query::Compare {
            column: column.into(),
            op: CmpOp::Eq,
            value: value.into(),
        }
    }

    pub fn and(self, other: Query) -> Self {
        Query::And(Box::new(self), Box::new(other))
    }

    /// Every column the query reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Query::Compare { column, .. } => {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
            Query::And(a, b) | Query::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Query::Not(a) => a.collect_columns(out),
        }
    }

    /// Evaluates the query at table `positions`, using `lookup` to resolve
    /// column names.
    pub fn evaluate<'c, F>(&self, lookup: &F, positions: &[usize]) -> Result<Vec<bool>, PopulationError>
    where
        F: Fn(&str) -> Option<&'c Column>,
    {
        match self {
            Query::Compare { column, op, value } => {
                let data = lookup(column).ok_or_else(|| PopulationError::MissingColumn(column.clone()))?;
                positions
                    .iter()
                    .map(|&p| {
                        let cell = data.get(p).ok_or(PopulationError::UnknownSimulant(p))?;
                        compare(&cell, value)
                            .map(|ordering| op.holds(ordering))
                            .ok_or_else(|| {
                                PopulationError::Query(format!(
                                    "cannot compare column '{}' of type {:?} with {:?}",
                                    column,
                                    data.dtype(),
                                    value
                                ))
                            })
                    })
                    .collect()
            }
            Query::And(a, b) => {
                let left = a.evaluate(lookup, positions)?;
                let right = b.evaluate(lookup, positions)?;
                Ok(left.into_iter().zip(right).map(|(x, y)| x && y).collect())
            }
            Query::Or(a, b) => {
                let left = a.evaluate(lookup, positions)?;
                let right = b.evaluate(lookup, positions)?;
                Ok(left.into_iter().zip(right).map(|(x, y)| x || y).collect())
            }
            Query::Not(a) => Ok(a.evaluate(lookup, positions)?.into_iter().map(|x| !x).collect()),
        }
    }
}

impl FromStr for Query {
    type Err = PopulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Compare { column, op, value } => write!(f, "{} {} {:?}", column, op.symbol(), value),
            Query::And(a, b) => write!(f, "({} and {})", a, b),
            Query::Or(a, b) => write!(f, "({} or {})", a, b),
            Query::Not(a) => write!(f, "not {}", a),
        }
    }
}

fn compare(cell: &Scalar, value: &Scalar) -> Option<Ordering> {
    match (cell, value) {
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Time(a), Scalar::Time(b)) => Some(a.cmp(b)),
        (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
        (a, b) => {
            let (a, b) = (a.as_f64()?, b.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Scalar),
    Op(CmpOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(text: &str) -> Result<Vec<Token>, PopulationError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    ('<', true) => CmpOp::Le,
                    ('>', true) => CmpOp::Ge,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    _ => return Err(PopulationError::Query(format!("bad operator at {} in '{}'", i, text))),
                };
                tokens.push(Token::Op(op));
                i += if two { 2 } else { 1 };
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&x| x == c)
                    .ok_or_else(|| PopulationError::Query(format!("unterminated string in '{}'", text)))?;
                let literal: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(Token::Literal(Scalar::Str(literal)));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let literal = if let Ok(v) = raw.parse::<i64>() {
                    Scalar::Int(v)
                } else {
                    raw.parse::<f64>()
                        .map(Scalar::Float)
                        .map_err(|_| PopulationError::Query(format!("bad number '{}' in '{}'", raw, text)))?
                };
                tokens.push(Token::Literal(literal));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Scalar::Bool(true)),
                    "false" | "False" => Token::Literal(Scalar::Bool(false)),
                    _ => Token::Ident(word),
                });
            }
            _ => {
                return Err(PopulationError::Query(format!(
                    "unexpected character '{}' in '{}'",
                    c, text
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Query, PopulationError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Query::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Query, PopulationError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Query::And(Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Query, PopulationError> {
        match self.next() {
            Some(Token::Not) => Ok(Query::Not(Box::new(self.parse_unary()?))),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(PopulationError::Query("missing closing parenthesis".into())),
                }
            }
            Some(Token::Ident(column)) => match self.peek() {
                Some(Token::Op(op)) => {
                    let op = *op;
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Literal(value)) => Ok(Query::Compare { column, op, value }),
                        other => Err(PopulationError::Query(format!(
                            "expected a literal after '{}', found {:?}",
                            column, other
                        ))),
                    }
                }
                _ => Ok(Query::eq(column, true)),
            },
            other => Err(PopulationError::Query(format!("unexpected token {:?}", other))),
        }
    }
}
