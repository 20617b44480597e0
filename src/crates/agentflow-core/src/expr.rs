//! Safe condition expressions for conditional and loop edges.
//!
//! Route conditions like `state.score > 0.8 and not state.done` are
//! compiled by a hand-written lexer and recursive-descent parser into a
//! closed AST, then interpreted against the run state. There is no host
//! evaluation of any kind: no function calls, no subscripting, no
//! arithmetic — just comparisons, boolean combinators and literals.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors from parsing or evaluating a condition
#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error in condition '{input}': {reason}")]
    Syntax { input: String, reason: String },

    #[error("condition references unknown field '{0}'")]
    UnknownField(String),

    #[error("cannot compare {lhs} with {rhs}")]
    TypeMismatch { lhs: String, rhs: String },

    #[error("condition did not evaluate to a boolean (got {0})")]
    NotBoolean(String),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{symbol}")
    }
}

/// Closed expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Number(f64),
    Str(String),
    /// Dotted field path, `state.` prefix already stripped
    Field(Vec<String>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// An evaluated operand
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Bool(bool),
    Number(f64),
    Str(String),
    Null,
}

impl Operand {
    fn type_name(&self) -> &'static str {
        match self {
            Operand::Bool(_) => "bool",
            Operand::Number(_) => "number",
            Operand::Str(_) => "string",
            Operand::Null => "null",
        }
    }
}

impl Expr {
    /// Parse a condition string into an expression tree
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = lex(input)?;
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.syntax_error(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a state object; the result must be boolean
    pub fn eval(&self, state: &Map<String, Value>) -> Result<bool, ExprError> {
        match self.eval_operand(state)? {
            Operand::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean(other.type_name().to_string())),
        }
    }

    fn eval_operand(&self, state: &Map<String, Value>) -> Result<Operand, ExprError> {
        match self {
            Expr::Bool(b) => Ok(Operand::Bool(*b)),
            Expr::Number(n) => Ok(Operand::Number(*n)),
            Expr::Str(s) => Ok(Operand::Str(s.clone())),
            Expr::Field(path) => {
                let mut current = state
                    .get(&path[0])
                    .ok_or_else(|| ExprError::UnknownField(path.join(".")))?;
                for segment in &path[1..] {
                    current = current
                        .get(segment)
                        .ok_or_else(|| ExprError::UnknownField(path.join(".")))?;
                }
                Ok(match current {
                    Value::Bool(b) => Operand::Bool(*b),
                    Value::Number(n) => Operand::Number(n.as_f64().unwrap_or(f64::NAN)),
                    Value::String(s) => Operand::Str(s.clone()),
                    Value::Null => Operand::Null,
                    other => {
                        return Err(ExprError::TypeMismatch {
                            lhs: path.join("."),
                            rhs: format!("non-comparable value {other}"),
                        })
                    }
                })
            }
            Expr::Compare { op, lhs, rhs } => {
                let left = lhs.eval_operand(state)?;
                let right = rhs.eval_operand(state)?;
                compare(*op, &left, &right).map(Operand::Bool)
            }
            Expr::And(lhs, rhs) => Ok(Operand::Bool(lhs.eval(state)? && rhs.eval(state)?)),
            Expr::Or(lhs, rhs) => Ok(Operand::Bool(lhs.eval(state)? || rhs.eval(state)?)),
            Expr::Not(inner) => Ok(Operand::Bool(!inner.eval(state)?)),
        }
    }

    /// Root state fields this expression reads
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Field(path) => out.push(path[0].clone()),
            Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::Not(inner) => inner.collect_fields(out),
            _ => {}
        }
    }
}

fn compare(op: CmpOp, left: &Operand, right: &Operand) -> Result<bool, ExprError> {
    match (left, right) {
        (Operand::Number(a), Operand::Number(b)) => Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }),
        (Operand::Str(a), Operand::Str(b)) => Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }),
        (Operand::Bool(a), Operand::Bool(b)) => match op {
            CmpOp::Eq => Ok(a == b),
            CmpOp::Ne => Ok(a != b),
            _ => Err(ExprError::TypeMismatch {
                lhs: "bool".to_string(),
                rhs: format!("bool under ordering operator {op}"),
            }),
        },
        (a, b) => Err(ExprError::TypeMismatch {
            lhs: a.type_name().to_string(),
            rhs: b.type_name().to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    True,
    False,
    Number(f64),
    Str(String),
    Field(Vec<String>),
    Op(CmpOp),
}

fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    let syntax = |reason: String| ExprError::Syntax {
        input: input.to_string(),
        reason,
    };

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    pos += 2;
                } else {
                    return Err(syntax("single '=' (use '==')".to_string()));
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    pos += 2;
                } else {
                    return Err(syntax("single '!' (use '!=' or 'not')".to_string()));
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    pos += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    pos += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    pos += 1;
                }
            }
            '"' => {
                pos += 1;
                let mut s = String::new();
                loop {
                    match chars.get(pos) {
                        Some('"') => {
                            pos += 1;
                            break;
                        }
                        Some('\\') if chars.get(pos + 1) == Some(&'"') => {
                            s.push('"');
                            pos += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            pos += 1;
                        }
                        None => return Err(syntax("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && matches!(chars.get(pos + 1), Some(d) if d.is_ascii_digit())) =>
            {
                let start = pos;
                pos += 1;
                while matches!(chars.get(pos), Some(d) if d.is_ascii_digit() || *d == '.') {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| syntax(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while matches!(chars.get(pos), Some(ch) if ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '.')
                {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => {
                        let stripped = word.strip_prefix("state.").unwrap_or(&word);
                        let path: Vec<String> =
                            stripped.split('.').map(str::to_string).collect();
                        if path.iter().any(String::is_empty) {
                            return Err(syntax(format!("bad field reference '{word}'")));
                        }
                        tokens.push(Token::Field(path));
                    }
                }
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn syntax_error(&self, reason: String) -> ExprError {
        ExprError::Syntax {
            input: self.input.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(self.syntax_error("expected ')'".to_string())),
                }
            }
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Field(path)) => Ok(Expr::Field(path)),
            Some(other) => Err(self.syntax_error(format!("unexpected token {other:?}"))),
            None => Err(self.syntax_error("unexpected end of condition".to_string())),
        }
    }
}
