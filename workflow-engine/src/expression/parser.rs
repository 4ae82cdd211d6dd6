// Expression Parser
// Recursive-descent parser producing an expression AST

use crate::expression::lexer::{Lexer, Token};
use crate::expression::ExpressionError;

use serde_json::Value;

/// Functions whose presence disables the implicit `success() &&`
pub const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "always", "cancelled"];

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `'text'`, `1`, `true`, `null`
    Literal(Value),

    /// Top-level context name: `github`, `matrix`, `needs`, ...
    Context(String),

    /// `object.property`
    Member { object: Box<Expr>, property: String },

    /// `object['key']` or `array[0]`
    Index { object: Box<Expr>, index: Box<Expr> },

    Not(Box<Expr>),

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl Expr {
    /// Whether any status check function is called anywhere in the tree
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Context(_) => false,
            Expr::Member { object, .. } => object.uses_status_function(),
            Expr::Index { object, index } => {
                object.uses_status_function() || index.uses_status_function()
            }
            Expr::Not(inner) => inner.uses_status_function(),
            Expr::Binary { left, right, .. } => {
                left.uses_status_function() || right.uses_status_function()
            }
            Expr::Call { name, args } => {
                STATUS_FUNCTIONS
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(name))
                    || args.iter().any(Expr::uses_status_function)
            }
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    /// Parse a complete expression; trailing tokens are an error
    pub fn parse_str(input: &str) -> Result<Expr, ExpressionError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(ExpressionError::syntax(
                format!("unexpected '{}' after expression", other),
                parser.pos,
            )),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let found = self.advance();
        if found == expected {
            Ok(())
        } else {
            Err(ExpressionError::syntax(
                format!("expected '{}', found '{}'", expected, found),
                self.pos,
            ))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == Token::Not {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Identifier(property) => {
                            expr = Expr::Member {
                                object: Box::new(expr),
                                property,
                            };
                        }
                        // Keywords are valid property names: `inputs.true`
                        keyword @ (Token::True | Token::False | Token::Null) => {
                            let property = keyword.to_string();
                            expr = Expr::Member {
                                object: Box::new(expr),
                                property,
                            };
                        }
                        other => {
                            return Err(ExpressionError::syntax(
                                format!("expected property name, found '{}'", other),
                                self.pos,
                            ))
                        }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Number(n) => Ok(Expr::Literal(number_value(n))),
            Token::String(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Identifier(name) => {
                if *self.peek() == Token::LParen {
                    self.advance();
                    let args = self.parse_arguments()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Context(name))
                }
            }
            other => Err(ExpressionError::syntax(
                format!("unexpected '{}'", other),
                self.pos,
            )),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => {
                    return Err(ExpressionError::syntax(
                        format!("expected ',' or ')', found '{}'", other),
                        self.pos,
                    ))
                }
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Integral numbers become JSON integers so they print without `.0`
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
