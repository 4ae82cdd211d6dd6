// Expression Lexer
// Tokenizes `${{ }}` expression bodies

use crate::expression::ExpressionError;

use std::fmt;

/// Expression tokens
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Eq,  // ==
    Ne,  // !=
    Lt,  // <
    Le,  // <=
    Gt,  // >
    Ge,  // >=
    And, // &&
    Or,  // ||
    Not, // !
    Dot,
    Comma,

    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
        }
    }

    /// Tokenize the entire input; the last token is always `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let Some((pos, ch)) = self.chars.next() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '=' => {
                if self.eat('=') {
                    Token::Eq
                } else {
                    return Err(ExpressionError::syntax("expected '=='", pos));
                }
            }
            '!' => {
                if self.eat('=') {
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '<' => {
                if self.eat('=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' => {
                if self.eat('&') {
                    Token::And
                } else {
                    return Err(ExpressionError::syntax("expected '&&'", pos));
                }
            }
            '|' => {
                if self.eat('|') {
                    Token::Or
                } else {
                    return Err(ExpressionError::syntax("expected '||'", pos));
                }
            }
            '\'' => self.read_string(pos)?,
            c if c.is_ascii_digit() || c == '-' => self.read_number(c, pos)?,
            c if c.is_alphabetic() || c == '_' => self.read_identifier(c),
            other => {
                return Err(ExpressionError::syntax(
                    format!("unexpected character '{}'", other),
                    pos,
                ))
            }
        };

        Ok(token)
    }

    fn eat(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some((_, c)) if *c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    /// Single-quoted string; `''` escapes a quote
    fn read_string(&mut self, start: usize) -> Result<Token, ExpressionError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if self.eat('\'') {
                        value.push('\'');
                    } else {
                        return Ok(Token::String(value));
                    }
                }
                Some((_, c)) => value.push(c),
                None => return Err(ExpressionError::syntax("unterminated string", start)),
            }
        }
    }

    fn read_number(&mut self, first: char, start: usize) -> Result<Token, ExpressionError> {
        let mut text = String::from(first);
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '.' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }

        let parsed = match text.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16).ok().map(|n| n as f64),
            None => text.parse::<f64>().ok(),
        };
        parsed
            .map(Token::Number)
            .ok_or_else(|| ExpressionError::syntax(format!("invalid number '{}'", text), start))
    }

    fn read_identifier(&mut self, first: char) -> Token {
        let mut ident = String::from(first);
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.chars.next();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}
