use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::error::{Position, RebacError, Result};
use crate::rewrite::{
    Reference, TUPLE_USERSET_NAMESPACE, TUPLE_USERSET_OBJECT, TUPLE_USERSET_RELATION,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    Placeholder(Reference),
    LeftBrace,
    RightBrace,
    Colon,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "`{name}`"),
            TokenKind::Str(value) => write!(f, "string {value:?}"),
            TokenKind::Placeholder(reference) => write!(f, "placeholder {reference}"),
            TokenKind::LeftBrace => f.write_str("'{'"),
            TokenKind::RightBrace => f.write_str("'}'"),
            TokenKind::Colon => f.write_str("':'"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) position: Position,
}

/// Splits namespace configuration source into tokens. The last token is always `Eof`.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer {
        input,
        chars: input.char_indices().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl Lexer<'_> {
    fn position(&mut self) -> Position {
        let offset = self.chars.peek().map_or(self.input.len(), |(offset, _)| *offset);
        Position {
            offset,
            line: self.line,
            column: self.column,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' || (c == '/' && self.peek_second() == Some('/')) {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia();
        let position = self.position();
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position,
            });
        };

        let kind = match c {
            '{' => {
                self.bump();
                TokenKind::LeftBrace
            }
            '}' => {
                self.bump();
                TokenKind::RightBrace
            }
            ':' => {
                self.bump();
                TokenKind::Colon
            }
            '"' => TokenKind::Str(self.string(position)?),
            '$' => TokenKind::Placeholder(self.placeholder(position)?),
            c if c.is_ascii_alphabetic() || c == '_' => TokenKind::Ident(self.word()),
            other => {
                return Err(RebacError::Syntax {
                    position,
                    expected: "a token".to_string(),
                    found: format!("{other:?}"),
                })
            }
        };
        Ok(Token { kind, position })
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn string(&mut self, start: Position) -> Result<String> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some(escaped @ ('"' | '\\')) => value.push(escaped),
                    Some('n') => value.push('\n'),
                    Some(other) => {
                        return Err(RebacError::Syntax {
                            position: start,
                            expected: "a valid escape sequence".to_string(),
                            found: format!("\\{other}"),
                        })
                    }
                    None => break,
                },
                Some(c) => value.push(c),
                None => break,
            }
        }
        Err(RebacError::Syntax {
            position: start,
            expected: "closing '\"'".to_string(),
            found: TokenKind::Eof.to_string(),
        })
    }

    fn placeholder(&mut self, start: Position) -> Result<Reference> {
        self.bump();
        let word = format!("${}", self.word());
        match word.as_str() {
            TUPLE_USERSET_NAMESPACE => Ok(Reference::TupleUsersetNamespace),
            TUPLE_USERSET_OBJECT => Ok(Reference::TupleUsersetObject),
            TUPLE_USERSET_RELATION => Ok(Reference::TupleUsersetRelation),
            _ => Err(RebacError::Syntax {
                position: start,
                expected: format!(
                    "one of {}, {}, {}",
                    TUPLE_USERSET_NAMESPACE, TUPLE_USERSET_OBJECT, TUPLE_USERSET_RELATION
                ),
                found: format!("`{word}`"),
            }),
        }
    }
}
