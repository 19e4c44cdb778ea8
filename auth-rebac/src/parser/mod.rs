//! Namespace configuration parser.
//!
//! Compiles the textual policy language into a [`Namespace`]:
//!
//! ```text
//! namespace {
//!   name: "doc"
//!   relation { name: "owner" }
//!   relation {
//!     name: "viewer"
//!     userset_rewrite {
//!       union {
//!         child { _this }
//!         child { computed_userset { relation: "owner" } }
//!         child {
//!           tuple_to_userset {
//!             tupleset { relation: "parent" }
//!             computed_userset { object: $TUPLE_USERSET_OBJECT relation: "viewer" }
//!           }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Tokenizing and parsing are hand-written; the grammar is small enough that a
//! recursive-descent parser over a token vector stays readable.

mod lexer;

use tracing::debug;

use crate::error::{RebacError, Result};
use crate::rewrite::{
    ComputedUserset, Namespace, Reference, Relation, SetOperation, SetOperator, TupleToUserset,
    Tupleset, UsersetExpression,
};
use lexer::{Token, TokenKind};

/// Parses namespace configuration source. The result always has version 0;
/// versions are assigned when the namespace is published to a store.
pub fn parse_namespace(input: &str) -> Result<Namespace> {
    let tokens = lexer::tokenize(input)?;
    let mut parser = Parser { tokens, cursor: 0 };
    let namespace = parser.namespace()?;
    parser.expect_eof()?;
    namespace.validate()?;
    debug!(
        namespace = %namespace.name,
        relations = namespace.relations().count(),
        "Parsed namespace configuration"
    );
    Ok(namespace)
}

/// Field values collected from a `computed_userset { ... }` or `tupleset { ... }` clause.
#[derive(Default)]
struct ReferenceFields {
    namespace: Option<Reference>,
    object: Option<Reference>,
    relation: Option<Reference>,
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.cursor)
            .map_or(&TokenKind::Eof, |token| &token.kind)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
        }
        kind
    }

    fn error(&self, expected: &str) -> RebacError {
        let (position, found) = match self.tokens.get(self.cursor).or_else(|| self.tokens.last()) {
            Some(token) => (token.position, token.kind.to_string()),
            None => (Default::default(), TokenKind::Eof.to_string()),
        };
        RebacError::Syntax {
            position,
            expected: expected.to_string(),
            found,
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(name) if name == keyword)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_keyword(keyword) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("`{keyword}`")))
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&kind.to_string()))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        match self.peek() {
            TokenKind::Eof => Ok(()),
            _ => Err(self.error("end of input")),
        }
    }

    fn string(&mut self) -> Result<String> {
        let TokenKind::Str(value) = self.peek().clone() else {
            return Err(self.error("a string literal"));
        };
        self.advance();
        Ok(value)
    }

    /// `name: "..."` where the `name` keyword has not been consumed yet.
    fn name_field(&mut self, slot: &mut Option<String>, clause: &str) -> Result<()> {
        self.expect_keyword("name")?;
        self.expect(&TokenKind::Colon)?;
        let value = self.string()?;
        if slot.is_some() {
            return Err(RebacError::AmbiguousReference {
                clause: clause.to_string(),
                field: "name".to_string(),
            });
        }
        *slot = Some(value);
        Ok(())
    }

    fn namespace(&mut self) -> Result<Namespace> {
        self.expect_keyword("namespace")?;
        self.expect(&TokenKind::LeftBrace)?;

        let mut name = None;
        let mut relations = Vec::new();
        loop {
            match self.peek() {
                TokenKind::RightBrace => break,
                TokenKind::Ident(keyword) if keyword == "name" => {
                    self.name_field(&mut name, "namespace")?;
                }
                TokenKind::Ident(keyword) if keyword == "relation" => {
                    relations.push(self.relation()?);
                }
                _ => return Err(self.error("`name`, `relation` or '}'")),
            }
        }
        let Some(name) = name else {
            return Err(self.error("`name`"));
        };
        self.expect(&TokenKind::RightBrace)?;

        relations
            .into_iter()
            .try_fold(Namespace::new(&name), Namespace::with_relation)
    }

    fn relation(&mut self) -> Result<Relation> {
        self.expect_keyword("relation")?;
        self.expect(&TokenKind::LeftBrace)?;

        let mut name = None;
        let mut rewrite = None;
        loop {
            match self.peek() {
                TokenKind::RightBrace => break,
                TokenKind::Ident(keyword) if keyword == "name" => {
                    self.name_field(&mut name, "relation")?;
                }
                TokenKind::Ident(keyword) if keyword == "userset_rewrite" => {
                    if rewrite.is_some() {
                        return Err(self.error("a single `userset_rewrite`"));
                    }
                    self.advance();
                    self.expect(&TokenKind::LeftBrace)?;
                    rewrite = Some(self.userset()?);
                    self.expect(&TokenKind::RightBrace)?;
                }
                _ => return Err(self.error("`name`, `userset_rewrite` or '}'")),
            }
        }
        let Some(name) = name else {
            return Err(self.error("`name`"));
        };
        self.expect(&TokenKind::RightBrace)?;

        let relation = Relation::new(&name);
        Ok(match rewrite {
            Some(rewrite) => relation.with_rewrite(rewrite),
            None => relation,
        })
    }

    fn userset(&mut self) -> Result<UsersetExpression> {
        let keyword = match self.peek() {
            TokenKind::Ident(keyword) => keyword.clone(),
            _ => return Err(self.error("a userset")),
        };
        match keyword.as_str() {
            "_this" => {
                self.advance();
                if self.peek() == &TokenKind::LeftBrace {
                    self.advance();
                    self.expect(&TokenKind::RightBrace)?;
                }
                Ok(UsersetExpression::This)
            }
            "computed_userset" => {
                let fields = self.reference_clause("computed_userset")?;
                Ok(UsersetExpression::ComputedUserset(ComputedUserset {
                    namespace: fields.namespace,
                    object: fields.object,
                    relation: fields.relation,
                }))
            }
            "tuple_to_userset" => self.tuple_to_userset(),
            "union" | "intersect" | "exclude" => self.set_operation(keyword.parse()?),
            _ => Err(self.error(
                "`_this`, `computed_userset`, `tuple_to_userset`, `union`, `intersect` or `exclude`",
            )),
        }
    }

    fn tuple_to_userset(&mut self) -> Result<UsersetExpression> {
        self.expect_keyword("tuple_to_userset")?;
        self.expect(&TokenKind::LeftBrace)?;
        let tupleset = self.reference_clause("tupleset")?;
        let computed = self.reference_clause("computed_userset")?;
        self.expect(&TokenKind::RightBrace)?;

        Ok(UsersetExpression::TupleToUserset(TupleToUserset::new(
            Tupleset {
                namespace: tupleset.namespace,
                object: tupleset.object,
                relation: tupleset.relation,
            },
            ComputedUserset {
                namespace: computed.namespace,
                object: computed.object,
                relation: computed.relation,
            },
        )))
    }

    fn set_operation(&mut self, operator: SetOperator) -> Result<UsersetExpression> {
        self.advance();
        self.expect(&TokenKind::LeftBrace)?;

        let mut children = Vec::new();
        while self.peek_keyword("child") {
            self.advance();
            self.expect(&TokenKind::LeftBrace)?;
            children.push(self.userset()?);
            self.expect(&TokenKind::RightBrace)?;
        }
        if children.is_empty() {
            return Err(self.error("`child`"));
        }
        self.expect(&TokenKind::RightBrace)?;

        SetOperation::new(operator, children).map(UsersetExpression::SetOperation)
    }

    /// `<clause> { (namespace|object|relation): <value> ... }`, each field at most once.
    fn reference_clause(&mut self, clause: &str) -> Result<ReferenceFields> {
        self.expect_keyword(clause)?;
        self.expect(&TokenKind::LeftBrace)?;

        let mut fields = ReferenceFields::default();
        loop {
            let field = match self.peek() {
                TokenKind::RightBrace => break,
                TokenKind::Ident(field)
                    if matches!(field.as_str(), "namespace" | "object" | "relation") =>
                {
                    field.clone()
                }
                _ => return Err(self.error("`namespace`, `object`, `relation` or '}'")),
            };
            self.advance();
            self.expect(&TokenKind::Colon)?;
            let value = match self.peek() {
                TokenKind::Str(value) => Reference::Literal(value.clone()),
                TokenKind::Placeholder(reference) => reference.clone(),
                _ => return Err(self.error("a string literal or placeholder")),
            };
            self.advance();

            let slot = match field.as_str() {
                "namespace" => &mut fields.namespace,
                "object" => &mut fields.object,
                _ => &mut fields.relation,
            };
            if slot.is_some() {
                return Err(RebacError::AmbiguousReference {
                    clause: clause.to_string(),
                    field,
                });
            }
            *slot = Some(value);
        }
        self.expect(&TokenKind::RightBrace)?;
        Ok(fields)
    }
}
