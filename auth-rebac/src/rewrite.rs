//! Userset rewrite expressions: the compiled form of a namespace configuration.
//!
//! Every consumer dispatches on [`UsersetExpression`] with an exhaustive
//! `match`, so adding a node kind is a compile error everywhere it matters.
//! All values are immutable once built and are shared across evaluations
//! behind `Arc<Namespace>`.
//!
//! `Display` renders the namespace configuration language accepted by
//! [`crate::parser::parse_namespace`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

use crate::error::{RebacError, Result};
use crate::metadata::NamespaceMetadata;

pub const TUPLE_USERSET_NAMESPACE: &str = "$TUPLE_USERSET_NAMESPACE";
pub const TUPLE_USERSET_OBJECT: &str = "$TUPLE_USERSET_OBJECT";
pub const TUPLE_USERSET_RELATION: &str = "$TUPLE_USERSET_RELATION";

/// Value of a namespace/object/relation field in a computed userset or tupleset.
///
/// The placeholders are only meaningful inside a `tuple_to_userset`, where they
/// are filled from the subject of each matched tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    Literal(String),
    TupleUsersetNamespace,
    TupleUsersetObject,
    TupleUsersetRelation,
}

impl Reference {
    pub fn literal(value: &str) -> Self {
        Reference::Literal(value.to_string())
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Reference::Literal(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        !matches!(self, Reference::Literal(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Literal(value) => write_quoted(f, value),
            Reference::TupleUsersetNamespace => f.write_str(TUPLE_USERSET_NAMESPACE),
            Reference::TupleUsersetObject => f.write_str(TUPLE_USERSET_OBJECT),
            Reference::TupleUsersetRelation => f.write_str(TUPLE_USERSET_RELATION),
        }
    }
}

/// Redirects evaluation to another relation, optionally on another object.
///
/// Absent fields default to the current evaluation context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputedUserset {
    pub namespace: Option<Reference>,
    pub object: Option<Reference>,
    pub relation: Option<Reference>,
}

impl ComputedUserset {
    pub fn relation(relation: &str) -> Self {
        Self {
            relation: Some(Reference::literal(relation)),
            ..Self::default()
        }
    }

    /// Fully qualified userset `namespace:object#relation`.
    pub fn to(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: Some(Reference::literal(namespace)),
            object: Some(Reference::literal(object)),
            relation: Some(Reference::literal(relation)),
        }
    }

    pub fn with_namespace(mut self, namespace: Reference) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn with_object(mut self, object: Reference) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_relation(mut self, relation: Reference) -> Self {
        self.relation = Some(relation);
        self
    }

    fn has_placeholder(&self) -> bool {
        [&self.namespace, &self.object, &self.relation]
            .into_iter()
            .flatten()
            .any(Reference::is_placeholder)
    }
}

/// Selects the stored tuples that feed a [`TupleToUserset`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tupleset {
    pub namespace: Option<Reference>,
    pub object: Option<Reference>,
    pub relation: Option<Reference>,
}

impl Tupleset {
    pub fn relation(relation: &str) -> Self {
        Self {
            relation: Some(Reference::literal(relation)),
            ..Self::default()
        }
    }
}

/// For every tuple matching `tupleset`, evaluate `computed_userset` on its subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleToUserset {
    pub tupleset: Tupleset,
    pub computed_userset: ComputedUserset,
}

impl TupleToUserset {
    pub fn new(tupleset: Tupleset, computed_userset: ComputedUserset) -> Self {
        Self {
            tupleset,
            computed_userset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOperator {
    Union,
    Intersect,
    /// First child minus the union of the remaining children.
    Exclude,
}

impl SetOperator {
    pub fn keyword(self) -> &'static str {
        match self {
            SetOperator::Union => "union",
            SetOperator::Intersect => "intersect",
            SetOperator::Exclude => "exclude",
        }
    }
}

impl std::str::FromStr for SetOperator {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "union" => Ok(SetOperator::Union),
            "intersect" => Ok(SetOperator::Intersect),
            "exclude" => Ok(SetOperator::Exclude),
            other => Err(RebacError::UnsupportedSetOperation(other.to_string())),
        }
    }
}

/// A set operator over a non-empty, ordered list of children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SetOperationParts")]
pub struct SetOperation {
    operator: SetOperator,
    children: Vec<UsersetExpression>,
}

#[derive(Deserialize)]
struct SetOperationParts {
    operator: SetOperator,
    children: Vec<UsersetExpression>,
}

impl TryFrom<SetOperationParts> for SetOperation {
    type Error = RebacError;

    fn try_from(parts: SetOperationParts) -> Result<Self> {
        SetOperation::new(parts.operator, parts.children)
    }
}

impl SetOperation {
    pub fn new(operator: SetOperator, children: Vec<UsersetExpression>) -> Result<Self> {
        if children.is_empty() {
            return Err(RebacError::InvalidRewrite(format!(
                "{} requires at least one child",
                operator.keyword()
            )));
        }
        Ok(Self { operator, children })
    }

    pub fn operator(&self) -> SetOperator {
        self.operator
    }

    pub fn children(&self) -> &[UsersetExpression] {
        &self.children
    }
}

/// Node of a userset rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsersetExpression {
    /// Subjects stored directly for the current object and relation.
    This,
    ComputedUserset(ComputedUserset),
    TupleToUserset(TupleToUserset),
    SetOperation(SetOperation),
}

impl UsersetExpression {
    pub fn computed(relation: &str) -> Self {
        UsersetExpression::ComputedUserset(ComputedUserset::relation(relation))
    }

    pub fn tuple_to_userset(tupleset: Tupleset, computed_userset: ComputedUserset) -> Self {
        UsersetExpression::TupleToUserset(TupleToUserset::new(tupleset, computed_userset))
    }

    pub fn union(children: Vec<UsersetExpression>) -> Result<Self> {
        SetOperation::new(SetOperator::Union, children).map(UsersetExpression::SetOperation)
    }

    pub fn intersect(children: Vec<UsersetExpression>) -> Result<Self> {
        SetOperation::new(SetOperator::Intersect, children).map(UsersetExpression::SetOperation)
    }

    pub fn exclude(children: Vec<UsersetExpression>) -> Result<Self> {
        SetOperation::new(SetOperator::Exclude, children).map(UsersetExpression::SetOperation)
    }

    /// Checks the rules the grammar cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            UsersetExpression::This => Ok(()),
            UsersetExpression::ComputedUserset(computed) => {
                if computed.relation.is_none() {
                    return Err(RebacError::InvalidRewrite(
                        "computed_userset requires a relation".to_string(),
                    ));
                }
                if computed.has_placeholder() {
                    return Err(RebacError::InvalidRewrite(
                        "placeholders are only allowed inside tuple_to_userset".to_string(),
                    ));
                }
                Ok(())
            }
            UsersetExpression::TupleToUserset(ttu) => {
                match &ttu.tupleset.relation {
                    Some(Reference::Literal(_)) => {}
                    _ => {
                        return Err(RebacError::InvalidRewrite(
                            "tupleset requires a literal relation".to_string(),
                        ))
                    }
                }
                let tupleset_placeholder = [&ttu.tupleset.namespace, &ttu.tupleset.object]
                    .into_iter()
                    .flatten()
                    .any(Reference::is_placeholder);
                if tupleset_placeholder {
                    return Err(RebacError::InvalidRewrite(
                        "tupleset cannot use placeholders".to_string(),
                    ));
                }
                let computed = &ttu.computed_userset;
                let misplaced = [
                    (&computed.namespace, Reference::TupleUsersetNamespace),
                    (&computed.object, Reference::TupleUsersetObject),
                    (&computed.relation, Reference::TupleUsersetRelation),
                ]
                .into_iter()
                .any(|(field, allowed)| match field {
                    Some(reference) => reference.is_placeholder() && *reference != allowed,
                    None => false,
                });
                if misplaced {
                    return Err(RebacError::InvalidRewrite(
                        "placeholder used in the wrong computed_userset field".to_string(),
                    ));
                }
                Ok(())
            }
            UsersetExpression::SetOperation(operation) => {
                operation.children().iter().try_for_each(UsersetExpression::validate)
            }
        }
    }
}

impl fmt::Display for UsersetExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_userset(f, self, 0)
    }
}

/// One named relation of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub rewrite: UsersetExpression,
}

impl Relation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rewrite: UsersetExpression::This,
        }
    }

    pub fn with_rewrite(mut self, rewrite: UsersetExpression) -> Self {
        self.rewrite = rewrite;
        self
    }
}

/// A policy domain: named relations plus optional subject-type constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NamespaceParts", into = "NamespaceParts")]
pub struct Namespace {
    pub name: String,
    pub version: u32,
    relations: BTreeMap<String, Relation>,
    pub metadata: Option<NamespaceMetadata>,
}

#[derive(Serialize, Deserialize)]
struct NamespaceParts {
    name: String,
    #[serde(default)]
    version: u32,
    relations: Vec<Relation>,
    #[serde(default)]
    metadata: Option<NamespaceMetadata>,
}

impl TryFrom<NamespaceParts> for Namespace {
    type Error = RebacError;

    fn try_from(parts: NamespaceParts) -> Result<Self> {
        let mut namespace = Namespace::new(&parts.name).with_version(parts.version);
        for relation in parts.relations {
            namespace = namespace.with_relation(relation)?;
        }
        namespace.metadata = parts.metadata;
        Ok(namespace)
    }
}

impl From<Namespace> for NamespaceParts {
    fn from(namespace: Namespace) -> Self {
        Self {
            name: namespace.name,
            version: namespace.version,
            relations: namespace.relations.into_values().collect(),
            metadata: namespace.metadata,
        }
    }
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: 0,
            relations: BTreeMap::new(),
            metadata: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_metadata(mut self, metadata: NamespaceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Adds a relation; names must be unique within the namespace.
    pub fn with_relation(mut self, relation: Relation) -> Result<Self> {
        if self.relations.contains_key(&relation.name) {
            return Err(RebacError::DuplicateRelation {
                namespace: self.name,
                relation: relation.name,
            });
        }
        self.relations.insert(relation.name.clone(), relation);
        Ok(self)
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Looks up a relation, failing with `RelationNotDefined`.
    pub fn require_relation(&self, name: &str) -> Result<&Relation> {
        self.relation(name).ok_or_else(|| RebacError::RelationNotDefined {
            namespace: self.name.clone(),
            relation: name.to_string(),
        })
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn validate(&self) -> Result<()> {
        self.relations()
            .try_for_each(|relation| relation.rewrite.validate())?;
        match &self.metadata {
            Some(metadata) => metadata.check_consistency(self),
            None => Ok(()),
        }
    }
}

/// Renders the configuration language. The language has no syntax for
/// `version` or `metadata`, so parsing the output yields version 0 and no
/// metadata; the name and relations round-trip exactly.
impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("namespace {\n")?;
        indent(f, 1)?;
        f.write_str("name: ")?;
        write_quoted(f, &self.name)?;
        f.write_char('\n')?;
        for relation in self.relations() {
            indent(f, 1)?;
            f.write_str("relation {\n")?;
            indent(f, 2)?;
            f.write_str("name: ")?;
            write_quoted(f, &relation.name)?;
            f.write_char('\n')?;
            if relation.rewrite != UsersetExpression::This {
                indent(f, 2)?;
                f.write_str("userset_rewrite {\n")?;
                indent(f, 3)?;
                write_userset(f, &relation.rewrite, 3)?;
                f.write_char('\n')?;
                indent(f, 2)?;
                f.write_str("}\n")?;
            }
            indent(f, 1)?;
            f.write_str("}\n")?;
        }
        f.write_str("}\n")
    }
}

fn write_userset(
    f: &mut fmt::Formatter<'_>,
    expression: &UsersetExpression,
    depth: usize,
) -> fmt::Result {
    match expression {
        UsersetExpression::This => f.write_str("_this {}"),
        UsersetExpression::ComputedUserset(computed) => write_clause(
            f,
            "computed_userset",
            [&computed.namespace, &computed.object, &computed.relation],
        ),
        UsersetExpression::TupleToUserset(ttu) => {
            f.write_str("tuple_to_userset {\n")?;
            indent(f, depth + 1)?;
            write_clause(
                f,
                "tupleset",
                [&ttu.tupleset.namespace, &ttu.tupleset.object, &ttu.tupleset.relation],
            )?;
            f.write_char('\n')?;
            indent(f, depth + 1)?;
            let computed = &ttu.computed_userset;
            write_clause(
                f,
                "computed_userset",
                [&computed.namespace, &computed.object, &computed.relation],
            )?;
            f.write_char('\n')?;
            indent(f, depth)?;
            f.write_char('}')
        }
        UsersetExpression::SetOperation(operation) => {
            writeln!(f, "{} {{", operation.operator().keyword())?;
            for child in operation.children() {
                indent(f, depth + 1)?;
                f.write_str("child {\n")?;
                indent(f, depth + 2)?;
                write_userset(f, child, depth + 2)?;
                f.write_char('\n')?;
                indent(f, depth + 1)?;
                f.write_str("}\n")?;
            }
            indent(f, depth)?;
            f.write_char('}')
        }
    }
}

fn write_clause(
    f: &mut fmt::Formatter<'_>,
    keyword: &str,
    fields: [&Option<Reference>; 3],
) -> fmt::Result {
    write!(f, "{keyword} {{")?;
    for (field, value) in ["namespace", "object", "relation"].into_iter().zip(fields) {
        if let Some(value) = value {
            write!(f, " {field}: {value}")?;
        }
    }
    f.write_str(" }")
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        f.write_str("  ")?;
    }
    Ok(())
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in value.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer_rewrite() -> UsersetExpression {
        UsersetExpression::union(vec![
            UsersetExpression::This,
            UsersetExpression::computed("editor"),
            UsersetExpression::tuple_to_userset(
                Tupleset::relation("parent"),
                ComputedUserset::relation("viewer").with_object(Reference::TupleUsersetObject),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_set_operator_keywords() {
        for operator in [SetOperator::Union, SetOperator::Intersect, SetOperator::Exclude] {
            assert_eq!(operator.keyword().parse::<SetOperator>().unwrap(), operator);
        }
        assert!(matches!(
            "xor".parse::<SetOperator>(),
            Err(RebacError::UnsupportedSetOperation(op)) if op == "xor"
        ));
    }

    #[test]
    fn test_set_operation_requires_children() {
        assert!(matches!(
            UsersetExpression::intersect(vec![]),
            Err(RebacError::InvalidRewrite(_))
        ));
    }

    #[test]
    fn test_duplicate_relation_rejected() {
        let result = Namespace::new("doc")
            .with_relation(Relation::new("owner"))
            .unwrap()
            .with_relation(Relation::new("owner"));
        assert!(matches!(result, Err(RebacError::DuplicateRelation { .. })));
    }

    #[test]
    fn test_validate_rejects_placeholder_outside_tuple_to_userset() {
        let rewrite = UsersetExpression::ComputedUserset(
            ComputedUserset::relation("viewer").with_object(Reference::TupleUsersetObject),
        );
        assert!(rewrite.validate().is_err());
        assert!(viewer_rewrite().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_misplaced_placeholder() {
        let rewrite = UsersetExpression::tuple_to_userset(
            Tupleset::relation("parent"),
            ComputedUserset::relation("viewer").with_namespace(Reference::TupleUsersetObject),
        );
        assert!(matches!(rewrite.validate(), Err(RebacError::InvalidRewrite(_))));
    }

    #[test]
    fn test_validate_rejects_computed_userset_without_relation() {
        let rewrite = UsersetExpression::ComputedUserset(ComputedUserset::default());
        assert!(matches!(rewrite.validate(), Err(RebacError::InvalidRewrite(_))));
    }

    #[test]
    fn test_render_namespace() {
        let namespace = Namespace::new("doc")
            .with_relation(Relation::new("owner"))
            .unwrap()
            .with_relation(Relation::new("viewer").with_rewrite(viewer_rewrite()))
            .unwrap();

        let rendered = namespace.to_string();
        assert!(rendered.starts_with("namespace {\n  name: \"doc\"\n"));
        let computed = "computed_userset { object: $TUPLE_USERSET_OBJECT relation: \"viewer\" }";
        assert!(rendered.contains(computed));
        assert!(rendered.contains("tupleset { relation: \"parent\" }"));
    }

    #[test]
    fn test_namespace_serde_keeps_relations() {
        let namespace = Namespace::new("doc")
            .with_version(2)
            .with_relation(Relation::new("viewer").with_rewrite(viewer_rewrite()))
            .unwrap();
        let json = serde_json::to_string(&namespace).unwrap();
        let decoded: Namespace = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, namespace);
    }
}
