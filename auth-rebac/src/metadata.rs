//! Subject-type constraints for tuple writes.
//!
//! A namespace may restrict, per relation, which kinds of subjects a stored
//! tuple can reference. Check and Expand never consult these constraints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{RebacError, Result};
use crate::models::{RelationTuple, Subject};
use crate::rewrite::Namespace;

/// `user` admits subject ids of namespace `user`; `group#member` admits
/// subject sets over the `member` relation of `group` objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectType {
    pub namespace: String,
    pub relation: Option<String>,
}

impl SubjectType {
    pub fn id(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: None,
        }
    }

    pub fn set(namespace: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        match (subject, &self.relation) {
            (Subject::Id(id), None) => id.namespace == self.namespace,
            (Subject::Set(set), Some(relation)) => {
                set.namespace == self.namespace && &set.relation == relation
            }
            _ => false,
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{}#{}", self.namespace, relation),
            None => f.write_str(&self.namespace),
        }
    }
}

impl FromStr for SubjectType {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('#') {
            Some((namespace, relation)) if !namespace.is_empty() && !relation.is_empty() => {
                Ok(Self::set(namespace, relation))
            }
            None if !s.is_empty() => Ok(Self::id(s)),
            _ => Err(RebacError::InvalidTuple(format!("invalid subject type '{s}'"))),
        }
    }
}

/// Per-relation allow-lists. Relations without an entry accept any subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMetadata {
    relation_types: BTreeMap<String, Vec<SubjectType>>,
}

impl NamespaceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, relation: &str, subject_type: SubjectType) -> Self {
        let allowed = self.relation_types.entry(relation.to_string()).or_default();
        if !allowed.contains(&subject_type) {
            allowed.push(subject_type);
        }
        self
    }

    pub fn allowed_types(&self, relation: &str) -> Option<&[SubjectType]> {
        self.relation_types.get(relation).map(Vec::as_slice)
    }

    /// Every constrained relation must exist in `namespace`.
    pub fn check_consistency(&self, namespace: &Namespace) -> Result<()> {
        match self
            .relation_types
            .keys()
            .find(|relation| namespace.relation(relation).is_none())
        {
            Some(relation) => Err(RebacError::RelationNotDefined {
                namespace: namespace.name.clone(),
                relation: relation.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Validates a tuple write against the namespace it targets.
pub fn validate_tuple(namespace: &Namespace, tuple: &RelationTuple) -> Result<()> {
    if tuple.object.namespace != namespace.name {
        return Err(RebacError::InvalidTuple(format!(
            "tuple {} does not belong to namespace '{}'",
            tuple, namespace.name
        )));
    }
    namespace.require_relation(&tuple.relation)?;

    let Some(allowed) = namespace
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.allowed_types(&tuple.relation))
    else {
        return Ok(());
    };

    if allowed.iter().any(|subject_type| subject_type.matches(&tuple.subject)) {
        Ok(())
    } else {
        Err(RebacError::SubjectTypeNotAllowed {
            namespace: namespace.name.clone(),
            relation: tuple.relation.clone(),
            subject: tuple.subject.to_string(),
        })
    }
}
