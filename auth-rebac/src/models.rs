use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RebacError;

/// Subject-set relation meaning "the relation supplied by the evaluating context".
pub const ELLIPSIS: &str = "...";

/// An object (resource) identified by namespace and id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Object {
    pub namespace: String,
    pub id: String,
}

impl Object {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for Object {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, id) = split_non_empty(s, ':').ok_or_else(|| {
            RebacError::InvalidTuple(format!("object must be 'namespace:id', got '{s}'"))
        })?;
        Ok(Self::new(namespace, id))
    }
}

/// A concrete principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId {
    pub namespace: String,
    pub id: String,
}

/// All subjects holding `relation` on `namespace:object`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectSet {
    pub namespace: String,
    pub object: String,
    pub relation: String,
}

impl SubjectSet {
    pub fn new(namespace: &str, object: &str, relation: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
        }
    }

    pub fn object(&self) -> Object {
        Object::new(&self.namespace, &self.object)
    }

    pub fn is_wildcard(&self) -> bool {
        self.relation == ELLIPSIS
    }

    /// The relation to evaluate on the referenced object; `...` yields `context_relation`.
    pub fn resolve_relation<'a>(&'a self, context_relation: &'a str) -> &'a str {
        if self.is_wildcard() {
            context_relation
        } else {
            &self.relation
        }
    }
}

impl fmt::Display for SubjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object, self.relation)
    }
}

/// Represents a subject in the authorization system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subject {
    Id(SubjectId),
    Set(SubjectSet),
}

impl Subject {
    pub fn id(namespace: &str, id: &str) -> Self {
        Subject::Id(SubjectId {
            namespace: namespace.to_string(),
            id: id.to_string(),
        })
    }

    pub fn user(user_id: &str) -> Self {
        Self::id("user", user_id)
    }

    pub fn set(namespace: &str, object: &str, relation: &str) -> Self {
        Subject::Set(SubjectSet::new(namespace, object, relation))
    }

    pub fn as_subject_set(&self) -> Option<&SubjectSet> {
        match self {
            Subject::Set(set) => Some(set),
            Subject::Id(_) => None,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Subject::Id(id) => &id.namespace,
            Subject::Set(set) => &set.namespace,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Id(id) => write!(f, "{}:{}", id.namespace, id.id),
            Subject::Set(set) => set.fmt(f),
        }
    }
}

impl FromStr for Subject {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RebacError::InvalidTuple(format!("invalid subject '{s}'"));
        match s.rsplit_once('#') {
            Some((object, relation)) if !relation.is_empty() => {
                let (namespace, id) = split_non_empty(object, ':').ok_or_else(invalid)?;
                Ok(Subject::set(namespace, id, relation))
            }
            Some(_) => Err(invalid()),
            None => {
                let (namespace, id) = split_non_empty(s, ':').ok_or_else(invalid)?;
                Ok(Subject::id(namespace, id))
            }
        }
    }
}

/// A stored fact: `subject` holds `relation` on `object`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationTuple {
    pub object: Object,
    pub relation: String,
    pub subject: Subject,
}

impl RelationTuple {
    pub fn new(object: Object, relation: &str, subject: Subject) -> Self {
        Self {
            object,
            relation: relation.to_string(),
            subject,
        }
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.subject)
    }
}

impl FromStr for RelationTuple {
    type Err = RebacError;

    /// Parses `namespace:object#relation@subject`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            RebacError::InvalidTuple(format!(
                "tuple must be 'ns:object#relation@subject', got '{s}'"
            ))
        };
        let (resource, subject) = s.split_once('@').ok_or_else(invalid)?;
        let (object, relation) = split_non_empty(resource, '#').ok_or_else(invalid)?;
        Ok(Self {
            object: object.parse()?,
            relation: relation.to_string(),
            subject: subject.parse()?,
        })
    }
}

/// Authorization check request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub object: Object,
    pub relation: String,
    pub subject: Subject,
}

impl CheckRequest {
    pub fn new(object: Object, relation: &str, subject: Subject) -> Self {
        Self {
            object,
            relation: relation.to_string(),
            subject,
        }
    }
}

/// Authorization check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub request: CheckRequest,
    pub allowed: bool,
}

fn split_non_empty(s: &str, separator: char) -> Option<(&str, &str)> {
    s.split_once(separator)
        .filter(|(left, right)| !left.is_empty() && !right.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tuple_with_subject_id() {
        let tuple: RelationTuple = "doc:doc_1#owner@user:user_1".parse().unwrap();
        assert_eq!(tuple.object, Object::new("doc", "doc_1"));
        assert_eq!(tuple.relation, "owner");
        assert_eq!(tuple.subject, Subject::user("user_1"));
        assert_eq!(tuple.to_string(), "doc:doc_1#owner@user:user_1");
    }

    #[test]
    fn test_parse_tuple_with_subject_set() {
        let tuple: RelationTuple = "doc:doc_1#parent@folder:folder_1#...".parse().unwrap();
        let set = tuple.subject.as_subject_set().unwrap();
        assert_eq!(set.object(), Object::new("folder", "folder_1"));
        assert!(set.is_wildcard());
        assert_eq!(set.resolve_relation("viewer"), "viewer");
    }

    #[test]
    fn test_parse_rejects_malformed_tuples() {
        assert!("doc:doc_1#owner".parse::<RelationTuple>().is_err());
        assert!("doc_1#owner@user:alice".parse::<RelationTuple>().is_err());
        assert!("doc:doc_1#@user:alice".parse::<RelationTuple>().is_err());
        assert!("doc:doc_1#owner@alice".parse::<RelationTuple>().is_err());
        assert!("doc:doc_1#owner@group:eng#".parse::<RelationTuple>().is_err());
    }

    #[test]
    fn test_subject_ordering_is_stable() {
        let mut subjects = vec![
            Subject::set("group", "eng", "member"),
            Subject::user("bob"),
            Subject::user("alice"),
        ];
        subjects.sort();
        assert_eq!(subjects[0], Subject::user("alice"));
        assert_eq!(subjects[2], Subject::set("group", "eng", "member"));
    }
}
