use std::fmt;

use thiserror::Error;

/// Location of a token in namespace configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset from the start of the input.
    pub offset: usize,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// What stopped a Check path from descending further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionLimit {
    /// The relation is already on the current path.
    Cycle,
    /// The path used up the configured depth.
    DepthExhausted,
}

impl fmt::Display for RecursionLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecursionLimit::Cycle => write!(f, "cycle in namespace configuration"),
            RecursionLimit::DepthExhausted => write!(f, "depth budget exhausted"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RebacError {
    #[error(
        "Namespace not found: {name}{}",
        .version.map(|v| format!(" (version {v})")).unwrap_or_default()
    )]
    NamespaceNotFound { name: String, version: Option<u32> },

    #[error("Relation '{relation}' is not defined in namespace '{namespace}'")]
    RelationNotDefined { namespace: String, relation: String },

    #[error("Syntax error at {position}: expected {expected}, found {found}")]
    Syntax {
        position: Position,
        expected: String,
        found: String,
    },

    #[error("Ambiguous reference: {clause} specifies '{field}' more than once")]
    AmbiguousReference { clause: String, field: String },

    #[error("Relation '{relation}' is declared more than once in namespace '{namespace}'")]
    DuplicateRelation { namespace: String, relation: String },

    #[error("Invalid userset rewrite: {0}")]
    InvalidRewrite(String),

    #[error("Unsupported set operation: {0}")]
    UnsupportedSetOperation(String),

    #[error("Recursion limit exceeded at {namespace}:{object}#{relation}: {limit}")]
    RecursionLimitExceeded {
        namespace: String,
        object: String,
        relation: String,
        limit: RecursionLimit,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Namespace '{name}' version {version} conflicts with published version {latest}")]
    VersionConflict { name: String, version: u32, latest: u32 },

    #[error("Subject '{subject}' is not allowed in relation '{namespace}#{relation}'")]
    SubjectTypeNotAllowed {
        namespace: String,
        relation: String,
        subject: String,
    },

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    /// A path that closes a cycle contributes no members to the relation.
    pub fn is_cycle(&self) -> bool {
        matches!(
            self,
            RebacError::RecursionLimitExceeded {
                limit: RecursionLimit::Cycle,
                ..
            }
        )
    }

    /// A path cut off by the depth budget leaves its branch undecided.
    pub fn is_depth_exhausted(&self) -> bool {
        matches!(
            self,
            RebacError::RecursionLimitExceeded {
                limit: RecursionLimit::DepthExhausted,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
