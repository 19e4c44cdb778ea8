//! Relationship-based authorization engine in the style of Google Zanzibar
//!
//! This crate provides:
//! - A userset rewrite model describing how each relation is derived
//! - A parser for the namespace configuration language
//! - Check: does a subject hold a relation on an object?
//! - Expand: which subjects hold it, and through which rewrite?
//! - Subject type constraints for validating tuple writes
//! - Store interfaces with in-memory implementations
//!
//! # Core Concepts
//!
//! - **Object**: Any resource that can be protected, identified as `namespace:id`
//! - **Subject**: A concrete principal (`user:alice`) or the members of another
//!   relation (`group:eng#member`)
//! - **Relation Tuple**: A stored fact `doc:doc_1#owner@user:alice`
//! - **Userset Rewrite**: How a relation is computed from `_this`, other relations,
//!   and relations on objects reached through tuples
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{
//!     AuthorizationEngine, EngineConfig, InMemoryNamespaceStore, InMemoryTupleStore, Object,
//!     Subject,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let namespaces = InMemoryNamespaceStore::new();
//!     namespaces.publish_source(
//!         r#"namespace {
//!              name: "doc"
//!              relation { name: "owner" }
//!              relation {
//!                name: "viewer"
//!                userset_rewrite {
//!                  union {
//!                    child { _this }
//!                    child { computed_userset { relation: "owner" } }
//!                  }
//!                }
//!              }
//!            }"#,
//!         1,
//!     )?;
//!
//!     let tuples = InMemoryTupleStore::new();
//!     tuples.write_tuple("doc:doc_1#owner@user:alice".parse()?).await?;
//!
//!     let (tuples, namespaces) = (Arc::new(tuples), Arc::new(namespaces));
//!     let engine = AuthorizationEngine::new(tuples, namespaces, EngineConfig::default())?;
//!     let allowed = engine
//!         .check(&Object::new("doc", "doc_1"), "viewer", &Subject::user("alice"))
//!         .await?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod cancellation;
mod check;
pub mod config;
pub(crate) mod context;
pub mod engine;
pub mod error;
pub mod expand;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod rewrite;
pub mod store;

pub use cancellation::CancellationToken;
pub use crate::config::EngineConfig;
pub use engine::AuthorizationEngine;
pub use error::*;
pub use expand::{SubjectTree, Truncation};
pub use metadata::{validate_tuple, NamespaceMetadata, SubjectType};
pub use models::*;
pub use parser::parse_namespace;
pub use rewrite::*;
pub use store::*;
