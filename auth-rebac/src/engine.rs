use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    cancellation::CancellationToken,
    check::PermissionChecker,
    config::EngineConfig,
    context::EvaluationScope,
    error::{RebacError, Result},
    expand::{SubjectExpander, SubjectTree},
    metadata,
    models::*,
    store::{NamespaceStore, RelationTupleStore},
};

/// Core authorization engine
///
/// Interprets namespace rewrites against the tuple graph. The engine owns no
/// mutable state of its own: every call takes a fresh namespace snapshot and
/// only reads from the stores.
pub struct AuthorizationEngine {
    /// Storage for relationship tuples
    tuples: Arc<dyn RelationTupleStore>,

    /// Published namespace configurations
    namespaces: Arc<dyn NamespaceStore>,

    config: EngineConfig,

    /// Bounds store queries in flight across all calls
    limiter: Arc<Semaphore>,

    /// Namespace versions to evaluate instead of the latest
    pinned: Arc<BTreeMap<String, u32>>,
}

impl AuthorizationEngine {
    pub fn new(
        tuples: Arc<dyn RelationTupleStore>,
        namespaces: Arc<dyn NamespaceStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            max_check_depth = config.max_check_depth,
            max_concurrent_queries = config.max_concurrent_queries,
            "Creating authorization engine"
        );
        Ok(Self {
            tuples,
            namespaces,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries)),
            config,
            pinned: Arc::new(BTreeMap::new()),
        })
    }

    /// Evaluate `name` at `version` rather than its latest published version.
    pub fn pin_namespace(mut self, name: &str, version: u32) -> Self {
        Arc::make_mut(&mut self.pinned).insert(name.to_string(), version);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn scope(&self) -> EvaluationScope {
        EvaluationScope::new(
            Arc::clone(&self.tuples),
            Arc::clone(&self.namespaces),
            Arc::clone(&self.pinned),
            Arc::clone(&self.limiter),
        )
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if `subject` holds `relation` on `object`
    pub async fn check(&self, object: &Object, relation: &str, subject: &Subject) -> Result<bool> {
        self.check_with_cancellation(object, relation, subject, &CancellationToken::new())
            .await
    }

    /// Check that fails with `Cancelled` once `token` is cancelled
    pub async fn check_with_cancellation(
        &self,
        object: &Object,
        relation: &str,
        subject: &Subject,
        token: &CancellationToken,
    ) -> Result<bool> {
        debug!(object = %object, relation, subject = %subject, "Check");
        let scope = self.scope();
        let result = PermissionChecker::new(&scope, subject, self.config.max_check_depth)
            .check(object, relation, token)
            .await;
        if let Err(RebacError::StoreUnavailable(reason)) = &result {
            warn!(object = %object, relation, reason = %reason, "Check aborted by store failure");
        }
        result
    }

    /// Batch check multiple permissions at once
    pub async fn batch_check(&self, requests: Vec<CheckRequest>) -> Result<Vec<CheckResponse>> {
        let checks = requests.into_iter().map(|request| async move {
            let allowed = self.check(&request.object, &request.relation, &request.subject).await?;
            Ok::<_, RebacError>(CheckResponse { request, allowed })
        });
        try_join_all(checks).await
    }

    // =============================================================================
    // Permission Expansion
    // =============================================================================

    /// Expand the subjects holding `relation` on `object`, descending at most
    /// `depth` relation levels
    pub async fn expand(&self, object: &Object, relation: &str, depth: u32) -> Result<SubjectTree> {
        self.expand_with_cancellation(object, relation, depth, &CancellationToken::new())
            .await
    }

    /// Expand whose unfinished branches are marked cancelled once `token` is cancelled
    pub async fn expand_with_cancellation(
        &self,
        object: &Object,
        relation: &str,
        depth: u32,
        token: &CancellationToken,
    ) -> Result<SubjectTree> {
        debug!(object = %object, relation, depth, "Expand");
        let scope = self.scope();
        let result = SubjectExpander::new(&scope).expand(object, relation, depth, token).await;
        if let Err(RebacError::StoreUnavailable(reason)) = &result {
            warn!(object = %object, relation, reason = %reason, "Expand aborted by store failure");
        }
        result
    }

    /// Concrete subjects holding `relation` on `object` at the default expand depth
    pub async fn list_subjects(&self, object: &Object, relation: &str) -> Result<Vec<Subject>> {
        let tree = self
            .expand(object, relation, self.config.default_expand_depth)
            .await?;
        if !tree.is_complete() {
            debug!(object = %object, relation, "Subject list is incomplete");
        }
        Ok(tree.subject_ids().cloned().map(Subject::Id).collect())
    }

    // =============================================================================
    // Tuple Validation
    // =============================================================================

    /// Validate a tuple against its namespace's relations and subject type constraints
    pub async fn validate_tuple(&self, tuple: &RelationTuple) -> Result<()> {
        let name = &tuple.object.namespace;
        let namespace = match self.pinned.get(name) {
            Some(&version) => self.namespaces.namespace(name, version).await?,
            None => self.namespaces.latest_namespace(name).await?,
        };
        metadata::validate_tuple(&namespace, tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryNamespaceStore, InMemoryTupleStore};

    const FOLDER: &str = r#"
        namespace {
          name: "folder"
          relation { name: "viewer" }
        }"#;

    const DOC: &str = r#"
        namespace {
          name: "doc"
          relation { name: "owner" }
          relation { name: "parent" }
          relation {
            name: "editor"
            userset_rewrite {
              union {
                child { _this }
                child { computed_userset { relation: "owner" } }
              }
            }
          }
          relation {
            name: "viewer"
            userset_rewrite {
              union {
                child { _this }
                child { computed_userset { relation: "editor" } }
                child {
                  tuple_to_userset {
                    tupleset { relation: "parent" }
                    computed_userset {
                      object: $TUPLE_USERSET_OBJECT
                      relation: "viewer"
                    }
                  }
                }
              }
            }
          }
        }"#;

    fn engine() -> AuthorizationEngine {
        let namespaces = InMemoryNamespaceStore::new();
        namespaces.publish_source(FOLDER, 1).unwrap();
        namespaces.publish_source(DOC, 1).unwrap();
        let tuples = InMemoryTupleStore::from_tuples(
            [
                "doc:doc_1#owner@user:user_1",
                "doc:doc_1#parent@folder:folder_1#...",
                "folder:folder_1#viewer@user:user_2",
            ]
            .iter()
            .map(|t| t.parse().unwrap()),
        );
        AuthorizationEngine::new(Arc::new(tuples), Arc::new(namespaces), EngineConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_document_and_folder_scenario() {
        let engine = engine();
        let doc = Object::new("doc", "doc_1");

        assert!(engine.check(&doc, "viewer", &Subject::user("user_1")).await.unwrap());
        assert!(engine.check(&doc, "viewer", &Subject::user("user_2")).await.unwrap());
        assert!(!engine.check(&doc, "viewer", &Subject::user("user_3")).await.unwrap());
        assert!(engine.check(&doc, "editor", &Subject::user("user_1")).await.unwrap());
        assert!(!engine.check(&doc, "editor", &Subject::user("user_2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_check_preserves_order() {
        let engine = engine();
        let doc = Object::new("doc", "doc_1");
        let requests = vec![
            CheckRequest::new(doc.clone(), "viewer", Subject::user("user_3")),
            CheckRequest::new(doc.clone(), "viewer", Subject::user("user_2")),
        ];

        let responses = engine.batch_check(requests.clone()).await.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].request, requests[0]);
        assert!(!responses[0].allowed);
        assert!(responses[1].allowed);
    }

    #[tokio::test]
    async fn test_list_subjects() {
        let engine = engine();
        let subjects = engine.list_subjects(&Object::new("doc", "doc_1"), "viewer").await.unwrap();
        assert_eq!(subjects, vec![Subject::user("user_1"), Subject::user("user_2")]);
    }

    #[tokio::test]
    async fn test_validate_tuple() {
        let engine = engine();
        assert!(engine
            .validate_tuple(&"doc:doc_1#viewer@user:user_9".parse().unwrap())
            .await
            .is_ok());
        assert!(matches!(
            engine.validate_tuple(&"doc:doc_1#approver@user:user_9".parse().unwrap()).await,
            Err(RebacError::RelationNotDefined { .. })
        ));
        assert!(matches!(
            engine.validate_tuple(&"report:r1#viewer@user:user_9".parse().unwrap()).await,
            Err(RebacError::NamespaceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pinned_namespace_version() {
        let namespaces = Arc::new(InMemoryNamespaceStore::new());
        namespaces.publish_source(FOLDER, 1).unwrap();
        namespaces
            .publish_source(
                r#"namespace {
                  name: "folder"
                  relation { name: "owner" }
                  relation {
                    name: "viewer"
                    userset_rewrite { computed_userset { relation: "owner" } }
                  }
                }"#,
                2,
            )
            .unwrap();
        let tuples = Arc::new(InMemoryTupleStore::from_tuples([
            "folder:f1#viewer@user:alice".parse().unwrap()
        ]));
        let alice = Subject::user("alice");
        let folder = Object::new("folder", "f1");

        let latest =
            AuthorizationEngine::new(tuples.clone(), namespaces.clone(), EngineConfig::default())
                .unwrap();
        assert!(!latest.check(&folder, "viewer", &alice).await.unwrap());

        let pinned = AuthorizationEngine::new(tuples, namespaces, EngineConfig::default())
            .unwrap()
            .pin_namespace("folder", 1);
        assert!(pinned.check(&folder, "viewer", &alice).await.unwrap());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = AuthorizationEngine::new(
            Arc::new(InMemoryTupleStore::new()),
            Arc::new(InMemoryNamespaceStore::new()),
            EngineConfig::default().with_max_concurrent_queries(0),
        );
        assert!(matches!(result, Err(RebacError::Configuration(_))));
    }
}
