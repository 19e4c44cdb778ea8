//! State shared by all branches of a single Check or Expand call.

use ahash::AHashSet;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    cancellation::CancellationToken,
    error::{RebacError, Result},
    models::{Object, SubjectSet},
    rewrite::{ComputedUserset, Namespace, Reference, Tupleset},
    store::{NamespaceStore, RelationTupleStore},
};

/// Stores plus the per-call namespace snapshot and the in-flight query bound.
pub(crate) struct EvaluationScope {
    pub(crate) tuples: Arc<dyn RelationTupleStore>,
    namespaces: Arc<dyn NamespaceStore>,
    pinned: Arc<BTreeMap<String, u32>>,
    snapshot: DashMap<String, Arc<Namespace>>,
    limiter: Arc<Semaphore>,
}

impl EvaluationScope {
    pub(crate) fn new(
        tuples: Arc<dyn RelationTupleStore>,
        namespaces: Arc<dyn NamespaceStore>,
        pinned: Arc<BTreeMap<String, u32>>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self {
            tuples,
            namespaces,
            pinned,
            snapshot: DashMap::new(),
            limiter,
        }
    }

    /// Runs a store query under the concurrency bound. `Ok(None)` means the
    /// token was cancelled before the query finished.
    pub(crate) async fn query<T, F>(&self, token: &CancellationToken, query: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(None),
            permit = self.limiter.acquire() => permit,
        };
        let _permit = permit
            .map_err(|_| RebacError::StoreUnavailable("query limiter closed".to_string()))?;
        tokio::select! {
            biased;
            () = token.cancelled() => Ok(None),
            result = query => result.map(Some),
        }
    }

    /// Resolves a namespace, fixing its version for the rest of the call.
    pub(crate) async fn namespace(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<Arc<Namespace>>> {
        let cached = self.snapshot.get(name).map(|entry| Arc::clone(entry.value()));
        if cached.is_some() {
            return Ok(cached);
        }

        let fetched = match self.pinned.get(name) {
            Some(&version) => self.query(token, self.namespaces.namespace(name, version)).await?,
            None => self.query(token, self.namespaces.latest_namespace(name)).await?,
        };
        let Some(fetched) = fetched else {
            return Ok(None);
        };
        debug!(namespace = name, version = fetched.version, "Resolved namespace");
        let namespace = self
            .snapshot
            .entry(name.to_string())
            .or_insert(fetched)
            .clone();
        Ok(Some(namespace))
    }
}

fn literal<'a>(reference: Option<&'a Reference>, field: &str) -> Result<Option<&'a str>> {
    match reference {
        None => Ok(None),
        Some(Reference::Literal(value)) => Ok(Some(value)),
        Some(placeholder) => Err(RebacError::InvalidRewrite(format!(
            "{placeholder} in {field} is only valid inside tuple_to_userset"
        ))),
    }
}

fn literal_target(
    namespace: Option<&Reference>,
    object_id: Option<&Reference>,
    relation: Option<&Reference>,
    object: &Object,
    clause: &str,
) -> Result<(Object, String)> {
    let namespace = literal(namespace, "namespace")?.unwrap_or(&object.namespace);
    let id = literal(object_id, "object")?.unwrap_or(&object.id);
    let relation = literal(relation, "relation")?
        .ok_or_else(|| RebacError::InvalidRewrite(format!("{clause} requires a relation")))?;
    Ok((Object::new(namespace, id), relation.to_string()))
}

/// Target of a computed userset evaluated on `object`.
pub(crate) fn computed_target(
    computed: &ComputedUserset,
    object: &Object,
) -> Result<(Object, String)> {
    literal_target(
        computed.namespace.as_ref(),
        computed.object.as_ref(),
        computed.relation.as_ref(),
        object,
        "computed_userset",
    )
}

/// Object and relation whose tuples feed a tuple-to-userset on `object`.
pub(crate) fn tupleset_source(tupleset: &Tupleset, object: &Object) -> Result<(Object, String)> {
    literal_target(
        tupleset.namespace.as_ref(),
        tupleset.object.as_ref(),
        tupleset.relation.as_ref(),
        object,
        "tupleset",
    )
}

/// Target reached through one matched tupleset subject. Literal namespace and
/// object win over the subject's; `...` takes the computed relation, or
/// `context_relation` when the computed relation is not a literal.
pub(crate) fn tuple_userset_target(
    computed: &ComputedUserset,
    set: &SubjectSet,
    context_relation: &str,
) -> (Object, String) {
    let pick = |reference: &Option<Reference>, from_subject: &str| -> String {
        reference
            .as_ref()
            .and_then(Reference::as_literal)
            .unwrap_or(from_subject)
            .to_string()
    };
    let namespace = pick(&computed.namespace, &set.namespace);
    let id = pick(&computed.object, &set.object);
    let relation = if set.is_wildcard() {
        pick(&computed.relation, context_relation)
    } else {
        set.relation.clone()
    };
    (Object { namespace, id }, relation)
}

/// A `(namespace, object, relation)` triple on the current evaluation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PathKey {
    object: Object,
    relation: String,
}

impl PathKey {
    pub(crate) fn new(object: &Object, relation: &str) -> Self {
        Self {
            object: object.clone(),
            relation: relation.to_string(),
        }
    }
}

/// The relations entered between the root of a call and the current node.
/// Copied on extension so sibling branches never observe each other.
#[derive(Debug, Clone, Default)]
pub(crate) struct VisitedPath(Arc<AHashSet<PathKey>>);

impl VisitedPath {
    pub(crate) fn contains(&self, key: &PathKey) -> bool {
        self.0.contains(key)
    }

    pub(crate) fn with(&self, key: PathKey) -> Self {
        let mut visited = (*self.0).clone();
        visited.insert(key);
        Self(Arc::new(visited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryNamespaceStore, InMemoryTupleStore};

    fn scope(
        namespaces: Arc<InMemoryNamespaceStore>,
        pinned: BTreeMap<String, u32>,
        permits: usize,
    ) -> EvaluationScope {
        EvaluationScope::new(
            Arc::new(InMemoryTupleStore::new()),
            namespaces,
            Arc::new(pinned),
            Arc::new(Semaphore::new(permits)),
        )
    }

    #[tokio::test]
    async fn test_snapshot_fixes_version_within_call() {
        let namespaces = Arc::new(InMemoryNamespaceStore::new());
        namespaces.publish(Namespace::new("doc").with_version(1)).unwrap();
        let scope = scope(namespaces.clone(), BTreeMap::new(), 4);
        let token = CancellationToken::new();

        assert_eq!(scope.namespace("doc", &token).await.unwrap().unwrap().version, 1);
        namespaces.publish(Namespace::new("doc").with_version(2)).unwrap();
        assert_eq!(scope.namespace("doc", &token).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_pinned_version() {
        let namespaces = Arc::new(InMemoryNamespaceStore::new());
        namespaces.publish(Namespace::new("doc").with_version(1)).unwrap();
        namespaces.publish(Namespace::new("doc").with_version(2)).unwrap();
        let pinned = BTreeMap::from([("doc".to_string(), 1)]);
        let scope = scope(namespaces, pinned, 4);

        let resolved = scope.namespace("doc", &CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(resolved.version, 1);
    }

    #[tokio::test]
    async fn test_query_returns_none_when_cancelled() {
        let scope = scope(Arc::new(InMemoryNamespaceStore::new()), BTreeMap::new(), 1);
        let token = CancellationToken::new();
        token.cancel();
        let result = scope.query(&token, async { Ok(1) }).await.unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_computed_target_defaults_to_context() {
        let object = Object::new("doc", "d1");
        let (target, relation) =
            computed_target(&ComputedUserset::relation("owner"), &object).unwrap();
        assert_eq!((target, relation.as_str()), (object.clone(), "owner"));

        let (target, _) =
            computed_target(&ComputedUserset::to("folder", "f1", "viewer"), &object).unwrap();
        assert_eq!(target, Object::new("folder", "f1"));

        assert!(computed_target(&ComputedUserset::default(), &object).is_err());
        let placeholder =
            ComputedUserset::relation("viewer").with_object(Reference::TupleUsersetObject);
        assert!(matches!(
            computed_target(&placeholder, &object),
            Err(RebacError::InvalidRewrite(_))
        ));
    }

    #[test]
    fn test_tuple_userset_target_resolution() {
        let computed =
            ComputedUserset::relation("viewer").with_object(Reference::TupleUsersetObject);

        let wildcard = SubjectSet::new("folder", "f1", "...");
        assert_eq!(
            tuple_userset_target(&computed, &wildcard, "reader"),
            (Object::new("folder", "f1"), "viewer".to_string())
        );

        let explicit = SubjectSet::new("folder", "f1", "owner");
        assert_eq!(
            tuple_userset_target(&computed, &explicit, "reader"),
            (Object::new("folder", "f1"), "owner".to_string())
        );

        let passthrough = ComputedUserset::default().with_relation(Reference::TupleUsersetRelation);
        assert_eq!(
            tuple_userset_target(&passthrough, &wildcard, "reader"),
            (Object::new("folder", "f1"), "reader".to_string())
        );
    }

    #[test]
    fn test_visited_path_is_copy_on_write() {
        let root = VisitedPath::default();
        let key = PathKey::new(&Object::new("doc", "d1"), "viewer");
        let extended = root.with(key.clone());
        assert!(extended.contains(&key));
        assert!(!root.contains(&key));
    }
}
