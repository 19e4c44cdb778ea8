use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    error::{RebacError, Result},
    models::*,
    parser::parse_namespace,
    rewrite::Namespace,
};

/// Restricts the subjects returned by [`RelationTupleStore::relation_tuples`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectFilter {
    Exact(Subject),
    SubjectIdsOnly,
    SubjectSetsOnly,
}

impl SubjectFilter {
    pub fn matches(&self, subject: &Subject) -> bool {
        match self {
            SubjectFilter::Exact(expected) => expected == subject,
            SubjectFilter::SubjectIdsOnly => matches!(subject, Subject::Id(_)),
            SubjectFilter::SubjectSetsOnly => matches!(subject, Subject::Set(_)),
        }
    }
}

/// Tuple lookup. `None` and empty `relations` act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleQuery {
    pub namespace: String,
    pub object: Option<String>,
    pub relations: Vec<String>,
    pub subject: Option<SubjectFilter>,
}

impl TupleQuery {
    pub fn for_object(object: &Object) -> Self {
        Self {
            namespace: object.namespace.clone(),
            object: Some(object.id.clone()),
            ..Self::default()
        }
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relations.push(relation.to_string());
        self
    }

    pub fn with_subject(mut self, filter: SubjectFilter) -> Self {
        self.subject = Some(filter);
        self
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        tuple.object.namespace == self.namespace
            && self.object.as_ref().map_or(true, |id| &tuple.object.id == id)
            && (self.relations.is_empty() || self.relations.contains(&tuple.relation))
            && self.subject.as_ref().map_or(true, |filter| filter.matches(&tuple.subject))
    }
}

/// Read interface over the tuple graph. Implementations must support
/// concurrent reads; the evaluator never writes through it.
#[async_trait]
pub trait RelationTupleStore: Send + Sync {
    async fn relation_tuples(&self, query: &TupleQuery) -> Result<Vec<RelationTuple>>;

    /// Subjects of `object` under `relations` that are themselves subject sets.
    async fn subject_sets(&self, object: &Object, relations: &[String]) -> Result<Vec<SubjectSet>> {
        let mut query = TupleQuery::for_object(object).with_subject(SubjectFilter::SubjectSetsOnly);
        query.relations = relations.to_vec();
        Ok(self
            .relation_tuples(&query)
            .await?
            .into_iter()
            .filter_map(|tuple| match tuple.subject {
                Subject::Set(set) => Some(set),
                Subject::Id(_) => None,
            })
            .collect())
    }

    async fn exact_match_count(
        &self,
        object: &Object,
        relation: &str,
        subject: &Subject,
    ) -> Result<usize> {
        let query = TupleQuery::for_object(object)
            .with_relation(relation)
            .with_subject(SubjectFilter::Exact(subject.clone()));
        Ok(self.relation_tuples(&query).await?.len())
    }
}

/// Read interface over published namespace configurations.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn latest_namespace(&self, name: &str) -> Result<Arc<Namespace>>;

    async fn namespace(&self, name: &str, version: u32) -> Result<Arc<Namespace>>;
}

/// Batch write operation
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub writes: Vec<RelationTuple>,
    pub deletes: Vec<RelationTuple>,
}

/// In-memory tuple store for testing and embedding
#[derive(Default)]
pub struct InMemoryTupleStore {
    tuples: DashMap<Object, BTreeSet<(String, Subject)>>,
}

impl InMemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tuples(tuples: impl IntoIterator<Item = RelationTuple>) -> Self {
        let store = Self::new();
        for tuple in tuples {
            store.insert(tuple);
        }
        store
    }

    fn insert(&self, tuple: RelationTuple) {
        self.tuples
            .entry(tuple.object)
            .or_default()
            .insert((tuple.relation, tuple.subject));
    }

    pub async fn write_tuple(&self, tuple: RelationTuple) -> Result<()> {
        debug!("Writing tuple: {}", tuple);
        self.insert(tuple);
        Ok(())
    }

    pub async fn delete_tuple(&self, tuple: &RelationTuple) -> Result<()> {
        debug!("Deleting tuple: {}", tuple);
        if let Some(mut entries) = self.tuples.get_mut(&tuple.object) {
            entries.remove(&(tuple.relation.clone(), tuple.subject.clone()));
        }
        self.tuples.remove_if(&tuple.object, |_, entries| entries.is_empty());
        Ok(())
    }

    pub async fn batch_write(&self, request: WriteRequest) -> Result<()> {
        for tuple in request.writes {
            self.write_tuple(tuple).await?;
        }
        for tuple in &request.deletes {
            self.delete_tuple(tuple).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tuples.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RelationTupleStore for InMemoryTupleStore {
    async fn relation_tuples(&self, query: &TupleQuery) -> Result<Vec<RelationTuple>> {
        let collect = |object: &Object, entries: &BTreeSet<(String, Subject)>| {
            entries
                .iter()
                .map(|(relation, subject)| {
                    RelationTuple::new(object.clone(), relation, subject.clone())
                })
                .filter(|tuple| query.matches(tuple))
                .collect::<Vec<_>>()
        };

        let tuples = match &query.object {
            Some(id) => {
                let object = Object::new(&query.namespace, id);
                self.tuples
                    .get(&object)
                    .map(|entries| collect(&object, entries.value()))
                    .unwrap_or_default()
            }
            None => {
                let mut tuples: Vec<RelationTuple> = self
                    .tuples
                    .iter()
                    .filter(|entry| entry.key().namespace == query.namespace)
                    .flat_map(|entry| collect(entry.key(), entry.value()))
                    .collect();
                tuples.sort();
                tuples
            }
        };
        Ok(tuples)
    }
}

/// In-memory namespace store. Versions of a name only ever increase, and a
/// published version never changes.
#[derive(Default)]
pub struct InMemoryNamespaceStore {
    namespaces: DashMap<String, BTreeMap<u32, Arc<Namespace>>>,
}

impl InMemoryNamespaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, namespace: Namespace) -> Result<Arc<Namespace>> {
        namespace.validate()?;
        let mut versions = self.namespaces.entry(namespace.name.clone()).or_default();

        if let Some(existing) = versions.get(&namespace.version) {
            return if **existing == namespace {
                Ok(Arc::clone(existing))
            } else {
                Err(RebacError::VersionConflict {
                    name: namespace.name,
                    version: namespace.version,
                    latest: versions.keys().next_back().copied().unwrap_or_default(),
                })
            };
        }
        if let Some(&latest) = versions.keys().next_back() {
            if namespace.version < latest {
                return Err(RebacError::VersionConflict {
                    name: namespace.name,
                    version: namespace.version,
                    latest,
                });
            }
        }

        info!(namespace = %namespace.name, version = namespace.version, "Publishing namespace");
        let namespace = Arc::new(namespace);
        versions.insert(namespace.version, Arc::clone(&namespace));
        Ok(namespace)
    }

    /// Parses configuration source and publishes it under `version`.
    pub fn publish_source(&self, source: &str, version: u32) -> Result<Arc<Namespace>> {
        self.publish(parse_namespace(source)?.with_version(version))
    }
}

#[async_trait]
impl NamespaceStore for InMemoryNamespaceStore {
    async fn latest_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| RebacError::NamespaceNotFound {
                name: name.to_string(),
                version: None,
            })
    }

    async fn namespace(&self, name: &str, version: u32) -> Result<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| RebacError::NamespaceNotFound {
                name: name.to_string(),
                version: Some(version),
            })
    }
}

/// Read-through cache over another namespace store, keyed by name and version.
/// Published versions are immutable, so entries never need invalidation.
pub struct CachedNamespaceStore {
    inner: Arc<dyn NamespaceStore>,
    cache: DashMap<(String, u32), Arc<Namespace>>,
}

impl CachedNamespaceStore {
    pub fn new(inner: Arc<dyn NamespaceStore>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached_versions(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl NamespaceStore for CachedNamespaceStore {
    async fn latest_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        let namespace = self.inner.latest_namespace(name).await?;
        let cached = self
            .cache
            .entry((namespace.name.clone(), namespace.version))
            .or_insert(namespace)
            .clone();
        Ok(cached)
    }

    async fn namespace(&self, name: &str, version: u32) -> Result<Arc<Namespace>> {
        if let Some(cached) = self.cache.get(&(name.to_string(), version)) {
            debug!(namespace = name, version, "Namespace cache hit");
            return Ok(Arc::clone(cached.value()));
        }
        let namespace = self.inner.namespace(name, version).await?;
        self.cache.insert((name.to_string(), version), Arc::clone(&namespace));
        Ok(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Relation;

    fn tuple(s: &str) -> RelationTuple {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_tuple_store() {
        let store = InMemoryTupleStore::new();
        let owner = tuple("doc:doc_1#owner@user:alice");

        store.write_tuple(owner.clone()).await.unwrap();
        store.write_tuple(tuple("doc:doc_1#parent@folder:f1#...")).await.unwrap();
        store.write_tuple(tuple("doc:doc_2#owner@user:bob")).await.unwrap();
        assert_eq!(store.len(), 3);

        let object = Object::new("doc", "doc_1");
        assert_eq!(
            store.exact_match_count(&object, "owner", &Subject::user("alice")).await.unwrap(),
            1
        );
        let sets = store.subject_sets(&object, &["parent".to_string()]).await.unwrap();
        assert_eq!(sets, vec![SubjectSet::new("folder", "f1", "...")]);

        let all_owners = store
            .relation_tuples(&TupleQuery {
                namespace: "doc".to_string(),
                relations: vec!["owner".to_string()],
                ..TupleQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(all_owners.len(), 2);

        store.delete_tuple(&owner).await.unwrap();
        assert_eq!(
            store.exact_match_count(&object, "owner", &Subject::user("alice")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_batch_write() {
        let store = InMemoryTupleStore::from_tuples([tuple("doc:d#viewer@user:a")]);
        store
            .batch_write(WriteRequest {
                writes: vec![tuple("doc:d#viewer@user:b")],
                deletes: vec![tuple("doc:d#viewer@user:a")],
            })
            .await
            .unwrap();
        let tuples = store
            .relation_tuples(&TupleQuery::for_object(&Object::new("doc", "d")))
            .await
            .unwrap();
        assert_eq!(tuples, vec![tuple("doc:d#viewer@user:b")]);
    }

    #[tokio::test]
    async fn test_namespace_versions_are_monotonic() {
        let store = InMemoryNamespaceStore::new();
        let v1 = Namespace::new("doc").with_version(1);
        let v2 = Namespace::new("doc")
            .with_version(2)
            .with_relation(Relation::new("owner"))
            .unwrap();

        store.publish(v1.clone()).unwrap();
        store.publish(v2).unwrap();
        assert_eq!(store.latest_namespace("doc").await.unwrap().version, 2);
        assert_eq!(*store.namespace("doc", 1).await.unwrap(), v1);

        // Re-publishing the same content is idempotent.
        assert!(store.publish(v1.clone()).is_ok());
        // Changing a published version or going backwards is rejected.
        let changed = v1.with_relation(Relation::new("viewer")).unwrap();
        assert!(matches!(store.publish(changed), Err(RebacError::VersionConflict { .. })));
        assert!(matches!(
            store.publish(Namespace::new("doc").with_version(0)),
            Err(RebacError::VersionConflict { latest: 2, .. })
        ));

        assert!(matches!(
            store.namespace("doc", 7).await,
            Err(RebacError::NamespaceNotFound { version: Some(7), .. })
        ));
        assert!(matches!(
            store.latest_namespace("folder").await,
            Err(RebacError::NamespaceNotFound { version: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_source() {
        let store = InMemoryNamespaceStore::new();
        let published = store
            .publish_source(r#"namespace { name: "folder" relation { name: "viewer" } }"#, 4)
            .unwrap();
        assert_eq!(published.version, 4);
        assert!(store.publish_source("namespace {", 5).is_err());
        assert_eq!(store.latest_namespace("folder").await.unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_cached_namespace_store() {
        let inner = Arc::new(InMemoryNamespaceStore::new());
        inner.publish(Namespace::new("doc").with_version(1)).unwrap();
        let cached = CachedNamespaceStore::new(inner.clone());

        assert_eq!(cached.latest_namespace("doc").await.unwrap().version, 1);
        assert_eq!(cached.namespace("doc", 1).await.unwrap().version, 1);
        assert_eq!(cached.cached_versions(), 1);

        inner.publish(Namespace::new("doc").with_version(2)).unwrap();
        assert_eq!(cached.latest_namespace("doc").await.unwrap().version, 2);
        assert_eq!(cached.cached_versions(), 2);
    }
}
