//! Expand: which subjects hold a relation on an object, and through which rewrite?

use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

use crate::{
    cancellation::CancellationToken,
    context::{
        computed_target, tuple_userset_target, tupleset_source, EvaluationScope, PathKey,
        VisitedPath,
    },
    error::Result,
    models::*,
    rewrite::{ComputedUserset, SetOperator, UsersetExpression},
    store::TupleQuery,
};

/// Why a branch of the tree stopped before it was fully evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    DepthExhausted,
    Cancelled,
    Cycle,
}

/// Explanation tree produced by Expand.
///
/// Each node records the rewrite expression evaluated for `relation` on
/// `object`, the subtrees it recursed into and the subjects it resolved to.
/// A truncated node has an empty result and its `expression` is the userset
/// it would have expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTree {
    pub object: Object,
    pub relation: String,
    pub expression: UsersetExpression,
    pub children: Vec<SubjectTree>,
    pub result: BTreeSet<Subject>,
    pub truncated: Option<Truncation>,
}

impl SubjectTree {
    fn new(
        object: &Object,
        relation: &str,
        expression: &UsersetExpression,
        children: Vec<SubjectTree>,
    ) -> Self {
        Self {
            object: object.clone(),
            relation: relation.to_string(),
            expression: expression.clone(),
            children,
            result: BTreeSet::new(),
            truncated: None,
        }
    }

    fn truncated(object: &Object, relation: &str, truncation: Truncation) -> Self {
        let computed = ComputedUserset::to(&object.namespace, &object.id, relation);
        let expression = UsersetExpression::ComputedUserset(computed);
        Self {
            truncated: Some(truncation),
            ..Self::new(object, relation, &expression, Vec::new())
        }
    }

    fn with_result(mut self, result: BTreeSet<Subject>) -> Self {
        self.result = result;
        self
    }

    fn union_of_children(self) -> Self {
        let result = self.children.iter().flat_map(|child| child.result.iter().cloned()).collect();
        self.with_result(result)
    }

    /// True when no node in the tree was truncated.
    pub fn is_complete(&self) -> bool {
        self.truncated.is_none() && self.children.iter().all(SubjectTree::is_complete)
    }

    /// Truncated nodes in depth-first order.
    pub fn truncated_nodes(&self) -> Vec<&SubjectTree> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.truncated.is_some() {
                found.push(node);
            }
            stack.extend(node.children.iter().rev());
        }
        found
    }

    /// Concrete principals in the result.
    pub fn subject_ids(&self) -> impl Iterator<Item = &SubjectId> {
        self.result.iter().filter_map(|subject| match subject {
            Subject::Id(id) => Some(id),
            Subject::Set(_) => None,
        })
    }
}

#[derive(Clone)]
struct Frame {
    /// Relation levels left; a relation reached with none left is truncated.
    depth: u32,
    path: VisitedPath,
    token: CancellationToken,
}

impl Frame {
    fn hop(&self) -> Self {
        Self {
            depth: self.depth.saturating_sub(1),
            ..self.clone()
        }
    }
}

/// Evaluates a single Expand call.
pub(crate) struct SubjectExpander<'a> {
    scope: &'a EvaluationScope,
}

impl<'a> SubjectExpander<'a> {
    pub(crate) fn new(scope: &'a EvaluationScope) -> Self {
        Self { scope }
    }

    /// Expand all subjects that have `relation` on `object`.
    ///
    /// `depth` counts relation levels: the requested relation is the first and
    /// every hop adds one, so `depth = 0` touches no store.
    pub async fn expand(
        &self,
        object: &Object,
        relation: &str,
        depth: u32,
        token: &CancellationToken,
    ) -> Result<SubjectTree> {
        let frame = Frame {
            depth,
            path: VisitedPath::default(),
            token: token.clone(),
        };
        let tree = self.expand_relation(object.clone(), relation.to_string(), frame).await?;
        debug!(
            object = %object,
            relation,
            subjects = tree.result.len(),
            complete = tree.is_complete(),
            "Expand complete"
        );
        Ok(tree)
    }

    fn expand_relation(
        &self,
        object: Object,
        relation: String,
        frame: Frame,
    ) -> BoxFuture<'_, Result<SubjectTree>> {
        async move {
            if frame.depth == 0 {
                trace!(object = %object, relation = %relation, "Depth exhausted");
                return Ok(SubjectTree::truncated(&object, &relation, Truncation::DepthExhausted));
            }
            if frame.token.is_cancelled() {
                return Ok(SubjectTree::truncated(&object, &relation, Truncation::Cancelled));
            }
            let key = PathKey::new(&object, &relation);
            if frame.path.contains(&key) {
                trace!(object = %object, relation = %relation, "Cycle");
                return Ok(SubjectTree::truncated(&object, &relation, Truncation::Cycle));
            }

            let namespace = self.scope.namespace(&object.namespace, &frame.token).await?;
            let Some(namespace) = namespace else {
                return Ok(SubjectTree::truncated(&object, &relation, Truncation::Cancelled));
            };
            let definition = namespace.require_relation(&relation)?;
            let frame = Frame {
                path: frame.path.with(key),
                ..frame
            };
            self.expand_rewrite(&definition.rewrite, &object, &relation, frame).await
        }
        .boxed()
    }

    fn expand_rewrite<'b>(
        &'b self,
        node: &'b UsersetExpression,
        object: &'b Object,
        relation: &'b str,
        frame: Frame,
    ) -> BoxFuture<'b, Result<SubjectTree>> {
        async move {
            let cancelled = || SubjectTree {
                truncated: Some(Truncation::Cancelled),
                ..SubjectTree::new(object, relation, node, Vec::new())
            };

            match node {
                UsersetExpression::This => {
                    let query = TupleQuery::for_object(object).with_relation(relation);
                    let lookup = self.scope.tuples.relation_tuples(&query);
                    let Some(tuples) = self.scope.query(&frame.token, lookup).await? else {
                        return Ok(cancelled());
                    };

                    let mut direct = BTreeSet::new();
                    let mut nested = Vec::new();
                    for tuple in tuples {
                        match tuple.subject {
                            Subject::Set(set) => {
                                let target = set.object();
                                let target_relation = set.resolve_relation(relation).to_string();
                                nested.push(
                                    self.expand_relation(target, target_relation, frame.hop()),
                                );
                            }
                            id @ Subject::Id(_) => {
                                direct.insert(id);
                            }
                        }
                    }
                    let children = try_join_all(nested).await?;
                    let mut tree =
                        SubjectTree::new(object, relation, node, children).union_of_children();
                    tree.result.extend(direct);
                    Ok(tree)
                }
                UsersetExpression::ComputedUserset(computed) => {
                    let (target, target_relation) = computed_target(computed, object)?;
                    let child = self.expand_relation(target, target_relation, frame.hop()).await?;
                    Ok(SubjectTree::new(object, relation, node, vec![child]).union_of_children())
                }
                UsersetExpression::TupleToUserset(ttu) => {
                    let (source, tupleset_relation) = tupleset_source(&ttu.tupleset, object)?;
                    let relations = [tupleset_relation];
                    let Some(sets) = self
                        .scope
                        .query(&frame.token, self.scope.tuples.subject_sets(&source, &relations))
                        .await?
                    else {
                        return Ok(cancelled());
                    };

                    let nested = sets.iter().map(|set| {
                        let (target, target_relation) =
                            tuple_userset_target(&ttu.computed_userset, set, relation);
                        self.expand_relation(target, target_relation, frame.hop())
                    });
                    let children = try_join_all(nested).await?;
                    Ok(SubjectTree::new(object, relation, node, children).union_of_children())
                }
                UsersetExpression::SetOperation(operation) => {
                    let nested = operation
                        .children()
                        .iter()
                        .map(|child| self.expand_rewrite(child, object, relation, frame.clone()));
                    let children = try_join_all(nested).await?;
                    let result = combine(operation.operator(), &children);
                    Ok(SubjectTree::new(object, relation, node, children).with_result(result))
                }
            }
        }
        .boxed()
    }
}

fn combine(operator: SetOperator, children: &[SubjectTree]) -> BTreeSet<Subject> {
    let mut results = children.iter().map(|child| &child.result);
    match operator {
        SetOperator::Union => results.flatten().cloned().collect(),
        SetOperator::Intersect => {
            let mut combined = results.next().cloned().unwrap_or_default();
            for result in results {
                if combined.is_empty() {
                    break;
                }
                combined.retain(|subject| result.contains(subject));
            }
            combined
        }
        SetOperator::Exclude => {
            let mut combined = results.next().cloned().unwrap_or_default();
            for result in results {
                combined.retain(|subject| !result.contains(subject));
            }
            combined
        }
    }
}
