//! Check: does a subject hold a relation on an object?
//!
//! The rewrite of the requested relation is interpreted recursively. Sibling
//! branches run concurrently and each set operation stops its remaining
//! branches as soon as its answer is decided.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use crate::{
    cancellation::CancellationToken,
    context::{
        computed_target, tuple_userset_target, tupleset_source, EvaluationScope, PathKey,
        VisitedPath,
    },
    error::{RebacError, RecursionLimit, Result},
    models::*,
    rewrite::{SetOperation, SetOperator, TupleToUserset, UsersetExpression},
};

/// Position of one branch in the traversal.
#[derive(Clone)]
struct Frame {
    /// Relation levels left; reaching a relation with none left fails the branch.
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

    fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }
}

fn recursion_limit(object: &Object, relation: &str, limit: RecursionLimit) -> RebacError {
    RebacError::RecursionLimitExceeded {
        namespace: object.namespace.clone(),
        object: object.id.clone(),
        relation: relation.to_string(),
        limit,
    }
}

/// Evaluates a single Check call for one subject.
pub(crate) struct PermissionChecker<'a> {
    scope: &'a EvaluationScope,
    subject: &'a Subject,
    max_depth: u32,
}

impl<'a> PermissionChecker<'a> {
    pub(crate) fn new(scope: &'a EvaluationScope, subject: &'a Subject, max_depth: u32) -> Self {
        Self {
            scope,
            subject,
            max_depth,
        }
    }

    /// Check if the subject holds `relation` on `object`.
    ///
    /// `max_depth` counts relation levels the same way Expand's `depth` does:
    /// the requested relation is the first level and every hop adds one.
    pub async fn check(
        &self,
        object: &Object,
        relation: &str,
        token: &CancellationToken,
    ) -> Result<bool> {
        let frame = Frame {
            depth: self.max_depth,
            path: VisitedPath::default(),
            token: token.clone(),
        };
        let allowed = self
            .check_relation(object.clone(), relation.to_string(), frame)
            .await?;
        debug!(object = %object, relation, subject = %self.subject, allowed, "Check complete");
        Ok(allowed)
    }

    fn check_relation(
        &self,
        object: Object,
        relation: String,
        frame: Frame,
    ) -> BoxFuture<'_, Result<bool>> {
        async move {
            if frame.token.is_cancelled() {
                return Err(RebacError::Cancelled);
            }
            if frame.depth == 0 {
                trace!(object = %object, relation = %relation, "Depth exhausted");
                return Err(recursion_limit(&object, &relation, RecursionLimit::DepthExhausted));
            }
            let key = PathKey::new(&object, &relation);
            if frame.path.contains(&key) {
                return Err(recursion_limit(&object, &relation, RecursionLimit::Cycle));
            }
            trace!(object = %object, relation = %relation, subject = %self.subject, "Checking");

            let namespace = self
                .scope
                .namespace(&object.namespace, &frame.token)
                .await?
                .ok_or(RebacError::Cancelled)?;
            let definition = namespace.require_relation(&relation)?;
            let frame = Frame {
                path: frame.path.with(key),
                ..frame
            };
            self.check_rewrite(&definition.rewrite, &object, &relation, frame).await
        }
        .boxed()
    }

    fn check_rewrite<'b>(
        &'b self,
        node: &'b UsersetExpression,
        object: &'b Object,
        relation: &'b str,
        frame: Frame,
    ) -> BoxFuture<'b, Result<bool>> {
        async move {
            match node {
                UsersetExpression::This => self.check_this(object, relation, frame).await,
                UsersetExpression::ComputedUserset(computed) => {
                    let (target, target_relation) = computed_target(computed, object)?;
                    self.check_relation(target, target_relation, frame.hop()).await
                }
                UsersetExpression::TupleToUserset(ttu) => {
                    self.check_tuple_to_userset(ttu, object, relation, frame).await
                }
                UsersetExpression::SetOperation(operation) => {
                    self.check_set_operation(operation, object, relation, frame).await
                }
            }
        }
        .boxed()
    }

    async fn check_this(&self, object: &Object, relation: &str, frame: Frame) -> Result<bool> {
        let direct = self
            .scope
            .query(
                &frame.token,
                self.scope.tuples.exact_match_count(object, relation, self.subject),
            )
            .await?
            .ok_or(RebacError::Cancelled)?;
        if direct > 0 {
            trace!(object = %object, relation, "Direct tuple found");
            return Ok(true);
        }

        let relations = [relation.to_string()];
        let sets = self
            .scope
            .query(&frame.token, self.scope.tuples.subject_sets(object, &relations))
            .await?
            .ok_or(RebacError::Cancelled)?;
        let targets = sets
            .iter()
            .map(|set| (set.object(), set.resolve_relation(relation).to_string()))
            .collect();
        self.any_reachable(targets, frame).await
    }

    async fn check_tuple_to_userset(
        &self,
        ttu: &TupleToUserset,
        object: &Object,
        relation: &str,
        frame: Frame,
    ) -> Result<bool> {
        let (source, tupleset_relation) = tupleset_source(&ttu.tupleset, object)?;
        let relations = [tupleset_relation];
        let sets = self
            .scope
            .query(&frame.token, self.scope.tuples.subject_sets(&source, &relations))
            .await?
            .ok_or(RebacError::Cancelled)?;
        let targets = sets
            .iter()
            .map(|set| tuple_userset_target(&ttu.computed_userset, set, relation))
            .collect();
        self.any_reachable(targets, frame).await
    }

    /// True when the subject holds any of `targets`, evaluated concurrently.
    async fn any_reachable(&self, targets: Vec<(Object, String)>, frame: Frame) -> Result<bool> {
        if targets.is_empty() {
            return Ok(false);
        }
        let branch_token = frame.token.child();
        let branches = targets
            .into_iter()
            .map(|(target, target_relation)| {
                let frame = frame.with_token(branch_token.clone()).hop();
                self.check_relation(target, target_relation, frame)
            })
            .collect();
        any_of(branches, &branch_token).await
    }

    async fn check_set_operation(
        &self,
        operation: &SetOperation,
        object: &Object,
        relation: &str,
        frame: Frame,
    ) -> Result<bool> {
        let branch_token = frame.token.child();
        let mut branches: Vec<BoxFuture<'_, Result<bool>>> = operation
            .children()
            .iter()
            .map(|child| {
                let frame = frame.with_token(branch_token.clone());
                self.check_rewrite(child, object, relation, frame)
            })
            .collect();

        match operation.operator() {
            SetOperator::Union => any_of(branches, &branch_token).await,
            SetOperator::Intersect => all_of(branches, &branch_token).await,
            SetOperator::Exclude => {
                let base = branches.remove(0);
                exclude(base, branches, &branch_token).await
            }
        }
    }
}

/// Result of one branch as seen by the operation combining it.
fn settle(result: Result<bool>) -> Result<bool> {
    match result {
        Err(e) if e.is_cycle() => Ok(false),
        other => other,
    }
}

/// Union over branches. A branch cut off by the depth budget only fails the
/// union when no other branch grants access.
async fn any_of(
    branches: Vec<BoxFuture<'_, Result<bool>>>,
    branch_token: &CancellationToken,
) -> Result<bool> {
    let mut pending: FuturesUnordered<_> = branches.into_iter().collect();
    let mut undecided = None;
    while let Some(result) = pending.next().await {
        match settle(result) {
            Ok(true) => {
                branch_token.cancel();
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) if e.is_depth_exhausted() => undecided = Some(e),
            Err(e) => {
                branch_token.cancel();
                return Err(e);
            }
        }
    }
    undecided.map_or(Ok(false), Err)
}

async fn all_of(
    branches: Vec<BoxFuture<'_, Result<bool>>>,
    branch_token: &CancellationToken,
) -> Result<bool> {
    let mut pending: FuturesUnordered<_> = branches.into_iter().collect();
    let mut undecided = None;
    while let Some(result) = pending.next().await {
        match settle(result) {
            Ok(true) => {}
            Ok(false) => {
                branch_token.cancel();
                return Ok(false);
            }
            Err(e) if e.is_depth_exhausted() => undecided = Some(e),
            Err(e) => {
                branch_token.cancel();
                return Err(e);
            }
        }
    }
    undecided.map_or(Ok(true), Err)
}

/// `base` minus the union of `subtracted`.
async fn exclude(
    base: BoxFuture<'_, Result<bool>>,
    subtracted: Vec<BoxFuture<'_, Result<bool>>>,
    branch_token: &CancellationToken,
) -> Result<bool> {
    let mut pending: FuturesUnordered<_> = std::iter::once(base.map(|r| (true, r)).boxed())
        .chain(subtracted.into_iter().map(|branch| branch.map(|r| (false, r)).boxed()))
        .collect();
    let mut base_allowed = false;
    let mut undecided = None;
    while let Some((is_base, result)) = pending.next().await {
        match settle(result) {
            Ok(allowed) if allowed != is_base => {
                // Base denied or a subtracted branch matched.
                branch_token.cancel();
                return Ok(false);
            }
            Ok(_) => base_allowed |= is_base,
            Err(e) if e.is_depth_exhausted() => {
                undecided.get_or_insert(e);
            }
            Err(e) => {
                branch_token.cancel();
                return Err(e);
            }
        }
    }
    undecided.map_or(Ok(base_allowed), Err)
}
