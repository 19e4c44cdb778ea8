//! Property-based tests for the namespace language and set algebra.

use auth_rebac::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Strategy for string literals, including characters that need escaping
fn literal_strategy() -> impl Strategy<Value = String> {
    "[a-z_\"\\\\]{1,8}"
}

fn reference_strategy() -> impl Strategy<Value = Option<Reference>> {
    proptest::option::of(literal_strategy().prop_map(Reference::Literal))
}

fn computed_userset_strategy() -> impl Strategy<Value = UsersetExpression> {
    (reference_strategy(), reference_strategy(), literal_strategy()).prop_map(
        |(namespace, object, relation)| {
            UsersetExpression::ComputedUserset(ComputedUserset {
                namespace,
                object,
                relation: Some(Reference::Literal(relation)),
            })
        },
    )
}

fn tuple_to_userset_strategy() -> impl Strategy<Value = UsersetExpression> {
    let placeholder_or_literal = |placeholder: Reference| {
        prop_oneof![
            Just(None),
            Just(Some(placeholder)),
            literal_strategy().prop_map(|value| Some(Reference::Literal(value))),
        ]
    };
    (
        literal_strategy(),
        placeholder_or_literal(Reference::TupleUsersetNamespace),
        placeholder_or_literal(Reference::TupleUsersetObject),
        placeholder_or_literal(Reference::TupleUsersetRelation),
    )
        .prop_map(|(tupleset, namespace, object, relation)| {
            UsersetExpression::tuple_to_userset(
                Tupleset::relation(&tupleset),
                ComputedUserset {
                    namespace,
                    object,
                    relation,
                },
            )
        })
}

fn userset_strategy() -> impl Strategy<Value = UsersetExpression> {
    let leaf = prop_oneof![
        Just(UsersetExpression::This),
        computed_userset_strategy(),
        tuple_to_userset_strategy(),
    ];
    leaf.prop_recursive(3, 24, 3, |inner| {
        (
            prop_oneof![
                Just(SetOperator::Union),
                Just(SetOperator::Intersect),
                Just(SetOperator::Exclude),
            ],
            prop::collection::vec(inner, 1..4),
        )
            .prop_map(|(operator, children)| {
                UsersetExpression::SetOperation(SetOperation::new(operator, children).unwrap())
            })
    })
}

fn namespace_strategy() -> impl Strategy<Value = Namespace> {
    (
        literal_strategy(),
        prop::collection::btree_map(literal_strategy(), userset_strategy(), 0..4),
    )
        .prop_map(|(name, relations)| {
            relations.into_iter().fold(Namespace::new(&name), |namespace, (relation, rewrite)| {
                namespace
                    .with_relation(Relation::new(&relation).with_rewrite(rewrite))
                    .unwrap()
            })
        })
}

const USERS: [&str; 5] = ["u0", "u1", "u2", "u3", "u4"];

const SETS: &str = r#"
    namespace {
      name: "doc"
      relation { name: "a" }
      relation { name: "b" }
      relation {
        name: "both"
        userset_rewrite {
          intersect {
            child { computed_userset { relation: "a" } }
            child { computed_userset { relation: "b" } }
          }
        }
      }
      relation {
        name: "either"
        userset_rewrite {
          union {
            child { computed_userset { relation: "a" } }
            child { computed_userset { relation: "b" } }
          }
        }
      }
      relation {
        name: "only_a"
        userset_rewrite {
          exclude {
            child { computed_userset { relation: "a" } }
            child { computed_userset { relation: "b" } }
          }
        }
      }
    }"#;

fn engine_with(a: &BTreeSet<usize>, b: &BTreeSet<usize>) -> AuthorizationEngine {
    let namespaces = InMemoryNamespaceStore::new();
    namespaces.publish_source(SETS, 1).unwrap();
    let object = Object::new("doc", "d");
    let tuples = a
        .iter()
        .map(|&u| RelationTuple::new(object.clone(), "a", Subject::user(USERS[u])))
        .chain(b.iter().map(|&u| RelationTuple::new(object.clone(), "b", Subject::user(USERS[u]))));
    AuthorizationEngine::new(
        Arc::new(InMemoryTupleStore::from_tuples(tuples)),
        Arc::new(namespaces),
        EngineConfig::default(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn test_render_then_parse_is_identity(namespace in namespace_strategy()) {
        let rendered = namespace.to_string();
        let parsed = parse_namespace(&rendered);
        prop_assert!(parsed.is_ok(), "Failed to parse:\n{}", rendered);
        prop_assert_eq!(parsed.unwrap(), namespace);
    }

    #[test]
    fn test_render_drops_version_and_metadata(
        namespace in namespace_strategy(),
        version in 1u32..100,
    ) {
        let published = namespace
            .clone()
            .with_version(version)
            .with_metadata(NamespaceMetadata::new());
        let parsed = parse_namespace(&published.to_string()).unwrap();
        prop_assert_eq!(parsed.version, 0);
        prop_assert!(parsed.metadata.is_none());
        prop_assert_eq!(parsed, namespace);
    }

    #[test]
    fn test_set_operations_agree_between_check_and_expand(
        a in prop::collection::btree_set(0..USERS.len(), 0..USERS.len()),
        b in prop::collection::btree_set(0..USERS.len(), 0..USERS.len()),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let engine = engine_with(&a, &b);
            let object = Object::new("doc", "d");
            let a_tree = engine.expand(&object, "a", 5).await.unwrap();
            let b_tree = engine.expand(&object, "b", 5).await.unwrap();
            let both = engine.expand(&object, "both", 5).await.unwrap();
            prop_assert!(both.result.is_subset(&a_tree.result));
            prop_assert!(both.result.is_subset(&b_tree.result));
            prop_assert_eq!(both.result.is_empty(), a.intersection(&b).next().is_none());

            for relation in ["a", "b", "both", "either", "only_a"] {
                let tree = engine.expand(&object, relation, 5).await.unwrap();
                prop_assert!(tree.is_complete());
                for user in USERS {
                    let subject = Subject::user(user);
                    let allowed = engine.check(&object, relation, &subject).await.unwrap();
                    let expanded = tree.result.contains(&subject);
                    prop_assert_eq!(allowed, expanded, "{} on {}", user, relation);
                }
            }
            Ok(())
        })?;
    }
}
