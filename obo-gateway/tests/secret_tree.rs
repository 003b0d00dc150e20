#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

use obo_gateway::secret::{Resolution, SecretProvider, SecretResolver};
use proptest::prelude::*;
use serde_json::{Value, json};

struct KnownSecrets;

impl SecretProvider for KnownSecrets {
    fn name(&self) -> &'static str {
        "known"
    }

    fn resolve(&self, name: &str) -> Result<Resolution, anyhow::Error> {
        Ok(Resolution::Found(format!("resolved:{name}")))
    }
}

fn resolver() -> SecretResolver {
    SecretResolver::new(vec![Box::new(KnownSecrets)])
}

/// Arbitrary JSON trees mixing literals and `$secret` descriptors.
fn tree_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,12}".prop_map(Value::from),
        "[A-Z_]{1,8}".prop_map(|name| json!({ "$secret": name })),
    ];

    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Shape equality: same structure, with descriptor nodes allowed to become
/// strings.
fn same_shape(before: &Value, after: &Value) -> bool {
    match (before, after) {
        (Value::Object(b), _) if b.contains_key("$secret") => after.is_string(),
        (Value::Object(b), Value::Object(a)) => {
            b.len() == a.len()
                && b.iter().all(|(key, b_child)| {
                    a.get(key).is_some_and(|a_child| same_shape(b_child, a_child))
                })
        }
        (Value::Array(b), Value::Array(a)) => {
            b.len() == a.len() && b.iter().zip(a).all(|(b_child, a_child)| same_shape(b_child, a_child))
        }
        (b, a) => b == a,
    }
}

proptest! {
    #[test]
    fn resolution_preserves_tree_shape(tree in tree_strategy()) {
        let mut resolved = tree.clone();
        resolver().resolve_value(&mut resolved).expect("all secrets known");

        prop_assert!(same_shape(&tree, &resolved));
    }

    #[test]
    fn resolution_is_idempotent(tree in tree_strategy()) {
        let mut resolved = tree.clone();
        resolver().resolve_value(&mut resolved).expect("all secrets known");

        let snapshot = resolved.clone();
        resolver().resolve_value(&mut resolved).expect("second pass");

        prop_assert_eq!(resolved, snapshot);
    }

    #[test]
    fn only_descriptor_nodes_change(tree in tree_strategy()) {
        let mut resolved = tree.clone();
        resolver().resolve_value(&mut resolved).expect("all secrets known");

        fn check(before: &Value, after: &Value) -> bool {
            match before {
                Value::Object(map) if map.contains_key("$secret") => {
                    let name = map.get("$secret").and_then(Value::as_str).unwrap_or_default();
                    after == &Value::String(format!("resolved:{name}"))
                }
                Value::Object(map) => map
                    .iter()
                    .all(|(key, child)| check(child, &after[key])),
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .all(|(idx, child)| check(child, &after[idx])),
                literal => literal == after,
            }
        }

        prop_assert!(check(&tree, &resolved));
    }
}
