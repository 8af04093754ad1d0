use graphql_federation_gateway::plan_cache::PlanStep;
use graphql_federation_gateway::{fingerprint, QueryPlan, QueryPlanCache, QueryPlanCacheConfig};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

fn variables() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec(("[a-z]{1,8}", scalar()), 0..8)
}

fn object(entries: &[(String, Value)]) -> Value {
    let mut map = Map::new();
    for (k, v) in entries {
        map.insert(k.clone(), v.clone());
    }
    Value::Object(map)
}

fn plan(key: &str) -> QueryPlan {
    QueryPlan::new(
        key,
        "{ me { id } }",
        vec![PlanStep {
            subgraph_id: "users".to_string(),
        }],
    )
}

proptest! {
    #[test]
    fn fingerprint_ignores_variable_order(query in "[a-z{} ]{0,40}", entries in variables()) {
        // Keep the last value per key so both orders describe the same object
        let mut unique: Vec<(String, Value)> = Vec::new();
        for (k, v) in entries {
            unique.retain(|(existing, _)| existing != &k);
            unique.push((k, v));
        }
        let forward = object(&unique);
        let mut reversed_entries = unique.clone();
        reversed_entries.reverse();
        let reversed = object(&reversed_entries);

        let nested_forward = serde_json::json!({ "input": forward.clone() });
        let nested_reversed = serde_json::json!({ "input": reversed.clone() });

        prop_assert_eq!(fingerprint(&query, &forward), fingerprint(&query, &reversed));
        prop_assert_eq!(fingerprint(&query, &nested_forward), fingerprint(&query, &nested_reversed));
    }

    #[test]
    fn fingerprint_is_eight_hex_digits(query in ".{0,64}", entries in variables()) {
        let fp = fingerprint(&query, &object(&entries));
        prop_assert_eq!(fp.len(), 8);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn cache_never_exceeds_max_size(max_size in 1usize..50, keys in prop::collection::vec("[a-z]{1,6}", 1..200)) {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig { max_size, ttl: None });
        for key in &keys {
            cache.set(key.clone(), plan(key));
            prop_assert!(cache.len() <= max_size);
            // The entry just written survives its own insertion
            prop_assert!(cache.peek(key).is_some());
        }
    }

    #[test]
    fn hits_increment_access_count(hits in 1u64..20) {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig::default());
        cache.set("fp", plan("fp"));
        for _ in 0..hits {
            prop_assert!(cache.get("fp").is_some());
        }
        prop_assert_eq!(cache.peek("fp").map(|c| c.access_count), Some(hits));
        prop_assert_eq!(cache.stats().hits, hits);
    }
}
