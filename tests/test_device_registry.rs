//! Device registry behaviour
//!
//! Identifier assignment, resolution precedence and availability tracking.

use matter_mqtt_bridge::bridge::registry::DeviceRegistry;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

fn registry_with(overrides: &[(u64, &str)]) -> DeviceRegistry {
    DeviceRegistry::new(
        overrides
            .iter()
            .map(|(handle, name)| (*handle, name.to_string()))
            .collect::<HashMap<_, _>>(),
    )
}

#[test]
fn test_stable_id_defaults_and_overrides() {
    let registry = registry_with(&[(12, "kitchen-lamp")]);

    assert!(registry.register(12, json!({})));
    assert!(registry.register(5, json!({})));

    assert_eq!(registry.get(12).unwrap().stable_id, "kitchen-lamp");
    assert_eq!(registry.get(5).unwrap().stable_id, "node_5");
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_reregistration_refreshes_without_renaming() {
    let registry = registry_with(&[]);
    assert!(registry.register(5, json!({"vendor": "a"})));
    let first = registry.get(5).unwrap();

    assert!(!registry.register(5, json!({"vendor": "b"})));
    let second = registry.get(5).unwrap();

    assert_eq!(second.stable_id, first.stable_id);
    assert_eq!(second.info, json!({"vendor": "b"}));
    assert!(second.last_seen >= first.last_seen);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_numeric_handle_wins_over_name() {
    // Device 9 is literally named "4"; the numeric handle 4 still wins
    let registry = registry_with(&[(9, "4")]);
    registry.register(4, json!({}));
    registry.register(9, json!({}));

    assert_eq!(registry.resolve("4"), Some(4));
    assert_eq!(registry.resolve("node_4"), Some(4));
}

#[test]
fn test_numeric_identifier_for_unknown_handle_falls_back_to_name() {
    let registry = registry_with(&[(9, "77")]);
    registry.register(9, json!({}));

    assert_eq!(registry.resolve("77"), Some(9));
    assert_eq!(registry.resolve("78"), None);
}

#[test]
fn test_colliding_names_resolve_to_lowest_handle() {
    let registry = registry_with(&[(8, "lamp"), (3, "lamp")]);
    registry.register(8, json!({}));
    registry.register(3, json!({}));

    assert_eq!(registry.resolve("lamp"), Some(3));
}

#[test]
fn test_unavailable_devices_stay_resolvable() {
    let registry = registry_with(&[]);
    registry.register(7, json!({}));

    assert_eq!(registry.set_availability(7, false), Some(true));
    assert_eq!(registry.set_availability(7, false), Some(false));
    assert_eq!(registry.resolve("node_7"), Some(7));
    assert!(!registry.get(7).unwrap().available);

    assert_eq!(registry.set_availability(99, true), None);
}

#[test]
fn test_topic_identifier_for_unregistered_handle() {
    let registry = registry_with(&[(2, "porch")]);
    assert_eq!(registry.topic_identifier(2), "porch");
    assert_eq!(registry.topic_identifier(3), "node_3");
    assert!(registry.is_empty());
}

#[test]
fn test_snapshot_is_ordered_by_handle() {
    let registry = registry_with(&[]);
    for handle in [30, 4, 17] {
        registry.register(handle, json!({}));
    }
    let handles: Vec<u64> = registry.snapshot().iter().map(|d| d.handle).collect();
    assert_eq!(handles, vec![4, 17, 30]);
}

proptest! {
    #[test]
    fn prop_registered_handles_resolve_by_number_and_default_name(
        handles in proptest::collection::btree_set(0u64..10_000, 1..20)
    ) {
        let registry = registry_with(&[]);
        for handle in &handles {
            registry.register(*handle, json!({}));
        }

        for handle in &handles {
            prop_assert_eq!(registry.resolve(&handle.to_string()), Some(*handle));
            prop_assert_eq!(registry.resolve(&format!("node_{handle}")), Some(*handle));
        }
        prop_assert_eq!(registry.len(), handles.len());
    }

    #[test]
    fn prop_stable_id_survives_reregistration(handle in any::<u64>(), rounds in 1usize..5) {
        let registry = registry_with(&[]);
        registry.register(handle, json!({}));
        let stable_id = registry.get(handle).unwrap().stable_id;

        for round in 0..rounds {
            registry.register(handle, json!({"round": round}));
            registry.set_availability(handle, round % 2 == 0);
        }
        prop_assert_eq!(registry.get(handle).unwrap().stable_id, stable_id);
    }
}
