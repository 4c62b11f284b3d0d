//! Integration tests for the JSON command layer
//!
//! Every scenario talks to the server exactly as a remote client would:
//! JSON in, JSON out.

use crate::{matrix_of, Harness};
use ear_core::domain::backend::mock::MockEvent;
use ear_core::domain::{DriverId, EarConfig, Usage, ZoneTemplate};
use serde_json::{json, Value};

// ============================================================================
// GLOBAL METHODS
// ============================================================================

#[test]
fn test_list_drivers_shape() {
    let h = Harness::new();
    let drivers = h.call(json!({ "method": "list_drivers" }));
    let drivers = drivers.as_array().unwrap();

    assert_eq!(drivers.len(), 3);
    for driver in drivers {
        for key in ["id", "name", "rate", "mode", "channels"] {
            assert!(driver.get(key).is_some(), "driver is missing {}", key);
        }
    }
    assert_eq!(drivers[0]["mode"], "stereo");
    assert_eq!(drivers[1]["mode"], "quad");
}

#[test]
fn test_driver_ids_are_stable() {
    let h = Harness::new();
    let first = h.call(json!({ "method": "list_drivers" }));
    let second = h.call(json!({ "method": "list_drivers" }));
    assert_eq!(first, second);
    assert_eq!(
        first[1]["id"],
        json!(DriverId::from_hardware_id("mock-quad").to_string())
    );
}

#[test]
fn test_unknown_driver_creates_no_session() {
    let h = Harness::new();
    for bogus in ["not-a-uuid", "6f1c1a4e-0000-5000-8000-000000000000"] {
        assert_eq!(
            h.call(json!({ "method": "create_system", "driver": bogus })),
            json!({ "error": "Unknown driver", "data": bogus })
        );
    }
    assert_eq!(h.server.session_count(), 0);
}

#[test]
fn test_start_flag_overrides_config() {
    let h = Harness::new();
    let reply = h.call(json!({
        "method": "create_system",
        "driver": h.driver(2),
        "start": false,
    }));
    let system = reply["system"].clone();
    assert_eq!(h.scoped(&system, "get_state", json!({}))["state"], "created");

    let mut config = EarConfig::default();
    config.sessions.auto_start = false;
    let h = Harness::with_config(config);
    let system = h.system(2);
    assert_eq!(h.scoped(&system, "get_state", json!({}))["state"], "created");
}

// ============================================================================
// SCOPED METHODS
// ============================================================================

#[test]
fn test_unknown_system_for_every_scoped_method() {
    let h = Harness::new();
    let ghost = json!("00000000-0000-4000-8000-000000000000");
    for method in ["get_usage", "start", "list_zones", "destroy_system", "get_channel"] {
        assert_eq!(
            h.scoped(&ghost, method, json!({})),
            json!({ "error": "Unknown system", "data": ghost }),
            "method {}",
            method
        );
    }
}

#[test]
fn test_get_usage_reports_backend_snapshot() {
    let h = Harness::new();
    let system = h.system(4);
    h.probe().set_usage(Usage {
        dsp: 12.5,
        stream: 1.0,
        geometry: 0.0,
        update: 0.5,
        total: 14.0,
    });

    assert_eq!(
        h.scoped(&system, "get_usage", json!({})),
        json!({ "dsp": 12.5, "stream": 1.0, "geometry": 0.0, "update": 0.5, "total": 14.0 })
    );
}

#[test]
fn test_lifecycle_over_json() {
    let h = Harness::new();
    let system = h.system(2);

    assert_eq!(h.scoped(&system, "stop", json!({})), json!({ "state": "stopped" }));
    assert_eq!(h.scoped(&system, "stop", json!({}))["error"], "Not running");
    assert_eq!(h.scoped(&system, "start", json!({})), json!({ "state": "started" }));
    assert_eq!(h.scoped(&system, "start", json!({}))["error"], "Already running");
}

#[test]
fn test_front_rear_scenario() {
    let h = Harness::new();
    let system = h.system(4);

    let front = h.scoped(&system, "create_zone", json!({ "name": "front", "speakers": [0, 1] }));
    let rear = h.scoped(&system, "create_zone", json!({ "name": "rear", "speakers": [2, 3] }));
    assert_eq!(front["resolved"], json!([0, 1]));

    let channel = h.scoped(&system, "create_channel", json!({ "name": "music", "channels": 2 }));
    assert_eq!(channel["channels"], 2);
    assert_eq!(matrix_of(&channel), vec![0.0; 8]);
    let id = channel["id"].clone();

    let attached = h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": front["id"] }));
    assert_eq!(attached, json!({ "zone": front["id"], "volume": 1.0 }));
    let channel = h.scoped(&system, "get_channel", json!({ "channel": id }));
    assert_eq!(matrix_of(&channel), vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

    h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": rear["id"] }));
    let channel = h.scoped(&system, "get_channel", json!({ "channel": id }));
    assert_eq!(matrix_of(&channel), vec![1.0; 8]);
    assert_eq!(channel["zones"].as_array().map(Vec::len), Some(2));
    assert_eq!(channel["stale"], false);

    // attaching again is a no-op
    h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": rear["id"] }));
    let channel = h.scoped(&system, "get_channel", json!({ "channel": id }));
    assert_eq!(channel["zones"].as_array().map(Vec::len), Some(2));

    let detached = h.scoped(&system, "detach_zone", json!({ "channel": id, "zone": front["id"] }));
    assert_eq!(detached["zone"], front["id"]);
    let reply = h.scoped(&system, "detach_zone", json!({ "channel": id, "zone": front["id"] }));
    assert_eq!(reply["error"], "Not found");
}

#[test]
fn test_zone_tree_over_json() {
    let h = Harness::new();
    let system = h.system(4);

    let house = h.scoped(&system, "create_zone", json!({ "name": "house" }));
    let front = h.scoped(
        &system,
        "create_zone",
        json!({ "name": "front", "speakers": [0, 1], "parent": house["id"] }),
    );
    let rear = h.scoped(&system, "create_zone", json!({ "name": "rear", "speakers": [2, 3] }));
    assert_eq!(front["parent"], house["id"]);

    let moved = h.scoped(&system, "add_zone", json!({ "parent": house["id"], "child": rear["id"] }));
    assert_eq!(moved["parent"], house["id"]);

    let zones = h.scoped(&system, "list_zones", json!({}));
    let house_now = zones
        .as_array()
        .unwrap()
        .iter()
        .find(|z| z["name"] == "house")
        .cloned()
        .unwrap();
    assert_eq!(house_now["resolved"], json!([0, 1, 2, 3]));
    assert_eq!(house_now["children"], json!([front["id"], rear["id"]]));

    let reply = h.scoped(&system, "add_zone", json!({ "parent": front["id"], "child": house["id"] }));
    assert_eq!(reply["error"], "Zone cycle");
    let reply = h.scoped(&system, "add_zone", json!({ "parent": house["id"], "child": front["id"] }));
    assert_eq!(reply["error"], "Duplicate child");

    let removed = h.scoped(&system, "remove_zone", json!({ "parent": house["id"], "child": rear["id"] }));
    assert_eq!(removed["parent"], Value::Null);
    let reply = h.scoped(&system, "remove_zone", json!({ "parent": house["id"], "child": rear["id"] }));
    assert_eq!(reply["error"], "Not found");

    let updated = h.scoped(&system, "set_zone_speakers", json!({ "zone": front["id"], "speakers": [1] }));
    assert_eq!(updated["speakers"], json!([1]));

    let destroyed = h.scoped(&system, "destroy_zone", json!({ "zone": house["id"] }));
    assert_eq!(destroyed["detached"], json!([]));
    assert_eq!(h.scoped(&system, "list_zones", json!({})).as_array().map(Vec::len), Some(1));
}

#[test]
fn test_speaker_volume_reports_recomputed_channels() {
    let h = Harness::new();
    let system = h.system(4);
    let front = h.scoped(&system, "create_zone", json!({ "name": "front", "speakers": [0, 1] }));
    let rear = h.scoped(&system, "create_zone", json!({ "name": "rear", "speakers": [2, 3] }));
    let a = h.scoped(&system, "create_channel", json!({ "channels": 1 }))["id"].clone();
    let b = h.scoped(&system, "create_channel", json!({ "channels": 1 }))["id"].clone();
    h.scoped(&system, "attach_zone", json!({ "channel": a, "zone": front["id"] }));
    h.scoped(&system, "attach_zone", json!({ "channel": b, "zone": rear["id"] }));

    let reply = h.scoped(&system, "set_speaker_volume", json!({ "speaker": 1, "volume": 0.5 }));
    assert_eq!(reply, json!({ "recomputed": [a] }));

    let speakers = h.scoped(&system, "list_speakers", json!({}));
    assert_eq!(speakers[1]["volume"], 0.5);
    assert_eq!(speakers.as_array().map(Vec::len), Some(4));

    let channel = h.scoped(&system, "get_channel", json!({ "channel": a }));
    assert_eq!(matrix_of(&channel), vec![1.0, 0.5, 0.0, 0.0]);

    let reply = h.scoped(&system, "set_speaker_volume", json!({ "speaker": 9, "volume": 0.5 }));
    assert_eq!(reply["error"], "Out of range");
    let reply = h.scoped(&system, "set_speaker_volume", json!({ "speaker": 0, "volume": -0.5 }));
    assert_eq!(reply["error"], "Invalid volume");
}

#[test]
fn test_attachment_volume_over_json() {
    let h = Harness::new();
    let system = h.system(2);
    let both = h.scoped(&system, "create_zone", json!({ "name": "both", "speakers": [0, 1] }));
    let id = h.scoped(&system, "create_channel", json!({ "name": "voice", "channels": 1 }))["id"].clone();
    h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": both["id"] }));

    let channel = h.scoped(
        &system,
        "set_attachment_volume",
        json!({ "channel": id, "zone": both["id"], "volume": 0.25 }),
    );
    assert_eq!(matrix_of(&channel), vec![0.25, 0.25]);
    assert_eq!(channel["zones"][0]["volume"], 0.25);
}

#[test]
fn test_set_driver_over_json() {
    let h = Harness::new();
    let system = h.system(2);
    let both = h.scoped(&system, "create_zone", json!({ "name": "both", "speakers": [0, 1] }));
    let id = h.scoped(&system, "create_channel", json!({ "channels": 1 }))["id"].clone();
    h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": both["id"] }));

    let driver = h.scoped(&system, "set_driver", json!({ "driver": h.driver(4) }));
    assert_eq!(driver["channels"], 4);
    assert_eq!(h.scoped(&system, "get_driver", json!({})), driver);

    let state = h.scoped(&system, "get_state", json!({}));
    assert_eq!(state["state"], "started");
    assert_eq!(state["speakers"], 4);

    let channel = h.scoped(&system, "get_channel", json!({ "channel": id }));
    assert_eq!(matrix_of(&channel), vec![1.0, 1.0, 0.0, 0.0]);

    let reply = h.scoped(&system, "set_driver", json!({ "driver": "nope" }));
    assert_eq!(reply, json!({ "error": "Unknown driver", "data": "nope" }));
}

#[test]
fn test_channels_list_and_destroy() {
    let h = Harness::new();
    let system = h.system(2);
    let a = h.scoped(&system, "create_channel", json!({ "channels": 2 }));
    assert_eq!(a["name"], "channel-1");
    let b = h.scoped(&system, "create_channel", json!({ "name": "fx", "channels": 1 }));

    assert_eq!(h.scoped(&system, "list_channels", json!({})).as_array().map(Vec::len), Some(2));
    assert_eq!(
        h.scoped(&system, "destroy_channel", json!({ "channel": a["id"] })),
        json!({ "channel": a["id"] })
    );
    let remaining = h.scoped(&system, "list_channels", json!({}));
    assert_eq!(remaining, json!([b]));

    let reply = h.scoped(&system, "get_channel", json!({ "channel": a["id"] }));
    assert_eq!(reply["error"], "Not found");
    let reply = h.scoped(&system, "get_channel", json!({ "channel": "garbage" }));
    assert_eq!(reply["error"], "Invalid params");
}

#[test]
fn test_oversized_channel_keeps_server_alive() {
    let h = Harness::new();
    let system = h.system(4);

    let reply = h.scoped(&system, "create_channel", json!({ "channels": 4611686018427387904u64 }));
    assert_eq!(reply["error"], "Out of range");
    let reply = h.scoped(&system, "create_channel", json!({ "channels": 65 }));
    assert_eq!(reply["error"], "Out of range");

    assert_eq!(h.scoped(&system, "get_state", json!({}))["state"], "started");
    let channel = h.scoped(&system, "create_channel", json!({ "channels": 64 }));
    assert_eq!(channel["channels"], 64);
    assert_eq!(h.scoped(&system, "list_channels", json!({})).as_array().map(Vec::len), Some(1));
}

#[test]
fn test_naming_over_json() {
    let h = Harness::new();
    let system = h.system(4);
    let front = h.scoped(&system, "create_zone", json!({ "name": "front", "speakers": [0, 1] }));
    h.scoped(&system, "create_zone", json!({ "name": "rear", "speakers": [2, 3] }));

    let reply = h.scoped(&system, "rename_zone", json!({ "zone": front["id"], "name": "rear" }));
    assert_eq!(reply["error"], "Duplicate child");
    let renamed = h.scoped(&system, "rename_zone", json!({ "zone": front["id"], "name": "stage" }));
    assert_eq!(renamed["name"], "stage");

    h.scoped(&system, "set_speaker_name", json!({ "speaker": 0, "name": "Left" }));
    let speakers = h.scoped(&system, "list_speakers", json!({}));
    assert_eq!(speakers[0]["name"], "Left");
    assert_eq!(speakers[1]["name"], Value::Null);
}

#[test]
fn test_set_driver_with_bad_value() {
    let h = Harness::new();
    let system = h.system(2);
    assert_eq!(
        h.scoped(&system, "set_driver", json!({})),
        json!({ "error": "Unknown driver", "data": null })
    );
    assert_eq!(
        h.scoped(&system, "set_driver", json!({ "driver": false })),
        json!({ "error": "Unknown driver", "data": false })
    );
    assert_eq!(h.scoped(&system, "get_state", json!({}))["speakers"], 2);
}

#[test]
fn test_stale_channel_refresh_over_json() {
    let h = Harness::new();
    let system = h.system(2);
    let both = h.scoped(&system, "create_zone", json!({ "name": "both", "speakers": [0, 1] }));
    let id = h.scoped(&system, "create_channel", json!({ "channels": 1 }))["id"].clone();

    h.probe().fail_pushes(true);
    let reply = h.scoped(&system, "attach_zone", json!({ "channel": id, "zone": both["id"] }));
    assert_eq!(reply["error"], "Backend failure");
    let channel = h.scoped(&system, "get_channel", json!({ "channel": id }));
    assert_eq!(channel["stale"], true);
    assert_eq!(matrix_of(&channel), vec![0.0, 0.0]);

    h.probe().fail_pushes(false);
    let channel = h.scoped(&system, "refresh_channel", json!({ "channel": id }));
    assert_eq!(channel["stale"], false);
    assert_eq!(matrix_of(&channel), vec![1.0, 1.0]);
}

// ============================================================================
// SESSIONS
// ============================================================================

#[test]
fn test_sessions_are_independent() {
    let h = Harness::new();
    let one = h.system(2);
    let two = h.system(2);
    assert_ne!(one, two);

    h.scoped(&one, "create_zone", json!({ "name": "both", "speakers": [0, 1] }));
    assert_eq!(h.scoped(&one, "list_zones", json!({})).as_array().map(Vec::len), Some(1));
    assert_eq!(h.scoped(&two, "list_zones", json!({})), json!([]));

    h.scoped(&one, "destroy_system", json!({}));
    assert_eq!(h.scoped(&two, "get_state", json!({}))["state"], "started");
    assert_eq!(h.server.session_count(), 1);
}

#[test]
fn test_config_templates_seed_new_sessions() {
    let mut config = EarConfig::default();
    config.zones.push(
        ZoneTemplate::new("house", vec![])
            .with_child(ZoneTemplate::new("front", vec![0, 1]))
            .with_child(ZoneTemplate::new("rear", vec![2, 3])),
    );
    let h = Harness::with_config(config);

    let quad = h.system(4);
    let zones = h.scoped(&quad, "list_zones", json!({}));
    assert_eq!(zones.as_array().map(Vec::len), Some(3));

    let stereo = h.system(2);
    let zones = h.scoped(&stereo, "list_zones", json!({}));
    let house = zones
        .as_array()
        .unwrap()
        .iter()
        .find(|z| z["name"] == "house")
        .cloned()
        .unwrap();
    assert_eq!(house["resolved"], json!([0, 1]));
}

#[test]
fn test_shutdown_releases_everything() {
    let h = Harness::new();
    h.system(2);
    h.system(4);
    h.server.shutdown();
    assert_eq!(h.server.session_count(), 0);

    let releases = h
        .probe()
        .events()
        .into_iter()
        .filter(|e| matches!(e, MockEvent::Release))
        .count();
    assert_eq!(releases, 2);
}
