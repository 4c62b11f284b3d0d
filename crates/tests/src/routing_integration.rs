//! Integration tests for the routing engine
//!
//! These tests drive a Router against the mock backend and check that every
//! channel's pushed matrix follows its zone attachments through tree edits,
//! volume changes and driver switches.

use ear_core::domain::backend::mock::{MockBackend, MockEvent, MockProbe};
use ear_core::domain::{AudioBackend, AudioError, ChannelId, Router, RouterState, ZoneId};
use proptest::prelude::*;

fn router(channels: u16) -> (Router, MockProbe, MockBackend) {
    let backend = MockBackend::with_default_drivers();
    let driver = backend
        .drivers()
        .unwrap()
        .into_iter()
        .find(|d| d.channels == channels)
        .unwrap();
    let router = Router::new(backend.create_session().unwrap(), driver).unwrap();
    (router, backend.probe(), backend)
}

fn pushed(router: &Router, probe: &MockProbe, channel: ChannelId) -> Vec<f32> {
    probe.matrix(router.channel(channel).unwrap().group()).unwrap()
}

/// Matrix as the router would compute it from scratch
fn fresh(router: &Router, channel: ChannelId) -> Vec<f32> {
    router
        .channel(channel)
        .unwrap()
        .compute_matrix(router.zones(), router.speakers())
        .unwrap()
        .flatten()
        .to_vec()
}

// ============================================================================
// ZONE ROUTING
// ============================================================================

#[test]
fn test_front_then_rear_leaves_front_columns() {
    let (mut router, probe, _) = router(4);
    router.start().unwrap();
    let front = router.create_zone("front", [0, 1]).unwrap();
    let rear = router.create_zone("rear", [2, 3]).unwrap();
    let music = router.create_channel("music", 2).unwrap();

    router.attach_zone(music, front).unwrap();
    let before = pushed(&router, &probe, music);
    assert_eq!(before, vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

    router.attach_zone(music, rear).unwrap();
    let after = pushed(&router, &probe, music);
    for row in 0..2 {
        assert_eq!(after[row * 4..row * 4 + 2], before[row * 4..row * 4 + 2]);
        assert_eq!(after[row * 4 + 2..row * 4 + 4], [1.0, 1.0]);
    }
}

#[test]
fn test_hierarchy_follows_reparenting() {
    let (mut router, probe, _) = router(8);
    let house = router.create_zone("house", []).unwrap();
    let upstairs = router.create_zone("upstairs", []).unwrap();
    let kitchen = router.create_zone_in(house, "kitchen", [0, 1]).unwrap();
    let bedroom = router.create_zone_in(upstairs, "bedroom", [4, 5]).unwrap();

    let radio = router.create_channel("radio", 1).unwrap();
    router.attach_zone(radio, house).unwrap();
    assert_eq!(
        pushed(&router, &probe, radio),
        vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    );

    // upstairs moves under house; radio now reaches the bedroom too
    router.add_zone(house, upstairs).unwrap();
    assert_eq!(
        pushed(&router, &probe, radio),
        vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]
    );

    // bedroom moves under kitchen; still inside house, nothing changes
    router.add_zone(kitchen, bedroom).unwrap();
    assert_eq!(
        pushed(&router, &probe, radio),
        vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]
    );
    assert_eq!(router.zones().zone(upstairs).unwrap().children, Vec::<ZoneId>::new());
}

#[test]
fn test_cycle_is_rejected_without_side_effects() {
    let (mut router, probe, _) = router(4);
    let house = router.create_zone("house", [0]).unwrap();
    let room = router.create_zone_in(house, "room", [1]).unwrap();
    let music = router.create_channel("music", 1).unwrap();
    router.attach_zone(music, house).unwrap();
    probe.clear_events();

    assert!(matches!(router.add_zone(room, house), Err(AudioError::Cycle { .. })));
    assert!(matches!(router.add_zone(room, room), Err(AudioError::Cycle { .. })));
    assert!(probe.pushed_groups().is_empty());
    assert_eq!(router.zones().zone(house).unwrap().parent, None);
}

#[test]
fn test_destroying_subtree_detaches_descendants() {
    let (mut router, probe, _) = router(4);
    let house = router.create_zone("house", []).unwrap();
    let kitchen = router.create_zone_in(house, "kitchen", [0, 1]).unwrap();
    let garden = router.create_zone("garden", [3]).unwrap();

    let a = router.create_channel("a", 1).unwrap();
    let b = router.create_channel("b", 1).unwrap();
    router.attach_zone(a, kitchen).unwrap();
    router.attach_zone(a, garden).unwrap();
    router.attach_zone(b, garden).unwrap();

    let affected = router.destroy_zone(house).unwrap();
    assert_eq!(affected, vec![a]);
    assert!(router.zones().get(kitchen).is_none());
    assert_eq!(router.channel(a).unwrap().zones().len(), 1);
    assert_eq!(pushed(&router, &probe, a), vec![0.0, 0.0, 0.0, 1.0]);
    assert_eq!(pushed(&router, &probe, b), vec![0.0, 0.0, 0.0, 1.0]);
}

// ============================================================================
// VOLUMES
// ============================================================================

#[test]
fn test_speaker_and_attachment_volumes_multiply() {
    let (mut router, probe, _) = router(2);
    let both = router.create_zone("both", [0, 1]).unwrap();
    let voice = router.create_channel("voice", 1).unwrap();
    router.attach_zone(voice, both).unwrap();

    router.set_attachment_volume(voice, both, 0.5).unwrap();
    router.set_speaker_volume(1, 0.5).unwrap();
    assert_eq!(pushed(&router, &probe, voice), vec![0.5, 0.25]);
}

#[test]
fn test_overlapping_zones_sum() {
    let (mut router, probe, _) = router(4);
    let front = router.create_zone("front", [0, 1]).unwrap();
    let left = router.create_zone("left", [0, 2]).unwrap();
    let fx = router.create_channel("fx", 1).unwrap();
    router.attach_zone(fx, front).unwrap();
    router.attach_zone(fx, left).unwrap();
    router.set_attachment_volume(fx, left, 0.5).unwrap();

    assert_eq!(pushed(&router, &probe, fx), vec![1.5, 1.0, 0.5, 0.0]);
}

#[test]
fn test_attachment_volume_touches_one_channel() {
    let (mut router, probe, _) = router(4);
    let front = router.create_zone("front", [0, 1]).unwrap();
    let a = router.create_channel("a", 2).unwrap();
    let b = router.create_channel("b", 2).unwrap();
    router.attach_zone(a, front).unwrap();
    router.attach_zone(b, front).unwrap();
    probe.clear_events();

    router.set_attachment_volume(a, front, 0.3).unwrap();
    let group_a = router.channel(a).unwrap().group();
    assert_eq!(probe.pushed_groups(), vec![group_a]);
}

#[test]
fn test_invalid_volumes_change_nothing() {
    let (mut router, probe, _) = router(2);
    let both = router.create_zone("both", [0, 1]).unwrap();
    let voice = router.create_channel("voice", 1).unwrap();
    router.attach_zone(voice, both).unwrap();
    probe.clear_events();

    assert!(matches!(
        router.set_speaker_volume(0, -1.0),
        Err(AudioError::InvalidVolume(_))
    ));
    assert!(matches!(
        router.set_attachment_volume(voice, both, f32::INFINITY),
        Err(AudioError::InvalidVolume(_))
    ));
    assert!(matches!(
        router.set_speaker_volume(7, 0.5),
        Err(AudioError::OutOfRange { .. })
    ));
    assert!(probe.pushed_groups().is_empty());
}

// ============================================================================
// LIFECYCLE AND DRIVERS
// ============================================================================

#[test]
fn test_stop_keeps_groups_for_restart() {
    let (mut router, probe, _) = router(2);
    router.start().unwrap();
    let music = router.create_channel("music", 2).unwrap();
    router.stop().unwrap();
    assert_eq!(router.state(), RouterState::Stopped);

    router.start().unwrap();
    assert!(router.channel(music).is_ok());
    assert!(!probe
        .events()
        .iter()
        .any(|e| matches!(e, MockEvent::ReleaseGroup(_))));
}

#[test]
fn test_driver_switch_widens_matrices() {
    let (mut router, probe, backend) = router(2);
    let wide = backend
        .drivers()
        .unwrap()
        .into_iter()
        .find(|d| d.channels == 8)
        .unwrap();

    let both = router.create_zone("both", [0, 1]).unwrap();
    let music = router.create_channel("music", 2).unwrap();
    router.attach_zone(music, both).unwrap();

    router.set_driver(wide.clone()).unwrap();
    assert_eq!(router.driver(), &wide);
    assert_eq!(router.num_speakers(), 8);
    assert_eq!(router.state(), RouterState::Created);

    let matrix = pushed(&router, &probe, music);
    assert_eq!(matrix.len(), 16);
    assert_eq!(matrix[..8], [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_failed_push_recovers_on_refresh() {
    let (mut router, probe, _) = router(4);
    let front = router.create_zone("front", [0, 1]).unwrap();
    let a = router.create_channel("a", 1).unwrap();
    let b = router.create_channel("b", 1).unwrap();
    router.attach_zone(a, front).unwrap();
    router.attach_zone(b, front).unwrap();

    probe.fail_pushes(true);
    assert!(router.set_speaker_volume(0, 0.5).is_err());
    assert!(router.channel(a).unwrap().is_stale());
    assert!(router.channel(b).unwrap().is_stale());
    assert_eq!(router.channel(a).unwrap().matrix().flatten(), &[1.0, 1.0, 0.0, 0.0]);

    probe.fail_pushes(false);
    let mut recovered = router.refresh_stale().unwrap();
    recovered.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(recovered, expected);
    assert_eq!(pushed(&router, &probe, a), vec![0.5, 1.0, 0.0, 0.0]);
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Attach(usize, usize),
    Detach(usize, usize),
    Volume(usize, usize, f32),
    Speaker(usize, f32),
    Link(usize, usize),
    Unlink(usize, usize),
    Speakers(usize, Vec<usize>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, 0..4usize).prop_map(|(c, z)| Op::Attach(c, z)),
        (0..3usize, 0..4usize).prop_map(|(c, z)| Op::Detach(c, z)),
        (0..3usize, 0..4usize, 0.0f32..2.0).prop_map(|(c, z, v)| Op::Volume(c, z, v)),
        (0..4usize, 0.0f32..2.0).prop_map(|(s, v)| Op::Speaker(s, v)),
        (0..4usize, 0..4usize).prop_map(|(p, c)| Op::Link(p, c)),
        (0..4usize, 0..4usize).prop_map(|(p, c)| Op::Unlink(p, c)),
        (0..4usize, prop::collection::vec(0..4usize, 0..4)).prop_map(|(z, s)| Op::Speakers(z, s)),
    ]
}

proptest! {
    #[test]
    fn prop_pushed_matrix_matches_attachments(ops in prop::collection::vec(op(), 1..40)) {
        let (mut router, probe, _) = router(4);
        let zones: Vec<ZoneId> = (0..4)
            .map(|i| router.create_zone(&format!("z{}", i), [i]).unwrap())
            .collect();
        let channels: Vec<ChannelId> = (1..=3)
            .map(|k| router.create_channel(&format!("c{}", k), k).unwrap())
            .collect();

        for op in ops {
            // rejected operations must leave everything consistent too
            let _ = match op {
                Op::Attach(c, z) => router.attach_zone(channels[c], zones[z]).map(|_| ()),
                Op::Detach(c, z) => router.detach_zone(channels[c], zones[z]).map(|_| ()),
                Op::Volume(c, z, v) => router.set_attachment_volume(channels[c], zones[z], v),
                Op::Speaker(s, v) => router.set_speaker_volume(s, v).map(|_| ()),
                Op::Link(p, c) => router.add_zone(zones[p], zones[c]),
                Op::Unlink(p, c) => router.remove_zone(zones[p], zones[c]),
                Op::Speakers(z, s) => router.set_zone_speakers(zones[z], s),
            };

            for &channel in &channels {
                let expected = fresh(&router, channel);
                prop_assert_eq!(router.channel(channel).unwrap().matrix().flatten(), &expected[..]);
                prop_assert_eq!(pushed(&router, &probe, channel), expected);
            }
        }
    }
}
