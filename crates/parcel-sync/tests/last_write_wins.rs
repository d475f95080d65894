//! Property tests for last-write-wins convergence of a batch

use parcel_sync::{
    BatchStatePool, ComponentId, ComponentRegistry, CrdtEntity, CrdtMessage,
    CrdtWorldSynchronizer, DefaultEntityFactory, MemoryWorld, ReconciliationEffect,
    SceneCrdtBridge, SceneWorld, SyncConfig, Utf8Bridge,
};
use parking_lot::RwLock;
use proptest::prelude::*;
use std::sync::Arc;

const TEXT: ComponentId = ComponentId(10);

fn synchronizer() -> CrdtWorldSynchronizer<MemoryWorld, DefaultEntityFactory> {
    CrdtWorldSynchronizer::new(
        Arc::new(RwLock::new(SceneWorld::new(MemoryWorld::new()))),
        Arc::new(ComponentRegistry::new().with(Utf8Bridge::new(TEXT, "text"))),
        DefaultEntityFactory,
        SyncConfig::new("lww"),
        Arc::new(BatchStatePool::new(64, true)),
    )
}

fn value(timestamp: u32) -> String {
    format!("v{}", timestamp)
}

/// Distinct timestamps in arbitrary order
fn shuffled_timestamps() -> impl Strategy<Value = Vec<u32>> {
    (1u32..16).prop_flat_map(|n| {
        let timestamps: Vec<u32> = (1..=n).map(|t| t * 3).collect();
        Just(timestamps).prop_shuffle()
    })
}

proptest! {
    #[test]
    fn highest_timestamp_is_applied(timestamps in shuffled_timestamps()) {
        let sync = synchronizer();
        let mut buffer = sync.get_sync_command_buffer().unwrap();

        let mut highest_so_far = 0;
        for &timestamp in &timestamps {
            let effect = buffer
                .stage(CrdtMessage::put(1, 10, timestamp, value(timestamp).as_str()))
                .unwrap();
            if timestamp > highest_so_far {
                prop_assert_ne!(effect, ReconciliationEffect::Obsolete);
                highest_so_far = timestamp;
            } else {
                prop_assert_eq!(effect, ReconciliationEffect::Obsolete);
            }
        }

        let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();
        prop_assert_eq!(report.created, 1);

        let max = timestamps.iter().copied().max().unwrap();
        let scene = sync.scene().read();
        prop_assert_eq!(scene.component::<String>(CrdtEntity(1), TEXT), Some(&value(max)));
    }

    #[test]
    fn protocol_and_world_converge(timestamps in shuffled_timestamps(), split in 0usize..16) {
        let bridge = SceneCrdtBridge::new(synchronizer());
        let messages: Vec<_> = timestamps
            .iter()
            .map(|&t| CrdtMessage::put(7, 10, t, value(t).as_str()))
            .collect();

        // the same messages, delivered over two batches
        let split = split.min(messages.len());
        bridge.send_to_renderer(messages[..split].to_vec()).unwrap();
        bridge.send_to_renderer(messages[split..].to_vec()).unwrap();

        let max = timestamps.iter().copied().max().unwrap();
        let state = bridge.get_state();
        prop_assert_eq!(state.len(), 1);
        prop_assert_eq!(state[0].timestamp, max);

        let scene = bridge.synchronizer().scene().read();
        prop_assert_eq!(scene.component::<String>(CrdtEntity(7), TEXT), Some(&value(max)));
    }

    #[test]
    fn deleted_entity_stays_absent(count in 1u32..8) {
        let bridge = SceneCrdtBridge::new(synchronizer());
        let mut batch: Vec<_> = (0..count)
            .map(|entity| CrdtMessage::put(entity, 10, 1, "x"))
            .collect();
        batch.push(CrdtMessage::delete_entity(0));
        // rejected once the entity is deleted, even in the same batch
        batch.push(CrdtMessage::put(0, 10, 2, "y"));
        bridge.send_to_renderer(batch).unwrap();

        prop_assert!(bridge.with_protocol(|protocol| protocol.is_entity_deleted(CrdtEntity(0))));
        let scene = bridge.synchronizer().scene().read();
        prop_assert!(scene.entity(CrdtEntity(0)).is_none());
        prop_assert_eq!(scene.entities().len(), count as usize - 1);
    }
}

fn world_text(bridge: &SceneCrdtBridge<MemoryWorld, DefaultEntityFactory>) -> Option<String> {
    bridge
        .synchronizer()
        .scene()
        .read()
        .component::<String>(CrdtEntity(1), TEXT)
        .cloned()
}

fn state_text(bridge: &SceneCrdtBridge<MemoryWorld, DefaultEntityFactory>) -> Option<String> {
    bridge
        .get_state()
        .into_iter()
        .find(|message| message.key() == (CrdtEntity(1), TEXT))
        .map(|message| String::from_utf8_lossy(message.payload.as_bytes()).into_owned())
}

#[test]
fn test_equal_timestamps_converge_regardless_of_batching() {
    let one_batch = SceneCrdtBridge::new(synchronizer());
    one_batch
        .send_to_renderer(vec![
            CrdtMessage::put(1, 10, 5, "a"),
            CrdtMessage::put(1, 10, 5, "b"),
        ])
        .unwrap();

    let two_batches = SceneCrdtBridge::new(synchronizer());
    two_batches
        .send_to_renderer(vec![CrdtMessage::put(1, 10, 5, "a")])
        .unwrap();
    two_batches
        .send_to_renderer(vec![CrdtMessage::put(1, 10, 5, "b")])
        .unwrap();

    assert_eq!(state_text(&one_batch), Some("b".to_string()));
    assert_eq!(world_text(&one_batch), state_text(&one_batch));
    assert_eq!(world_text(&two_batches), state_text(&two_batches));
}
