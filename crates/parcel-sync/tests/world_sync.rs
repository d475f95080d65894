//! End-to-end synchronization scenarios and single-writer behavior

use parcel_sync::{
    BatchStatePool, ComponentId, ComponentRegistry, ComponentValue, CrdtEntity, CrdtMessage,
    CrdtWorldSynchronizer, DefaultEntityFactory, EcsWorld, EntityFactory, Error, MemoryWorld,
    ReconciliationEffect, SceneWorld, SyncConfig, Utf8Bridge, WorldEntity,
    WorldSyncCommandBufferCollectionsPool,
};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TEXT: ComponentId = ComponentId(10);
const ORIGIN: ComponentId = ComponentId(0);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn registry() -> Arc<ComponentRegistry> {
    Arc::new(ComponentRegistry::new().with(Utf8Bridge::new(TEXT, "text")))
}

fn synchronizer<W, F>(world: W, factory: F, config: SyncConfig) -> CrdtWorldSynchronizer<W, F>
where
    W: EcsWorld,
    F: EntityFactory<W>,
{
    CrdtWorldSynchronizer::new(
        Arc::new(RwLock::new(SceneWorld::new(world))),
        registry(),
        factory,
        config,
        Arc::new(BatchStatePool::new(256, true)),
    )
}

fn memory_synchronizer(config: SyncConfig) -> CrdtWorldSynchronizer<MemoryWorld, DefaultEntityFactory> {
    synchronizer(MemoryWorld::new(), DefaultEntityFactory, config)
}

/// World wrapper counting destroy calls
#[derive(Default)]
struct CountingWorld {
    inner: MemoryWorld,
    destroy_calls: usize,
}

impl EcsWorld for CountingWorld {
    type Entity = WorldEntity;

    fn create_entity(&mut self) -> WorldEntity {
        self.inner.create_entity()
    }

    fn contains(&self, entity: WorldEntity) -> bool {
        self.inner.contains(entity)
    }

    fn add_or_set_component(
        &mut self,
        entity: WorldEntity,
        component_id: ComponentId,
        value: ComponentValue,
    ) -> bool {
        self.inner.add_or_set_component(entity, component_id, value)
    }

    fn remove_component(&mut self, entity: WorldEntity, component_id: ComponentId) -> bool {
        self.inner.remove_component(entity, component_id)
    }

    fn destroy_entity(&mut self, entity: WorldEntity) -> bool {
        self.destroy_calls += 1;
        self.inner.destroy_entity(entity)
    }

    fn component(
        &self,
        entity: WorldEntity,
        component_id: ComponentId,
    ) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.component(entity, component_id)
    }
}

/// Factory recording the CRDT entity on the world entity it creates
struct OriginFactory;

impl<W: EcsWorld> EntityFactory<W> for OriginFactory {
    fn create(&self, crdt_entity: CrdtEntity, world: &mut W) -> W::Entity {
        let entity = world.create_entity();
        world.add_or_set_component(entity, ORIGIN, Box::new(crdt_entity));
        entity
    }
}

#[test]
fn test_latest_timestamp_wins_end_to_end() {
    init_logs();
    let sync = memory_synchronizer(SyncConfig::new("e2e"));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    let effects: Vec<_> = [
        CrdtMessage::put(1, 10, 1, "A"),
        CrdtMessage::put(1, 10, 3, "C"),
        CrdtMessage::put(1, 10, 2, "B"),
    ]
    .into_iter()
    .map(|message| buffer.stage(message).unwrap())
    .collect();

    assert_eq!(effects[2], ReconciliationEffect::Obsolete);
    sync.apply_sync_command_buffer(buffer).unwrap();

    let scene = sync.scene().read();
    assert_eq!(
        scene.component::<String>(CrdtEntity(1), TEXT),
        Some(&"C".to_string())
    );
}

#[test]
fn test_deleting_mapped_entity_destroys_it_once() {
    init_logs();
    let sync = synchronizer(CountingWorld::default(), DefaultEntityFactory, SyncConfig::new("delete"));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(5, 10, 1, "crate")).unwrap();
    sync.apply_sync_command_buffer(buffer).unwrap();
    assert!(sync.scene().read().entities().contains_key(&CrdtEntity(5)));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::delete_entity(5)).unwrap();
    let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();

    let scene = sync.scene().read();
    assert_eq!(report.destroyed, 1);
    assert_eq!(scene.world().destroy_calls, 1);
    assert!(!scene.entities().contains_key(&CrdtEntity(5)));
    assert!(scene.world().inner.is_empty());
}

#[test]
fn test_factory_creates_missing_entities() {
    let sync = synchronizer(MemoryWorld::new(), OriginFactory, SyncConfig::new("factory"));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(512, 10, 1, "box")).unwrap();
    buffer.stage(CrdtMessage::put(513, 10, 1, "sphere")).unwrap();
    let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();
    assert_eq!(report.created, 2);

    let scene = sync.scene().read();
    assert_eq!(
        scene.component::<CrdtEntity>(CrdtEntity(513), ORIGIN),
        Some(&CrdtEntity(513))
    );

    // the next batch reuses the mapping
    drop(scene);
    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(512, 10, 2, "bigger box")).unwrap();
    let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(sync.scene().read().world().len(), 2);
}

#[test]
fn test_reserved_entities_are_never_instantiated() {
    let config = SyncConfig::new("reserved")
        .with_reserved_entity(CrdtEntity(1))
        .with_reserved_entity(CrdtEntity(2));
    let sync = memory_synchronizer(config);

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(1, 10, 1, "player")).unwrap();
    buffer.stage(CrdtMessage::put(512, 10, 1, "box")).unwrap();
    let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();

    assert_eq!(report.skipped_reserved, 1);
    let scene = sync.scene().read();
    assert!(scene.entity(CrdtEntity(1)).is_none());
    assert!(scene.entity(CrdtEntity(512)).is_some());
}

#[test]
fn test_writers_are_serialized() {
    init_logs();
    let sync = Arc::new(memory_synchronizer(SyncConfig::new("exclusive")));
    let counter = Arc::new(AtomicUsize::new(0));

    let first = sync.get_sync_command_buffer().unwrap();

    let second = {
        let sync = Arc::clone(&sync);
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
            let mut buffer = sync.get_sync_command_buffer().unwrap();
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            buffer.stage(CrdtMessage::put(1, 10, 2, "second")).unwrap();
            sync.apply_sync_command_buffer(buffer).unwrap();
            seen
        })
    };

    // the second writer must still be waiting
    thread::sleep(Duration::from_millis(50));
    let seen_by_first = counter.fetch_add(1, Ordering::SeqCst);

    let mut first = first;
    first.stage(CrdtMessage::put(1, 10, 1, "first")).unwrap();
    sync.apply_sync_command_buffer(first).unwrap();

    assert_eq!(seen_by_first, 0);
    assert_eq!(second.join().unwrap(), 1);

    let scene = sync.scene().read();
    assert_eq!(
        scene.component::<String>(CrdtEntity(1), TEXT),
        Some(&"second".to_string())
    );
}

#[test]
fn test_staging_and_applying_on_different_threads() {
    let sync = Arc::new(memory_synchronizer(SyncConfig::new("threads")));

    let buffer = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || {
            let mut buffer = sync.get_sync_command_buffer().unwrap();
            buffer.stage(CrdtMessage::put(7, 10, 1, "worker")).unwrap();
            buffer.finalize_and_deserialize().unwrap();
            buffer
        })
        .join()
        .unwrap()
    };

    let report = sync.apply_sync_command_buffer(buffer).unwrap().unwrap();
    assert_eq!(report.created, 1);

    // the permit acquired on the worker was released here
    assert!(sync.get_sync_command_buffer().is_ok());
}

#[test]
fn test_timeout_reports_scene_and_wait() {
    init_logs();
    let config = SyncConfig::new("-9,12").with_acquire_timeout(Duration::from_millis(30));
    let sync = memory_synchronizer(config);
    let _stuck = sync.get_sync_command_buffer().unwrap();

    match sync.get_sync_command_buffer() {
        Err(Error::Timeout { scene, waited }) => {
            assert_eq!(scene, "-9,12");
            assert!(waited >= Duration::from_millis(30));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn test_pause_does_not_time_out() {
    let config = SyncConfig::new("paused").with_acquire_timeout(Duration::from_millis(20));
    let sync = Arc::new(memory_synchronizer(config));
    let pause = sync.pause_signal();

    let held = sync.get_sync_command_buffer().unwrap();
    pause.pause();

    let waiter = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || sync.get_sync_command_buffer().map(drop))
    };

    thread::sleep(Duration::from_millis(120));
    drop(held);
    pause.resume();

    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn test_dropping_unapplied_buffer_releases_permit() {
    let config = SyncConfig::new("dropped").with_acquire_timeout(Duration::from_millis(50));
    let sync = memory_synchronizer(config);

    {
        let mut buffer = sync.get_sync_command_buffer().unwrap();
        buffer.stage(CrdtMessage::put(1, 10, 1, "lost")).unwrap();
    }

    let buffer = sync.get_sync_command_buffer().unwrap();
    assert_eq!(buffer.staged_len(), 0);
    assert!(sync.scene().read().world().is_empty());
}

#[test]
fn test_apply_after_dispose_leaves_world_untouched() {
    init_logs();
    let sync = Arc::new(memory_synchronizer(SyncConfig::new("teardown")));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(1, 10, 1, "A")).unwrap();
    sync.apply_sync_command_buffer(buffer).unwrap();

    let staged = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || {
            let mut buffer = sync.get_sync_command_buffer().unwrap();
            buffer.stage(CrdtMessage::put(1, 10, 2, "B")).unwrap();
            buffer.stage(CrdtMessage::put(2, 10, 1, "new")).unwrap();
            buffer.stage(CrdtMessage::delete_entity(1)).unwrap();
            buffer
        })
        .join()
        .unwrap()
    };

    sync.dispose();
    let result = sync.apply_sync_command_buffer(staged);
    assert!(matches!(result, Ok(None)));

    let scene = sync.scene().read();
    assert_eq!(scene.entities().len(), 1);
    assert_eq!(scene.world().len(), 1);
    assert_eq!(
        scene.component::<String>(CrdtEntity(1), TEXT),
        Some(&"A".to_string())
    );
}

#[test]
fn test_main_dictionary_checkout_is_exclusive() {
    let pool = WorldSyncCommandBufferCollectionsPool::new("pool", 8);
    let _main = pool.get_main_dictionary().unwrap();
    assert!(matches!(
        pool.get_main_dictionary(),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_release_drops_decoded_value() {
    let pool = BatchStatePool::new(8, true);
    let decoded = Arc::new("decoded".to_string());

    let mut state = pool.acquire();
    state.set_deserialization_target(Box::new(Arc::clone(&decoded)));
    pool.release(state).unwrap();

    assert_eq!(Arc::strong_count(&decoded), 1);
    assert!(pool.acquire().deserialization_target().is_none());
}

#[test]
fn test_dispose_while_apply_waits_for_world() {
    init_logs();
    let sync = Arc::new(memory_synchronizer(SyncConfig::new("lock-race")));

    let mut buffer = sync.get_sync_command_buffer().unwrap();
    buffer.stage(CrdtMessage::put(1, 10, 1, "A")).unwrap();

    // hold the world so the apply blocks on the lock
    let guard = sync.scene().write();
    let applier = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || sync.apply_sync_command_buffer(buffer).map(|report| report.is_none()))
    };

    thread::sleep(Duration::from_millis(50));
    sync.dispose();
    drop(guard);

    assert!(applier.join().unwrap().unwrap());
    let scene = sync.scene().read();
    assert!(scene.world().is_empty());
    assert!(scene.entities().is_empty());
}
