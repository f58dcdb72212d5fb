//! Performance benchmarks for hot session paths

use server::world::SceneWorld;
use server::{MapDefinition, ServerConfig};
use server::spawn::{EntitySpawnOrchestrator, SpawnStep};
use shared::channel::ReliableChannel;
use shared::correlation::PendingRequests;
use shared::messages::{ChatMessage, TimeOfDayUpdate};
use shared::physics_sync::{PhysicsDimension, PhysicsSyncScheduler, TransformSync};
use shared::protocol::{decode_packet, encode_packet};
use shared::readiness::{ReadinessGate, ReadinessScope};
use shared::router::{notification, MessageRouter};
use shared::time_of_day::TimeOfDayState;
use shared::{ConnectionId, Opcode, Packet};
use std::time::{Duration, Instant};

/// Benchmarks notification dispatch through the router
#[test]
fn benchmark_router_dispatch() {
    let mut router: MessageRouter<u64> = MessageRouter::new();
    router.register_notification(Opcode::CHAT, |count: &mut u64, _, message: ChatMessage| {
        *count += message.text.len() as u64;
    });
    let envelope = notification(Opcode::CHAT, &ChatMessage::system("hello")).unwrap();

    let iterations = 100_000;
    let mut count = 0u64;
    let start = Instant::now();

    for _ in 0..iterations {
        router.dispatch(&mut count, ConnectionId(1), &envelope).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Router dispatch: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(count, 5 * iterations as u64);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks polling a closed readiness gate
#[test]
fn benchmark_readiness_gate_poll() {
    let activated = Instant::now();
    let mut gate = ReadinessGate::with_minimum_delay(
        ReadinessScope::ServerObjects,
        activated,
        Duration::from_secs(3600),
    );
    for i in 0..8 {
        gate.register_criterion(format!("criterion_{}", i), |_: Duration| true);
    }

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(!gate.poll(activated));
    }

    let duration = start.elapsed();
    println!(
        "Readiness poll: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

struct CountingSync {
    syncs: u64,
}

impl TransformSync for CountingSync {
    fn sync_transforms(&mut self, _dimension: PhysicsDimension) {
        self.syncs += 1;
    }
}

/// Simulated ticks at 1 ms spacing: the throttle caps syncs at one per
/// minimum interval per dimension
#[test]
fn benchmark_physics_sync_throttle() {
    let mut scheduler = PhysicsSyncScheduler::new(Duration::from_millis(8));
    scheduler.set_auto_sync(PhysicsDimension::ThreeD, true);
    let mut target = CountingSync { syncs: 0 };

    let base = Instant::now();
    let ticks = 80_000u64;
    let start = Instant::now();

    for tick in 0..ticks {
        scheduler.maybe_sync(&mut target, base + Duration::from_millis(tick));
    }

    let duration = start.elapsed();
    println!(
        "Physics throttle: {} ticks in {:?}, {} syncs",
        ticks, duration, target.syncs
    );

    assert_eq!(target.syncs, ticks / 8);
    assert_eq!(scheduler.sync_count(PhysicsDimension::TwoD), 0);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks reliable delivery with every other packet arriving out of order
#[test]
fn benchmark_reliable_channel_reordering() {
    let mut sender = ReliableChannel::new();
    let mut receiver = ReliableChannel::new();
    let now = Instant::now();
    let envelope = notification(Opcode::CHAT, &ChatMessage::system("payload")).unwrap();

    let pairs = 10_000;
    let mut delivered = 0;
    let start = Instant::now();

    for _ in 0..pairs {
        let first = sender.send(envelope.clone(), now);
        let second = sender.send(envelope.clone(), now);
        for packet in [second, first] {
            if let Packet::Reliable { sequence, envelope } = packet {
                let (released, ack) = receiver.receive(sequence, envelope);
                delivered += released.len();
                if let Packet::Ack { sequence } = ack {
                    sender.on_ack(sequence);
                }
            }
        }
    }

    let duration = start.elapsed();
    println!(
        "Reliable channel: {} packets in {:?} ({:.2} ns/packet)",
        pairs * 2,
        duration,
        duration.as_nanos() as f64 / (pairs * 2) as f64
    );

    assert_eq!(delivered, pairs * 2);
    assert_eq!(sender.unacked_len(), 0);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks the request correlation table under churn
#[test]
fn benchmark_correlation_table() {
    let mut pending = PendingRequests::new();
    let deadline = Instant::now() + Duration::from_secs(60);

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let id = pending.insert(Opcode::ENTER_GAME, i, deadline);
        assert_eq!(pending.fulfill(id), Some((Opcode::ENTER_GAME, i)));
    }

    let duration = start.elapsed();
    println!(
        "Correlation table: {} round trips in {:?}",
        iterations, duration
    );

    assert!(pending.is_empty());
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks packet encode/decode of a typical reliable notification
#[test]
fn benchmark_packet_codec() {
    let envelope = notification(
        Opcode::TIME_OF_DAY,
        &TimeOfDayUpdate {
            time_of_day: 13.25,
            server_time_ms: 1_700_000_000_000,
        },
    )
    .unwrap();
    let packet = Packet::unreliable(envelope);

    let iterations = 100_000;
    let mut state = TimeOfDayState::default();
    let start = Instant::now();

    for _ in 0..iterations {
        let data = encode_packet(&packet).unwrap();
        if let Packet::Unreliable { envelope } = decode_packet(&data).unwrap() {
            let update: TimeOfDayUpdate = bincode::deserialize(&envelope.payload).unwrap();
            state.apply(&update);
        }
    }

    let duration = start.elapsed();
    println!(
        "Packet codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!((state.hours() - 13.25).abs() < 0.001);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks spawning the built-in map end to end
#[test]
fn benchmark_scene_spawn() {
    let map: MapDefinition = ServerConfig::default().map;
    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut world = SceneWorld::new();
        world.load_catalog(map.assets.iter().cloned());

        let mut orchestrator = EntitySpawnOrchestrator::new(map.info.map_id.clone(), false, true);
        assert!(orchestrator.start(&map.spawns));
        let steps = orchestrator.run_to_completion(&mut world);

        assert!(matches!(steps.last(), Some(SpawnStep::Finished(_))));
        assert_eq!(orchestrator.report().failed, 0);
    }

    let duration = start.elapsed();
    println!(
        "Scene spawn: {} runs in {:?} ({:.2} μs/run)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}
