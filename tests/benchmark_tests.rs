//! Performance benchmarks for hot paths of the orchestration layer

use node::actor::CallChain;
use node::cluster::{BackendRuntime, ClusterClient, LocalCluster, RuntimeSettings};
use shared::{
    read_frame, resolve_launch_order, write_frame, ClientPacket, PlayerContext, RoleSet,
};
use std::time::Instant;

/// Benchmarks role parsing and launch-order resolution
#[test]
fn benchmark_launch_order_resolution() {
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let roles = RoleSet::parse("front_end, backend").unwrap();
        let order = resolve_launch_order(roles).unwrap();
        assert_eq!(order.len(), 3);
    }

    let duration = start.elapsed();
    println!(
        "Launch order resolution: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Generous bound for debug builds
    assert!(duration.as_secs() < 2);
}

/// Benchmarks control-frame encoding and decoding over an in-memory pipe
#[tokio::test]
async fn benchmark_frame_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    let packet = ClientPacket::Join {
        context: PlayerContext {
            profile_id: 1001,
            display_name: "bench".to_string(),
        },
        session_id: 9,
        token: "token".to_string(),
    };

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        write_frame(&mut a, &packet).await.unwrap();
        let decoded: ClientPacket = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded, packet);
    }

    let duration = start.elapsed();
    println!(
        "Frame round trip: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks sequential backend calls through the in-process cluster client
#[tokio::test]
async fn benchmark_backend_calls() {
    let runtime = BackendRuntime::new(RuntimeSettings::default());
    let cluster = LocalCluster::new(runtime.clone());
    cluster.connect().await.unwrap();
    let invoker = cluster.invoker();

    let sessions = 100u64;
    let players_per_session = 8u64;
    let start = Instant::now();

    for session_id in 1..=sessions {
        for profile_id in 1..=players_per_session {
            let context = PlayerContext {
                profile_id,
                display_name: format!("p{}", profile_id),
            };
            let outcome = invoker.add_player(session_id, context, None).await.unwrap();
            assert!(outcome.success);
        }
    }

    let calls = sessions * players_per_session;
    let duration = start.elapsed();
    println!(
        "Backend calls: {} add_player calls in {:?} ({:.2} μs/call)",
        calls,
        duration,
        duration.as_micros() as f64 / calls as f64
    );

    let players = runtime
        .session(sessions)
        .await
        .unwrap()
        .get_players(&CallChain::root())
        .await
        .unwrap();
    assert_eq!(players.len(), players_per_session as usize);
    assert!(duration.as_secs() < 10);
}
