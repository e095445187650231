//! End-to-end race scenarios: host session, synchronizer, store and client
//! sessions running together.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use tap_race::game::engine::{RaceConfig, StartOutcome};
use tap_race::game::events::RaceEvent;
use tap_race::network::client::{ClientConfig, ClientSession, ConnectionState, RelayTransport, StoreTransport};
use tap_race::network::server::{RelayServer, ServerConfig};
use tap_race::network::session::{HostSession, RoomConfig, RoomManager};
use tap_race::store::memory::InMemoryRoomStore;
use tap_race::store::RoomStore;
use tap_race::{DeterministicRng, PlayerId, RacePhase};

fn fast_race() -> RaceConfig {
    RaceConfig {
        countdown_step: Duration::from_millis(10),
        go_hold: Duration::from_millis(5),
        race_duration: Duration::from_secs(30),
        ..RaceConfig::default()
    }
}

fn manager(store: &Arc<InMemoryRoomStore>, race: RaceConfig) -> RoomManager {
    RoomManager::with_rng(store.clone(), race, RoomConfig::default(), DeterministicRng::new(42))
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..5_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn join(store: &Arc<InMemoryRoomStore>, host: &HostSession, name: &str) -> ClientSession<StoreTransport> {
    ClientSession::connect(
        StoreTransport::new(store.clone()),
        ClientConfig::default(),
        host.code().as_str(),
        name,
    )
    .await
    .unwrap()
}

async fn start_and_wait_for_racing(host: &HostSession) {
    assert_eq!(host.start_game(), StartOutcome::Started);
    wait_until("racing", || host.engine().phase() == RacePhase::Racing).await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_players_race_to_a_winner() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();

    let ana = join(&store, &host, "Ana").await;
    let bo = join(&store, &host, "Bo").await;
    wait_until("both players in engine", || host.engine().players().len() == 2).await;

    start_and_wait_for_racing(&host).await;
    for _ in 0..10 {
        bo.send_tap();
    }
    for _ in 0..50 {
        ana.send_tap();
    }
    assert_eq!(ana.tap_count(), 50);

    wait_until("finish", || host.engine().phase() == RacePhase::Finished).await;
    assert_eq!(host.engine().winner().as_ref(), Some(ana.player_id()));

    // Every client sees the same authoritative result.
    for client in [&ana, &bo] {
        wait_until("client view of winner", || {
            client
                .view()
                .map_or(false, |v| v.race.winner_id.as_ref() == Some(ana.player_id()))
        })
        .await;
    }
    let view = bo.view().unwrap();
    assert_eq!(view.race.phase, RacePhase::Finished);
    assert!(!view.race.timed_out);
    assert!(view.race.pending_taps.is_empty());
    let ana_view = view.players.iter().find(|p| &p.id == ana.player_id()).unwrap();
    assert_eq!(ana_view.progress, 1.0);
    assert_eq!(ana_view.tap_count, 50);
    assert!(bo.progress() < 1.0);

    manager.close_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_race_times_out_without_winner() {
    let store = Arc::new(InMemoryRoomStore::new());
    let race = RaceConfig {
        race_duration: Duration::from_secs(2),
        ..fast_race()
    };
    let manager = manager(&store, race);
    let host = manager.create_room().await.unwrap();
    let mut events = host.subscribe();

    let ana = join(&store, &host, "Ana").await;
    wait_until("player in engine", || host.engine().players().len() == 1).await;
    start_and_wait_for_racing(&host).await;
    ana.send_tap();

    wait_until("timeout", || host.engine().phase() == RacePhase::Finished).await;
    let stats = host.stats();
    assert_eq!(stats.winner_id, None);
    assert!(stats.timed_out);

    let mut saw_timeout = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, RaceEvent::Finished { .. }));
        saw_timeout |= matches!(event, RaceEvent::TimedOut { .. });
    }
    assert!(saw_timeout);

    wait_until("store shows timeout", || ana.view().map_or(false, |v| v.race.timed_out)).await;
    assert_eq!(ana.view().unwrap().race.winner_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_return_to_lobby_discards_old_taps() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();
    let ana = join(&store, &host, "Ana").await;
    wait_until("player in engine", || host.engine().players().len() == 1).await;

    start_and_wait_for_racing(&host).await;
    for _ in 0..20 {
        ana.send_tap();
    }
    wait_until("taps applied", || host.stats().total_taps == 20).await;
    let epoch_during_race = host_room(&store, &host).await.race_state.tap_epoch;

    host.return_to_lobby();
    let me = ana.player_id().clone();
    wait_until("lobby projected", || {
        ana.view().map_or(false, |v| {
            v.race.phase == RacePhase::Waiting && v.players.iter().all(|p| p.progress == 0.0 && p.tap_count == 0)
        })
    })
    .await;
    let room = host_room(&store, &host).await;
    assert!(room.race_state.tap_epoch > epoch_during_race);
    assert_eq!(room.pending_tap_count(&me), 0);

    // A new race starts from zero; the old taps are never replayed.
    start_and_wait_for_racing(&host).await;
    ana.send_tap();
    wait_until("new tap applied", || host.stats().total_taps == 1).await;
    assert_eq!(host.stats().racers[0].tap_count, 1);

    manager.close_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_host_and_remote_finish_together_one_winner() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();
    let mut events = host.subscribe();

    let me = host.add_local_player("Host").await.unwrap();
    let ana = join(&store, &host, "Ana").await;
    wait_until("both players in engine", || host.engine().players().len() == 2).await;
    start_and_wait_for_racing(&host).await;

    for _ in 0..49 {
        host.tap(&me);
        ana.send_tap();
    }
    wait_until("remote taps applied", || host.stats().total_taps == 98).await;
    ana.send_tap();
    host.tap(&me);

    wait_until("finish", || host.engine().phase() == RacePhase::Finished).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let winners: Vec<PlayerId> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            RaceEvent::Finished { winner_id, .. } => Some(winner_id),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(host.engine().winner(), Some(winners[0].clone()));
    assert!(host.stats().racers.iter().filter(|r| r.progress >= 1.0).count() == 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_and_room_close() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();

    let ana = join(&store, &host, "Ana").await;
    let bo = join(&store, &host, "Bo").await;
    wait_until("both players in engine", || host.engine().players().len() == 2).await;

    bo.disconnect().await;
    assert_eq!(bo.state(), ConnectionState::Disconnected);
    wait_until("leave reaches engine", || host.engine().players().len() == 1).await;
    wait_until("ana sees bo leave", || ana.view().map_or(false, |v| v.players.len() == 1)).await;

    let code = host.code().clone();
    assert!(manager.close_room(&code).await);
    assert_eq!(store.read_room(&code).await.unwrap(), None);
    wait_until("ana disconnected", || ana.state() == ConnectionState::Disconnected).await;
    assert_eq!(ana.send_tap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_room_full() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();

    let mut players = Vec::new();
    for i in 0..8 {
        players.push(join(&store, &host, &format!("P{i}")).await);
    }
    let err = ClientSession::connect(
        StoreTransport::new(store.clone()),
        ClientConfig::default(),
        host.code().as_str(),
        "Late",
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.to_string(), "room is full");
}

#[tokio::test]
async fn test_race_over_websocket_relay() {
    let store = Arc::new(InMemoryRoomStore::new());
    let manager = manager(&store, fast_race());
    let host = manager.create_room().await.unwrap();

    let server = Arc::new(RelayServer::new(ServerConfig::default(), RoomConfig::default(), store.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let transport = RelayTransport::connect(&url).await.unwrap();
    let ana = ClientSession::connect(transport, ClientConfig::default(), host.code().as_str(), "Ana")
        .await
        .unwrap();
    wait_until("player in engine", || host.engine().players().len() == 1).await;

    start_and_wait_for_racing(&host).await;
    for _ in 0..50 {
        ana.send_tap();
    }
    wait_until("finish", || host.engine().phase() == RacePhase::Finished).await;
    assert_eq!(host.engine().winner().as_ref(), Some(ana.player_id()));
    wait_until("client sees winner", || {
        ana.view()
            .map_or(false, |v| v.race.winner_id.as_ref() == Some(ana.player_id()))
    })
    .await;

    server.shutdown();
    serving.await.unwrap().unwrap();
    manager.close_all().await;
}

async fn host_room(store: &InMemoryRoomStore, host: &HostSession) -> tap_race::Room {
    store.read_room(host.code()).await.unwrap().unwrap()
}
