//! Tap Race Relay
//!
//! Hosts rooms in-process and serves them to mobile clients over WebSocket.
//! Set `TAP_RACE_DEMO=1` to play a bot race against the first room on startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tap_race::{
    core::env,
    game::{engine::RaceConfig, events::RaceEvent},
    network::{
        client::{ClientConfig, ClientSession, StoreTransport},
        server::{RelayServer, ServerConfig},
        session::{HostSession, RoomConfig, RoomManager},
    },
    store::{memory::InMemoryRoomStore, RoomStore},
    RacePhase, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let race = RaceConfig::from_env();
    let rooms = RoomConfig::from_env();
    let server_config = ServerConfig::from_env();

    info!("Tap Race Relay v{}", VERSION);
    info!(
        "Race: {} taps to finish, countdown from {}, timeout {:?}",
        race.taps_to_finish(),
        race.countdown_from,
        race.race_duration
    );

    let store: Arc<dyn RoomStore> = Arc::new(InMemoryRoomStore::new());
    let manager = Arc::new(RoomManager::new(Arc::clone(&store), race, rooms));
    let host = manager.create_room().await.context("failed to open the first room")?;
    info!("Room {} is open", host.code());

    if env::parse_or("TAP_RACE_DEMO", 0u8) == 1 {
        let store = Arc::clone(&store);
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            if let Err(e) = demo_race(store, host).await {
                warn!("Demo race failed: {:#}", e);
            }
        });
    }

    let server = RelayServer::new(server_config, manager.config().clone(), Arc::clone(&store));
    tokio::select! {
        result = server.run() => result.context("relay server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            server.shutdown();
        }
    }

    manager.close_all().await;
    info!("Bye");
    Ok(())
}

/// Demo: three bots race in the first room.
async fn demo_race(store: Arc<dyn RoomStore>, host: Arc<HostSession>) -> anyhow::Result<()> {
    info!("=== Starting Demo Race ===");

    let mut bots = Vec::new();
    for name in ["Ada", "Brook", "Cy"] {
        let transport = StoreTransport::new(Arc::clone(&store));
        let bot = ClientSession::connect(transport, ClientConfig::default(), host.code().as_str(), name).await?;
        bot.select_avatar(&name.to_lowercase()).await?;
        bots.push(bot);
    }

    let mut events = host.subscribe();
    // Joins reach the engine through the store.
    while host.engine().players().len() < bots.len() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!("Start: {:?}", host.start_game());

    loop {
        match events.recv().await {
            Ok(RaceEvent::PhaseChanged { to: RacePhase::Racing, .. }) => break,
            Ok(RaceEvent::CountdownTick { value }) => info!("Countdown: {}", value),
            Ok(_) => {}
            Err(e) => anyhow::bail!("event stream closed: {e}"),
        }
    }

    // Bots tap at slightly different rates until the race ends.
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    let mut round = 0usize;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                round += 1;
                for (i, bot) in bots.iter().enumerate() {
                    if round % (i + 2) != 0 {
                        bot.send_tap();
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.is_terminal() => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("engine dropped"),
            },
        }
    }

    let stats = host.stats();
    info!("=== Demo Race Complete ===");
    info!("Winner: {:?}, timed out: {}", stats.winner_id, stats.timed_out);
    for racer in &stats.racers {
        info!("  {}: {:.2} ({} taps)", racer.player_id, racer.progress, racer.tap_count);
    }

    host.return_to_lobby();
    for bot in &bots {
        bot.disconnect().await;
    }
    Ok(())
}
