//! Race Engine
//!
//! The single source of truth for one room's race, run on the host.
//!
//! ```text
//! ┌──────────┐ start_game ┌───────────┐  3,2,1,0  ┌─────────┐ tap hits 1.0 ┌──────────┐
//! │ WAITING  │───────────>│ COUNTDOWN │──────────>│ RACING  │─────────────>│ FINISHED │
//! └──────────┘            └───────────┘           └─────────┘  or timeout  └──────────┘
//!      ^                                          pause │ ^ resume
//!      │ stop_game (any phase)                          v │
//!      └───────────────────────────────────────── ┌─────────┐
//!                                                 │ PAUSED  │
//!                                                 └─────────┘
//! ```
//!
//! All mutation happens under one mutex per engine, so "advance progress,
//! then check for the finish line" is atomic across concurrent callers.
//! Events are broadcast while that lock is held, so subscribers see them in
//! the order the state changed.
//!
//! Countdown and race clock run as one tokio task per race attempt. Every
//! cancellation bumps the attempt counter; a timer that wakes up for an old
//! attempt does nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::env;
use crate::core::progress::{Progress, PROGRESS_SCALE};
use crate::core::time::{now_millis, Timestamp};
use crate::game::events::RaceEvent;
use crate::game::state::{PlayerId, RacePhase};
use crate::{COUNTDOWN_FROM, DEFAULT_TAP_INCREMENT, RACE_DURATION_MS};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Race timing and scoring.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Progress added per tap, as a fraction of the track.
    pub tap_increment: f32,
    /// First countdown value.
    pub countdown_from: u32,
    /// Time between countdown values.
    pub countdown_step: Duration,
    /// How long 0 ("GO") is shown before racing starts.
    pub go_hold: Duration,
    /// Race length before timeout.
    pub race_duration: Duration,
    /// Event channel capacity per engine.
    pub event_capacity: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            tap_increment: DEFAULT_TAP_INCREMENT,
            countdown_from: COUNTDOWN_FROM,
            countdown_step: Duration::from_millis(1000),
            go_hold: Duration::from_millis(500),
            race_duration: Duration::from_millis(RACE_DURATION_MS),
            event_capacity: 1024,
        }
    }
}

impl RaceConfig {
    /// Load from environment variables, defaulting anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tap_increment: env::parse_or("TAP_RACE_TAP_INCREMENT", defaults.tap_increment),
            countdown_from: env::parse_or("TAP_RACE_COUNTDOWN_FROM", defaults.countdown_from),
            countdown_step: env::millis_or("TAP_RACE_COUNTDOWN_STEP_MS", defaults.countdown_step),
            go_hold: env::millis_or("TAP_RACE_GO_HOLD_MS", defaults.go_hold),
            race_duration: env::millis_or("TAP_RACE_DURATION_MS", defaults.race_duration),
            event_capacity: defaults.event_capacity,
        }
    }

    /// Progress per tap in fixed-point units. Never zero.
    pub fn tap_step(&self) -> Progress {
        let step = Progress::from_fraction(self.tap_increment);
        if step.units() == 0 {
            Progress::from_units(1)
        } else {
            step
        }
    }

    /// Total time from `start_game` until RACING.
    pub fn countdown_total(&self) -> Duration {
        self.countdown_step * self.countdown_from + self.go_hold
    }

    /// Taps needed to cross the line from zero.
    pub fn taps_to_finish(&self) -> u32 {
        let step = self.tap_step().units();
        (PROGRESS_SCALE + step - 1) / step
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of [`RaceEngine::start_game`]. The no-op cases are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Countdown is running.
    Started,
    /// Empty player list; nothing happened.
    NoPlayers,
    /// Not in WAITING; nothing happened.
    WrongPhase(RacePhase),
}

/// Result of [`RaceEngine::process_tap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapOutcome {
    /// Not racing, or unknown player.
    Ignored,
    /// Progress moved.
    Advanced {
        /// New progress
        progress: Progress,
    },
    /// This tap crossed the finish line. Returned for exactly one tap per race.
    Won,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceStats {
    /// Current phase.
    pub phase: RacePhase,
    /// Countdown display value.
    pub countdown: u32,
    /// Winner, if the race was won.
    pub winner_id: Option<PlayerId>,
    /// Race ended on the clock.
    pub timed_out: bool,
    /// When RACING began.
    pub started_at: Option<Timestamp>,
    /// Taps accepted this race, across all racers.
    pub total_taps: u64,
    /// Per-racer progress.
    pub racers: Vec<RacerStats>,
}

/// One racer in [`RaceStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RacerStats {
    /// Racer.
    pub player_id: PlayerId,
    /// Progress in [0, 1].
    pub progress: f32,
    /// Taps applied.
    pub tap_count: u32,
}

// =============================================================================
// ENGINE STATE
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Racer {
    progress: Progress,
    tap_count: u32,
}

struct EngineState {
    phase: RacePhase,
    countdown: u32,
    winner: Option<PlayerId>,
    timed_out: bool,
    racers: BTreeMap<PlayerId, Racer>,
    total_taps: u64,
    started_at: Option<Timestamp>,
    racing_since: Option<Instant>,
    /// Bumped on every timer cancellation.
    attempt: u64,
    timer: Option<JoinHandle<()>>,
}

impl EngineState {
    fn cancel_timer(&mut self) {
        self.attempt = self.attempt.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_current(&self, attempt: u64, phase: RacePhase) -> bool {
        self.attempt == attempt && self.phase == phase
    }
}

struct Shared {
    config: RaceConfig,
    tap_step: Progress,
    state: Mutex<EngineState>,
    events: broadcast::Sender<RaceEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RaceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut EngineState, to: RacePhase) {
        let from = state.phase;
        if from == to {
            return;
        }
        debug_assert!(from.can_transition_to(to), "illegal phase change {from} -> {to}");
        state.phase = to;
        debug!(%from, %to, "race phase changed");
        self.emit(RaceEvent::phase_changed(from, to, now_millis()));
    }

    fn countdown_tick(&self, attempt: u64, value: u32) -> bool {
        let mut state = self.lock();
        if !state.is_current(attempt, RacePhase::Countdown) {
            return false;
        }
        state.countdown = value;
        self.emit(RaceEvent::CountdownTick { value });
        true
    }

    fn begin_racing(&self, attempt: u64) -> bool {
        let mut state = self.lock();
        if !state.is_current(attempt, RacePhase::Countdown) {
            return false;
        }
        state.started_at = Some(now_millis());
        state.racing_since = Some(Instant::now());
        self.set_phase(&mut state, RacePhase::Racing);
        info!(racers = state.racers.len(), "race started");
        true
    }

    fn expire(&self, attempt: u64) {
        let mut state = self.lock();
        if !state.is_current(attempt, RacePhase::Racing) {
            return;
        }
        // Detach rather than abort: this is the timer task itself.
        state.timer = None;
        state.timed_out = true;
        let elapsed_ms = state
            .racing_since
            .map_or(0, |since| u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX));
        self.set_phase(&mut state, RacePhase::Finished);
        self.emit(RaceEvent::TimedOut { elapsed_ms });
        info!(elapsed_ms, "race timed out without a winner");
    }
}

async fn run_countdown(shared: Arc<Shared>, attempt: u64) {
    let mut value = shared.config.countdown_from;
    loop {
        let hold = if value > 0 {
            shared.config.countdown_step
        } else {
            shared.config.go_hold
        };
        tokio::time::sleep(hold).await;
        if value == 0 {
            break;
        }
        value -= 1;
        if !shared.countdown_tick(attempt, value) {
            return;
        }
    }
    if shared.begin_racing(attempt) {
        run_race_clock(shared, attempt).await;
    }
}

async fn run_race_clock(shared: Arc<Shared>, attempt: u64) {
    tokio::time::sleep(shared.config.race_duration).await;
    shared.expire(attempt);
}

// =============================================================================
// RACE ENGINE
// =============================================================================

/// Authoritative race state machine for one room.
///
/// Timer-driven methods (`start_game`, `resume_game`) spawn onto the current
/// tokio runtime and must be called from within one.
pub struct RaceEngine {
    shared: Arc<Shared>,
}

impl RaceEngine {
    /// Create an engine in WAITING with no players.
    pub fn new(config: RaceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = EngineState {
            phase: RacePhase::Waiting,
            countdown: config.countdown_from,
            winner: None,
            timed_out: false,
            racers: BTreeMap::new(),
            total_taps: 0,
            started_at: None,
            racing_since: None,
            attempt: 0,
            timer: None,
        };
        Self {
            shared: Arc::new(Shared {
                tap_step: config.tap_step(),
                config,
                state: Mutex::new(state),
                events,
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &RaceConfig {
        &self.shared.config
    }

    /// Subscribe to engine events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.shared.events.subscribe()
    }

    /// Current phase.
    pub fn phase(&self) -> RacePhase {
        self.shared.lock().phase
    }

    /// Current countdown display value.
    pub fn countdown(&self) -> u32 {
        self.shared.lock().countdown
    }

    /// Winner of the current race, if it was won.
    pub fn winner(&self) -> Option<PlayerId> {
        self.shared.lock().winner.clone()
    }

    /// Progress of one racer.
    pub fn progress_of(&self, player_id: &PlayerId) -> Option<Progress> {
        self.shared.lock().racers.get(player_id).map(|r| r.progress)
    }

    /// Known racers.
    pub fn players(&self) -> Vec<PlayerId> {
        self.shared.lock().racers.keys().cloned().collect()
    }

    /// Register a racer with zero progress. Returns false if already known.
    pub fn add_player(&self, player_id: PlayerId) -> bool {
        let mut state = self.shared.lock();
        if state.racers.contains_key(&player_id) {
            return false;
        }
        debug!(player = %player_id, "racer added");
        state.racers.insert(player_id, Racer::default());
        true
    }

    /// Forget a racer. Later taps from them are ignored.
    pub fn remove_player(&self, player_id: &PlayerId) -> bool {
        let removed = self.shared.lock().racers.remove(player_id).is_some();
        if removed {
            debug!(player = %player_id, "racer removed");
        }
        removed
    }

    /// Start a race with `players`, beginning the countdown.
    ///
    /// The racer set becomes exactly `players`, all at zero progress.
    pub fn start_game(&self, players: &[PlayerId]) -> StartOutcome {
        let mut state = self.shared.lock();
        if players.is_empty() {
            debug!("start ignored: no players");
            return StartOutcome::NoPlayers;
        }
        if state.phase != RacePhase::Waiting {
            debug!(phase = %state.phase, "start ignored: not waiting");
            return StartOutcome::WrongPhase(state.phase);
        }

        state.cancel_timer();
        state.winner = None;
        state.timed_out = false;
        state.total_taps = 0;
        state.started_at = None;
        state.racing_since = None;
        state.countdown = self.shared.config.countdown_from;
        state.racers = players.iter().map(|id| (id.clone(), Racer::default())).collect();

        self.shared.set_phase(&mut state, RacePhase::Countdown);
        for id in state.racers.keys() {
            self.shared.emit(RaceEvent::progress(id.clone(), 0.0, 0));
        }
        self.shared.emit(RaceEvent::CountdownTick {
            value: state.countdown,
        });

        let attempt = state.attempt;
        let shared = Arc::clone(&self.shared);
        state.timer = Some(tokio::spawn(run_countdown(shared, attempt)));

        info!(racers = players.len(), "countdown started");
        StartOutcome::Started
    }

    /// Apply one tap from `player_id`.
    ///
    /// Ignored unless RACING and the player is a known racer. The tap that
    /// brings a racer to the finish line ends the race inside the same
    /// critical section, so no later tap can be applied and no second
    /// winner can be declared.
    pub fn process_tap(&self, player_id: &PlayerId) -> TapOutcome {
        let mut state = self.shared.lock();
        if state.phase != RacePhase::Racing {
            return TapOutcome::Ignored;
        }
        let step = self.shared.tap_step;
        let Some(racer) = state.racers.get_mut(player_id) else {
            return TapOutcome::Ignored;
        };
        racer.tap_count = racer.tap_count.saturating_add(1);
        racer.progress = racer.progress.advance(step);
        let Racer { progress, tap_count } = *racer;
        state.total_taps += 1;

        #[cfg(feature = "debug-tracing")]
        tracing::trace!(player = %player_id, %progress, tap_count, "tap applied");

        self.shared
            .emit(RaceEvent::progress(player_id.clone(), progress.as_fraction(), tap_count));

        if !progress.is_complete() {
            return TapOutcome::Advanced { progress };
        }

        state.cancel_timer();
        state.winner = Some(player_id.clone());
        self.shared.set_phase(&mut state, RacePhase::Finished);
        self.shared.emit(RaceEvent::Finished {
            winner_id: player_id.clone(),
            at: now_millis(),
        });
        info!(winner = %player_id, taps = tap_count, "race won");
        TapOutcome::Won
    }

    /// Force WAITING from any phase, cancelling timers.
    ///
    /// Clears winner and countdown. Racer progress is left for the caller
    /// (see [`RaceEngine::reset_progress`]). Returns the phase it left.
    pub fn stop_game(&self) -> RacePhase {
        let mut state = self.shared.lock();
        let previous = state.phase;
        state.cancel_timer();
        state.winner = None;
        state.timed_out = false;
        state.started_at = None;
        state.racing_since = None;
        state.countdown = self.shared.config.countdown_from;
        self.shared.set_phase(&mut state, RacePhase::Waiting);
        if previous != RacePhase::Waiting {
            info!(from = %previous, "race stopped");
        }
        previous
    }

    /// RACING -> PAUSED, cancelling the race clock.
    pub fn pause_game(&self) -> bool {
        let mut state = self.shared.lock();
        if state.phase != RacePhase::Racing {
            return false;
        }
        state.cancel_timer();
        self.shared.set_phase(&mut state, RacePhase::Paused);
        true
    }

    /// PAUSED -> RACING.
    ///
    /// The race clock restarts with the full `race_duration`; time already
    /// raced before the pause is not deducted.
    pub fn resume_game(&self) -> bool {
        let mut state = self.shared.lock();
        if state.phase != RacePhase::Paused {
            return false;
        }
        state.cancel_timer();
        self.shared.set_phase(&mut state, RacePhase::Racing);
        let attempt = state.attempt;
        let shared = Arc::clone(&self.shared);
        state.timer = Some(tokio::spawn(run_race_clock(shared, attempt)));
        true
    }

    /// Zero every racer's progress. Refused while a race is underway.
    pub fn reset_progress(&self) -> bool {
        let mut state = self.shared.lock();
        if state.phase.is_active() {
            return false;
        }
        state.total_taps = 0;
        for (id, racer) in state.racers.iter_mut() {
            *racer = Racer::default();
            self.shared.emit(RaceEvent::progress(id.clone(), 0.0, 0));
        }
        true
    }

    /// Snapshot of phase, winner and per-racer progress.
    pub fn stats(&self) -> RaceStats {
        let state = self.shared.lock();
        RaceStats {
            phase: state.phase,
            countdown: state.countdown,
            winner_id: state.winner.clone(),
            timed_out: state.timed_out,
            started_at: state.started_at,
            total_taps: state.total_taps,
            racers: state
                .racers
                .iter()
                .map(|(id, racer)| RacerStats {
                    player_id: id.clone(),
                    progress: racer.progress.as_fraction(),
                    tap_count: racer.tap_count,
                })
                .collect(),
        }
    }
}

impl Drop for RaceEngine {
    fn drop(&mut self) {
        self.shared.lock().cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::Rng;
    use std::sync::Barrier;
    use tokio::sync::broadcast::error::TryRecvError;

    fn ids(names: &[&str]) -> Vec<PlayerId> {
        names.iter().map(|n| PlayerId::new(*n)).collect()
    }

    fn quick_config() -> RaceConfig {
        RaceConfig {
            countdown_step: Duration::ZERO,
            go_hold: Duration::ZERO,
            race_duration: Duration::from_secs(600),
            ..RaceConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RaceEvent>) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }

    async fn racing_engine(config: RaceConfig, players: &[PlayerId]) -> RaceEngine {
        let engine = RaceEngine::new(config);
        assert_eq!(engine.start_game(players), StartOutcome::Started);
        tokio::time::sleep(engine.config().countdown_total()).await;
        for _ in 0..1_000 {
            if engine.phase() == RacePhase::Racing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(engine.phase(), RacePhase::Racing);
        engine
    }

    #[test]
    fn test_tap_step_never_zero() {
        let config = RaceConfig {
            tap_increment: 0.0,
            ..RaceConfig::default()
        };
        assert_eq!(config.tap_step().units(), 1);
        assert_eq!(RaceConfig::default().tap_step().units(), 200);
        assert_eq!(RaceConfig::default().countdown_total(), Duration::from_millis(3500));
        assert_eq!(RaceConfig::default().taps_to_finish(), 50);
        let odd = RaceConfig {
            tap_increment: 0.03,
            ..RaceConfig::default()
        };
        assert_eq!(odd.taps_to_finish(), 34);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_sequence() {
        let engine = RaceEngine::new(RaceConfig::default());
        let mut rx = engine.subscribe();
        let players = ids(&["p1", "p2"]);

        assert_eq!(engine.start_game(&players), StartOutcome::Started);
        assert_eq!(engine.phase(), RacePhase::Countdown);

        tokio::time::sleep(Duration::from_millis(3_499)).await;
        assert_eq!(engine.phase(), RacePhase::Countdown);
        assert_eq!(engine.countdown(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(engine.phase(), RacePhase::Racing);

        let events = drain(&mut rx);
        let ticks: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::CountdownTick { value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![3, 2, 1, 0]);
        assert!(matches!(
            events.last(),
            Some(RaceEvent::PhaseChanged { from: RacePhase::Countdown, to: RacePhase::Racing, .. })
        ));
        assert!(engine.stats().started_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_no_players_is_noop() {
        let engine = RaceEngine::new(RaceConfig::default());
        let mut rx = engine.subscribe();
        assert_eq!(engine.start_game(&[]), StartOutcome::NoPlayers);
        assert_eq!(engine.phase(), RacePhase::Waiting);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let engine = RaceEngine::new(RaceConfig::default());
        let players = ids(&["p1"]);
        engine.start_game(&players);
        assert_eq!(
            engine.start_game(&players),
            StartOutcome::WrongPhase(RacePhase::Countdown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifty_taps_win() {
        let players = ids(&["p1", "p2"]);
        let engine = racing_engine(quick_config(), &players).await;
        let mut rx = engine.subscribe();

        for i in 0..49 {
            let outcome = engine.process_tap(&players[0]);
            assert!(matches!(outcome, TapOutcome::Advanced { .. }), "tap {i}");
        }
        assert_eq!(engine.process_tap(&players[0]), TapOutcome::Won);

        assert_eq!(engine.phase(), RacePhase::Finished);
        assert_eq!(engine.winner(), Some(players[0].clone()));
        assert_eq!(engine.progress_of(&players[0]), Some(Progress::COMPLETE));
        assert_eq!(engine.stats().total_taps, 50);

        // Taps after the finish are ignored.
        assert_eq!(engine.process_tap(&players[1]), TapOutcome::Ignored);
        assert_eq!(engine.progress_of(&players[1]), Some(Progress::ZERO));

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(RaceEvent::Finished { winner_id, .. }) if *winner_id == players[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_tap_is_ignored() {
        let players = ids(&["p1"]);
        let engine = racing_engine(quick_config(), &players).await;
        let mut rx = engine.subscribe();
        let before = engine.stats();

        assert_eq!(engine.process_tap(&PlayerId::new("unknown-id")), TapOutcome::Ignored);
        assert_eq!(engine.stats(), before);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_outside_racing_is_ignored() {
        let engine = RaceEngine::new(RaceConfig::default());
        let players = ids(&["p1"]);
        engine.add_player(players[0].clone());
        assert_eq!(engine.process_tap(&players[0]), TapOutcome::Ignored);

        engine.start_game(&players);
        assert_eq!(engine.process_tap(&players[0]), TapOutcome::Ignored);
        assert_eq!(engine.progress_of(&players[0]), Some(Progress::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_winner() {
        let config = RaceConfig {
            race_duration: Duration::from_millis(200),
            ..quick_config()
        };
        let players = ids(&["p1", "p2"]);
        let engine = RaceEngine::new(config);
        let mut rx = engine.subscribe();
        engine.start_game(&players);

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(engine.phase(), RacePhase::Finished);
        assert_eq!(engine.winner(), None);
        assert!(engine.stats().timed_out);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, RaceEvent::TimedOut { elapsed_ms } if *elapsed_ms >= 200)));
        assert!(!events.iter().any(|e| matches!(e, RaceEvent::Finished { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_win_cancels_timeout() {
        let config = RaceConfig {
            tap_increment: 0.5,
            race_duration: Duration::from_millis(200),
            ..quick_config()
        };
        let players = ids(&["p1"]);
        let engine = racing_engine(config, &players).await;
        let mut rx = engine.subscribe();
        engine.process_tap(&players[0]);
        assert_eq!(engine.process_tap(&players[0]), TapOutcome::Won);
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!engine.stats().timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_countdown_cancels_ticks() {
        let engine = RaceEngine::new(RaceConfig::default());
        let players = ids(&["p1"]);
        let mut rx = engine.subscribe();
        engine.start_game(&players);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(engine.stop_game(), RacePhase::Countdown);
        assert_eq!(engine.countdown(), COUNTDOWN_FROM);
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.phase(), RacePhase::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_race_cancels_timeout() {
        let config = RaceConfig {
            race_duration: Duration::from_millis(200),
            ..quick_config()
        };
        let players = ids(&["p1"]);
        let engine = racing_engine(config, &players).await;
        engine.process_tap(&players[0]);
        let mut rx = engine.subscribe();

        assert_eq!(engine.stop_game(), RacePhase::Racing);
        drain(&mut rx);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());

        // Progress survives a stop until explicitly reset.
        assert_eq!(engine.progress_of(&players[0]).map(Progress::units), Some(200));
        assert!(engine.reset_progress());
        assert_eq!(engine.progress_of(&players[0]), Some(Progress::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_ignores_old_timer() {
        let engine = RaceEngine::new(RaceConfig::default());
        let players = ids(&["p1"]);
        engine.start_game(&players);
        tokio::time::sleep(Duration::from_millis(900)).await;
        engine.stop_game();
        engine.start_game(&players);

        let mut rx = engine.subscribe();
        // The first attempt would have ticked at 1000ms; the new one ticks at 1900ms.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(drain(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_millis(850)).await;
        assert_eq!(drain(&mut rx), vec![RaceEvent::CountdownTick { value: 2 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_restarts_clock() {
        let config = RaceConfig {
            race_duration: Duration::from_millis(1_000),
            ..quick_config()
        };
        let players = ids(&["p1"]);
        let engine = racing_engine(config, &players).await;

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(engine.pause_game());
        assert_eq!(engine.process_tap(&players[0]), TapOutcome::Ignored);

        // A paused race never times out.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.phase(), RacePhase::Paused);

        assert!(engine.resume_game());
        assert!(!engine.resume_game());
        // Full duration again, not the 200ms that were left.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(engine.phase(), RacePhase::Racing);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.phase(), RacePhase::Finished);
        assert!(engine.stats().timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refused_while_racing() {
        let players = ids(&["p1"]);
        let engine = racing_engine(quick_config(), &players).await;
        assert!(!engine.reset_progress());
        assert!(!engine.resume_game());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_join_and_leave() {
        let players = ids(&["p1"]);
        let engine = racing_engine(quick_config(), &players).await;
        let late = PlayerId::new("late");

        assert!(engine.add_player(late.clone()));
        assert!(!engine.add_player(late.clone()));
        assert!(matches!(engine.process_tap(&late), TapOutcome::Advanced { .. }));

        assert!(engine.remove_player(&late));
        assert_eq!(engine.process_tap(&late), TapOutcome::Ignored);
        assert_eq!(engine.players(), players);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_previous_race() {
        let players = ids(&["p1"]);
        let engine = racing_engine(quick_config(), &players).await;
        for _ in 0..50 {
            engine.process_tap(&players[0]);
        }
        assert_eq!(engine.phase(), RacePhase::Finished);
        assert_eq!(
            engine.start_game(&players),
            StartOutcome::WrongPhase(RacePhase::Finished)
        );

        engine.stop_game();
        assert_eq!(engine.winner(), None);
        assert_eq!(engine.start_game(&players), StartOutcome::Started);
        let stats = engine.stats();
        assert_eq!(stats.total_taps, 0);
        assert_eq!(stats.racers[0].progress, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_final_taps_one_winner() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let players = ids(&["p1", "p2"]);
            let engine = Arc::new(racing_engine(quick_config(), &players).await);
            for player in &players {
                for _ in 0..49 {
                    engine.process_tap(player);
                }
            }

            let barrier = Arc::new(Barrier::new(2));
            let mut order = players.clone();
            if rng.gen_bool(0.5) {
                order.reverse();
            }
            let handles: Vec<_> = order
                .into_iter()
                .map(|player| {
                    let engine = Arc::clone(&engine);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        (player.clone(), engine.process_tap(&player))
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners: Vec<_> = results.iter().filter(|(_, o)| *o == TapOutcome::Won).collect();
            assert_eq!(winners.len(), 1);
            assert_eq!(engine.winner().as_ref(), Some(&winners[0].0));
            let loser = results.iter().find(|(_, o)| *o != TapOutcome::Won).unwrap();
            assert_eq!(loser.1, TapOutcome::Ignored);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_contended_taps_stress() {
        let players = ids(&["a", "b", "c", "d"]);
        let engine = Arc::new(racing_engine(quick_config(), &players).await);

        let handles: Vec<_> = players
            .iter()
            .cloned()
            .map(|player| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let taps = rng.gen_range(40..=80);
                    let mut wins = 0;
                    let mut last = Progress::ZERO;
                    for _ in 0..taps {
                        match engine.process_tap(&player) {
                            TapOutcome::Won => wins += 1,
                            TapOutcome::Advanced { progress } => {
                                assert!(progress >= last);
                                last = progress;
                            }
                            TapOutcome::Ignored => {}
                        }
                        if rng.gen_bool(0.3) {
                            std::thread::yield_now();
                        }
                    }
                    wins
                })
            })
            .collect();
        let wins: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let stats = engine.stats();
        let complete = stats.racers.iter().filter(|r| r.progress >= 1.0).count();
        assert!(wins <= 1);
        assert_eq!(complete, wins as usize);
        assert_eq!(stats.winner_id.is_some(), wins == 1);
    }

    proptest! {
        #[test]
        fn prop_single_winner_and_monotonic(taps in proptest::collection::vec(0usize..4, 0..400)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let players = ids(&["a", "b", "c", "d"]);
                let engine = racing_engine(quick_config(), &players).await;

                let mut counts = [0u32; 4];
                let mut expected_winner = None;
                let mut last = [Progress::ZERO; 4];
                let mut wins = 0;

                for &index in &taps {
                    if expected_winner.is_none() {
                        counts[index] += 1;
                        if counts[index] == 50 {
                            expected_winner = Some(players[index].clone());
                        }
                    }
                    match engine.process_tap(&players[index]) {
                        TapOutcome::Won => wins += 1,
                        TapOutcome::Advanced { progress } => {
                            prop_assert!(progress > last[index]);
                            last[index] = progress;
                        }
                        TapOutcome::Ignored => prop_assert!(expected_winner.is_some()),
                    }
                }

                prop_assert!(wins <= 1);
                prop_assert_eq!(engine.winner(), expected_winner);
                Ok(())
            })?;
        }
    }
}
