use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};

use crate::announce::{plan_cues, AnnouncementDeduplicator};
use crate::audio::AudioCountdownScheduler;
use crate::clock_sync::ClockSynchronizer;
use crate::config::{level_to_gain, SessionConfig};
use crate::display;
use crate::protocol::{parse_server_message, ClientMessage, NewPlayer, RallyStart, RoomState, ServerMessage};
use crate::rally::{self, RallyView};
use crate::speech::call_text;
use crate::status::SyncStatus;
use crate::traits::{SpeechOutput, Transport, WallClock};

/// Longest march accepted when adding a participant.
const MAX_MARCH_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Everything the session loop reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Message(String),
    /// Periodic timer asking for a new sync burst.
    BurstDue,
    /// One request inside a burst.
    SyncRequest,
    Tick,
    Report,
    Disconnected,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    RunBurst,
    Stop,
}

/// One-shot room edits issued from the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    AddPlayer { name: String, march_secs: f64 },
    RemovePlayer { id: String },
    StartRally { starter_id: String, rally_minutes: u32, pre_delay_secs: u32 },
    EndRally,
}

/// Client side of one room connection.
///
/// Owns the clock synchronizer, the mirrored room snapshot, the announcement
/// gate and the audio/speech outputs. Driven by one event at a time, so no
/// state is ever shared between concurrent handlers.
pub struct Session<T, C>
where
    T: Transport,
    C: WallClock,
{
    room_id: String,
    transport: T,
    clock: C,
    config: SessionConfig,

    sync: ClockSynchronizer,
    dedup: AnnouncementDeduplicator,
    audio: AudioCountdownScheduler,
    speech: Box<dyn SpeechOutput>,

    state: Option<RoomState>,
    rally_identity: Option<(String, i64)>,
    last_tick_local: Option<i64>,
}

impl<T, C> Session<T, C>
where
    T: Transport,
    C: WallClock,
{
    pub fn new(
        room_id: &str,
        transport: T,
        clock: C,
        config: SessionConfig,
        audio: AudioCountdownScheduler,
        speech: Box<dyn SpeechOutput>,
    ) -> Self {
        let sync = ClockSynchronizer::with_freshness(config.sync.fresh_ms);
        Session {
            room_id: room_id.to_string(),
            transport,
            clock,
            config,
            sync,
            dedup: AnnouncementDeduplicator::new(),
            audio,
            speech,
            state: None,
            rally_identity: None,
            last_tick_local: None,
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> Directive {
        match event {
            SessionEvent::Connected => {
                info!("[Session] Connected to room {}", self.room_id);
                self.send(&ClientMessage::StateRequest);
                Directive::RunBurst
            }
            SessionEvent::Message(text) => {
                self.on_message(&text);
                Directive::Continue
            }
            SessionEvent::BurstDue => Directive::RunBurst,
            SessionEvent::SyncRequest => {
                self.request_time_sync();
                Directive::Continue
            }
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::Report => {
                self.report();
                Directive::Continue
            }
            SessionEvent::Disconnected => {
                warn!("[Session] Connection closed");
                Directive::Stop
            }
            SessionEvent::Shutdown => Directive::Stop,
        }
    }

    fn send(&mut self, msg: &ClientMessage) -> bool {
        let text = match msg.encode(&self.room_id) {
            Ok(t) => t,
            Err(e) => {
                warn!("[Session] Failed to encode {:?}: {}", msg, e);
                return false;
            }
        };
        match self.transport.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Session] Send failed: {}", e);
                false
            }
        }
    }

    pub fn request_time_sync(&mut self) {
        let t0 = self.clock.now_ms();
        self.send(&ClientMessage::TimeSyncRequest { t0 });
    }

    fn on_message(&mut self, text: &str) {
        match parse_server_message(text) {
            Some(ServerMessage::State(state)) => self.apply_state(state),
            Some(ServerMessage::TimeSyncResponse(reply)) => {
                let t3 = self.clock.now_ms();
                let (t0, t1, t2) = reply.timestamps();
                self.sync.record_exchange(t0, t1, t2, t3);
            }
            None => {}
        }
    }

    /// Replace the mirrored snapshot. A different (or no) rally clears the
    /// announcement history.
    fn apply_state(&mut self, state: RoomState) {
        let identity = state
            .rally
            .as_ref()
            .map(|r| (r.starter_id.clone(), r.launch_at));
        if identity != self.rally_identity {
            if !self.dedup.is_empty() {
                debug!("[Session] Rally changed, clearing {} announcements", self.dedup.len());
            }
            self.dedup.reset();
            match &identity {
                Some((starter, launch_at)) => info!(
                    "[Session] Rally by {} launching at {}",
                    starter,
                    display::format_time_of_day(*launch_at)
                ),
                None if self.rally_identity.is_some() => info!("[Session] Rally ended"),
                None => {}
            }
            self.rally_identity = identity;
        }
        debug!("[Session] State: {} players", state.players.len());
        self.state = Some(state);
    }

    fn on_tick(&mut self) -> Directive {
        let local = self.clock.now_ms();
        let resumed = matches!(self.last_tick_local, Some(prev) if local - prev > self.config.sync.foreground_gap_ms);
        self.last_tick_local = Some(local);

        let now = self.sync.corrected_now(local);
        if let Some(view) = self.view_at(now) {
            self.announce(&view, now);
        }

        if resumed {
            info!("[Session] Clock jumped since last tick, resyncing");
            Directive::RunBurst
        } else {
            Directive::Continue
        }
    }

    fn announce(&mut self, view: &RallyView, now: i64) {
        let voice_volume = level_to_gain(self.config.announce.voice_level);
        let beep_gain = level_to_gain(self.config.audio.beep_level);

        for cue in plan_cues(view, now, &self.config.announce) {
            if !self.dedup.claim(&cue.key) {
                continue;
            }
            info!(
                "[Session] Calling {} ({:?} in {} ms)",
                cue.name,
                cue.key.phase,
                cue.key.target_at - now
            );
            self.speech.speak(&call_text(&cue.name), voice_volume);
            self.audio.schedule_countdown(cue.key.target_at, now, beep_gain);
        }
    }

    pub fn corrected_now(&self) -> i64 {
        self.sync.corrected_now(self.clock.now_ms())
    }

    fn view_at(&self, now: i64) -> Option<RallyView> {
        let state = self.state.as_ref()?;
        rally::derive(
            &state.players,
            state.rally.as_ref(),
            now,
            self.config.default_rally_duration_ms(),
        )
    }

    pub fn view(&self) -> Option<RallyView> {
        self.view_at(self.corrected_now())
    }

    pub fn status(&self) -> SyncStatus {
        self.sync.status(self.clock.now_ms())
    }

    pub fn state(&self) -> Option<&RoomState> {
        self.state.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.state.is_some()
    }

    pub fn synchronizer(&self) -> &ClockSynchronizer {
        &self.sync
    }

    pub fn audio(&self) -> &AudioCountdownScheduler {
        &self.audio
    }

    fn report(&self) {
        let now = self.corrected_now();
        info!("[Status] {}", self.status().summary());
        match self.view_at(now) {
            Some(view) => {
                for line in display::render_view(&view, now) {
                    info!("{}", line);
                }
            }
            None => info!("No rally started yet."),
        }
    }

    pub fn add_player(&mut self, name: &str, march_secs: f64) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Player name must not be empty");
        }
        if !march_secs.is_finite() || march_secs <= 0.0 || march_secs > MAX_MARCH_SECS {
            bail!("March time must be between 1 second and 24 hours");
        }

        let id = uuid::Uuid::new_v4().to_string();
        let msg = ClientMessage::PlayerAdd(NewPlayer {
            id: id.clone(),
            name: name.to_string(),
            march_ms: (march_secs * 1000.0).round() as u64,
        });
        if !self.send(&msg) {
            bail!("Failed to send player");
        }
        Ok(id)
    }

    pub fn remove_player(&mut self, id: &str) -> Result<()> {
        if !self.send(&ClientMessage::PlayerRemove(id.to_string())) {
            bail!("Failed to remove player {}", id);
        }
        Ok(())
    }

    pub fn start_rally(&mut self, starter_id: &str, rally_minutes: u32, pre_delay_secs: u32) -> Result<()> {
        let known = self
            .state
            .as_ref()
            .map(|s| s.players.iter().any(|p| p.id == starter_id))
            .unwrap_or(false);
        if !known {
            bail!("Starter {} is not in the room", starter_id);
        }
        if rally_minutes == 0 {
            bail!("Rally time must be at least one minute");
        }

        self.audio.unlock();
        if self.config.announce.voice_enabled {
            self.speech.unlock();
        }

        let msg = ClientMessage::RallyStart(RallyStart {
            starter_id: starter_id.to_string(),
            rally_duration_ms: rally_minutes as i64 * 60_000,
            pre_delay_ms: pre_delay_secs as i64 * 1000,
        });
        if !self.send(&msg) {
            bail!("Failed to start rally");
        }
        Ok(())
    }

    pub fn end_rally(&mut self) -> Result<()> {
        self.dedup.reset();
        if !self.send(&ClientMessage::RallyEnd) {
            return Err(anyhow!("Failed to end rally"));
        }
        Ok(())
    }

    pub fn execute(&mut self, command: RoomCommand) -> Result<()> {
        match command {
            RoomCommand::AddPlayer { name, march_secs } => {
                let id = self.add_player(&name, march_secs)?;
                info!("[Session] Added {} ({})", name.trim(), id);
            }
            RoomCommand::RemovePlayer { id } => self.remove_player(&id)?,
            RoomCommand::StartRally { starter_id, rally_minutes, pre_delay_secs } => {
                self.start_rally(&starter_id, rally_minutes, pre_delay_secs)?
            }
            RoomCommand::EndRally => self.end_rally()?,
        }
        Ok(())
    }

    /// Release the audio device. The session stays usable but silent.
    pub fn dispose(&mut self) {
        self.audio.dispose();
        info!("[Session] Disposed session for room {}", self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AssetCache;
    use crate::traits::{MockAssetSource, MockAudioOutput, MockSpeechOutput, MockTransport, MockWallClock};
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    const T: i64 = 1_700_000_000_000;

    /// Transport that records every message it is asked to send.
    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Value>>>);

    impl Transport for Recorder {
        fn send(&mut self, text: String) -> Result<()> {
            self.0.borrow_mut().push(serde_json::from_str(&text)?);
            Ok(())
        }
    }

    impl Recorder {
        fn types(&self) -> Vec<String> {
            self.0
                .borrow()
                .iter()
                .map(|v| v["type"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    /// Wall clock the test can move.
    #[derive(Clone)]
    struct FakeClock(Rc<RefCell<i64>>);

    impl FakeClock {
        fn at(ms: i64) -> Self {
            FakeClock(Rc::new(RefCell::new(ms)))
        }
        fn set(&self, ms: i64) {
            *self.0.borrow_mut() = ms;
        }
    }

    impl WallClock for FakeClock {
        fn now_ms(&self) -> i64 {
            *self.0.borrow()
        }
    }

    fn failing_assets() -> AssetCache {
        let mut source = MockAssetSource::new();
        source.expect_load().returning(|_| Err(anyhow!("missing")));
        AssetCache::new(Arc::new(source))
    }

    fn silent_audio() -> AudioCountdownScheduler {
        AudioCountdownScheduler::new(None, failing_assets())
    }

    fn state_json(launch_at: i64) -> String {
        format!(
            r#"{{"type":"STATE","roomId":"R1","payload":{{
                "players":[{{"id":"A","name":"Alpha","marchMs":60000}},{{"id":"B","name":"Bravo","marchMs":30000}}],
                "rally":{{"starterId":"A","launchAt":{},"rallyDurationMs":300000,"preDelayMs":10000}}}}}}"#,
            launch_at
        )
    }

    fn session_with(
        recorder: &Recorder,
        clock: &FakeClock,
        audio: AudioCountdownScheduler,
        speech: Box<dyn SpeechOutput>,
    ) -> Session<Recorder, FakeClock> {
        Session::new("R1", recorder.clone(), clock.clone(), SessionConfig::default(), audio, speech)
    }

    #[test]
    fn test_connect_requests_state_and_burst() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T);
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(MockSpeechOutput::new()));

        assert_eq!(session.handle(SessionEvent::Connected), Directive::RunBurst);
        assert_eq!(session.handle(SessionEvent::BurstDue), Directive::RunBurst);
        assert_eq!(recorder.types(), vec!["STATE_REQUEST"]);
        assert_eq!(recorder.0.borrow()[0]["roomId"], "R1");
    }

    #[test]
    fn test_time_sync_round_trip_updates_offset() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(1000);
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(MockSpeechOutput::new()));

        session.handle(SessionEvent::SyncRequest);
        assert_eq!(recorder.0.borrow()[0]["payload"]["t0"], 1000);

        clock.set(1120);
        session.handle(SessionEvent::Message(
            r#"{"type":"TIME_SYNC_RESPONSE","payload":{"t0":1000,"t1":1050,"t2":1060}}"#.to_string(),
        ));
        let status = session.status();
        assert_eq!(status.offset_ms, -5.0);
        assert_eq!(status.rtt_ms, Some(110.0));
        assert!(status.live);
        assert_eq!(session.corrected_now(), 1115);

        // Non-finite t1: ignored entirely.
        session.handle(SessionEvent::Message(
            r#"{"type":"TIME_SYNC_RESPONSE","payload":{"t0":1000,"t1":null,"t2":1060}}"#.to_string(),
        ));
        assert_eq!(session.synchronizer().sample_count(), 1);
        assert_eq!(session.status().offset_ms, -5.0);

        // Garbage: no effect, no panic.
        session.handle(SessionEvent::Message("{{{".to_string()));
        assert_eq!(session.synchronizer().sample_count(), 1);
    }

    #[test]
    fn test_tick_announces_once_per_target() {
        let _ = env_logger::builder().is_test(true).try_init();
        let recorder = Recorder::default();
        // A gathers at T - 300000; start 3s before that.
        let clock = FakeClock::at(T - 303_000);

        let mut speech = MockSpeechOutput::new();
        speech
            .expect_speak()
            .withf(|text: &str, volume: &f32| text == "Alpha, get ready" && *volume == 0.8)
            .times(1)
            .return_const(());

        let mut output = MockAudioOutput::new();
        output.expect_current_time().return_const(0.0);
        // Target 3s ahead: "3" would sit at the clock origin, inside the guard.
        output.expect_play_tone().times(3).return_const(());

        let audio = AudioCountdownScheduler::new(Some(Box::new(output)), failing_assets());
        let mut session = session_with(&recorder, &clock, audio, Box::new(speech));
        session.handle(SessionEvent::Message(state_json(T)));

        assert_eq!(session.handle(SessionEvent::Tick), Directive::Continue);
        clock.set(T - 302_800);
        session.handle(SessionEvent::Tick);
        clock.set(T - 302_600);
        session.handle(SessionEvent::Tick);
    }

    #[test]
    fn test_new_rally_clears_announcements() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T - 303_000);

        let mut speech = MockSpeechOutput::new();
        speech.expect_speak().times(2).return_const(());

        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(speech));
        session.handle(SessionEvent::Message(state_json(T)));
        session.handle(SessionEvent::Tick);

        // Same rally re-sent: still deduplicated.
        session.handle(SessionEvent::Message(state_json(T)));
        session.handle(SessionEvent::Tick);

        // Rally restarted with the same instants: allowed to call again.
        session.handle(SessionEvent::Message(
            r#"{"type":"STATE","payload":{"players":[],"rally":null}}"#.to_string(),
        ));
        session.handle(SessionEvent::Message(state_json(T)));
        session.handle(SessionEvent::Tick);
    }

    #[test]
    fn test_removed_starter_collapses_view() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T);
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(MockSpeechOutput::new()));

        session.handle(SessionEvent::Message(state_json(T + 1_000)));
        assert_eq!(session.view().unwrap().arrival_at, T + 61_000);

        session.handle(SessionEvent::Message(format!(
            r#"{{"type":"STATE","payload":{{"players":[{{"id":"B","name":"Bravo","marchMs":30000}}],
                "rally":{{"starterId":"A","launchAt":{}}}}}}}"#,
            T + 1_000
        )));
        assert!(session.view().is_none());
        assert_eq!(session.handle(SessionEvent::Tick), Directive::Continue);
    }

    #[test]
    fn test_tick_gap_triggers_resync() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T);
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(MockSpeechOutput::new()));

        assert_eq!(session.handle(SessionEvent::Tick), Directive::Continue);
        clock.set(T + 200);
        assert_eq!(session.handle(SessionEvent::Tick), Directive::Continue);
        clock.set(T + 60_000);
        assert_eq!(session.handle(SessionEvent::Tick), Directive::RunBurst);
    }

    #[test]
    fn test_commands_validate_and_send() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T);
        // Only the accepted start unlocks speech.
        let mut speech = MockSpeechOutput::new();
        speech.expect_unlock().times(1).return_const(());
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(speech));

        assert!(session.add_player("   ", 30.0).is_err());
        assert!(session.add_player("Speed", 0.0).is_err());
        assert!(session.add_player("Speed", 90_000.0).is_err());
        assert!(session.start_rally("A", 5, 10).is_err());

        let id = session.add_player(" Speed ", 32.4).unwrap();
        session.handle(SessionEvent::Message(state_json(T)));
        assert!(session.start_rally("A", 0, 10).is_err());
        session.start_rally("A", 10, 15).unwrap();
        session.remove_player(&id).unwrap();
        session.execute(RoomCommand::EndRally).unwrap();

        let sent = recorder.0.borrow();
        assert_eq!(sent[0]["type"], "PLAYER_ADD");
        assert_eq!(sent[0]["payload"]["name"], "Speed");
        assert_eq!(sent[0]["payload"]["marchMs"], 32_400);
        assert_eq!(sent[1]["type"], "RALLY_START");
        assert_eq!(sent[1]["payload"]["rallyDurationMs"], 600_000);
        assert_eq!(sent[1]["payload"]["preDelayMs"], 15_000);
        assert_eq!(sent[2]["payload"], Value::String(id));
        assert_eq!(sent[3]["type"], "RALLY_END");
    }

    #[test]
    fn test_start_rally_skips_speech_unlock_when_voice_disabled() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T);
        let mut config = SessionConfig::default();
        config.announce.voice_enabled = false;

        let mut speech = MockSpeechOutput::new();
        speech.expect_unlock().never();
        let mut session = Session::new("R1", recorder.clone(), clock.clone(), config, silent_audio(), Box::new(speech));
        session.handle(SessionEvent::Message(state_json(T)));
        session.start_rally("A", 5, 10).unwrap();
        assert_eq!(recorder.types(), vec!["RALLY_START"]);
    }

    #[test]
    fn test_oversized_march_in_snapshot_is_survivable() {
        let recorder = Recorder::default();
        let clock = FakeClock::at(T - 1_000);
        let mut session = session_with(&recorder, &clock, silent_audio(), Box::new(MockSpeechOutput::new()));

        session.handle(SessionEvent::Message(format!(
            r#"{{"type":"STATE","payload":{{"players":[{{"id":"A","name":"Alpha","marchMs":9223372036854775807}}],
                "rally":{{"starterId":"A","launchAt":{}}}}}}}"#,
            T
        )));
        assert!(session.has_snapshot());
        assert!(session.view().is_none());
        assert_eq!(session.handle(SessionEvent::Tick), Directive::Continue);
        assert_eq!(session.handle(SessionEvent::Report), Directive::Continue);
    }

    #[test]
    fn test_transport_failure_is_logged_not_raised() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Err(anyhow!("socket gone")));
        let mut clock = MockWallClock::new();
        clock.expect_now_ms().return_const(T);

        let mut session = Session::new(
            "R1",
            transport,
            clock,
            SessionConfig::default(),
            silent_audio(),
            Box::new(MockSpeechOutput::new()),
        );
        assert_eq!(session.handle(SessionEvent::SyncRequest), Directive::Continue);
        assert!(session.end_rally().is_err());
        assert_eq!(session.handle(SessionEvent::Disconnected), Directive::Stop);
        session.dispose();
    }
}
