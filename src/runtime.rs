//! Event loop and timers for one room session.
//!
//! Timers, burst requests, network frames and Ctrl+C all push
//! [`SessionEvent`]s into one queue. A single loop owns the [`Session`] and
//! handles them one at a time. Dropping the [`TaskSet`] aborts every timer.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

use crate::audio::assets::DirAssetSource;
use crate::audio::cpal_output::CpalOutput;
use crate::audio::{AssetCache, AudioCountdownScheduler};
use crate::config::{SessionConfig, SyncConfig};
use crate::net;
use crate::session::{Directive, RoomCommand, Session, SessionEvent};
use crate::speech::{self, NullSpeech};
use crate::traits::{AudioOutput, SpeechOutput, SystemWallClock};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests in one sync burst and the spacing between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPlan {
    pub count: usize,
    pub spacing: Duration,
}

impl BurstPlan {
    pub fn from_config(config: &SyncConfig) -> Self {
        BurstPlan {
            count: config.burst_count,
            spacing: Duration::from_millis(config.burst_spacing_ms),
        }
    }

    /// Delay of each request from the start of the burst.
    pub fn offsets(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.count).map(move |i| self.spacing * i as u32)
    }
}

/// Spawned timers, aborted together on teardown.
#[derive(Default)]
pub struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Emit `event` every `period`, first after one full period.
    pub fn every(&mut self, period: Duration, tx: &UnboundedSender<SessionEvent>, event: SessionEvent) {
        let tx = tx.clone();
        self.push(tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if tx.send(event.clone()).is_err() {
                    break;
                }
            }
        }));
    }

    /// Emit `event` once after `delay`.
    pub fn after(&mut self, delay: Duration, tx: &UnboundedSender<SessionEvent>, event: SessionEvent) {
        let tx = tx.clone();
        self.push(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    /// Emit one `SyncRequest` per burst slot.
    pub fn burst(&mut self, plan: BurstPlan, tx: &UnboundedSender<SessionEvent>) {
        let tx = tx.clone();
        self.push(tokio::spawn(async move {
            let start = Instant::now();
            for offset in plan.offsets() {
                tokio::time::sleep_until(start + offset).await;
                if tx.send(SessionEvent::SyncRequest).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

pub enum Mode {
    /// Follow the room: keep the clock synced, report, play cues.
    Watch,
    /// Wait for the first snapshot, run one command, disconnect.
    Once(RoomCommand),
}

fn open_audio(config: &SessionConfig) -> AudioCountdownScheduler {
    let source = DirAssetSource::new(&config.audio.asset_dir, &config.audio.asset_ext);
    let assets = AssetCache::new(Arc::new(source));

    let output: Option<Box<dyn AudioOutput>> = if config.audio.enabled {
        match CpalOutput::open() {
            Ok(out) => Some(Box::new(out)),
            Err(e) => {
                warn!("[Audio] No audio output, countdown cues disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };
    AudioCountdownScheduler::new(output, assets).with_guard(config.audio.schedule_guard_sec)
}

fn install_shutdown(tx: &UnboundedSender<SessionEvent>) {
    let tx = tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        let _ = tx.send(SessionEvent::Shutdown);
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }
}

/// Connect to `room_id` on `server` and run until shutdown, disconnect or
/// (for [`Mode::Once`]) the command has been sent.
pub async fn run(server: &str, room_id: &str, config: SessionConfig, mode: Mode) -> Result<()> {
    let url = net::room_url(server, room_id)?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let conn = net::connect(&url, event_tx.clone()).await?;

    let watch = matches!(mode, Mode::Watch);
    let (audio, speech): (AudioCountdownScheduler, Box<dyn SpeechOutput>) = if watch {
        (open_audio(&config), speech::open(config.announce.voice_enabled))
    } else {
        let source = DirAssetSource::new(&config.audio.asset_dir, &config.audio.asset_ext);
        (AudioCountdownScheduler::new(None, AssetCache::new(Arc::new(source))), Box::new(NullSpeech))
    };

    let plan = BurstPlan::from_config(&config.sync);
    let tick = Duration::from_millis(config.rally.tick_ms);
    let burst_interval = Duration::from_millis(config.sync.burst_interval_ms);

    let mut session = Session::new(room_id, conn.transport, SystemWallClock, config, audio, speech);
    let mut tasks = TaskSet::new();

    if watch {
        session.audio().assets().spawn_preload();
        tasks.every(tick, &event_tx, SessionEvent::Tick);
        tasks.every(burst_interval, &event_tx, SessionEvent::BurstDue);
        tasks.every(REPORT_INTERVAL, &event_tx, SessionEvent::Report);
    } else {
        tasks.after(SNAPSHOT_TIMEOUT, &event_tx, SessionEvent::Shutdown);
    }
    install_shutdown(&event_tx);
    let _ = event_tx.send(SessionEvent::Connected);

    let mut pending = match mode {
        Mode::Once(cmd) => Some(cmd),
        Mode::Watch => None,
    };
    let mut outcome = Ok(());

    while let Some(event) = event_rx.recv().await {
        match session.handle(event) {
            Directive::Continue => {}
            Directive::RunBurst if watch => {
                debug!("[Sync] Burst of {} requests", plan.count);
                tasks.burst(plan, &event_tx);
            }
            Directive::RunBurst => {}
            Directive::Stop => {
                if pending.is_some() {
                    outcome = Err(anyhow::anyhow!("No room state received from server"));
                }
                break;
            }
        }

        if session.has_snapshot() {
            if let Some(cmd) = pending.take() {
                outcome = session.execute(cmd);
                break;
            }
        }
    }

    tasks.cancel_all();
    session.dispose();
    conn.reader.abort();

    // Dropping the session drops the transport; the writer then flushes and closes.
    drop(session);
    if timeout(FLUSH_TIMEOUT, conn.writer).await.is_err() {
        warn!("[Net] Timed out flushing outgoing messages");
    }

    if let Err(e) = &outcome {
        bail!("{:#}", e);
    }
    info!("Exiting.");
    Ok(())
}
