// Recovery pass ("pass 3")
//
// A background daemon gated by the intake driver's idle signal. When the
// first pass has no outstanding work, this pass re-scans events whose
// tracking code is still empty -- at full frame density, code decoder only,
// no trigger logic -- and records whatever it finds. Each event gets exactly
// one recovery attempt, ever.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rusqlite::Connection;

use crate::constants::RECOVERY_MAX_ATTEMPTS;
use crate::db::gate::DbGate;
use crate::db::schema::{self, Event};
use crate::decode::{DecoderProvider, Roi};
use crate::error::{PackCamError, Result};
use crate::video::VideoOpener;

/// Cooperative flag with set/clear/wait semantics, shared between the intake
/// driver (producer) and the recovery pass (consumer). Waiting blocks on a
/// condition variable; there is no polling.
pub struct IdleSignal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl IdleSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(false), cond: Condvar::new() })
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        *state = false;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Block until the signal is set.
    pub fn wait_set(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Block until the signal is cleared again (the recovery pass handing
    /// control back).
    pub fn wait_clear(&self) {
        let mut state = self.state.lock().unwrap();
        while *state {
            state = self.cond.wait(state).unwrap();
        }
    }
}

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub candidates: usize,
    pub recovered: usize,
    pub exhausted: usize,
    pub errors: usize,
}

/// Run one recovery batch over the current candidates.
pub fn run_once(
    conn: &Connection,
    gate: &DbGate,
    opener: &dyn VideoOpener,
    provider: &dyn DecoderProvider,
) -> Result<RecoveryOutcome> {
    let candidates = {
        let _read = gate.read();
        schema::list_retry_candidates(conn)?
    };

    let mut outcome = RecoveryOutcome { candidates: candidates.len(), ..Default::default() };

    for event in &candidates {
        // The query already filters on retry_count, but the guard is the
        // policy: one recovery attempt per event, ever.
        if event.retry_count >= RECOVERY_MAX_ATTEMPTS {
            continue;
        }

        match recover_event(conn, gate, opener, provider, event) {
            Ok(Some(code)) => {
                let _write = gate.write();
                schema::update_event_recovered(conn, event.event_id, &code)?;
                outcome.recovered += 1;
                log::info!("event {}: recovered code {}", event.event_id, code);
            }
            Ok(None) => {
                let _write = gate.write();
                schema::update_event_retry_failed(conn, event.event_id)?;
                outcome.exhausted += 1;
                log::info!("event {}: no code in window", event.event_id);
            }
            Err(e) => {
                // A bad event never aborts the batch.
                outcome.errors += 1;
                log::error!("event {}: recovery failed: {}", event.event_id, e);
            }
        }
    }

    Ok(outcome)
}

/// Scan one event's frame window for a code. Returns the first non-empty
/// decode, stopping immediately; None when the window is exhausted.
fn recover_event(
    conn: &Connection,
    gate: &DbGate,
    opener: &dyn VideoOpener,
    provider: &dyn DecoderProvider,
    event: &Event,
) -> Result<Option<String>> {
    let te = event
        .te
        .ok_or_else(|| PackCamError::Scan(format!("event {} has no end boundary", event.event_id)))?;
    let ts = event.ts.unwrap_or(0.0);

    let camera = {
        let _read = gate.read();
        schema::get_camera_by_name(conn, &event.camera_name)?
            .ok_or_else(|| PackCamError::CameraNotFound(event.camera_name.clone()))?
    };
    let roi = Roi::new(camera.roi_x, camera.roi_y, camera.roi_w, camera.roi_h);
    let decoders = provider.decoders(&camera)?;

    let video_path = Path::new(&event.video_file);
    let info = opener.probe(video_path)?;
    let mut source = opener.open(video_path, &info, Some(ts))?;

    // Full density: every frame from ts*fps up to te*fps.
    let window_frames = (((te - ts) * info.fps).ceil() as u64).max(1);
    for _ in 0..window_frames {
        let frame = match source.next_frame()? {
            Some(f) => f,
            None => break,
        };
        let code = decoders.code.decode_code(&frame, roi)?;
        if !code.is_empty() {
            return Ok(Some(code));
        }
    }

    Ok(None)
}

/// Spawn the recovery daemon. It blocks on the idle signal, runs a batch,
/// clears the signal (handing control back to the first-pass driver), and
/// loops. Lives for the process lifetime.
pub fn spawn_daemon(
    db_path: PathBuf,
    gate: Arc<DbGate>,
    idle: Arc<IdleSignal>,
    opener: Arc<dyn VideoOpener>,
    provider: Arc<dyn DecoderProvider>,
) -> JoinHandle<()> {
    let policy = crate::retry::RetryPolicy::new();
    std::thread::Builder::new()
        .name("recovery-pass".into())
        .spawn(move || loop {
            idle.wait_set();

            let conn = match policy.with_retry("recovery-db", || {
                crate::db::open_db(&db_path).map_err(PackCamError::from)
            }) {
                Ok(c) => c,
                Err(e) => {
                    log::error!("recovery pass: failed to open DB: {}", e);
                    idle.clear();
                    continue;
                }
            };

            match run_once(&conn, &gate, opener.as_ref(), provider.as_ref()) {
                Ok(outcome) => {
                    if outcome.candidates > 0 {
                        log::info!(
                            "recovery batch: {} candidates, {} recovered, {} exhausted, {} errors",
                            outcome.candidates,
                            outcome.recovered,
                            outcome.exhausted,
                            outcome.errors
                        );
                    }
                }
                Err(e) => log::error!("recovery batch failed: {}", e),
            }

            idle.clear();
        })
        .expect("failed to spawn recovery daemon")
}
