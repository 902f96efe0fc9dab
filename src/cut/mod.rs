// Clip extraction engine
//
// Turns finalized events into output media files with lossless stream-copy
// cuts. Complete events get a padded [ts-buffer, te+buffer] window clamped to
// the video bounds; incomplete events run to the relevant file edge; pairs of
// complementary incomplete events adjacent by id are merged (merge.rs). An
// ffmpeg failure or an unreadable duration abandons that one event -- logged,
// left unprocessed for a later run -- and never aborts the batch.

pub mod merge;

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rusqlite::Connection;

use crate::config::ProcessingConfig;
use crate::constants::{
    EPOCH_FALLBACK_TIMESTAMP, FFMPEG_CUT_TIMEOUT_SECS, MIN_PLAUSIBLE_EPOCH_MS, NO_CODE_PLACEHOLDER,
};
use crate::db::gate::DbGate;
use crate::db::schema::{self, Event};
use crate::error::{PackCamError, Result};
use crate::tools;
use crate::video;

/// The three legal shapes of a cuttable event. Building this up front removes
/// the "both null" class of bugs from every downstream branch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventShape {
    Complete { ts: f64, te: f64 },
    StartOnly { ts: f64 },
    EndOnly { te: f64 },
}

impl EventShape {
    pub fn from_event(event: &Event) -> Result<Self> {
        match (event.ts, event.te) {
            (Some(ts), Some(te)) => Ok(EventShape::Complete { ts, te }),
            (Some(ts), None) => Ok(EventShape::StartOnly { ts }),
            (None, Some(te)) => Ok(EventShape::EndOnly { te }),
            (None, None) => Err(PackCamError::Other(format!(
                "event {} has neither boundary",
                event.event_id
            ))),
        }
    }
}

/// The code component of an output filename: a caller-supplied filter when it
/// matches one of the event's codes, else the last recovered code, else the
/// placeholder.
pub fn code_component(event: &Event, code_filter: Option<&str>) -> String {
    let chosen = match code_filter {
        Some(filter) if event.tracking_codes.iter().any(|c| c == filter) => filter.to_string(),
        _ => match event.tracking_codes.last() {
            Some(last) => last.clone(),
            None => return NO_CODE_PLACEHOLDER.to_string(),
        },
    };
    sanitize_component(&chosen)
}

/// The timestamp component: packing_time_start when it looks like a real
/// post-2020 ms epoch, else packing_time_end under the same test, else the
/// 1970 fallback.
pub fn time_component(event: &Event) -> String {
    for candidate in [event.packing_time_start, event.packing_time_end] {
        if let Some(ms) = candidate {
            if ms >= MIN_PLAUSIBLE_EPOCH_MS {
                if let Some(t) = Utc.timestamp_millis_opt(ms).single() {
                    return t.format("%Y%m%d_%H%M").to_string();
                }
            }
        }
    }
    EPOCH_FALLBACK_TIMESTAMP.to_string()
}

/// Strip anything unsafe for a filename out of a tracking code.
fn sanitize_component(raw: &str) -> String {
    let re = regex::Regex::new(r"[^A-Za-z0-9_-]").unwrap();
    let cleaned = re.replace_all(raw, "");
    if cleaned.is_empty() {
        NO_CODE_PLACEHOLDER.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Output filename for one event: camera, code, derived time.
pub fn output_filename(event: &Event, code_filter: Option<&str>) -> String {
    format!(
        "{}_{}_{}.mp4",
        sanitize_component(&event.camera_name),
        code_component(event, code_filter),
        time_component(event)
    )
}

/// Compute the clamped cut window for a shape within a video of `duration`
/// seconds. Returns (start, Some(end)) or (start, None) for run-to-end cuts.
/// Never produces a negative-length window.
pub fn cut_window(
    shape: EventShape,
    buffer: f64,
    duration: f64,
) -> (f64, Option<f64>) {
    match shape {
        EventShape::Complete { ts, te } => {
            let start = (ts - buffer).max(0.0);
            let end = (te + buffer).min(duration).max(start);
            (start, Some(end))
        }
        EventShape::StartOnly { ts } => ((ts - buffer).max(0.0), None),
        EventShape::EndOnly { te } => (0.0, Some((te + buffer).min(duration).max(0.0))),
    }
}

/// Run one stream-copy cut. `end` of None runs to the end of the input.
pub(crate) fn stream_copy_cut(
    input: &Path,
    start: f64,
    end: Option<f64>,
    output: &Path,
) -> Result<()> {
    let mut cmd = Command::new(tools::ffmpeg_path());
    cmd.arg("-y")
        .arg("-nostdin")
        .args(["-loglevel", "error"])
        .args(["-ss", &format!("{:.3}", start)])
        .arg("-i")
        .arg(input);

    if let Some(end) = end {
        cmd.args(["-t", &format!("{:.3}", (end - start).max(0.0))]);
    }

    cmd.args(["-c", "copy", "-avoid_negative_ts", "make_zero"]).arg(output);

    let result = tools::run_with_timeout(cmd, Duration::from_secs(FFMPEG_CUT_TIMEOUT_SECS))?;
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(PackCamError::FFmpeg(format!(
            "cut failed ({}): {}",
            result.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct CutOutcome {
    pub cut: usize,
    pub merged: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Cut every unprocessed event, merging complementary incomplete pairs.
pub fn cut_pending_events(
    conn: &Connection,
    gate: &DbGate,
    config: &ProcessingConfig,
    clips_dir: &Path,
    tmp_dir: &Path,
    code_filter: Option<&str>,
) -> Result<CutOutcome> {
    let events = {
        let _read = gate.read();
        schema::list_uncut_events(conn)?
    };

    let mut outcome = CutOutcome::default();
    let (pairs, singles) = merge::find_merge_pairs(&events, config.max_packing_time);

    for (first, second) in &pairs {
        match merge::merge_pair(conn, gate, config, first, second, clips_dir, tmp_dir, code_filter)
        {
            Ok(true) => outcome.merged += 1,
            Ok(false) => outcome.skipped += 1,
            Err(e) => {
                outcome.failed += 1;
                log::error!(
                    "merge of events {}+{} failed: {}",
                    first.event_id,
                    second.event_id,
                    e
                );
            }
        }
    }

    for event in &singles {
        match cut_single(conn, gate, config, event, clips_dir, tmp_dir, code_filter) {
            Ok(true) => outcome.cut += 1,
            Ok(false) => outcome.skipped += 1,
            Err(e) => {
                // Abandon this event; it stays unprocessed for a later run.
                outcome.failed += 1;
                log::error!("cut of event {} failed: {}", event.event_id, e);
            }
        }
    }

    Ok(outcome)
}

/// Cut one event. Returns false when the idempotence guard skipped it.
pub fn cut_single(
    conn: &Connection,
    gate: &DbGate,
    config: &ProcessingConfig,
    event: &Event,
    clips_dir: &Path,
    tmp_dir: &Path,
    code_filter: Option<&str>,
) -> Result<bool> {
    // Idempotence guard before any other logic.
    if event.is_processed {
        return Ok(false);
    }

    let shape = EventShape::from_event(event)?;
    let input = Path::new(&event.video_file);
    let duration = video::probe_duration(input)?;
    let (start, end) = cut_window(shape, config.video_buffer, duration);

    let output_path = clips_dir.join(output_filename(event, code_filter));
    // Cut to a temp name partitioned by event id, then rename into place.
    let tmp_path = tmp_dir.join(format!("cut_e{}.mp4", event.event_id));

    let result = stream_copy_cut(input, start, end, &tmp_path);
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    std::fs::rename(&tmp_path, &output_path)?;

    {
        let _write = gate.write();
        schema::mark_event_processed(conn, event.event_id, &output_path.to_string_lossy())?;
    }

    log::info!("event {}: cut to {}", event.event_id, output_path.display());
    Ok(true)
}
