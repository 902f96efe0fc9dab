// First-pass trigger scan
//
// Walks a video frame by frame, samples every Nth frame through the external
// decoders, smooths the raw signal with a 5-sample majority vote, and writes
// segmented transition logs. A frame read failure is end-of-video, not an
// error: the in-flight segment is closed and the scan reports success.

pub mod parse;
pub mod segment;

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::Connection;

use crate::config::ProcessingConfig;
use crate::constants::{SAMPLE_BUFFER_LEN, SAMPLE_MAJORITY};
use crate::db::gate::DbGate;
use crate::db::schema::Camera;
use crate::decode::{CodeDecoder, Roi, TriggerDetector};
use crate::error::Result;
use crate::video::{FrameSource, VideoInfo};
use segment::SegmentWriter;

/// Per-scan transient state: the raw sample ring and the last recorded
/// (state, code) pair used to suppress redundant log writes.
pub struct SamplingState {
    buffer: VecDeque<(bool, String)>,
    last_recorded: Option<(bool, String)>,
}

impl SamplingState {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(SAMPLE_BUFFER_LEN),
            last_recorded: None,
        }
    }

    /// Push a raw sample, dropping the oldest once the ring is full.
    pub fn push(&mut self, trigger: bool, code: String) {
        if self.buffer.len() == SAMPLE_BUFFER_LEN {
            self.buffer.pop_front();
        }
        self.buffer.push_back((trigger, code));
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == SAMPLE_BUFFER_LEN
    }

    /// Majority state over the ring: On iff at least 3 of 5 samples are On.
    pub fn majority_state(&self) -> bool {
        self.buffer.iter().filter(|(t, _)| *t).count() >= SAMPLE_MAJORITY
    }

    /// The code travels with the most recent sample, not a majority vote.
    pub fn latest_code(&self) -> &str {
        self.buffer.back().map(|(_, c)| c.as_str()).unwrap_or("")
    }

    /// Returns the smoothed (state, code) pair when it differs from the last
    /// recorded one, updating the record. None during steady state.
    pub fn transition(&mut self) -> Option<(bool, String)> {
        let current = (self.majority_state(), self.latest_code().to_string());
        match &self.last_recorded {
            Some(last) if *last == current => None,
            _ => {
                self.last_recorded = Some(current.clone());
                Some(current)
            }
        }
    }
}

impl Default for SamplingState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub transitions: u64,
    pub segments_written: usize,
}

/// Scan one video end to end, writing segmented transition logs.
///
/// `wall_start_ms` is the wall-clock time of the video's first frame; segment
/// registration derives each slice's absolute start from it.
#[allow(clippy::too_many_arguments)]
pub fn scan_video(
    conn: &Connection,
    gate: &DbGate,
    config: &ProcessingConfig,
    camera: &Camera,
    video_path: &Path,
    info: &VideoInfo,
    wall_start_ms: i64,
    source: &mut dyn FrameSource,
    trigger: &dyn TriggerDetector,
    decoder: &dyn CodeDecoder,
    logs_dir: &Path,
) -> Result<ScanOutcome> {
    let roi = Roi::new(camera.roi_x, camera.roi_y, camera.roi_w, camera.roi_h);
    let stride = config.frame_sample_stride.max(1) as u64;

    let mut state = SamplingState::new();
    let mut outcome = ScanOutcome::default();
    let mut writer = SegmentWriter::new(
        conn,
        gate,
        logs_dir,
        video_path,
        &camera.name,
        wall_start_ms,
        config.segment_length_seconds,
    );

    let mut frame_index: u64 = 0;
    loop {
        let frame = match source.next_frame() {
            Ok(Some(f)) => f,
            // End of stream or read failure: both end the scan cleanly.
            Ok(None) => break,
            Err(e) => {
                log::warn!("frame read failed on {}: {} (ending scan)", video_path.display(), e);
                break;
            }
        };
        outcome.frames_read += 1;
        let elapsed = frame_index as f64 / info.fps;
        frame_index += 1;

        if (frame_index - 1) % stride != 0 {
            continue;
        }
        outcome.frames_sampled += 1;

        // Keep segment files aligned with elapsed time even through long
        // steady-state stretches with no transitions.
        writer.ensure_segment(elapsed)?;

        let trigger_on = trigger.detect_trigger(&frame, roi)?;
        let code = decoder.decode_code(&frame, roi)?;
        state.push(trigger_on, code);

        if !state.is_full() {
            continue;
        }

        if let Some((new_state, new_code)) = state.transition() {
            writer.write_transition(elapsed, new_state, &new_code)?;
            outcome.transitions += 1;
        }
    }

    writer.close()?;
    outcome.segments_written = writer.segments_written;

    log::info!(
        "scanned {}: {} frames, {} sampled, {} transitions, {} segments",
        video_path.display(),
        outcome.frames_read,
        outcome.frames_sampled,
        outcome.transitions,
        outcome.segments_written
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;
    use crate::db::schema;
    use crate::decode::Frame;
    use tempfile::TempDir;

    // Scripted decoders: each sampled frame pops the next (trigger, code)
    // pair off the script.
    struct ScriptedDecoder {
        script: std::sync::Mutex<VecDeque<(bool, String)>>,
        last: std::sync::Mutex<(bool, String)>,
    }

    impl ScriptedDecoder {
        fn new(samples: Vec<(bool, &str)>) -> Self {
            Self {
                script: std::sync::Mutex::new(
                    samples.into_iter().map(|(t, c)| (t, c.to_string())).collect(),
                ),
                last: std::sync::Mutex::new((false, String::new())),
            }
        }
    }

    impl TriggerDetector for ScriptedDecoder {
        fn detect_trigger(&self, _frame: &Frame, _roi: Roi) -> Result<bool> {
            let mut script = self.script.lock().unwrap();
            let sample = script.pop_front().unwrap_or((false, String::new()));
            *self.last.lock().unwrap() = sample.clone();
            Ok(sample.0)
        }
    }

    impl CodeDecoder for ScriptedDecoder {
        fn decode_code(&self, _frame: &Frame, _roi: Roi) -> Result<String> {
            Ok(self.last.lock().unwrap().1.clone())
        }
    }

    struct FakeSource {
        remaining: u64,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame { width: 4, height: 4, data: vec![0; 16] }))
        }
    }

    fn setup() -> (Connection, std::sync::Arc<DbGate>, TempDir) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        (conn, DbGate::new(), TempDir::new().unwrap())
    }

    fn test_camera() -> Camera {
        Camera {
            id: 1,
            name: "cam1".to_string(),
            roi_x: 0,
            roi_y: 0,
            roi_w: 4,
            roi_h: 4,
            decoder_cmd: None,
        }
    }

    #[test]
    fn test_majority_three_of_five_is_on() {
        let mut state = SamplingState::new();
        for sample in [true, false, true, false, true] {
            state.push(sample, String::new());
        }
        assert!(state.is_full());
        assert!(state.majority_state());
    }

    #[test]
    fn test_majority_two_of_five_is_off() {
        let mut state = SamplingState::new();
        for sample in [true, true, false, false, false] {
            state.push(sample, String::new());
        }
        assert!(!state.majority_state());
    }

    #[test]
    fn test_majority_ignores_sample_order() {
        for on_positions in [[0, 1, 2], [0, 2, 4], [2, 3, 4]] {
            let mut state = SamplingState::new();
            for i in 0..5 {
                state.push(on_positions.contains(&i), String::new());
            }
            assert!(state.majority_state(), "positions {:?}", on_positions);
        }
    }

    #[test]
    fn test_code_comes_from_most_recent_sample() {
        let mut state = SamplingState::new();
        for code in ["AAA", "BBB", "CCC", "DDD", "EEE"] {
            state.push(true, code.to_string());
        }
        assert_eq!(state.latest_code(), "EEE");
    }

    #[test]
    fn test_steady_state_suppresses_writes() {
        let mut state = SamplingState::new();
        for _ in 0..5 {
            state.push(true, "AB1".to_string());
        }
        assert!(state.transition().is_some()); // first full buffer records
        state.push(true, "AB1".to_string());
        assert!(state.transition().is_none()); // unchanged pair stays quiet
        state.push(false, "AB1".to_string());
        state.push(false, "AB1".to_string());
        state.push(false, "AB1".to_string());
        assert!(state.transition().is_some()); // majority flipped
    }

    #[test]
    fn test_scan_writes_on_off_transitions() {
        let (conn, gate, dir) = setup();
        let config = ProcessingConfig::default();
        let camera = test_camera();
        let info = VideoInfo { duration_secs: 10.0, fps: 1.0, width: 4, height: 4 };

        // stride 5 over 50 frames at 1 fps -> 10 samples: ramp on, hold, off
        let decoder = ScriptedDecoder::new(vec![
            (false, ""),
            (true, "PKG1"),
            (true, "PKG1"),
            (true, "PKG1"),
            (true, "PKG1"), // buffer full here: 4/5 On -> On recorded
            (true, "PKG1"),
            (false, ""),
            (false, ""),
            (false, ""),
            (false, ""), // 1/5 On -> Off recorded
        ]);
        let mut source = FakeSource { remaining: 50 };

        let outcome = scan_video(
            &conn,
            &gate,
            &config,
            &camera,
            Path::new("/videos/cam1.mp4"),
            &info,
            0,
            &mut source,
            &decoder,
            &decoder,
            dir.path(),
        )
        .unwrap();

        assert_eq!(outcome.frames_read, 50);
        assert_eq!(outcome.frames_sampled, 10);
        assert_eq!(outcome.segments_written, 1);

        let segments = schema::list_unprocessed_segments(&conn).unwrap();
        let content = std::fs::read_to_string(&segments[0].path).unwrap();
        let lines: Vec<&str> = content.lines().skip(1).collect(); // skip header
        // Three recorded pairs: the code clears one sample before the
        // majority flips, so (On,"") lands between (On,PKG1) and (Off,"").
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(",On,PKG1"), "got {}", lines[0]);
        assert!(lines[1].ends_with(",On,"), "got {}", lines[1]);
        assert!(lines[2].ends_with(",Off,"), "got {}", lines[2]);
    }
}
