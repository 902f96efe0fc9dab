// Segment parser: turns trigger-transition transcripts into events
//
// Runs as the batch job downstream of the scanner: takes every unparsed
// segment, groups them by source video, pairs On/Off transitions into
// discrete events, and registers the events. Transitions are paired across
// segment boundaries of the same video; only halves cut off at a video
// boundary become incomplete events.

use rusqlite::Connection;

use crate::db::gate::DbGate;
use crate::db::schema::{self, LogSegment, NewEvent};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub elapsed: f64,
    pub state: bool,
    pub code: String,
}

/// Parse one transition line: `<elapsedSeconds>,<On|Off>,<trackingCodeOrEmpty>`.
/// Header and malformed lines yield None.
pub fn parse_line(line: &str) -> Option<Transition> {
    if line.starts_with('#') || line.trim().is_empty() {
        return None;
    }
    let mut parts = line.splitn(3, ',');
    let elapsed: f64 = parts.next()?.trim().parse().ok()?;
    let state = match parts.next()?.trim() {
        "On" => true,
        "Off" => false,
        _ => return None,
    };
    let code = parts.next().unwrap_or("").trim().to_string();
    Some(Transition { elapsed, state, code })
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub segments_parsed: usize,
    pub events_created: usize,
}

/// Parse all unprocessed segments into events.
pub fn parse_pending_segments(conn: &Connection, gate: &DbGate) -> Result<ParseOutcome> {
    let segments = {
        let _read = gate.read();
        schema::list_unprocessed_segments(conn)?
    };

    let mut outcome = ParseOutcome::default();
    if segments.is_empty() {
        return Ok(outcome);
    }

    // Segments arrive ordered by (video_file, segment_start); walk one
    // video's run at a time so boundary pairing sees the full transcript.
    let mut start = 0;
    while start < segments.len() {
        let video_file = segments[start].video_file.clone();
        let mut end = start;
        while end < segments.len() && segments[end].video_file == video_file {
            end += 1;
        }

        let group = &segments[start..end];
        match parse_video_group(conn, gate, group) {
            Ok(created) => {
                outcome.events_created += created;
                outcome.segments_parsed += group.len();
            }
            Err(e) => {
                // A broken transcript never blocks the other videos.
                log::error!("failed to parse segments of {}: {}", video_file, e);
            }
        }

        start = end;
    }

    Ok(outcome)
}

fn parse_video_group(conn: &Connection, gate: &DbGate, group: &[LogSegment]) -> Result<usize> {
    let first = &group[0];
    // Wall-clock time of the video's first frame, recovered from any
    // segment's absolute start minus its in-video offset.
    let video_wall_start_ms = first.wall_start_ms - (first.segment_start * 1000.0) as i64;

    let mut transitions = Vec::new();
    for segment in group {
        let content = std::fs::read_to_string(&segment.path)?;
        transitions.extend(content.lines().filter_map(parse_line));
    }

    let events = pair_transitions(&transitions);

    let created = events.len();
    {
        let _write = gate.write();
        for interval in &events {
            let new_event = interval.to_new_event(
                &first.video_file,
                &first.camera_name,
                video_wall_start_ms,
            );
            schema::insert_event(conn, &new_event)?;
        }
        for segment in group {
            schema::mark_segment_processed(conn, segment.id)?;
        }
    }

    Ok(created)
}

/// A paired On/Off interval before it becomes an event row.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub ts: Option<f64>,
    pub te: Option<f64>,
    pub codes: Vec<String>,
}

impl Interval {
    fn to_new_event(
        &self,
        video_file: &str,
        camera_name: &str,
        video_wall_start_ms: i64,
    ) -> NewEvent {
        NewEvent {
            video_file: video_file.to_string(),
            camera_name: camera_name.to_string(),
            ts: self.ts,
            te: self.te,
            tracking_codes: self.codes.clone(),
            packing_time_start: self.ts.map(|t| video_wall_start_ms + (t * 1000.0) as i64),
            packing_time_end: self.te.map(|t| video_wall_start_ms + (t * 1000.0) as i64),
            // A finished window with no code is what the recovery pass hunts.
            retry_needed: self.codes.is_empty() && self.te.is_some(),
        }
    }

    fn push_code(&mut self, code: &str) {
        if code.is_empty() {
            return;
        }
        if self.codes.last().map(String::as_str) != Some(code) {
            self.codes.push(code.to_string());
        }
    }
}

/// Pair transitions into intervals.
///
/// An Off before any On means the start boundary fell in the previous file
/// (te-only interval); an On left open at the end of the transcript means the
/// end boundary falls in the next file (ts-only interval). Off lines during
/// steady Off state (code blips) are ignored.
pub fn pair_transitions(transitions: &[Transition]) -> Vec<Interval> {
    let mut intervals = Vec::new();
    let mut open: Option<Interval> = None;
    let mut seen_any = false;

    for t in transitions {
        match (&mut open, t.state) {
            (Some(interval), true) => {
                // Still on; a code change mid-event adds to the list.
                interval.push_code(&t.code);
            }
            (Some(_), false) => {
                let mut interval = open.take().unwrap();
                interval.te = Some(t.elapsed);
                interval.push_code(&t.code);
                intervals.push(interval);
            }
            (None, true) => {
                let mut interval = Interval { ts: Some(t.elapsed), te: None, codes: Vec::new() };
                interval.push_code(&t.code);
                open = Some(interval);
            }
            (None, false) => {
                if !seen_any {
                    // Transcript starts mid-event: the On lives in the
                    // previous file.
                    let mut interval = Interval { ts: None, te: Some(t.elapsed), codes: Vec::new() };
                    interval.push_code(&t.code);
                    intervals.push(interval);
                }
                // Otherwise a code blip while steadily off; nothing to pair.
            }
        }
        seen_any = true;
    }

    if let Some(interval) = open {
        intervals.push(interval);
    }

    intervals
}
