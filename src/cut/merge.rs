// Merging of events split across two source files
//
// A packing action that straddles a file boundary shows up as a ts-only
// event (start observed, file ended) and a te-only event (file began
// mid-action) with adjacent ids. Each half is cut to a temp file, the halves
// are concatenated with the concat demuxer (stream copy, no re-encode), and
// both events are marked processed with the same output. Temp halves and the
// list file are removed on success and failure alike.

use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use rusqlite::Connection;

use crate::config::ProcessingConfig;
use crate::constants::FFMPEG_CUT_TIMEOUT_SECS;
use crate::db::gate::DbGate;
use crate::db::schema::{self, Event};
use crate::error::{PackCamError, Result};
use crate::tools;
use crate::video;
use super::{cut_window, output_filename, stream_copy_cut, EventShape};

/// True when the two events are two halves of one action: complementary
/// shapes, adjacent ids, and a combined wall-clock span under the cap when
/// both clocks are known.
pub fn merge_eligible(a: &Event, b: &Event, max_packing_time: f64) -> bool {
    if (a.event_id - b.event_id).abs() != 1 {
        return false;
    }

    let (start_half, end_half) = match (shape_of(a), shape_of(b)) {
        (Some(EventShape::StartOnly { .. }), Some(EventShape::EndOnly { .. })) => (a, b),
        (Some(EventShape::EndOnly { .. }), Some(EventShape::StartOnly { .. })) => (b, a),
        _ => return false,
    };

    // Reject merges whose halves are too far apart in wall-clock time to be
    // one packing action. Unknown clocks cannot disprove eligibility.
    if let (Some(start_ms), Some(end_ms)) =
        (start_half.packing_time_start, end_half.packing_time_end)
    {
        let span_secs = (end_ms - start_ms) as f64 / 1000.0;
        if span_secs < 0.0 || span_secs > max_packing_time {
            return false;
        }
    }

    true
}

fn shape_of(event: &Event) -> Option<EventShape> {
    EventShape::from_event(event).ok()
}

/// Split a batch into merge pairs (start-half first) and remaining singles.
/// Events arrive ordered by id.
pub fn find_merge_pairs(
    events: &[Event],
    max_packing_time: f64,
) -> (Vec<(Event, Event)>, Vec<Event>) {
    let mut pairs = Vec::new();
    let mut singles = Vec::new();

    let mut i = 0;
    while i < events.len() {
        if i + 1 < events.len() && merge_eligible(&events[i], &events[i + 1], max_packing_time) {
            let a = &events[i];
            let b = &events[i + 1];
            let (first, second) = match shape_of(a) {
                Some(EventShape::StartOnly { .. }) => (a.clone(), b.clone()),
                _ => (b.clone(), a.clone()),
            };
            pairs.push((first, second));
            i += 2;
        } else {
            singles.push(events[i].clone());
            i += 1;
        }
    }

    (pairs, singles)
}

/// Merge one pair into a single clip. Returns false when the idempotence
/// guard skipped the pair.
#[allow(clippy::too_many_arguments)]
pub fn merge_pair(
    conn: &Connection,
    gate: &DbGate,
    config: &ProcessingConfig,
    first: &Event,
    second: &Event,
    clips_dir: &Path,
    tmp_dir: &Path,
    code_filter: Option<&str>,
) -> Result<bool> {
    // Idempotence guard before any other logic.
    if first.is_processed || second.is_processed {
        return Ok(false);
    }

    let half_a = tmp_dir.join(format!("merge_e{}_a.mp4", first.event_id));
    let half_b = tmp_dir.join(format!("merge_e{}_b.mp4", second.event_id));
    let list_path = tmp_dir.join(format!("merge_e{}_e{}.txt", first.event_id, second.event_id));
    let output_path = clips_dir.join(output_filename(first, code_filter));
    let tmp_output = tmp_dir.join(format!("merge_e{}_e{}.mp4", first.event_id, second.event_id));

    let result = (|| -> Result<()> {
        cut_half(first, config, &half_a)?;
        cut_half(second, config, &half_b)?;

        let mut list = std::fs::File::create(&list_path)?;
        writeln!(list, "file '{}'", half_a.display())?;
        writeln!(list, "file '{}'", half_b.display())?;
        list.flush()?;
        drop(list);

        concat_copy(&list_path, &tmp_output)?;
        std::fs::rename(&tmp_output, &output_path)?;
        Ok(())
    })();

    // Temp halves and the list file go away on both success and failure.
    for path in [&half_a, &half_b, &list_path, &tmp_output] {
        let _ = std::fs::remove_file(path);
    }
    result?;

    {
        let _write = gate.write();
        let output = output_path.to_string_lossy();
        schema::mark_event_processed(conn, first.event_id, &output)?;
        schema::mark_event_processed(conn, second.event_id, &output)?;
    }

    log::info!(
        "events {}+{}: merged into {}",
        first.event_id,
        second.event_id,
        output_path.display()
    );
    Ok(true)
}

fn cut_half(event: &Event, config: &ProcessingConfig, output: &Path) -> Result<()> {
    let shape = EventShape::from_event(event)?;
    let input = Path::new(&event.video_file);
    let duration = video::probe_duration(input)?;
    let (start, end) = cut_window(shape, config.video_buffer, duration);
    stream_copy_cut(input, start, end, output)
}

fn concat_copy(list_path: &Path, output: &Path) -> Result<()> {
    let mut cmd = Command::new(tools::ffmpeg_path());
    cmd.arg("-y")
        .arg("-nostdin")
        .args(["-loglevel", "error"])
        .args(["-f", "concat", "-safe", "0"])
        .arg("-i")
        .arg(list_path)
        .args(["-c", "copy"])
        .arg(output);

    let result = tools::run_with_timeout(cmd, Duration::from_secs(FFMPEG_CUT_TIMEOUT_SECS))?;
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(PackCamError::FFmpeg(format!(
            "concat failed ({}): {}",
            result.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incomplete(event_id: i64, ts: Option<f64>, te: Option<f64>) -> Event {
        Event {
            event_id,
            video_file: format!("/videos/part{}.mp4", event_id),
            camera_name: "cam1".to_string(),
            ts,
            te,
            tracking_codes: vec![],
            packing_time_start: ts.map(|_| 1_700_000_000_000),
            packing_time_end: te.map(|_| 1_700_000_030_000),
            is_processed: false,
            output_file: None,
            retry_needed: false,
            retry_count: 0,
            status: "pending".to_string(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_adjacent_complementary_pair_is_eligible() {
        let a = incomplete(5, Some(100.0), None);
        let b = incomplete(6, None, Some(12.0));
        assert!(merge_eligible(&a, &b, 600.0));
        // Symmetric in argument order
        assert!(merge_eligible(&b, &a, 600.0));
    }

    #[test]
    fn test_non_adjacent_ids_not_eligible() {
        let a = incomplete(5, Some(100.0), None);
        let c = incomplete(7, None, Some(12.0));
        assert!(!merge_eligible(&a, &c, 600.0));
    }

    #[test]
    fn test_same_shape_not_eligible() {
        let a = incomplete(5, Some(100.0), None);
        let b = incomplete(6, Some(50.0), None);
        assert!(!merge_eligible(&a, &b, 600.0));
    }

    #[test]
    fn test_complete_event_not_eligible() {
        let a = incomplete(5, Some(10.0), Some(20.0));
        let b = incomplete(6, None, Some(12.0));
        assert!(!merge_eligible(&a, &b, 600.0));
    }

    #[test]
    fn test_wall_clock_span_cap() {
        let a = incomplete(5, Some(100.0), None);
        let mut b = incomplete(6, None, Some(12.0));
        // Halves two hours apart cannot be one packing action
        b.packing_time_end = Some(1_700_000_000_000 + 2 * 3600 * 1000);
        assert!(!merge_eligible(&a, &b, 600.0));
    }

    #[test]
    fn test_find_pairs_orders_start_half_first() {
        let start_half = incomplete(5, Some(100.0), None);
        let end_half = incomplete(6, None, Some(12.0));
        let lone = incomplete(9, Some(1.0), Some(2.0));

        let (pairs, singles) =
            find_merge_pairs(&[start_half, end_half, lone], 600.0);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.event_id, 5);
        assert_eq!(pairs[0].1.event_id, 6);
        assert_eq!(singles.len(), 1);
        assert_eq!(singles[0].event_id, 9);
    }

    #[test]
    fn test_merge_skips_when_either_half_processed() {
        use crate::db::migrations::run_migrations;
        use rusqlite::Connection;
        use tempfile::TempDir;

        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let gate = crate::db::gate::DbGate::new();
        let config = ProcessingConfig::default();
        let clips = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();

        let mut first = incomplete(5, Some(100.0), None);
        first.is_processed = true;
        let second = incomplete(6, None, Some(12.0));

        // Guard fires before any temp file or ffmpeg work
        let merged = merge_pair(
            &conn, &gate, &config, &first, &second, clips.path(), tmp.path(), None,
        )
        .unwrap();
        assert!(!merged);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_find_pairs_handles_reversed_shapes() {
        // te-half carries the lower id; start half must still lead the pair
        let end_half = incomplete(5, None, Some(12.0));
        let start_half = incomplete(6, Some(100.0), None);

        let (pairs, singles) = find_merge_pairs(&[end_half, start_half], 600.0);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.event_id, 6);
        assert!(singles.is_empty());
    }
}
