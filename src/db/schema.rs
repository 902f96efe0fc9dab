// Database schema types and query helpers

use rusqlite::{Connection, params, OptionalExtension};
use serde::{Deserialize, Serialize};
use crate::error::Result;

// ----- Event -----

/// One detected packing event. `ts`/`te` are seconds from the start of
/// `video_file`; exactly one may be null for an event whose other boundary
/// fell in an adjacent file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub video_file: String,
    pub camera_name: String,
    pub ts: Option<f64>,
    pub te: Option<f64>,
    pub tracking_codes: Vec<String>,
    pub packing_time_start: Option<i64>,
    pub packing_time_end: Option<i64>,
    pub is_processed: bool,
    pub output_file: Option<String>,
    pub retry_needed: bool,
    pub retry_count: i64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub video_file: String,
    pub camera_name: String,
    pub ts: Option<f64>,
    pub te: Option<f64>,
    pub tracking_codes: Vec<String>,
    pub packing_time_start: Option<i64>,
    pub packing_time_end: Option<i64>,
    pub retry_needed: bool,
}

const EVENT_COLUMNS: &str =
    "event_id, video_file, camera_name, ts, te, tracking_codes, packing_time_start,
     packing_time_end, is_processed, output_file, retry_needed, retry_count, status, created_at";

fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let codes_json: String = row.get(5)?;
    let tracking_codes: Vec<String> = serde_json::from_str(&codes_json).unwrap_or_default();

    Ok(Event {
        event_id: row.get(0)?,
        video_file: row.get(1)?,
        camera_name: row.get(2)?,
        ts: row.get(3)?,
        te: row.get(4)?,
        tracking_codes,
        packing_time_start: row.get(6)?,
        packing_time_end: row.get(7)?,
        is_processed: row.get::<_, i64>(8)? != 0,
        output_file: row.get(9)?,
        retry_needed: row.get::<_, i64>(10)? != 0,
        retry_count: row.get(11)?,
        status: row.get(12)?,
        created_at: row.get(13)?,
    })
}

pub fn insert_event(conn: &Connection, event: &NewEvent) -> Result<i64> {
    let codes_json = serde_json::to_string(&event.tracking_codes)?;
    conn.execute(
        "INSERT INTO events (video_file, camera_name, ts, te, tracking_codes,
                             packing_time_start, packing_time_end, retry_needed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.video_file,
            event.camera_name,
            event.ts,
            event.te,
            codes_json,
            event.packing_time_start,
            event.packing_time_end,
            event.retry_needed as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_event(conn: &Connection, event_id: i64) -> Result<Option<Event>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM events WHERE event_id = ?1", EVENT_COLUMNS),
            params![event_id],
            event_from_row,
        )
        .optional()?;
    Ok(result)
}

/// Events still waiting for a cut, in id order.
pub fn list_uncut_events(conn: &Connection) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events WHERE is_processed = 0 ORDER BY event_id",
        EVENT_COLUMNS
    ))?;
    let events = stmt
        .query_map([], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Recovery-pass candidates: events that still need a code, have never been
/// retried, and have a known end boundary.
pub fn list_retry_candidates(conn: &Connection) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events
         WHERE retry_needed = 1 AND retry_count < 1 AND te IS NOT NULL
         ORDER BY event_id",
        EVENT_COLUMNS
    ))?;
    let events = stmt
        .query_map([], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn mark_event_processed(conn: &Connection, event_id: i64, output_file: &str) -> Result<()> {
    conn.execute(
        "UPDATE events SET is_processed = 1, output_file = ?1,
         status = CASE WHEN status = 'pending' THEN 'completed' ELSE status END
         WHERE event_id = ?2",
        params![output_file, event_id],
    )?;
    Ok(())
}

/// Record a successful recovery: append the code, clear the retry flag.
pub fn update_event_recovered(conn: &Connection, event_id: i64, code: &str) -> Result<()> {
    let event = get_event(conn, event_id)?
        .ok_or(crate::error::PackCamError::EventNotFound(event_id))?;

    let mut codes = event.tracking_codes;
    codes.push(code.to_string());
    let codes_json = serde_json::to_string(&codes)?;

    conn.execute(
        "UPDATE events SET tracking_codes = ?1, retry_needed = 0,
         status = 'completed_retry', retry_count = retry_count + 1
         WHERE event_id = ?2",
        params![codes_json, event_id],
    )?;
    Ok(())
}

/// Record an exhausted recovery window.
pub fn update_event_retry_failed(conn: &Connection, event_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE events SET retry_needed = 0, status = 'retry_failed',
         retry_count = retry_count + 1
         WHERE event_id = ?1",
        params![event_id],
    )?;
    Ok(())
}

/// Aggregate counts by status, for the CLI status command.
pub fn count_events_by_status(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM events GROUP BY status ORDER BY status",
    )?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

// ----- Log segments -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSegment {
    pub id: i64,
    pub path: String,
    pub video_file: String,
    pub camera_name: String,
    pub segment_start: f64,
    pub segment_end: f64,
    pub wall_start_ms: i64,
    pub is_processed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewLogSegment {
    pub path: String,
    pub video_file: String,
    pub camera_name: String,
    pub segment_start: f64,
    pub segment_end: f64,
    pub wall_start_ms: i64,
}

fn segment_from_row(row: &rusqlite::Row) -> rusqlite::Result<LogSegment> {
    Ok(LogSegment {
        id: row.get(0)?,
        path: row.get(1)?,
        video_file: row.get(2)?,
        camera_name: row.get(3)?,
        segment_start: row.get(4)?,
        segment_end: row.get(5)?,
        wall_start_ms: row.get(6)?,
        is_processed: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

pub fn register_segment(conn: &Connection, segment: &NewLogSegment) -> Result<i64> {
    conn.execute(
        "INSERT INTO processed_logs (path, video_file, camera_name, segment_start,
                                     segment_end, wall_start_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(path) DO NOTHING",
        params![
            segment.path,
            segment.video_file,
            segment.camera_name,
            segment.segment_start,
            segment.segment_end,
            segment.wall_start_ms,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Unparsed segments, grouped by source video and ordered by in-video time so
/// the parser can pair transitions across segment boundaries.
pub fn list_unprocessed_segments(conn: &Connection) -> Result<Vec<LogSegment>> {
    let mut stmt = conn.prepare(
        "SELECT id, path, video_file, camera_name, segment_start, segment_end,
                wall_start_ms, is_processed, created_at
         FROM processed_logs WHERE is_processed = 0
         ORDER BY video_file, segment_start",
    )?;
    let segments = stmt
        .query_map([], segment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(segments)
}

pub fn mark_segment_processed(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE processed_logs SET is_processed = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

// ----- Camera -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    pub roi_x: u32,
    pub roi_y: u32,
    pub roi_w: u32,
    pub roi_h: u32,
    pub decoder_cmd: Option<String>,
}

pub fn insert_camera(
    conn: &Connection,
    name: &str,
    roi: (u32, u32, u32, u32),
    decoder_cmd: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO cameras (name, roi_x, roi_y, roi_w, roi_h, decoder_cmd)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![name, roi.0, roi.1, roi.2, roi.3, decoder_cmd],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_camera_by_name(conn: &Connection, name: &str) -> Result<Option<Camera>> {
    let result = conn
        .query_row(
            "SELECT id, name, roi_x, roi_y, roi_w, roi_h, decoder_cmd
             FROM cameras WHERE name = ?1",
            params![name],
            |row| {
                Ok(Camera {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    roi_x: row.get(2)?,
                    roi_y: row.get(3)?,
                    roi_w: row.get(4)?,
                    roi_h: row.get(5)?,
                    decoder_cmd: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(result)
}

pub fn list_cameras(conn: &Connection) -> Result<Vec<Camera>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, roi_x, roi_y, roi_w, roi_h, decoder_cmd FROM cameras ORDER BY name",
    )?;
    let cameras = stmt
        .query_map([], |row| {
            Ok(Camera {
                id: row.get(0)?,
                name: row.get(1)?,
                roi_x: row.get(2)?,
                roi_y: row.get(3)?,
                roi_w: row.get(4)?,
                roi_h: row.get(5)?,
                decoder_cmd: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample_event(ts: Option<f64>, te: Option<f64>, codes: Vec<String>) -> NewEvent {
        NewEvent {
            video_file: "/videos/cam1_20240101.mp4".to_string(),
            camera_name: "cam1".to_string(),
            ts,
            te,
            tracking_codes: codes,
            packing_time_start: Some(1_700_000_000_000),
            packing_time_end: Some(1_700_000_060_000),
            retry_needed: false,
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let conn = test_conn();
        let id = insert_event(&conn, &sample_event(Some(10.0), Some(30.0), vec!["AB123".into()])).unwrap();

        let event = get_event(&conn, id).unwrap().unwrap();
        assert_eq!(event.video_file, "/videos/cam1_20240101.mp4");
        assert_eq!(event.ts, Some(10.0));
        assert_eq!(event.te, Some(30.0));
        assert_eq!(event.tracking_codes, vec!["AB123".to_string()]);
        assert!(!event.is_processed);
        assert_eq!(event.status, "pending");
    }

    #[test]
    fn test_retry_candidates_filter() {
        let conn = test_conn();

        // Needs retry, never attempted, has te: candidate
        let mut e1 = sample_event(Some(1.0), Some(5.0), vec![]);
        e1.retry_needed = true;
        let id1 = insert_event(&conn, &e1).unwrap();

        // Needs retry but no te: excluded
        let mut e2 = sample_event(Some(1.0), None, vec![]);
        e2.retry_needed = true;
        insert_event(&conn, &e2).unwrap();

        // Already attempted once: excluded even with retry_needed re-set
        let mut e3 = sample_event(Some(1.0), Some(5.0), vec![]);
        e3.retry_needed = true;
        let id3 = insert_event(&conn, &e3).unwrap();
        update_event_retry_failed(&conn, id3).unwrap();
        conn.execute("UPDATE events SET retry_needed = 1 WHERE event_id = ?1", params![id3])
            .unwrap();

        let candidates = list_retry_candidates(&conn).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].event_id, id1);
    }

    #[test]
    fn test_recovered_appends_code_and_bumps_count() {
        let conn = test_conn();
        let mut e = sample_event(Some(1.0), Some(5.0), vec![]);
        e.retry_needed = true;
        let id = insert_event(&conn, &e).unwrap();

        update_event_recovered(&conn, id, "ZX987").unwrap();

        let event = get_event(&conn, id).unwrap().unwrap();
        assert_eq!(event.tracking_codes, vec!["ZX987".to_string()]);
        assert!(!event.retry_needed);
        assert_eq!(event.status, "completed_retry");
        assert_eq!(event.retry_count, 1);
    }

    #[test]
    fn test_segment_registration_is_idempotent() {
        let conn = test_conn();
        let seg = NewLogSegment {
            path: "/logs/cam1_0_360.log".to_string(),
            video_file: "/videos/cam1.mp4".to_string(),
            camera_name: "cam1".to_string(),
            segment_start: 0.0,
            segment_end: 360.0,
            wall_start_ms: 1_700_000_000_000,
        };
        register_segment(&conn, &seg).unwrap();
        register_segment(&conn, &seg).unwrap();

        let segments = list_unprocessed_segments(&conn).unwrap();
        assert_eq!(segments.len(), 1);
    }
}
