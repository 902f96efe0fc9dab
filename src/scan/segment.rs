// Log segment writer
//
// One plain-text file per fixed-duration slice of a video's trigger
// transcript. Lines are `<elapsedSeconds>,<On|Off>,<trackingCodeOrEmpty>`,
// flushed as written; a `#` header line carries the segment bounds, derived
// wall-clock start, camera name, and source path. Each new segment is
// registered in processed_logs (is_processed=0) under the write gate before
// any line lands in it.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use rusqlite::Connection;

use crate::db::gate::DbGate;
use crate::db::schema::{self, NewLogSegment};
use crate::error::Result;

pub struct SegmentWriter<'a> {
    conn: &'a Connection,
    gate: &'a DbGate,
    logs_dir: PathBuf,
    video_file: String,
    camera_name: String,
    video_wall_start_ms: i64,
    segment_length: f64,

    current: Option<OpenSegment>,
    pub segments_written: usize,
}

struct OpenSegment {
    file: File,
    end_secs: f64,
}

impl<'a> SegmentWriter<'a> {
    pub fn new(
        conn: &'a Connection,
        gate: &'a DbGate,
        logs_dir: &Path,
        video_file: &Path,
        camera_name: &str,
        video_wall_start_ms: i64,
        segment_length: f64,
    ) -> Self {
        Self {
            conn,
            gate,
            logs_dir: logs_dir.to_path_buf(),
            video_file: video_file.to_string_lossy().to_string(),
            camera_name: camera_name.to_string(),
            video_wall_start_ms,
            segment_length,
            current: None,
            segments_written: 0,
        }
    }

    /// Make sure the segment covering `elapsed` is open, rolling over any
    /// finished one. Segment N is fully closed before N+1 opens.
    pub fn ensure_segment(&mut self, elapsed: f64) -> Result<()> {
        loop {
            match &self.current {
                Some(seg) if elapsed < seg.end_secs => return Ok(()),
                Some(_) => self.close_current()?,
                None => {
                    let index = (elapsed / self.segment_length).floor() as u64;
                    self.open_segment(index)?;
                    return Ok(());
                }
            }
        }
    }

    fn open_segment(&mut self, index: u64) -> Result<()> {
        let start = index as f64 * self.segment_length;
        let end = start + self.segment_length;
        let wall_start_ms = self.video_wall_start_ms + (start * 1000.0) as i64;

        let stem = Path::new(&self.video_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let filename = format!(
            "{}_{}_{:.0}_{:.0}_{}.log",
            self.camera_name, stem, start, end, wall_start_ms
        );
        let path = self.logs_dir.join(filename);

        let mut file = File::create(&path)?;
        let wall_start = Utc
            .timestamp_millis_opt(wall_start_ms)
            .single()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_else(|| wall_start_ms.to_string());
        writeln!(
            file,
            "# segment {:.0}-{:.0}s wall_start={} camera={} source={}",
            start, end, wall_start, self.camera_name, self.video_file
        )?;
        file.flush()?;

        {
            let _write = self.gate.write();
            schema::register_segment(
                self.conn,
                &NewLogSegment {
                    path: path.to_string_lossy().to_string(),
                    video_file: self.video_file.clone(),
                    camera_name: self.camera_name.clone(),
                    segment_start: start,
                    segment_end: end,
                    wall_start_ms,
                },
            )?;
        }

        self.current = Some(OpenSegment { file, end_secs: end });
        self.segments_written += 1;
        Ok(())
    }

    /// Append one transition line and flush it immediately.
    pub fn write_transition(&mut self, elapsed: f64, state: bool, code: &str) -> Result<()> {
        self.ensure_segment(elapsed)?;
        let seg = self.current.as_mut().expect("segment open after ensure_segment");
        writeln!(
            seg.file,
            "{:.2},{},{}",
            elapsed,
            if state { "On" } else { "Off" },
            code
        )?;
        seg.file.flush()?;
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(seg) = self.current.take() {
            let mut file = seg.file;
            file.flush()?;
        }
        Ok(())
    }

    /// Close the in-flight segment. Also called on clean end-of-video.
    pub fn close(&mut self) -> Result<()> {
        self.close_current()
    }
}
