// First-pass intake driver
//
// Discovers recordings, feeds them to scan workers in batches sized by the
// adaptive scheduler, and sets the idle signal when the queue drains so the
// recovery pass can take its turn. Worker threads open their own DB
// connections; the shared gate serializes their writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use walkdir::WalkDir;

use crate::config::ProcessingConfig;
use crate::constants::{SCAN_FILE_TIMEOUT_SECS, VIDEO_EXTENSIONS};
use crate::db::gate::DbGate;
use crate::db::schema;
use crate::decode::DecoderProvider;
use crate::error::{PackCamError, Result};
use crate::recovery::IdleSignal;
use crate::retry::RetryPolicy;
use crate::scan;
use crate::scheduler::AdaptiveScheduler;
use crate::video::VideoOpener;

/// Recursively find video files under a source directory, sorted for stable
/// processing order.
pub fn discover_videos(source: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    videos.sort();
    videos
}

/// Wall-clock start of a recording, in epoch milliseconds. Recorders embed
/// it in the filename (`..._YYYYMMDD_HHMMSS.mp4`); files without one fall
/// back to their modification time.
pub fn video_wall_start_ms(path: &Path) -> i64 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let re = regex::Regex::new(r"(\d{8})[_-](\d{6})").unwrap();

    if let Some(caps) = re.captures(stem) {
        let joined = format!("{} {}", &caps[1], &caps[2]);
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&joined, "%Y%m%d %H%M%S") {
            return naive.and_utc().timestamp_millis();
        }
    }

    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[derive(Debug, Default)]
pub struct IntakeOutcome {
    pub discovered: usize,
    pub scanned: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub events_created: usize,
}

/// Run the first pass: scan every discovered video, parse the resulting log
/// segments into events, then set the idle signal to hand the recovery pass
/// its turn.
#[allow(clippy::too_many_arguments)]
pub fn run_intake(
    db_path: &Path,
    gate: &Arc<DbGate>,
    config: &ProcessingConfig,
    camera_name: &str,
    source_dir: &Path,
    logs_dir: &Path,
    idle: &IdleSignal,
    opener: &Arc<dyn VideoOpener>,
    provider: &Arc<dyn DecoderProvider>,
    scheduler: &mut AdaptiveScheduler,
) -> Result<IntakeOutcome> {
    let videos = discover_videos(source_dir);
    let mut outcome = IntakeOutcome { discovered: videos.len(), ..Default::default() };

    if videos.is_empty() {
        idle.set();
        return Ok(outcome);
    }

    let camera = {
        let conn = crate::db::open_db(db_path)?;
        let _read = gate.read();
        schema::get_camera_by_name(&conn, camera_name)?
            .ok_or_else(|| PackCamError::CameraNotFound(camera_name.to_string()))?
    };

    log::info!(
        "intake {}: {} videos from {} for camera {}",
        worker_id(),
        videos.len(),
        source_dir.display(),
        camera.name
    );

    // One retry policy shared by every worker in this run; transient probe
    // and database failures back off per class instead of failing the file.
    let policy = Arc::new(RetryPolicy::new());

    let mut batch_size = config.batch_size_default;
    let mut queue = videos.into_iter();
    loop {
        batch_size = scheduler.recommend(batch_size);
        let batch: Vec<PathBuf> = queue.by_ref().take(batch_size as usize).collect();
        if batch.is_empty() {
            break;
        }

        let mut handles = Vec::new();
        for video_path in batch {
            let db_path = db_path.to_path_buf();
            let gate = Arc::clone(gate);
            let config = config.clone();
            let camera = camera.clone();
            let logs_dir = logs_dir.to_path_buf();
            let opener = Arc::clone(opener);
            let provider = Arc::clone(provider);
            let policy = Arc::clone(&policy);

            handles.push(std::thread::spawn(move || -> Result<bool> {
                let started = Instant::now();
                let source_id = video_path.display().to_string();
                let conn = policy.with_retry(&source_id, || {
                    crate::db::open_db(&db_path).map_err(PackCamError::from)
                })?;
                let wall_start_ms = video_wall_start_ms(&video_path);

                let info = policy.with_retry(&source_id, || opener.probe(&video_path))?;
                let mut source = opener.open(&video_path, &info, None)?;
                let decoders = provider.decoders(&camera)?;

                scan::scan_video(
                    &conn,
                    &gate,
                    &config,
                    &camera,
                    &video_path,
                    &info,
                    wall_start_ms,
                    source.as_mut(),
                    decoders.trigger.as_ref(),
                    decoders.code.as_ref(),
                    &logs_dir,
                )?;

                Ok(started.elapsed().as_secs() > SCAN_FILE_TIMEOUT_SECS)
            }));
        }

        for handle in handles {
            match handle.join() {
                Ok(Ok(slow)) => {
                    outcome.scanned += 1;
                    if slow {
                        outcome.timed_out += 1;
                    }
                }
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    log::error!("scan worker failed: {}", e);
                }
                Err(_) => {
                    outcome.failed += 1;
                    log::error!("scan worker panicked (recovered)");
                }
            }
        }
    }

    scheduler.check_timeout_warning(outcome.timed_out, outcome.scanned + outcome.failed);

    // Parsing the fresh segments into events is still first-pass work; it
    // must land before the idle handoff so recovery sees the new events.
    {
        let conn = crate::db::open_db(db_path)?;
        let parsed = scan::parse::parse_pending_segments(&conn, gate)?;
        outcome.events_created = parsed.events_created;
    }

    // Queue drained: hand control to the recovery pass.
    idle.set();

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;
    use crate::decode::{CameraDecoders, CodeDecoder, Frame, Roi, TriggerDetector};
    use crate::scheduler::LoadProbe;
    use crate::video::{FrameSource, VideoInfo};
    use tempfile::TempDir;

    #[test]
    fn test_discover_filters_extensions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("b.MOV"), b"x").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/d.mkv"), b"x").unwrap();

        let videos = discover_videos(dir.path());
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.MOV", "d.mkv"]);
    }

    #[test]
    fn test_wall_start_from_filename() {
        let ms = video_wall_start_ms(Path::new("/videos/cam1_20240115_083000.mp4"));
        let expected = chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(ms, expected);
    }

    #[test]
    fn test_wall_start_missing_file_no_timestamp() {
        // No filename timestamp and no file on disk: epoch fallback
        assert_eq!(video_wall_start_ms(Path::new("/nope/plain.mp4")), 0);
    }

    struct StaticProbe;
    impl LoadProbe for StaticProbe {
        fn cpu_percent(&mut self) -> f64 {
            50.0
        }
        fn memory_percent(&mut self) -> f64 {
            50.0
        }
    }

    struct QuietDecoder;
    impl TriggerDetector for QuietDecoder {
        fn detect_trigger(&self, _f: &Frame, _r: Roi) -> crate::error::Result<bool> {
            Ok(false)
        }
    }
    impl CodeDecoder for QuietDecoder {
        fn decode_code(&self, _f: &Frame, _r: Roi) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    struct TinySource {
        remaining: u64,
    }
    impl FrameSource for TinySource {
        fn next_frame(&mut self) -> crate::error::Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame { width: 2, height: 2, data: vec![0; 4] }))
        }
    }

    struct TinyOpener;
    impl VideoOpener for TinyOpener {
        fn probe(&self, _path: &Path) -> crate::error::Result<VideoInfo> {
            Ok(VideoInfo { duration_secs: 10.0, fps: 1.0, width: 2, height: 2 })
        }
        fn open(
            &self,
            _path: &Path,
            _info: &VideoInfo,
            _start: Option<f64>,
        ) -> crate::error::Result<Box<dyn FrameSource>> {
            Ok(Box::new(TinySource { remaining: 10 }))
        }
    }

    struct QuietProvider;
    impl DecoderProvider for QuietProvider {
        fn decoders(&self, _camera: &schema::Camera) -> crate::error::Result<CameraDecoders> {
            Ok(CameraDecoders {
                trigger: Arc::new(QuietDecoder),
                code: Arc::new(QuietDecoder),
            })
        }
    }

    #[test]
    fn test_run_intake_scans_all_and_sets_idle() {
        let data_dir = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let logs_dir = TempDir::new().unwrap();

        for name in ["v1.mp4", "v2.mp4", "v3.mp4"] {
            std::fs::write(source_dir.path().join(name), b"x").unwrap();
        }

        let db_path = data_dir.path().join("packcam.db");
        {
            let conn = crate::db::open_db(&db_path).unwrap();
            run_migrations(&conn).unwrap();
            schema::insert_camera(&conn, "cam1", (0, 0, 2, 2), None).unwrap();
        }

        let gate = DbGate::new();
        let config = ProcessingConfig::default();
        let idle = IdleSignal::new();
        let opener: Arc<dyn VideoOpener> = Arc::new(TinyOpener);
        let provider: Arc<dyn DecoderProvider> = Arc::new(QuietProvider);
        let mut scheduler =
            AdaptiveScheduler::new(&config, Box::new(StaticProbe)).unwrap();

        let outcome = run_intake(
            &db_path,
            &gate,
            &config,
            "cam1",
            source_dir.path(),
            logs_dir.path(),
            &idle,
            &opener,
            &provider,
            &mut scheduler,
        )
        .unwrap();

        assert_eq!(outcome.discovered, 3);
        assert_eq!(outcome.scanned, 3);
        assert_eq!(outcome.failed, 0);
        assert!(idle.is_set());
    }
}
