// PackCam Constants
// Defaults for the processing_config row and the retry policy. The DB row
// wins at runtime; these seed the initial migration and back the tests.

// Paths
pub const PACKCAM_FOLDER: &str = ".packcam";
pub const DB_FILENAME: &str = "packcam.db";
pub const LOGS_FOLDER: &str = "logs";
pub const CLIPS_FOLDER: &str = "clips";
pub const TMP_FOLDER: &str = "tmp";

// Trigger state machine
pub const SAMPLE_BUFFER_LEN: usize = 5;
pub const SAMPLE_MAJORITY: usize = 3;
pub const DEFAULT_FRAME_SAMPLE_STRIDE: u32 = 5;
pub const DEFAULT_SEGMENT_LENGTH_SECONDS: f64 = 360.0;

// Clip cutting
pub const DEFAULT_VIDEO_BUFFER_SECONDS: f64 = 2.0;
pub const DEFAULT_MAX_PACKING_TIME_SECONDS: f64 = 600.0;
pub const NO_CODE_PLACEHOLDER: &str = "NoCode";
pub const EPOCH_FALLBACK_TIMESTAMP: &str = "19700101_0000";
// A packing_time_* value only counts as a real ms epoch if it lands after
// this (2020-01-01 UTC in milliseconds).
pub const MIN_PLAUSIBLE_EPOCH_MS: i64 = 1_577_836_800_000;

// Adaptive scheduler
pub const DEFAULT_BATCH_SIZE_MIN: u32 = 2;
pub const DEFAULT_BATCH_SIZE_MAX: u32 = 6;
pub const DEFAULT_BATCH_SIZE: u32 = 2;
pub const DEFAULT_CPU_THRESHOLD_LOW: f64 = 70.0;
pub const DEFAULT_CPU_THRESHOLD_HIGH: f64 = 90.0;
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 90.0;
pub const TIMEOUT_WARNING_RATIO: f64 = 0.10;

// Recovery pass
pub const RECOVERY_MAX_ATTEMPTS: i64 = 1;

// Retry policy
pub const ERROR_STREAK_COOLDOWN_THRESHOLD: u32 = 5;
pub const ERROR_COOLDOWN_SECONDS: u64 = 30 * 60;

// Subprocess timeouts (seconds)
pub const FFPROBE_TIMEOUT_SECS: u64 = 30;
pub const FFMPEG_CUT_TIMEOUT_SECS: u64 = 300;
pub const SCAN_FILE_TIMEOUT_SECS: u64 = 1800;

// Video extensions accepted by intake discovery
pub const VIDEO_EXTENSIONS: [&str; 8] = [
    "mp4", "mov", "avi", "mkv", "mts", "m2ts", "ts", "webm",
];
