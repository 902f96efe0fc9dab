// PackCam CLI binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use packcam::config::ProcessingConfig;
use packcam::constants::{CLIPS_FOLDER, LOGS_FOLDER, TMP_FOLDER};
use packcam::db::{self, gate::DbGate, schema};
use packcam::decode::helper::HelperDecoderProvider;
use packcam::decode::DecoderProvider;
use packcam::scheduler::{AdaptiveScheduler, SysinfoProbe};
use packcam::video::{FfmpegVideoOpener, VideoOpener};
use packcam::{cut, intake, recovery, scan};

#[derive(Parser)]
#[command(name = "packcam")]
#[command(about = "PackCam - packing-station event capture and clip extraction", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data root
    Init {
        /// Data root path
        path: PathBuf,
    },

    /// Register a camera and its packing-area crop
    AddCamera {
        /// Camera name
        name: String,
        /// Packing-area rectangle as x,y,w,h
        #[arg(long)]
        roi: String,
        /// External decoder helper command line
        #[arg(long)]
        decoder_cmd: Option<String>,
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Scan recordings for trigger transitions (first pass)
    Scan {
        /// Directory of recordings to scan
        source: PathBuf,
        /// Camera name
        #[arg(short, long)]
        camera: String,
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Parse pending log segments into events
    Parse {
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Run one recovery batch over code-less events
    Recover {
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Cut pending events into clips
    Cut {
        /// Prefer this tracking code when naming outputs
        #[arg(long)]
        code: Option<String>,
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Full pipeline: scan recordings, recover missing codes, cut clips
    Run {
        /// Directory of recordings to scan
        source: PathBuf,
        /// Camera name
        #[arg(short, long)]
        camera: String,
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Continuous service: rescan the source on an interval with the
    /// recovery daemon running alongside
    Watch {
        /// Directory of recordings to scan
        source: PathBuf,
        /// Camera name
        #[arg(short, long)]
        camera: String,
        /// Seconds between intake sweeps
        #[arg(long, default_value = "60")]
        interval: u64,
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Show event counts by status
    Status {
        /// Data root (defaults to current directory)
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => cmd_init(path),
        Commands::AddCamera { name, roi, decoder_cmd, data_root } => {
            cmd_add_camera(name, roi, decoder_cmd, data_root)
        }
        Commands::Scan { source, camera, data_root } => cmd_scan(source, camera, data_root),
        Commands::Parse { data_root } => cmd_parse(data_root),
        Commands::Recover { data_root } => cmd_recover(data_root),
        Commands::Cut { code, data_root } => cmd_cut(code, data_root),
        Commands::Run { source, camera, data_root } => cmd_run(source, camera, data_root),
        Commands::Watch { source, camera, interval, data_root } => {
            cmd_watch(source, camera, interval, data_root)
        }
        Commands::Status { data_root } => cmd_status(data_root),
    }
}

fn resolve_data_root(data_root: Option<PathBuf>) -> Result<PathBuf> {
    let root = match data_root {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    Ok(root)
}

fn open_at(data_root: &PathBuf) -> Result<rusqlite::Connection> {
    let db_path = db::get_db_path(data_root);
    if !db_path.exists() {
        anyhow::bail!("No data root at {} (run `packcam init` first)", data_root.display());
    }
    Ok(db::open_db(&db_path)?)
}

fn cmd_init(path: PathBuf) -> Result<()> {
    let data_root = path.canonicalize().unwrap_or(path.clone());

    let db_path = db::get_db_path(&data_root);
    if db_path.exists() {
        anyhow::bail!("Data root already initialized at {}", data_root.display());
    }

    db::init_data_folders(&data_root)?;
    let conn = db::open_db(&db_path)?;

    // Startup-fatal validation of the freshly seeded config
    ProcessingConfig::load(&conn)?;

    eprintln!("Initialized PackCam data root at {}", data_root.display());
    Ok(())
}

fn cmd_add_camera(
    name: String,
    roi: String,
    decoder_cmd: Option<String>,
    data_root: Option<PathBuf>,
) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;

    let parts: Vec<u32> = roi
        .split(',')
        .map(|p| p.trim().parse())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("ROI must be x,y,w,h"))?;
    if parts.len() != 4 {
        anyhow::bail!("ROI must be x,y,w,h");
    }

    schema::insert_camera(
        &conn,
        &name,
        (parts[0], parts[1], parts[2], parts[3]),
        decoder_cmd.as_deref(),
    )?;

    eprintln!("Registered camera {}", name);
    Ok(())
}

fn cmd_scan(source: PathBuf, camera: String, data_root: Option<PathBuf>) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;
    let config = ProcessingConfig::load(&conn)?;
    drop(conn);

    let gate = DbGate::new();
    let idle = recovery::IdleSignal::new();
    let opener: Arc<dyn VideoOpener> = Arc::new(FfmpegVideoOpener);
    let provider: Arc<dyn DecoderProvider> = Arc::new(HelperDecoderProvider);
    let mut scheduler = AdaptiveScheduler::new(&config, Box::new(SysinfoProbe::new()))?;

    let logs_dir = db::get_packcam_path(&data_root).join(LOGS_FOLDER);
    let outcome = intake::run_intake(
        &db::get_db_path(&data_root),
        &gate,
        &config,
        &camera,
        &source,
        &logs_dir,
        &idle,
        &opener,
        &provider,
        &mut scheduler,
    )?;

    eprintln!(
        "Scanned {} of {} videos ({} failed, {} slow), {} events",
        outcome.scanned, outcome.discovered, outcome.failed, outcome.timed_out, outcome.events_created
    );
    Ok(())
}

fn cmd_parse(data_root: Option<PathBuf>) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;
    let gate = DbGate::new();

    let outcome = scan::parse::parse_pending_segments(&conn, &gate)?;
    eprintln!(
        "Parsed {} segments into {} events",
        outcome.segments_parsed, outcome.events_created
    );
    Ok(())
}

fn cmd_recover(data_root: Option<PathBuf>) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;
    let gate = DbGate::new();
    let opener = FfmpegVideoOpener;
    let provider = HelperDecoderProvider;

    let outcome = recovery::run_once(&conn, &gate, &opener, &provider)?;
    eprintln!(
        "Recovery: {} candidates, {} recovered, {} exhausted, {} errors",
        outcome.candidates, outcome.recovered, outcome.exhausted, outcome.errors
    );
    Ok(())
}

fn cmd_cut(code: Option<String>, data_root: Option<PathBuf>) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;
    let config = ProcessingConfig::load(&conn)?;
    let gate = DbGate::new();

    let clips_dir = data_root.join(CLIPS_FOLDER);
    let tmp_dir = db::get_packcam_path(&data_root).join(TMP_FOLDER);
    let outcome = cut::cut_pending_events(
        &conn,
        &gate,
        &config,
        &clips_dir,
        &tmp_dir,
        code.as_deref(),
    )?;

    eprintln!(
        "Cut {} clips, merged {} pairs ({} skipped, {} failed)",
        outcome.cut, outcome.merged, outcome.skipped, outcome.failed
    );
    Ok(())
}

fn cmd_run(source: PathBuf, camera: String, data_root: Option<PathBuf>) -> Result<()> {
    cmd_scan(source, camera, data_root.clone())?;
    cmd_recover(data_root.clone())?;
    cmd_cut(None, data_root)
}

fn cmd_watch(
    source: PathBuf,
    camera: String,
    interval: u64,
    data_root: Option<PathBuf>,
) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let db_path = db::get_db_path(&data_root);
    let conn = open_at(&data_root)?;
    let config = ProcessingConfig::load(&conn)?;
    drop(conn);

    let gate = DbGate::new();
    let idle = recovery::IdleSignal::new();
    let opener: Arc<dyn VideoOpener> = Arc::new(FfmpegVideoOpener);
    let provider: Arc<dyn DecoderProvider> = Arc::new(HelperDecoderProvider);
    let mut scheduler = AdaptiveScheduler::new(&config, Box::new(SysinfoProbe::new()))?;

    // The recovery daemon blocks on the idle signal; each intake sweep sets
    // it on drain and the daemon clears it when its batch finishes.
    let _daemon = recovery::spawn_daemon(
        db_path.clone(),
        Arc::clone(&gate),
        Arc::clone(&idle),
        Arc::clone(&opener),
        Arc::clone(&provider),
    );

    let logs_dir = db::get_packcam_path(&data_root).join(LOGS_FOLDER);
    let clips_dir = data_root.join(CLIPS_FOLDER);
    let tmp_dir = db::get_packcam_path(&data_root).join(TMP_FOLDER);

    loop {
        let outcome = intake::run_intake(
            &db_path,
            &gate,
            &config,
            &camera,
            &source,
            &logs_dir,
            &idle,
            &opener,
            &provider,
            &mut scheduler,
        )?;
        log::info!(
            "sweep: {} scanned, {} events created",
            outcome.scanned, outcome.events_created
        );

        // Let the recovery pass finish its batch before cutting, so fresh
        // codes make it into the clip names.
        idle.wait_clear();

        let conn = db::open_db(&db_path)?;
        let cut_outcome = cut::cut_pending_events(
            &conn,
            &gate,
            &config,
            &clips_dir,
            &tmp_dir,
            None,
        )?;
        if cut_outcome.cut + cut_outcome.merged > 0 {
            log::info!(
                "sweep: {} clips cut, {} merged",
                cut_outcome.cut, cut_outcome.merged
            );
        }

        std::thread::sleep(std::time::Duration::from_secs(interval));
    }
}

fn cmd_status(data_root: Option<PathBuf>) -> Result<()> {
    let data_root = resolve_data_root(data_root)?;
    let conn = open_at(&data_root)?;
    let gate = DbGate::new();

    let counts = {
        let _read = gate.read();
        schema::count_events_by_status(&conn)?
    };

    if counts.is_empty() {
        eprintln!("No events yet");
        return Ok(());
    }
    for (status, count) in counts {
        eprintln!("{:>16}  {}", status, count);
    }
    Ok(())
}
