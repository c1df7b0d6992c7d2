use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{CodeScanner, IdentityMatcher, IdentityStore, OnnxFaceEncoder, StudentId};
use rollcall_hw::Camera;
use rollcall_ledger::{
    AttendanceLedger, ErrorLog, FirebaseBackend, SheetStore, SyncMirror, XlsxSheetStore,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod announcer;
mod config;
mod input;
mod session;

use announcer::{Announcer, LogAnnouncer, SpeechAnnouncer};
use config::Config;
use input::StdinInput;
use session::{CancelToken, Session, SessionContext};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance station")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the attendance station until 'q' or Ctrl+C
    Run,
    /// List registered students
    List,
    /// Deregister a student (signature and archived image)
    Remove {
        /// Student ID to remove
        id: String,
    },
    /// List video capture devices
    Devices,
    /// Show configuration and ledger state as JSON
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::List => {
            let mut store = open_store(&config)?;
            let all = store.all()?;
            if all.is_empty() {
                println!("No students registered");
            }
            for enrollment in all {
                println!("{}", enrollment.student_id);
            }
        }
        Commands::Remove { id } => {
            let id: StudentId = id.parse().context("student ID must not be blank")?;
            let mut store = open_store(&config)?;
            let removal = store.remove(&id)?;
            if removal.signature {
                println!("Removed face data for {id}");
            } else {
                println!("No face data found for {id}");
            }
            if removal.image {
                println!("Removed archived image for {id}");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Status => {
            let mut store = open_store(&config)?;
            let registered = store.all()?.len();
            let sheets = XlsxSheetStore::new(&config.ledger_path, &config.sheet_name);
            let sheet = sheets.load().context("reading attendance ledger")?;
            let status = serde_json::json!({
                "config": &config,
                "registered_students": registered,
                "ledger": {
                    "location": sheets.describe(),
                    "students": sheet.rows().len(),
                    "dates": sheet.dates().iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                },
                "models_present": config.detector_model_path().exists() && config.embedder_model_path().exists(),
                "mirror_enabled": config.mirror_url.is_some(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

/// Run the station on a blocking thread; Ctrl+C cancels it at the next frame.
async fn run(config: Config) -> Result<()> {
    let cancel = CancelToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut session = build_session(&config, cancel)?;
        Ok(session.run()?)
    })
    .await
    .context("session thread panicked")??;

    tracing::info!(
        recorded = summary.recorded,
        registered = summary.registered,
        rejected = summary.rejected,
        device_errors = summary.device_errors,
        "rollcall stopped"
    );
    Ok(())
}

/// Open every resource up front so a missing camera or model fails fast.
fn build_session(config: &Config, cancel: CancelToken) -> Result<Session> {
    let error_log = ErrorLog::new(&config.error_log);

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    tracing::info!(device = %config.camera_device, width = camera.width, height = camera.height, "camera opened");

    let encoder = OnnxFaceEncoder::load(&config.detector_model_path(), &config.embedder_model_path())
        .context("loading face models")?;
    let matcher = IdentityMatcher::new(Box::new(encoder), config.match_tolerance);
    tracing::info!(tolerance = matcher.tolerance(), "face models loaded");

    let store = open_store(config)?;

    let sheets = XlsxSheetStore::new(&config.ledger_path, &config.sheet_name);
    let ledger = AttendanceLedger::open(Box::new(sheets), error_log.clone()).context("opening attendance ledger")?;

    let mirror = match &config.mirror_url {
        Some(url) => {
            let backend = FirebaseBackend::new(url, config.mirror_auth.clone(), config.mirror_timeout())
                .context("creating mirror client")?;
            tracing::info!(url = %url, "remote mirror enabled");
            SyncMirror::new(Box::new(backend), error_log.clone())
        }
        None => SyncMirror::disabled(error_log.clone()),
    };

    let announcer: Box<dyn Announcer> = match config.speech_command.as_deref().and_then(SpeechAnnouncer::new) {
        Some(speech) => Box::new(speech),
        None => Box::new(LogAnnouncer),
    };

    let input = StdinInput::spawn().context("starting operator input")?;

    let ctx = SessionContext {
        matcher,
        store,
        codes: Box::new(CodeScanner::with_default_decoders()),
        ledger,
        mirror,
        announcer,
        input: Box::new(input),
        error_log,
    };
    Ok(Session::new(Box::new(camera), ctx, config.session_settings(), cancel))
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    if let Some(parent) = config.identity_db.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    IdentityStore::open(&config.identity_db, Some(config.faces_dir.clone()))
        .with_context(|| format!("opening identity store {}", config.identity_db.display()))
}
