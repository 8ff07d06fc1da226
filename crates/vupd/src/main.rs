//! vupd: vaultup upload daemon
//!
//! Usage:
//!   vupd [--config ~/.config/vaultup/config.toml] upload <paths...> [--photo]
//!   vupd resume [--paused]
//!   vupd admit
//!   vupd cancel <upload-id>
//!   vupd status

mod progress;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use uuid::Uuid;

use vup_core::config::{DaemonConfig, VaultupConfig};
use vup_core::types::{FileKind, FileState};
use vup_crypto::{AddressKeyring, KdfParams};
use vup_remote::{build_operator, check_health, OpendalRemote, RemoteApi};
use vup_store::MetadataStore;
use vup_upload::{
    DraftPreparer, JobHandle, JobOutcome, KeyResolver, KeyringResolver, SubmitOutcome,
    UploadContext, UploadScheduler,
};

#[derive(Parser, Debug)]
#[command(name = "vupd", version, about = "vaultup encrypted upload daemon")]
struct Cli {
    /// Path to vaultup.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "VAULTUP_CONFIG",
        default_value = "~/.config/vaultup/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error) [default: `[daemon] log_level`]
    #[arg(long, env = "VAULTUP_LOG")]
    log: Option<String>,

    /// Log format (json, text) [default: `[daemon] log_format`]
    #[arg(long, env = "VAULTUP_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Address used when a new keyring has to be generated
    #[arg(long, env = "VAULTUP_EMAIL", default_value = "owner@localhost")]
    email: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt and upload files, waiting until every job settles
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Treat the files as photos (adds the large preview thumbnail)
        #[arg(long)]
        photo: bool,
    },
    /// Pick up uploads a previous run left unfinished
    Resume {
        /// Also resubmit paused uploads
        #[arg(long)]
        paused: bool,
    },
    /// Re-admit uploads parked on storage quota if the remote has room now
    Admit,
    /// Cancel an upload and discard its draft
    Cancel { upload_id: Uuid },
    /// List uploads that have not completed
    Status,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

struct Runtime {
    store: Arc<MetadataStore>,
    keys: Arc<dyn KeyResolver>,
    remote: Arc<OpendalRemote>,
    scheduler: UploadScheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path)?;
    let (level, format) = log_settings(&cli, &config.daemon);
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "vupd starting"
    );
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    let rt = build_runtime(&config, &cli.email)?;

    let health = check_health(&rt.remote)
        .await
        .context("checking remote storage")?;
    info!(
        backend = %health.backend,
        available_bytes = ?health.available_bytes,
        "remote storage reachable"
    );

    let result = match cli.command {
        Command::Upload { paths, photo } => upload(&rt, paths, photo).await,
        Command::Resume { paused } => resume(&rt, paused).await,
        Command::Admit => admit(&rt).await,
        Command::Cancel { upload_id } => {
            if rt.scheduler.cancel(upload_id).await? {
                println!("cancelled {upload_id}");
            } else {
                println!("no upload with id {upload_id}");
            }
            Ok(())
        }
        Command::Status => status(&rt),
    };
    rt.store
        .persist()
        .await
        .context("flushing metadata store")?;
    result
}

/// Load the config, or defaults when the file is absent. The flag says
/// whether the file was found; logging is not up yet to report it.
fn load_config(path: &Path) -> Result<(VaultupConfig, bool)> {
    if path.exists() {
        let config = VaultupConfig::load(path)
            .with_context(|| format!("loading config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((VaultupConfig::default(), false))
    }
}

/// `--log` and `--log-format` win; `[daemon]` fills in whatever is unset.
fn log_settings(cli: &Cli, daemon: &DaemonConfig) -> (String, LogFormat) {
    let level = cli.log.clone().unwrap_or_else(|| daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        <LogFormat as ValueEnum>::from_str(&daemon.log_format, true).unwrap_or(LogFormat::Text)
    });
    (level, format)
}

fn build_runtime(config: &VaultupConfig, email: &str) -> Result<Runtime> {
    let mut storage = config.storage.clone();
    storage.root = expand_tilde(&storage.root);
    let op = build_operator(&storage)?;
    let remote = Arc::new(OpendalRemote::from_config(op, &storage));

    let state_db = expand_tilde(&config.store.state_db);
    let store = Arc::new(
        MetadataStore::open(&state_db)
            .with_context(|| format!("opening metadata store: {}", state_db.display()))?,
    );

    let keyring_path = expand_tilde(&config.crypto.keyring_file);
    let keyring = if keyring_path.exists() {
        AddressKeyring::load(&keyring_path)?
    } else {
        let keyring = AddressKeyring::generate(email);
        keyring.save(&keyring_path)?;
        info!(path = %keyring_path.display(), email, "generated new address keyring");
        keyring
    };
    let kdf = KdfParams {
        mem_cost_kib: config.crypto.argon2_mem_cost_kib,
        time_cost: config.crypto.argon2_time_cost,
        parallelism: config.crypto.argon2_parallelism,
    };
    let keys: Arc<dyn KeyResolver> = Arc::new(KeyringResolver::new(Arc::new(keyring), kdf));

    let ctx = UploadContext::new(
        store.clone(),
        remote.clone() as Arc<dyn RemoteApi>,
        keys.clone(),
        config.upload.clone(),
        expand_tilde(&config.store.cache_dir),
    );
    let scheduler = UploadScheduler::new(ctx);

    Ok(Runtime {
        store,
        keys,
        remote,
        scheduler,
    })
}

async fn upload(rt: &Runtime, paths: Vec<PathBuf>, photo: bool) -> Result<()> {
    let kind = if photo { FileKind::Photo } else { FileKind::Regular };
    let preparer = DraftPreparer::new(rt.store.clone(), rt.keys.clone());
    let events = rt.scheduler.subscribe();

    let mut handles = Vec::with_capacity(paths.len());
    let mut names = HashMap::new();
    for path in paths {
        let path = expand_tilde(&path);
        let file = preparer
            .prepare(&path, kind, None)
            .await
            .with_context(|| format!("preparing upload: {}", path.display()))?;
        match rt.scheduler.submit(&file.id).await? {
            SubmitOutcome::Started(handle) => {
                names.insert(file.id.clone(), file.name.clone());
                handles.push(handle);
            }
            SubmitOutcome::AlreadyUploading => {
                warn!(file_id = %file.id, "upload already in progress")
            }
        }
    }

    drive(rt, events, names, handles).await
}

async fn resume(rt: &Runtime, paused: bool) -> Result<()> {
    let events = rt.scheduler.subscribe();
    let mut handles = rt.scheduler.restart_interrupted_jobs().await?;
    if paused {
        for file in rt.store.files_in_states(&[FileState::PausedUpload])? {
            if let Some(handle) = rt.scheduler.submit(&file.id).await?.into_handle() {
                handles.push(handle);
            }
        }
    }
    if handles.is_empty() {
        println!("nothing to resume");
        return Ok(());
    }
    let names = names_for(rt, &handles)?;
    drive(rt, events, names, handles).await
}

async fn admit(rt: &Runtime) -> Result<()> {
    let available = rt
        .remote
        .available_bytes()
        .await
        .context("querying remote storage budget")?
        .unwrap_or(u64::MAX);
    let events = rt.scheduler.subscribe();
    let handles = rt.scheduler.on_storage_budget_changed(available).await?;
    if handles.is_empty() {
        println!("no waiting upload fits in {available} available bytes");
        return Ok(());
    }
    let names = names_for(rt, &handles)?;
    drive(rt, events, names, handles).await
}

fn status(rt: &Runtime) -> Result<()> {
    let files = rt.store.files_in_states(&[
        FileState::Uploading,
        FileState::Waiting,
        FileState::PausedUpload,
    ])?;
    if files.is_empty() {
        println!("no pending uploads");
        return Ok(());
    }
    for file in files {
        let upload_id = file
            .upload_id
            .map(|u| u.to_string())
            .unwrap_or_else(|| "-".into());
        let error = file.last_error.as_deref().unwrap_or("");
        println!(
            "{:<36}  {:<13}  {:>12}  {}  {}",
            upload_id,
            format!("{:?}", file.state),
            file.size,
            file.name,
            error
        );
    }
    Ok(())
}

fn names_for(rt: &Runtime, handles: &[JobHandle]) -> Result<HashMap<String, String>> {
    let mut names = HashMap::new();
    for handle in handles {
        let id = handle.file_id().to_string();
        let name = rt
            .store
            .read_file(&id)?
            .map(|f| f.name)
            .unwrap_or_else(|| id.clone());
        names.insert(id, name);
    }
    Ok(names)
}

/// Wait for every job, pausing all of them on Ctrl-C so a later
/// `vupd resume --paused` can pick them back up.
async fn drive(
    rt: &Runtime,
    events: tokio::sync::broadcast::Receiver<vup_upload::UploadEvent>,
    names: HashMap<String, String>,
    handles: Vec<JobHandle>,
) -> Result<()> {
    let ids: Vec<String> = handles.iter().map(|h| h.file_id().to_string()).collect();
    let bars = tokio::spawn(progress::watch(events, names));

    let waits = futures::future::join_all(handles.into_iter().map(|h| async move {
        let id = h.file_id().to_string();
        (id, h.wait().await)
    }));
    tokio::pin!(waits);

    let outcomes = tokio::select! {
        outcomes = &mut waits => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing uploads");
            for id in &ids {
                rt.scheduler.pause(id).await;
            }
            waits.await
        }
    };

    if tokio::time::timeout(Duration::from_secs(1), bars).await.is_err() {
        warn!("progress display did not settle");
    }

    let mut failed = 0usize;
    for (id, outcome) in &outcomes {
        match outcome {
            JobOutcome::Failed { category } => {
                failed += 1;
                warn!(file_id = %id, category = %category, "upload failed");
            }
            other => info!(file_id = %id, outcome = ?other, "upload settled"),
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} upload(s) failed", outcomes.len());
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
