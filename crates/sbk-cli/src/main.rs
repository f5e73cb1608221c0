//! sbk: encrypted messenger backup CLI
//!
//! Commands:
//!   export <file>    - write an encrypted backup of the local stores
//!   import <file>    - replace the local stores with a backup's contents
//!   inspect <file>   - decrypt a backup and count its frames, touching nothing
//!   config show      - display current configuration
//!   keygen           - create a fresh at-rest attachment secret

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use secrecy::SecretString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;

use sbk_backup::{inspect, CancellationToken, EventBus, Exporter, FrameReader, Importer};
use sbk_core::config::{KdfAlgorithm, KdfConfig, SbkConfig, StoreConfig};
use sbk_core::{BackupError, BackupEvent, BackupEventKind};
use sbk_crypto::{Argon2idKdf, AttachmentSecret, IteratedSha512, KdfParams, PassphraseKdf};
use sbk_store::{sql, BlobStore, JsonPreferenceStore, SqliteKeyValueStore};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sbk",
    version,
    about = "Encrypted messenger backups",
    long_about = "sbk: export, restore and inspect encrypted backups of the local message stores"
)]
struct Cli {
    /// Path to sbk.toml configuration file
    #[arg(long, short = 'c', env = "SBK_CONFIG", default_value = "~/.config/sbk/sbk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an encrypted backup of the local stores
    ///
    /// The passphrase is read from SBK_PASSPHRASE or prompted for.
    Export {
        /// Destination backup file
        file: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Restore a backup, replacing the local database, settings and blobs
    Import {
        /// Backup file to restore
        file: PathBuf,
    },

    /// Decrypt a backup and report what it contains without restoring it
    Inspect {
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Create a fresh at-rest attachment secret
    Keygen {
        /// Output path (overrides config store.attachment_secret)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Replace an existing secret; attachments encrypted with it become unreadable
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;
    init_logging(&config.log.level, &config.log.format);

    match cli.command {
        Commands::Export { file, force } => cmd_export(config, file, force).await,
        Commands::Import { file } => cmd_import(config, file).await,
        Commands::Inspect { file, json } => cmd_inspect(config, file, json).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Keygen { output, force } => cmd_keygen(&config, output.as_deref(), force),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<SbkConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        // logging is not up yet
        eprintln!(
            "warning: config file not found: {}, using defaults",
            path.display()
        );
        Ok(SbkConfig::default())
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so they never interleave with report output
    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn build_kdf(config: &KdfConfig) -> Box<dyn PassphraseKdf + Send + Sync> {
    match config.algorithm {
        KdfAlgorithm::Sha512 => Box::new(IteratedSha512 {
            iterations: config.sha512_iterations,
        }),
        KdfAlgorithm::Argon2id => Box::new(Argon2idKdf {
            params: KdfParams {
                mem_cost_kib: config.argon2_mem_cost_kib,
                time_cost: config.argon2_time_cost,
                parallelism: config.argon2_parallelism,
            },
        }),
    }
}

/// SBK_PASSPHRASE, or an interactive prompt.
fn read_passphrase(confirm: bool) -> Result<SecretString> {
    if let Ok(value) = std::env::var("SBK_PASSPHRASE") {
        return Ok(SecretString::from(value));
    }
    let first = rpassword::prompt_password("Backup passphrase: ").context("reading passphrase")?;
    if first.is_empty() {
        anyhow::bail!("empty passphrase");
    }
    if confirm {
        let second =
            rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?;
        if first != second {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(first))
}

/// The four local stores a backup is taken from or restored into.
struct Stores {
    db: Connection,
    kv: SqliteKeyValueStore,
    prefs: JsonPreferenceStore,
    blobs: BlobStore,
}

impl Stores {
    fn open(config: &StoreConfig) -> Result<Self> {
        let secret_path = expand_tilde(&config.attachment_secret);
        let secret = AttachmentSecret::load(&secret_path).with_context(|| {
            format!(
                "loading attachment secret (create one with `sbk keygen`): {}",
                secret_path.display()
            )
        })?;
        let db_path = expand_tilde(&config.database);
        Ok(Self {
            db: sql::open_database(&db_path)
                .with_context(|| format!("opening database: {}", db_path.display()))?,
            kv: SqliteKeyValueStore::open(&expand_tilde(&config.key_value_database))
                .context("opening key/value store")?,
            prefs: JsonPreferenceStore::open(&expand_tilde(&config.preferences))
                .context("opening preferences")?,
            blobs: BlobStore::open(&expand_tilde(&config.blob_dir), secret)
                .context("opening blob directory")?,
        })
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {pos} frames {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Feed backup events into a progress bar until the finished event arrives
/// or the bus is dropped.
fn follow_events(mut rx: broadcast::Receiver<BackupEvent>, pb: ProgressBar) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.estimated_total > 0 {
                        pb.set_length(event.estimated_total.max(event.count));
                    }
                    pb.set_position(event.count);
                    if event.kind == BackupEventKind::Finished {
                        pb.finish_with_message("done");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    pb.abandon();
                    break;
                }
            }
        }
    })
}

// ── `sbk export` ──────────────────────────────────────────────────────────────

async fn cmd_export(config: SbkConfig, file: PathBuf, force: bool) -> Result<()> {
    if file.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", file.display());
    }
    let passphrase = read_passphrase(true)?;

    let events = EventBus::default();
    let pb = make_progress_bar("export");
    let progress = follow_events(events.subscribe(), pb.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling export");
            ctrl_c.cancel();
        }
    });

    let target = file.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<BackupEvent> {
        let stores = Stores::open(&config.store)?;
        let kdf = build_kdf(&config.kdf);
        let exporter = Exporter::new(&stores.db, &stores.kv, &stores.prefs, &stores.blobs)
            .with_rules(config.tables.clone())
            .with_backup_config(&config.backup)
            .with_events(events);
        Ok(exporter.export_to_file(&target, &passphrase, kdf.as_ref(), &cancel)?)
    })
    .await
    .context("export task panicked")?;

    let finished = match result {
        Ok(finished) => finished,
        Err(e) => {
            pb.abandon();
            if let Err(rm) = std::fs::remove_file(&file) {
                tracing::debug!(error = %rm, "no partial backup to remove");
            }
            if is_cancellation(&e) {
                println!("Export cancelled");
                return Ok(());
            }
            return Err(e.context(format!("exporting to {}", file.display())));
        }
    };
    let _ = progress.await;

    let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
    println!();
    println!("Export complete:");
    println!("  file:    {}", file.display());
    println!("  frames:  {}", finished.count);
    println!("  size:    {}", fmt_bytes(size));
    Ok(())
}

// ── `sbk import` ──────────────────────────────────────────────────────────────

async fn cmd_import(config: SbkConfig, file: PathBuf) -> Result<()> {
    let input = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let passphrase = read_passphrase(false)?;

    let events = EventBus::default();
    let pb = make_spinner("import");
    let progress = follow_events(events.subscribe(), pb.clone());

    let summary = tokio::task::spawn_blocking(move || -> Result<sbk_backup::ImportSummary> {
        let mut stores = Stores::open(&config.store)?;
        let kdf = build_kdf(&config.kdf);
        let importer = Importer::new(
            &mut stores.db,
            &mut stores.kv,
            &mut stores.prefs,
            &stores.blobs,
        )
        .with_rules(config.tables.clone())
        .with_backup_config(&config.backup)
        .with_events(events);
        Ok(importer.import_from(BufReader::new(input), &passphrase, kdf.as_ref())?)
    })
    .await
    .context("import task panicked")?;

    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            pb.abandon();
            return Err(e.context(format!("importing {}", file.display())));
        }
    };
    let _ = progress.await;

    println!();
    println!("Import complete:");
    println!("  frames:       {}", summary.frames);
    println!(
        "  statements:   {} ({} skipped)",
        summary.statements, summary.skipped_statements
    );
    println!("  preferences:  {}", summary.preferences);
    println!("  key values:   {}", summary.key_values);
    println!("  attachments:  {}", summary.attachments);
    println!("  stickers:     {}", summary.stickers);
    println!("  avatars:      {}", summary.avatars);
    if summary.bad_payloads > 0 {
        println!("  bad payloads: {} (dropped)", summary.bad_payloads);
    }
    Ok(())
}

// ── `sbk inspect` ─────────────────────────────────────────────────────────────

async fn cmd_inspect(config: SbkConfig, file: PathBuf, json: bool) -> Result<()> {
    let input = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let passphrase = read_passphrase(false)?;

    let report = tokio::task::spawn_blocking(move || -> Result<sbk_backup::InspectReport> {
        let kdf = build_kdf(&config.kdf);
        let reader = FrameReader::open(BufReader::new(input), &passphrase, kdf.as_ref())?
            .with_max_frame_length(config.backup.max_frame_length);
        Ok(inspect(reader)?)
    })
    .await
    .context("inspect task panicked")?
    .with_context(|| format!("inspecting {}", file.display()))?;

    if json {
        let value = serde_json::json!({
            "file": file.display().to_string(),
            "database_version": report.database_version,
            "frames": report.frames,
            "total_frames": report.total_frames(),
            "tables": report.tables,
            "payload_bytes": report.payload_bytes,
            "bad_payloads": report.bad_payloads,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Backup: {}", file.display());
    match report.database_version {
        Some(v) => println!("  database version: {v}"),
        None => println!("  database version: (none)"),
    }
    println!("  frames:           {}", report.total_frames());
    for (kind, count) in &report.frames {
        println!("    {kind:<12} {count}");
    }
    println!("  tables:           {}", report.tables.len());
    println!("  payload data:     {}", fmt_bytes(report.payload_bytes));
    if report.bad_payloads > 0 {
        println!("  bad payloads:     {}", report.bad_payloads);
    }
    Ok(())
}

// ── `sbk config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &SbkConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    let rendered = toml::to_string_pretty(config).context("serializing config")?;
    print!("{rendered}");
    Ok(())
}

// ── `sbk keygen` ──────────────────────────────────────────────────────────────

fn cmd_keygen(config: &SbkConfig, output: Option<&Path>, force: bool) -> Result<()> {
    let path = match output {
        Some(p) => p.to_path_buf(),
        None => expand_tilde(&config.store.attachment_secret),
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }
    AttachmentSecret::generate()
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), "created attachment secret");
    println!("Attachment secret written to {}", path.display());
    Ok(())
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackupError>()
        .is_some_and(BackupError::is_cancelled)
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
