use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use indicatif::{ProgressBar, ProgressStyle};
use mediapub_core::NetClient;
use mediapub_net_http::HttpNet;
use mediapub_node::config::{Config, DEFAULT_CONFIG, NetConfig};
use mediapub_node::filter::FileFilter;
use mediapub_node::scanner::Scanner;
use mediapub_node::sync::ProgressSink;
use tracing::info;

#[derive(Parser)]
#[command(name = "mediapub")]
#[command(version, about = "Publish a media collection to a content-addressed network")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, value_name = "PATH", default_value = "./config.toml")]
    config: PathBuf,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file and generate the signing key pair
    Init,
    /// Check that the content-network daemon is reachable
    Check,
    /// Scan the watched directories and list what would be published
    Scan,
    /// Run the publisher daemon
    Start,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.cmd {
        Commands::Init => init(&cli.config),
        Commands::Check => check(&cli.config).await,
        Commands::Scan => scan(&cli.config),
        Commands::Start => start(&cli.config).await,
    }
}

fn init(config_path: &std::path::Path) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }
    if let Some(dir) = config_path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(config_path, DEFAULT_CONFIG)
        .with_context(|| format!("writing {}", config_path.display()))?;
    info!(path = %config_path.display(), "wrote starter config");

    // Generate the identity up front so the first `start` already has it.
    let base_dir = mediapub_node::util::expand_tilde(mediapub_node::config::DEFAULT_BASE_DIR);
    std::fs::create_dir_all(&base_dir)?;
    mediapub_node::keys::KeyStore::init(base_dir.join(mediapub_node::KEYS_DIR))?;
    info!(base_dir = %base_dir.display(), "signing key pair ready");

    println!("Configuration written to {}", config_path.display());
    println!("Edit it to point at your media directories, then run `mediapub start`.");
    Ok(())
}

async fn check(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let net = build_net(&config)?;

    net.is_available()
        .await
        .context("content network daemon is not reachable")?;
    println!("content network daemon is reachable");
    Ok(())
}

fn scan(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let scanner = Scanner::new(config.watched_roots(), FileFilter::new(&config.extensions));

    let files = scanner.scan();
    for (i, file) in files.iter().enumerate() {
        println!("[{}] {} ({} bytes)", i + 1, file.path.display(), file.size);
    }
    println!("{} files would be published", files.len());
    Ok(())
}

async fn start(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let net = build_net(&config)?;
    let progress = Arc::new(BatchProgress::new(config.behavior.progress_threshold as u64));

    info!("starting mediapub");
    mediapub_node::run_node(config, net, progress).await
}

fn build_net(config: &Config) -> anyhow::Result<Arc<dyn NetClient>> {
    match &config.net {
        NetConfig::External { api_url, .. } => {
            info!(%api_url, "using external content-network daemon");
            let net = HttpNet::new(api_url, config.net.timeout())?;
            Ok(Arc::new(net))
        }
    }
}

/// Progress bar for upload batches, shown only past the configured batch
/// size so single-file events stay quiet.
struct BatchProgress {
    threshold: u64,
    bar: Mutex<Option<ProgressBar>>,
}

impl BatchProgress {
    fn new(threshold: u64) -> Self {
        BatchProgress {
            threshold,
            bar: Mutex::new(None),
        }
    }
}

impl ProgressSink for BatchProgress {
    fn begin(&self, total: u64) {
        if total <= self.threshold {
            return;
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})")
                .expect("static template")
                .progress_chars("=> "),
        );
        bar.set_message("uploading");
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn advance(&self) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}
