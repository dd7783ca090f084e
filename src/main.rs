// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use feedpull::{
    DownloadStatus, FeedCache, IngestOptions, Ingestor, JsonDirCache, NoopCache, NoopReporter,
    ProgressEvent, ProgressReporter, ReqwestClient, SharedProgressReporter, TaskId,
    TransportConfig,
};

// Emoji with fallback for terminals without Unicode support
static SATELLITE: Emoji<'_, '_> = Emoji("📡 ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[r] ");
static NEWS: Emoji<'_, '_> = Emoji("📰 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[-] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Fetch an RSS feed and download its enclosures
#[derive(Parser, Debug)]
#[command(name = "feedpull")]
#[command(about = "Fetch an RSS feed and download its enclosures")]
#[command(version)]
struct Args {
    /// RSS feed URL
    feed_url: String,

    /// Download item enclosures into this directory
    #[arg(short, long)]
    download_dir: Option<PathBuf>,

    /// Maximum number of enclosures to download
    #[arg(short, long)]
    limit: Option<usize>,

    /// Keep parsed items as JSON files in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Empty the item cache before fetching
    #[arg(long, requires = "cache_dir")]
    clear_cache: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value = "15")]
    connect_timeout: u64,

    /// Do not fetch the feed again after a dropped connection
    #[arg(long)]
    no_retry: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
    labels: Mutex<HashMap<TaskId, String>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Result<Self> {
        let multi = MultiProgress::new();

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(ProgressStyle::default_bar().template("{spinner:.green} {wide_msg}")?);
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Ok(Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
            main_bar,
        })
    }

    fn set_label(&self, id: TaskId, label: &str) {
        let label = truncate_title(label, 40);
        if let Some(bar) = self.bars.lock().unwrap().get(&id) {
            bar.set_message(label.clone());
        }
        self.labels.lock().unwrap().insert(id, label);
    }

    fn label(&self, id: TaskId) -> String {
        self.labels
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("download {id}"))
    }

    fn get_or_create_bar(&self, id: TaskId) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap();

        if let Some(bar) = bars.get(&id) {
            return bar.clone();
        }

        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bar.set_message(self.label(id));
        bars.insert(id, bar.clone());
        bar
    }

    fn finish_bar(&self, id: TaskId, message: String) {
        if let Some(bar) = self.bars.lock().unwrap().remove(&id) {
            bar.abandon_with_message(message);
        }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { url, .. } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Fetching feed: {}", url.cyan()));
            }

            ProgressEvent::FetchRetrying { error, .. } => {
                self.main_bar.set_message(format!(
                    "{RETRY}{} {}",
                    error.to_string().yellow(),
                    "- fetching again".dimmed()
                ));
            }

            ProgressEvent::ItemParsed { item, .. } => {
                let enclosure = if item.enclosure.is_some() { " ♪" } else { "" };
                let _ = self.multi.println(format!(
                    "  {NEWS}{}{} {}",
                    truncate_title(&item.title, 60).bold(),
                    enclosure.magenta(),
                    item.link.as_str().dimmed()
                ));
            }

            ProgressEvent::FeedCompleted { item_count, .. } => {
                self.main_bar.set_message(format!(
                    "{SUCCESS}{} items",
                    item_count.to_string().green().bold()
                ));
            }

            ProgressEvent::FeedFailed { error, .. } => {
                self.main_bar
                    .set_message(format!("{FAILURE}{}", error.to_string().red()));
            }

            ProgressEvent::DownloadStatusChanged { id, status } => match status {
                DownloadStatus::Pending => {}
                DownloadStatus::Downloading => {
                    self.get_or_create_bar(id);
                }
                DownloadStatus::Paused => {
                    self.get_or_create_bar(id)
                        .set_message(format!("{} (paused)", self.label(id)));
                }
                DownloadStatus::Completed => {
                    self.finish_bar(id, format!("{SUCCESS}{}", self.label(id).green()));
                }
                DownloadStatus::Cancelled => {
                    self.finish_bar(id, format!("{CROSS}{}", self.label(id).dimmed()));
                }
                DownloadStatus::Failed(error) => {
                    self.finish_bar(
                        id,
                        format!(
                            "{FAILURE}{} - {}",
                            truncate_title(&self.label(id), 30).red(),
                            error.to_string().red()
                        ),
                    );
                }
            },

            ProgressEvent::DownloadProgress {
                id,
                bytes_transferred,
                expected_total,
            } => {
                let bar = self.get_or_create_bar(id);
                if let Some(total) = expected_total {
                    bar.set_length(total);
                }
                bar.set_position(bytes_transferred);
            }

            ProgressEvent::CacheCleared { removed } => {
                let _ = self.multi.println(format!(
                    "{BROOM}Removed {} cached items",
                    removed.to_string().cyan()
                ));
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let kept: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            SATELLITE,
            "feedpull".bold().magenta(),
            "- Feed Reader".dimmed()
        );
    }

    let client = ReqwestClient::from_config(&TransportConfig {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        ..TransportConfig::default()
    })
    .context("Failed to set up HTTP client")?;

    let cache: Arc<dyn FeedCache> = match &args.cache_dir {
        Some(dir) => Arc::new(JsonDirCache::open(dir).context("Failed to open item cache")?),
        None => Arc::new(NoopCache),
    };

    let progress = if args.quiet {
        None
    } else {
        Some(Arc::new(IndicatifReporter::new()?))
    };
    let reporter: SharedProgressReporter = match &progress {
        Some(progress) => progress.clone(),
        None => NoopReporter::shared(),
    };

    let options = IngestOptions {
        retry_disconnects: !args.no_retry,
        ..IngestOptions::default()
    };
    let ingestor = Arc::new(
        Ingestor::new(client, options)
            .with_reporter(reporter)
            .with_cache(cache),
    );

    if args.clear_cache {
        ingestor.clear_cache().context("Failed to clear item cache")?;
    }

    let interrupt = tokio::spawn({
        let ingestor = ingestor.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling");
                ingestor.cancel_all().await;
            }
        }
    });

    let document = ingestor
        .fetch_feed(&args.feed_url)
        .join()
        .await
        .with_context(|| format!("Failed to fetch feed {}", args.feed_url))?;

    if args.quiet {
        for item in &document.items {
            println!("{}\t{}", item.link, item.title);
        }
    }

    let mut failures = Vec::new();
    let mut completed = 0;

    if let Some(dir) = &args.download_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let limit = args.limit.unwrap_or(usize::MAX);
        let mut started = Vec::new();
        for item in document.items.iter().filter(|i| i.enclosure.is_some()).take(limit) {
            match ingestor.download_enclosure(item, dir).await {
                Ok(Some(id)) => {
                    if let Some(progress) = &progress {
                        progress.set_label(id, &item.title);
                    }
                    started.push((id, item.title.clone()));
                }
                Ok(None) => {}
                Err(e) => failures.push((item.title.clone(), e.to_string())),
            }
        }

        for (id, title) in started {
            match ingestor.wait_download(id).await? {
                DownloadStatus::Completed => completed += 1,
                DownloadStatus::Failed(e) => failures.push((title, e.to_string())),
                _ => failures.push((title, "cancelled".to_string())),
            }
            ingestor.acknowledge_download(id).await?;
        }
    }

    interrupt.abort();

    if let Some(progress) = &progress {
        progress.main_bar.finish_and_clear();
        println!(
            "\n{} {} items, {} downloaded, {} failed",
            document
                .channel
                .title
                .as_deref()
                .unwrap_or(&args.feed_url)
                .bold()
                .green(),
            document.items.len().to_string().cyan(),
            completed.to_string().green().bold(),
            if failures.is_empty() {
                "0".green()
            } else {
                failures.len().to_string().red().bold()
            }
        );
    }

    if !args.quiet && !failures.is_empty() {
        println!("\n{}", "Failed downloads:".red().bold());
        for (title, error) in &failures {
            println!("  {}{} - {}", CROSS, title.yellow(), error.dimmed());
        }
    }

    if !failures.is_empty() && completed == 0 {
        std::process::exit(1);
    }

    Ok(())
}
