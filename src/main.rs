use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use setid::config::AppConfig;
use setid::gaps::find_gaps;
use setid::matching::MaxGapPolicy;
use setid::orchestrator::{BatchOrchestrator, ProcessResult, ProgressObserver, SegmentOutcome};
use setid::progress::ProgressSnapshot;
use setid::recognition::BackendRouter;
use setid::segment::Segment;
use setid::tracklist::{self, TracklistDocument};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "setid", version, about = "Identify the tracks in a DJ set recording")]
struct Cli {
    /// Config file (defaults to ~/.config/setid/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a recording into segments and build a timestamped tracklist
    Recognize(RecognizeArgs),
}

#[derive(Args)]
struct RecognizeArgs {
    /// Audio file to analyze
    audio_file: PathBuf,

    /// Segment length in milliseconds
    #[arg(long)]
    segment_length: Option<u64>,

    /// HTTP/HTTPS proxy URL for both recognition services
    #[arg(long)]
    proxy: Option<String>,

    /// Save the tracklist to a JSON file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Minimum segment matches for a track to count
    #[arg(long)]
    min_matches: Option<usize>,

    /// Minimum mean confidence (0-1)
    #[arg(long)]
    min_confidence: Option<f64>,

    /// Maximum segment gap inside a cluster
    #[arg(long)]
    max_gap: Option<usize>,

    /// Minimum segments in a cluster
    #[arg(long)]
    min_cluster: Option<usize>,

    /// Don't list unidentified gaps
    #[arg(long)]
    no_gaps: bool,

    /// Minimum gap duration in seconds
    #[arg(long)]
    min_gap_duration: Option<f64>,

    /// Parallelism used to size batches (0 = available cores)
    #[arg(short = 'j', long)]
    cpu_count: Option<usize>,

    /// Fixed batch size (at most 50)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Primary recognition endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Don't fall back to ACRCloud
    #[arg(long)]
    no_fallback: bool,

    /// ACRCloud access key
    #[arg(long, env = "ACRCLOUD_ACCESS_KEY", hide_env_values = true)]
    acr_access_key: Option<String>,

    /// ACRCloud access secret
    #[arg(long, env = "ACRCLOUD_ACCESS_SECRET", hide_env_values = true)]
    acr_access_secret: Option<String>,

    /// ACRCloud host
    #[arg(long)]
    acr_host: Option<String>,
}

impl RecognizeArgs {
    /// Command-line flags win over the config file.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(ms) = self.segment_length {
            config.processing.segment_length_ms = ms;
        }
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(n) = self.min_matches {
            config.matching.min_segment_matches = n;
        }
        if let Some(c) = self.min_confidence {
            config.matching.min_confidence = c;
        }
        if let Some(segments) = self.max_gap {
            config.matching.max_gap = MaxGapPolicy::Fixed { segments };
        }
        if let Some(n) = self.min_cluster {
            config.matching.min_cluster_size = n;
        }
        if self.no_gaps {
            config.output.show_gaps = false;
        }
        if let Some(secs) = self.min_gap_duration {
            config.output.min_gap_duration_secs = secs;
        }
        if let Some(n) = self.cpu_count {
            config.processing.parallelism = Some(n);
        }
        if let Some(n) = self.batch_size {
            config.processing.batch_size = Some(n);
        }
        if let Some(endpoint) = &self.endpoint {
            config.primary.endpoint = endpoint.clone();
        }
        if self.no_fallback {
            config.fallback.enabled = false;
        }
        if let Some(key) = &self.acr_access_key {
            config.fallback.access_key = Some(key.clone());
        }
        if let Some(secret) = &self.acr_access_secret {
            config.fallback.access_secret = Some(secret.clone());
        }
        if let Some(host) = &self.acr_host {
            config.fallback.host = host.clone();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Explicit config must parse; the default location is optional
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(),
    };

    match cli.command {
        Commands::Recognize(args) => {
            args.apply(&mut config);
            recognize(&config, &args)?;
        }
    }

    Ok(())
}

fn recognize(config: &AppConfig, args: &RecognizeArgs) -> Result<()> {
    if !args.audio_file.exists() {
        anyhow::bail!("File {} does not exist", args.audio_file.display());
    }

    let scratch = tempfile::Builder::new()
        .prefix("setid-")
        .tempdir()
        .context("Failed to create scratch directory")?;
    let segments = setid::segment::split_audio(
        &args.audio_file,
        scratch.path(),
        config.processing.segment_seconds(),
    )
    .context("Failed to split audio")?;
    log::info!("Split {} into {} segments", args.audio_file.display(), segments.len());

    let router =
        BackendRouter::from_config(config).context("Failed to set up recognition clients")?;
    let orchestrator = BatchOrchestrator::new(router, config.processing, config.matching)?;

    let mut observer = BarObserver::new(segments.len())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime
        .block_on(orchestrator.process_all(&segments, &mut observer))
        .context("Recognition failed")?;
    observer.finish(&result);

    let gaps = if config.output.show_gaps {
        find_gaps(
            result.tracklist.values(),
            result.total_segments,
            result.segment_seconds,
            config.output.min_gap_segments,
            config.output.min_gap_duration_secs,
        )
    } else {
        Vec::new()
    };

    if let Some(path) = &args.json {
        let shown_gaps = config.output.show_gaps.then_some(gaps.as_slice());
        let document = TracklistDocument::new(&result, shown_gaps);
        document
            .write_json(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Results saved to {}", path.display());
    }

    println!();
    println!("Final Tracklist:");
    for (i, entry) in tracklist::merge(result.tracklist.values(), &gaps).iter().enumerate() {
        println!("{}", entry.render(i + 1));
    }

    println!();
    println!("Analysis Summary:");
    for line in tracklist::summary_lines(&result) {
        println!("{line}");
    }

    Ok(())
}

/// Drives an indicatif bar from orchestrator callbacks.
struct BarObserver {
    pb: ProgressBar,
}

impl BarObserver {
    fn new(total: usize) -> Result<Self> {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )?
            .progress_chars("#>-"),
        );
        Ok(Self { pb })
    }

    fn finish(&self, result: &ProcessResult) {
        self.pb.finish_with_message(format!(
            "Done: {} matched, {} failed",
            result.matched_segments, result.failed_segments
        ));
        // The bar finished; the tracker line stays in the scrollback
        println!("{}", result.progress);
    }
}

impl ProgressObserver for BarObserver {
    fn segment_resolved(
        &mut self,
        _segment: &Segment,
        outcome: &SegmentOutcome,
        snapshot: &ProgressSnapshot,
    ) {
        self.pb.inc(1);
        let message = match outcome {
            SegmentOutcome::Matched(hit) => format!("{} - {}", hit.artist, hit.title),
            _ => format!("{:.0}% matched", snapshot.success_rate),
        };
        self.pb.set_message(message);
    }
}
