use anyhow::{anyhow, Context, Result};
use clap::Parser;
use common::messages::{LineSink, MessageLog};
use common::{BatchConfig, ConflictPolicy, Engine, MirrorSettings, RunSummary};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rmirror",
    version,
    about = "Mirror a directory tree onto a backup destination - one way, incremental",
    long_about = "`rmirror` makes DESTINATION an exact copy of SOURCE: new entries are copied, changed files \
are updated and entries missing from SOURCE are deleted from DESTINATION.

The destination tree is remembered in a cache file inside DESTINATION, so later runs only need to scan \
SOURCE. After a number of runs (--reindex) the destination is scanned again from scratch.

EXAMPLE:
    # Mirror a directory, skipping a top-level `tmp` and anything ending in `.part`
    rmirror /data/photos /mnt/backup/photos --ignore '^tmp$' --ignore '.part$' --progress --summary

    # Run every mirror listed in a batch file
    rmirror --config mirrors.json --log rmirror.log"
)]
struct Args {
    // Mirror options
    /// Ignore pattern (can be specified multiple times)
    ///
    /// A plain pattern is matched as a substring of the full source path. Anchored forms are
    /// matched against the path relative to SOURCE: `^name` (starts with), `name$` (ends with)
    /// and `^name$` (exactly, so only a top-level entry). Matching is case-sensitive.
    #[arg(long, value_name = "PATTERN", action = clap::ArgAction::Append, help_heading = "Mirror options")]
    ignore: Vec<String>,

    /// Number of times the destination cache is reused before the destination is reindexed
    #[arg(
        long,
        default_value = "10",
        value_name = "N",
        help_heading = "Mirror options"
    )]
    reindex: u64,

    /// Minimum time between background saves of the destination cache
    ///
    /// This option accepts a human readable duration, e.g. "30s", "10min" etc.
    #[arg(long, default_value = "10min", value_name = "DELAY", value_parser = humantime::parse_duration, help_heading = "Mirror options")]
    autosave: std::time::Duration,

    /// Delete destination-only entries even when they unexpectedly still exist in SOURCE
    ///
    /// By default such entries are reported as a consistency error and left alone.
    #[arg(long, help_heading = "Mirror options")]
    delete_on_conflict: bool,

    /// Batch file (JSON) listing the mirrors to run, instead of SOURCE and DESTINATION
    #[arg(long, value_name = "PATH", conflicts_with_all = ["source", "destination"], help_heading = "Mirror options")]
    config: Option<PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Append every run message to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log: Option<PathBuf>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of concurrent operations and worker threads, 0 means 75% of the cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Directory to mirror
    #[arg(required_unless_present = "config")]
    source: Option<PathBuf>,

    /// Directory to mirror into, created if missing
    #[arg(required_unless_present = "config")]
    destination: Option<PathBuf>,
}

impl Args {
    fn progress_settings(&self) -> Option<common::ProgressSettings> {
        (self.progress || self.progress_type.is_some() || self.progress_delay.is_some()).then(
            || common::ProgressSettings {
                progress_type: self.progress_type.unwrap_or_default(),
                progress_delay: self.progress_delay.clone(),
            },
        )
    }

    fn mirrors(&self) -> Result<Vec<MirrorSettings>> {
        let mut defaults = MirrorSettings::new(PathBuf::new(), PathBuf::new());
        defaults.ignore = self.ignore.clone();
        defaults.reindex_threshold = self.reindex;
        defaults.autosave_interval = self.autosave;
        defaults.max_workers = self.max_workers;
        if self.delete_on_conflict {
            defaults.conflict_policy = ConflictPolicy::Delete;
        }
        match (&self.config, &self.source, &self.destination) {
            (Some(path), _, _) => {
                let batch = BatchConfig::from_file(path)?;
                if batch.is_empty() {
                    return Err(anyhow!("batch config {:?} lists no mirrors", path));
                }
                Ok(batch.settings(&defaults))
            }
            (None, Some(source), Some(destination)) => Ok(vec![MirrorSettings {
                title: MirrorSettings::new(source, destination).title,
                source: source.clone(),
                destination: destination.clone(),
                ..defaults
            }]),
            _ => Err(anyhow!("either SOURCE and DESTINATION or --config must be given")),
        }
    }
}

type SharedLog = Arc<Mutex<std::fs::File>>;

fn open_log(path: &Path) -> Result<SharedLog> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {:?}", path))?;
    Ok(Arc::new(Mutex::new(file)))
}

fn log_sink(file: SharedLog) -> LineSink {
    Box::new(move |line: &str| {
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(error) = writeln!(file, "{line}") {
            tracing::warn!("cannot write to log file: {}", error);
        }
    })
}

/// Best-effort cache save, then exit without waiting for in-flight work.
fn interrupted(engine: &Engine) -> ! {
    engine
        .messages()
        .warning(format!("{}: interrupted", engine.settings().title));
    match engine.save_cache_now() {
        Ok(true) => eprintln!("rmirror: interrupted, destination cache saved"),
        Ok(false) => eprintln!("rmirror: interrupted"),
        Err(error) => eprintln!("rmirror: interrupted, cannot save destination cache: {error}"),
    }
    std::process::exit(130);
}

#[instrument]
async fn async_main(args: Args) -> Result<RunSummary> {
    let mirrors = args.mirrors()?;
    let log = args.log.as_deref().map(open_log).transpose()?;
    let progress = args.progress_settings();
    let mut total = RunSummary::default();
    let mut failed = 0;
    for settings in mirrors.iter().cloned() {
        let messages = Arc::new(match &log {
            Some(file) => MessageLog::with_sink(log_sink(file.clone())),
            None => MessageLog::new(),
        });
        let engine = Engine::new(settings, messages);
        let stop = Arc::new(tokio::sync::Notify::new());
        let reporter = progress.clone().map(|settings| {
            tokio::spawn(common::progress::report(
                settings,
                engine.printer(),
                stop.clone(),
            ))
        });
        let result = tokio::select! {
            result = engine.run() => result,
            _ = tokio::signal::ctrl_c() => interrupted(&engine),
        };
        stop.notify_one();
        if let Some(reporter) = reporter {
            match reporter.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!("progress reporting failed: {:#}", error),
                Err(error) => tracing::error!("progress task failed: {}", error),
            }
        }
        match result {
            Ok(summary) => total = total + summary,
            Err(error) => {
                tracing::error!("{:#}", anyhow::Error::from(error));
                failed += 1;
            }
        }
    }
    if failed > 0 {
        if args.summary {
            return Err(anyhow!(
                "{} of {} mirrors failed\n\n{}",
                failed,
                mirrors.len(),
                &total
            ));
        }
        return Err(anyhow!("{} of {} mirrors failed", failed, mirrors.len()));
    }
    Ok(total)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
