use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{event, instrument, Level};

use crate::tree::TreeIndex;

/// Pipeline state of a mirror run. Only ever moves forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RunState {
    Init = 0,
    Scan = 1,
    Match = 2,
    Delete = 3,
    Copy = 4,
    Update = 5,
    Done = 6,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Init,
            1 => RunState::Scan,
            2 => RunState::Match,
            3 => RunState::Delete,
            4 => RunState::Copy,
            5 => RunState::Update,
            _ => RunState::Done,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Scan => "scanning",
            RunState::Match => "matching",
            RunState::Delete => "deleting",
            RunState::Copy => "copying",
            RunState::Update => "updating",
            RunState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, enum_map::Enum)]
pub enum Category {
    Copy,
    Update,
    Delete,
}

#[derive(Debug, Default)]
pub struct CategoryCounters {
    files_queued: AtomicU64,
    bytes_queued: AtomicU64,
    files_done: AtomicU64,
    bytes_done: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryStatus {
    pub files_queued: u64,
    pub bytes_queued: u64,
    pub files_done: u64,
    pub bytes_done: u64,
}

impl CategoryCounters {
    pub fn queue(&self, files: u64, bytes: u64) {
        self.files_queued.fetch_add(files, Ordering::Relaxed);
        self.bytes_queued.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn complete(&self, files: u64, bytes: u64) {
        self.files_done.fetch_add(files, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    #[instrument(skip(self))]
    pub fn get(&self) -> CategoryStatus {
        let mut status = CategoryStatus {
            files_queued: self.files_queued.load(Ordering::Relaxed),
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            files_done: self.files_done.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
        };
        if status.files_done > status.files_queued {
            event!(
                Level::DEBUG,
                "Progress inversion - queued: {}, done {}",
                status.files_queued,
                status.files_done
            );
            status.files_queued = status.files_done;
        }
        status.bytes_queued = status.bytes_queued.max(status.bytes_done);
        status
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0)
}

#[derive(Debug)]
pub struct Progress {
    state: AtomicU8,
    counters: enum_map::EnumMap<Category, CategoryCounters>,
    pub directories_to_copy: AtomicU64,
    pub directories_copied: AtomicU64,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Init as u8),
            counters: Default::default(),
            directories_to_copy: AtomicU64::new(0),
            directories_copied: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the run is already at or past it.
    pub fn advance(&self, next: RunState) -> bool {
        let advanced = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok();
        if advanced {
            event!(Level::DEBUG, "run state: {}", next);
        }
        advanced
    }

    pub fn category(&self, category: Category) -> &CategoryCounters {
        &self.counters[category]
    }

    fn fraction(&self, pick: impl Fn(&CategoryStatus) -> (u64, u64)) -> f64 {
        match self.state() {
            RunState::Init | RunState::Scan | RunState::Match => 0.0,
            RunState::Delete => {
                let (done, total) = pick(&self.counters[Category::Delete].get());
                ratio(done, total)
            }
            RunState::Copy | RunState::Update => {
                let (copy_done, copy_total) = pick(&self.counters[Category::Copy].get());
                let (update_done, update_total) = pick(&self.counters[Category::Update].get());
                ratio(copy_done + update_done, copy_total + update_total)
            }
            RunState::Done => 1.0,
        }
    }

    pub fn byte_fraction(&self) -> f64 {
        self.fraction(|status| (status.bytes_done, status.bytes_queued))
    }

    pub fn file_fraction(&self) -> f64 {
        self.fraction(|status| (status.files_done, status.files_queued))
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text updates, appropriate for logging
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    /// Resolves `Auto` against stderr and applies the default delay of the chosen type.
    pub fn resolve(&self) -> anyhow::Result<(ProgressType, std::time::Duration)> {
        use std::io::IsTerminal;
        let progress_type = match self.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay {:?}: {}", delay, err))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        Ok((progress_type, delay))
    }
}

pub struct ProgressPrinter {
    progress: Arc<Progress>,
    source: Arc<TreeIndex>,
    destination: Arc<TreeIndex>,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl ProgressPrinter {
    pub fn new(
        progress: Arc<Progress>,
        source: Arc<TreeIndex>,
        destination: Arc<TreeIndex>,
    ) -> Self {
        let last_bytes = Self::bytes_done(&progress);
        Self {
            progress,
            source,
            destination,
            last_bytes,
            last_update: std::time::Instant::now(),
        }
    }

    fn bytes_done(progress: &Progress) -> u64 {
        progress.category(Category::Copy).get().bytes_done
            + progress.category(Category::Update).get().bytes_done
    }

    /// One line summary, used as the progress bar message.
    pub fn status_line(&self) -> String {
        let state = self.progress.state();
        let entity = match state {
            RunState::Scan => self.source.current_entity(),
            _ => self.destination.current_entity(),
        };
        format!(
            "{} {:>5.1}% | {}",
            state,
            self.progress.byte_fraction() * 100.0,
            entity
        )
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let bytes = Self::bytes_done(&self.progress);
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes.min(bytes)) as f64 / curr_duration_secs;
        // update self
        self.last_bytes = bytes;
        self.last_update = time_now;
        let copy = self.progress.category(Category::Copy).get();
        let update = self.progress.category(Category::Update).get();
        let delete = self.progress.category(Category::Delete).get();
        Ok(format!(
            "---------------------\n\
            STATE: {} ({:.1}% bytes, {:.1}% files)\n\
            -----------------------\n\
            INDEXED:\n\
            source:      {:>10} files {:>10}\n\
            destination: {:>10} files {:>10}\n\
            -----------------------\n\
            TRANSFER:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            -----------------------\n\
            COPY:        {:>10} / {:<10} files {:>10} / {:<10}\n\
            directories: {:>10} / {:<10}\n\
            UPDATE:      {:>10} / {:<10} files {:>10} / {:<10}\n\
            DELETE:      {:>10} / {:<10} files {:>10} / {:<10}\n\
            -----------------------\n\
            current: {}",
            self.progress.state(),
            self.progress.byte_fraction() * 100.0,
            self.progress.file_fraction() * 100.0,
            // indexed
            self.source.files(),
            bytesize::ByteSize(self.source.size().max(0) as u64),
            self.destination.files(),
            bytesize::ByteSize(self.destination.size().max(0) as u64),
            // rates
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            // queues
            copy.files_done,
            copy.files_queued,
            bytesize::ByteSize(copy.bytes_done),
            bytesize::ByteSize(copy.bytes_queued),
            self.progress.directories_copied.load(Ordering::Relaxed),
            self.progress.directories_to_copy.load(Ordering::Relaxed),
            update.files_done,
            update.files_queued,
            bytesize::ByteSize(update.bytes_done),
            bytesize::ByteSize(update.bytes_queued),
            delete.files_done,
            delete.files_queued,
            bytesize::ByteSize(delete.bytes_done),
            bytesize::ByteSize(delete.bytes_queued),
            self.status_line(),
        ))
    }
}

/// Reports progress until `stop` is notified.
pub async fn report(
    settings: ProgressSettings,
    mut printer: ProgressPrinter,
    stop: Arc<tokio::sync::Notify>,
) -> anyhow::Result<()> {
    let (progress_type, delay) = settings.resolve()?;
    match progress_type {
        ProgressType::ProgressBar | ProgressType::Auto => {
            let bar = indicatif::ProgressBar::new(1000);
            bar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}",
                )?
                .progress_chars("=> "),
            );
            loop {
                bar.set_position((printer.progress.byte_fraction() * 1000.0) as u64);
                bar.set_message(printer.status_line());
                bar.tick();
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            bar.finish_and_clear();
        }
        ProgressType::TextUpdates => loop {
            tokio::select! {
                _ = stop.notified() => break,
                _ = tokio::time::sleep(delay) => eprintln!("{}", printer.print()?),
            }
        },
    }
    Ok(())
}
