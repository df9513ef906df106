//! Progress reporting (stage L6).
//!
//! A single ticker samples the shared counters and hands the snapshot to a
//! printer. Two printers exist: a plain text line that overwrites itself
//! with an erase-line prefix, and a drawn bar. While the work set is still
//! empty a spinner shows instead of numbers.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::utils::{format_bytes, format_duration};
use crate::workset::{Statistics, WorkSet};

/// ETA is meaningless before this much of the byte total is in.
const MIN_RATIO_FOR_ETA: f64 = 0.1;
const ERASE_LINE: &str = "\u{1b}[2K\r";
const SPINNER_FRAMES: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const DEFAULT_BAR_SIZE: usize = 20;

/// Renders one statistics snapshot.
pub trait ProgressPrinter: Send + Sync {
    fn print(&self, stats: &Statistics);

    /// Called once when the ticker stops, to leave a clean line.
    fn finish(&self) {
        let mut out = std::io::stdout();
        let _ = write!(out, "{ERASE_LINE}");
        let _ = out.flush();
    }
}

/// Plain text variant.
pub struct TextPrinter;

impl ProgressPrinter for TextPrinter {
    fn print(&self, stats: &Statistics) {
        let line = format_line(stats);
        let mut out = std::io::stdout();
        let _ = write!(out, "{ERASE_LINE}{line}");
        let _ = out.flush();
    }
}

/// Text-graphics variant: the same line behind a drawn bar.
pub struct BarPrinter {
    bar: indicatif::ProgressBar,
}

impl BarPrinter {
    pub fn new(bar_size: usize) -> Self {
        let size = if bar_size == 0 {
            DEFAULT_BAR_SIZE
        } else {
            bar_size
        };
        let bar = indicatif::ProgressBar::new(0);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(&format!("[{{bar:{size}.cyan/blue}}] {{msg}}"))
                .unwrap()
                .progress_chars("█░ "),
        );
        BarPrinter { bar }
    }
}

impl ProgressPrinter for BarPrinter {
    fn print(&self, stats: &Statistics) {
        self.bar.set_length(stats.total_bytes.max(0) as u64);
        self.bar.set_position(stats.progress_bytes.max(0) as u64);
        self.bar.set_message(format_line(stats));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Picks the printer the configuration asks for.
pub fn new_printer(cfg: &Configuration) -> Box<dyn ProgressPrinter> {
    if cfg.progress.with_progress_bar {
        Box::new(BarPrinter::new(cfg.progress.bar_size))
    } else {
        Box::new(TextPrinter)
    }
}

/// The formatting shared by both printers.
fn format_line(stats: &Statistics) -> String {
    format!(
        "{}/{} ({:.2}%). D\\L: {}/{}. Act: {}. Avg: {}/s. ETR: {}",
        format_bytes(stats.progress_bytes),
        format_bytes(stats.total_bytes),
        stats.ratio * 100.0,
        stats.downloaded,
        stats.count,
        stats.active,
        format_bytes(stats.average_speed as i64),
        eta(stats)
    )
}

fn eta(stats: &Statistics) -> String {
    if stats.ratio <= MIN_RATIO_FOR_ETA || stats.average_speed <= 0.0 {
        return "--:--".to_string();
    }
    let remaining = (stats.total_bytes - stats.progress_bytes).max(0) as f64;
    format_duration(Duration::from_secs(
        (remaining / stats.average_speed).round() as u64,
    ))
}

/// Samples the work set on every tick until cancelled.
///
/// Before the lister has admitted anything and no worker is active, a
/// spinner frame is drawn instead of the counters.
pub async fn run_ticker(
    work: Arc<WorkSet>,
    printer: Box<dyn ProgressPrinter>,
    delay: Duration,
    start: Instant,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(delay);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut frame = 0usize;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let stats = work.statistics(start.elapsed());
                if stats.active == 0 && stats.count == 0 {
                    let spinner = SPINNER_FRAMES[frame % SPINNER_FRAMES.len()];
                    frame += 1;
                    let mut out = std::io::stdout();
                    let _ = write!(out, "{ERASE_LINE}{spinner} Waiting for bucket metadata.");
                    let _ = out.flush();
                } else {
                    printer.print(&stats);
                }
            }
        }
    }
    printer.finish();
}
