use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::batch::{Accumulator, StallDetector};
use crate::output::BatchWriter;
use crate::settings::Settings;
use crate::source::ProductSource;

/// Knobs of the polling loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub batch_size: usize,
    pub max_products: usize,
    pub stall_threshold: u32,
    pub settle_delay: Duration,
}

impl From<&Settings> for LoopConfig {
    fn from(s: &Settings) -> Self {
        LoopConfig {
            batch_size: s.batch_size,
            max_products: s.max_products,
            stall_threshold: s.stall_threshold,
            settle_delay: s.settle_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LimitExceeded,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Polling,
    Stalled,
    Aborted(AbortReason),
    Done,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Stalled,
    LimitExceeded,
    Interrupted,
}

#[derive(Debug)]
pub struct RunSummary {
    pub termination: Termination,
    pub total_products: usize,
    pub total_batches: u32,
    pub failed_batches: u32,
    pub polls: usize,
    pub source_errors: usize,
    pub batch_folder: PathBuf,
    /// `None` when interrupted or when the final write failed.
    pub final_output: Option<PathBuf>,
}

/// Drives a `ProductSource` until it stops growing, flushing batches as it
/// goes. Single-threaded: every step is awaited in order.
pub struct Extractor<'a, S> {
    source: &'a mut S,
    writer: BatchWriter,
    acc: Accumulator,
    stall: StallDetector,
    config: LoopConfig,
    interrupt: Arc<AtomicBool>,
    progress: ProgressBar,
    polls: usize,
    source_errors: usize,
}

impl<'a, S: ProductSource + Send> Extractor<'a, S> {
    pub fn new(
        source: &'a mut S,
        writer: BatchWriter,
        config: LoopConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let progress = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            progress.set_style(style);
        }
        Extractor {
            source,
            acc: Accumulator::new(config.batch_size),
            stall: StallDetector::new(config.stall_threshold),
            writer,
            config,
            interrupt,
            progress,
            polls: 0,
            source_errors: 0,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(mut self) -> RunSummary {
        info!(
            "Starting batch extraction (batch size {}, ceiling {}, stall after {} polls)",
            self.config.batch_size, self.config.max_products, self.config.stall_threshold
        );

        let mut state = LoopState::Polling;
        let mut termination = Termination::Stalled;
        while state != LoopState::Done {
            state = match state {
                LoopState::Polling => self.poll().await,
                LoopState::Stalled => {
                    info!("No new products loading. Processing final batch.");
                    self.extract(true).await;
                    termination = Termination::Stalled;
                    LoopState::Done
                }
                LoopState::Aborted(AbortReason::LimitExceeded) => {
                    warn!(
                        "Reached maximum product limit ({}). Stopping extraction.",
                        self.config.max_products
                    );
                    self.extract(true).await;
                    termination = Termination::LimitExceeded;
                    LoopState::Done
                }
                LoopState::Aborted(AbortReason::Interrupted) => {
                    warn!("Interrupted; flushing pending products, skipping final output");
                    self.extract(true).await;
                    return self.finish(Termination::Interrupted, None);
                }
                LoopState::Done => LoopState::Done,
            };
        }

        let final_output = match self.writer.write_final(self.acc.records()) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Error creating final output: {}", e);
                None
            }
        };
        self.finish(termination, final_output)
    }

    /// One reveal → settle → count cycle. Returns the next state.
    async fn poll(&mut self) -> LoopState {
        if self.interrupt.load(Ordering::SeqCst) {
            return LoopState::Aborted(AbortReason::Interrupted);
        }
        self.polls += 1;

        if let Err(e) = self.source.reveal_more().await {
            self.source_errors += 1;
            warn!("Poll {}: reveal failed: {}", self.polls, e);
        }
        tokio::time::sleep(self.config.settle_delay).await;

        let count = match self.source.count().await {
            Ok(n) => n,
            Err(e) => {
                self.source_errors += 1;
                warn!("Poll {}: count failed, treating as unchanged: {}", self.polls, e);
                self.stall.last_count()
            }
        };
        debug!("Current products loaded: {}", count);
        self.progress
            .set_message(format!("{} loaded, {} extracted", count, self.acc.len()));
        self.progress.tick();

        if self.stall.observe(count) {
            return LoopState::Stalled;
        }
        if self.stall.consecutive_same() > 0 {
            debug!(
                "No new products ({}/{})",
                self.stall.consecutive_same(),
                self.config.stall_threshold
            );
        }

        if self.acc.pending_against(count) >= self.config.batch_size {
            self.extract(false).await;
        }

        if count > self.config.max_products {
            return LoopState::Aborted(AbortReason::LimitExceeded);
        }
        LoopState::Polling
    }

    /// Snapshot the page, absorb the new tail and write whatever batches it
    /// completes. A failed snapshot counts as empty.
    async fn extract(&mut self, force: bool) {
        let snapshot = match self.source.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                self.source_errors += 1;
                warn!("Error extracting products, treating as empty: {}", e);
                Vec::new()
            }
        };
        let ingest = self.acc.ingest(snapshot, force);
        if ingest.new_records > 0 {
            info!(
                "Extracted {} new products ({} total)",
                ingest.new_records,
                self.acc.len()
            );
        }
        self.write_batches(ingest.batches);
    }

    fn write_batches(&mut self, batches: Vec<Range<usize>>) {
        for range in batches {
            let products = &self.acc.records()[range.clone()];
            if let Err(e) = self.writer.write_batch(products, range.end) {
                error!(
                    "Error saving batch ({} products not persisted): {}",
                    products.len(),
                    e
                );
            }
        }
    }

    fn finish(self, termination: Termination, final_output: Option<PathBuf>) -> RunSummary {
        self.progress.finish_and_clear();
        let summary = RunSummary {
            termination,
            total_products: self.acc.len(),
            total_batches: self.writer.written(),
            failed_batches: self.writer.failed(),
            polls: self.polls,
            source_errors: self.source_errors,
            batch_folder: self.writer.batch_folder().to_path_buf(),
            final_output,
        };
        info!(
            "Extraction finished ({:?}): {} products, {} batches",
            summary.termination, summary.total_products, summary.total_batches
        );
        summary
    }
}
