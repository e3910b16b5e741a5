//! Bounded Batch Processor
//!
//! Splits a list into contiguous chunks and runs them in waves of at most
//! `max_concurrency` concurrent calls, awaiting each wave before starting
//! the next. A failing chunk fails the whole call immediately; chunks from
//! earlier waves are not rolled back. There is no deadline of its own.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::Serialize;

use crate::config::BatchConfig;
use crate::error::DbResult;
use crate::scaling::ScalablePool;
use crate::telemetry::metrics::with_metrics;

/// Cumulative progress reported after each wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Items in finished chunks
    pub completed: usize,
    pub total: usize,
    /// Waves finished so far
    pub wave: usize,
}

/// Position of a chunk, passed to the processor function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchContext {
    /// Zero-based index of the chunk across the whole call
    pub batch_index: usize,
    /// Zero-based wave the chunk belongs to
    pub wave: usize,
}

// ============================================================================
// BATCH SIZING
// ============================================================================

/// Chooses the chunk size before each wave.
pub trait BatchSizer: Send + Sync {
    fn next_batch_size(&self, configured: usize) -> usize;
}

/// Always the configured size.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBatchSize;

impl BatchSizer for FixedBatchSize {
    fn next_batch_size(&self, configured: usize) -> usize {
        configured
    }
}

/// Halves the chunk size while a pressure probe reads above `threshold`,
/// then doubles back toward the configured size once it drops.
pub struct PressureAwareSizer {
    probe: Box<dyn Fn() -> f64 + Send + Sync>,
    threshold: f64,
    min_size: usize,
    current: AtomicUsize,
}

impl std::fmt::Debug for PressureAwareSizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureAwareSizer")
            .field("threshold", &self.threshold)
            .field("min_size", &self.min_size)
            .field("current", &self.current.load(Ordering::Relaxed))
            .finish()
    }
}

impl PressureAwareSizer {
    pub fn new(probe: impl Fn() -> f64 + Send + Sync + 'static, threshold: f64) -> Self {
        Self {
            probe: Box::new(probe),
            threshold,
            min_size: 1,
            current: AtomicUsize::new(0),
        }
    }

    /// Use pool utilization as the pressure signal.
    pub fn for_pool(pool: Arc<dyn ScalablePool>, threshold: f64) -> Self {
        Self::new(move || pool.sample().utilization, threshold)
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size.max(1);
        self
    }
}

impl BatchSizer for PressureAwareSizer {
    fn next_batch_size(&self, configured: usize) -> usize {
        let current = match self.current.load(Ordering::Relaxed) {
            0 => configured,
            n => n,
        };
        let pressure = (self.probe)();
        let next = if pressure > self.threshold {
            (current / 2).max(self.min_size)
        } else {
            current.saturating_mul(2).min(configured)
        }
        .max(1);
        if next != current {
            tracing::debug!(pressure, from = current, to = next, "Adjusted batch size");
        }
        self.current.store(next, Ordering::Relaxed);
        next
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    sizer: Arc<dyn BatchSizer>,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .finish()
    }
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sizer: Arc::new(FixedBatchSize),
        })
    }

    pub fn with_sizer(mut self, sizer: Arc<dyn BatchSizer>) -> Self {
        self.sizer = sizer;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run `processor` over every chunk. Results are concatenated in input
    /// order.
    pub async fn process<T, R, E, F, Fut>(&self, items: Vec<T>, processor: F) -> Result<Vec<R>, E>
    where
        F: Fn(Vec<T>, BatchContext) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
        E: std::fmt::Display,
    {
        self.process_with_progress(items, processor, |_| {}).await
    }

    /// Like [`BatchProcessor::process`], calling `on_progress` after each
    /// wave.
    pub async fn process_with_progress<T, R, E, F, Fut, P>(
        &self,
        items: Vec<T>,
        processor: F,
        mut on_progress: P,
    ) -> Result<Vec<R>, E>
    where
        F: Fn(Vec<T>, BatchContext) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
        E: std::fmt::Display,
        P: FnMut(BatchProgress),
    {
        let total = items.len();
        let mut remaining = items.into_iter();
        let mut results = Vec::with_capacity(total);
        let mut completed = 0usize;
        let mut wave = 0usize;
        let mut batch_index = 0usize;
        let processor = &processor;

        while completed < total {
            let size = self.sizer.next_batch_size(self.config.batch_size).max(1);
            let mut chunks = Vec::with_capacity(self.config.max_concurrency);
            for _ in 0..self.config.max_concurrency {
                let chunk: Vec<T> = remaining.by_ref().take(size).collect();
                if chunk.is_empty() {
                    break;
                }
                chunks.push((batch_index, chunk));
                batch_index += 1;
            }
            let wave_items: usize = chunks.iter().map(|(_, chunk)| chunk.len()).sum();

            let calls = chunks.into_iter().map(move |(index, chunk)| {
                let call = processor(
                    chunk,
                    BatchContext {
                        batch_index: index,
                        wave,
                    },
                );
                async move {
                    let result = call.await;
                    with_metrics(|m| m.record_batch_chunk(result.is_ok()));
                    result
                }
            });

            let outputs = match try_join_all(calls).await {
                Ok(outputs) => outputs,
                Err(e) => {
                    tracing::warn!(wave, completed, total, error = %e, "Batch chunk failed");
                    return Err(e);
                }
            };
            results.extend(outputs.into_iter().flatten());

            completed += wave_items;
            wave += 1;
            on_progress(BatchProgress {
                completed,
                total,
                wave,
            });
        }

        tracing::debug!(total, waves = wave, batches = batch_index, "Batch processing complete");
        Ok(results)
    }
}
