use std::time::Instant;

use tokio::sync::mpsc;

/// One observation of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Share of the work done, in `0.0..=1.0`.
    pub fraction: f64,
    pub completed: usize,
    pub total: usize,
    /// Units completed per second since the operation started.
    pub rate: f64,
    pub elapsed_secs: f64,
}

impl ProgressSample {
    /// Seconds until completion at the current rate, if any work has been timed.
    pub fn eta_secs(&self) -> Option<f64> {
        if self.rate > 0.0 {
            Some(self.total.saturating_sub(self.completed) as f64 / self.rate)
        } else {
            None
        }
    }
}

/// Receives progress samples. Closures implement it directly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, sample: ProgressSample);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressSample) + Send + Sync,
{
    fn report(&self, sample: ProgressSample) {
        self(sample)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _sample: ProgressSample) {}
}

/// Forwards samples to an unbounded channel; samples are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressSample>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, sample: ProgressSample) {
        let _ = self.tx.send(sample);
    }
}

/// Turns completed-unit counts into [`ProgressSample`]s for a fixed total.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    started: Instant,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        Self {
            sink,
            total,
            started: Instant::now(),
        }
    }

    /// Report `completed` units done. Nothing is emitted before the first unit finishes.
    pub fn update(&self, completed: usize) {
        if completed == 0 || self.total == 0 {
            return;
        }
        let completed = completed.min(self.total);
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        let rate = if elapsed_secs > 0.0 {
            completed as f64 / elapsed_secs
        } else {
            0.0
        };
        self.sink.report(ProgressSample {
            fraction: completed as f64 / self.total as f64,
            completed,
            total: self.total,
            rate,
            elapsed_secs,
        });
    }
}
