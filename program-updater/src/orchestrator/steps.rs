use crate::report::ProgressSink;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Steps each file contributes: download, verify, replace.
pub const STEPS_PER_FILE: usize = 3;

/// Overall progress of one run, expressed in whole steps.
///
/// Reported percentages never decrease, even when several downloads report
/// partial progress at once.
pub struct StepCounter {
    total: usize,
    done: AtomicUsize,
    highest: AtomicU8,
    sink: Arc<dyn ProgressSink>,
}

impl StepCounter {
    pub fn new(file_count: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            total: file_count * STEPS_PER_FILE,
            done: AtomicUsize::new(0),
            highest: AtomicU8::new(0),
            sink,
        }
    }

    /// Mark `steps` as finished and report.
    pub fn complete(&self, steps: usize, label: &str) {
        self.done.fetch_add(steps, Ordering::SeqCst);
        self.partial(0.0, label);
    }

    /// Report progress within the next unfinished step; `fraction` is 0..=1.
    pub fn partial(&self, fraction: f64, label: &str) {
        let done = self.done.load(Ordering::SeqCst) as f64;
        let percent = if self.total == 0 {
            100
        } else {
            ((done + fraction.clamp(0.0, 1.0)) * 100.0 / self.total as f64)
                .floor()
                .min(100.0) as u8
        };
        let previous = self.highest.fetch_max(percent, Ordering::SeqCst);
        self.sink.on_progress(percent.max(previous), label);
    }

    /// Report the final 100%.
    pub fn finish(&self, label: &str) {
        self.highest.store(100, Ordering::SeqCst);
        self.sink.on_progress(100, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u8>>);

    impl ProgressSink for Recorder {
        fn on_progress(&self, percent: u8, _label: &str) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn test_rescales_into_step_window() {
        let recorder = Arc::new(Recorder::default());
        let counter = StepCounter::new(2, recorder.clone());

        counter.partial(0.5, "a: Downloading... 50%");
        counter.complete(1, "a downloaded");
        counter.complete(1, "a verified");
        counter.partial(0.5, "b: Downloading... 50%");

        // 6 steps: 0.5/6, 1/6, 2/6, 2.5/6
        assert_eq!(*recorder.0.lock().unwrap(), vec![8, 16, 33, 41]);
    }

    #[test]
    fn test_never_goes_backwards() {
        let recorder = Arc::new(Recorder::default());
        let counter = StepCounter::new(1, recorder.clone());

        counter.partial(0.9, "fast");
        counter.partial(0.1, "slow");
        counter.finish("done");

        assert_eq!(*recorder.0.lock().unwrap(), vec![30, 30, 100]);
    }
}
