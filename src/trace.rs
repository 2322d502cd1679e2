/// Per-instance diagnostic channel. No global state: every component
/// that traces holds its own handle, default off.
#[derive(Debug, Clone, Default)]
pub struct TraceSink {
    verbose: u8,
    label: &'static str,
}

impl TraceSink {
    pub fn new(label: &'static str, verbose: u8) -> Self {
        Self { verbose, label }
    }

    pub fn off() -> Self {
        Self::default()
    }

    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    pub fn enabled(&self) -> bool {
        self.verbose > 0
    }

    /// Emit a line when tracing is on. The closure keeps formatting off
    /// the hot path.
    pub fn note<F: FnOnce() -> String>(&self, message: F) {
        if self.verbose > 0 {
            eprintln!("[{}] {}", self.label, message());
        }
    }

    /// Emit only at the given verbosity or higher.
    pub fn note_at<F: FnOnce() -> String>(&self, level: u8, message: F) {
        if self.verbose >= level {
            eprintln!("[{}] {}", self.label, message());
        }
    }
}
