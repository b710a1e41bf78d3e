use crossbeam_channel::{unbounded, Receiver, Sender};

/// Severity attached to [`Signal::Log`] messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Events the core emits to the surrounding shell.
///
/// Fire-and-forget: emission never blocks and a disconnected receiver is not
/// an error, so the core keeps running if the shell stops listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    IndexingStarted,
    IndexingFinished,
    ProgressUpdated { current: usize, total: usize },
    WatcherStopped,
    CriticalError { title: String, message: String },
    Log { severity: Severity, message: String },
}

/// Cloneable producer half of the signal channel.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: Sender<Signal>,
}

impl SignalHub {
    pub fn new() -> (Self, Receiver<Signal>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// A hub whose receiver has been dropped; useful in tests.
    pub fn disconnected() -> Self {
        let (hub, _rx) = Self::new();
        hub
    }

    pub fn emit(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    pub fn progress(&self, current: usize, total: usize) {
        self.emit(Signal::ProgressUpdated { current, total });
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        self.emit(Signal::Log {
            severity,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Severity::Error, message);
    }

    pub fn critical_error(&self, title: impl Into<String>, message: impl Into<String>) {
        self.emit(Signal::CriticalError {
            title: title.into(),
            message: message.into(),
        });
    }
}
