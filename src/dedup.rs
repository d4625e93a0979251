//! Rate limiting for stack-trace output.
//!
//! A recovered panic that fires on every request would otherwise write a full
//! stack trace per request. [`DeduplicatingLogger`] lets one message through
//! per cooldown and counts the rest. The window is global per logger and does
//! not look at message content, so memory stays constant however many
//! distinct messages arrive.

use {
    crate::{clock::Clock, sink::LogSink},
    chrono::{DateTime, Utc},
    std::{
        backtrace::Backtrace,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tracing::warn,
};

struct SuppressionWindow {
    last_emission: Option<DateTime<Utc>>,
    /// Messages dropped since the last emission.
    suppressed: u64,
    emitted: u64,
}

/// Writes at most one message per cooldown to the wrapped sink.
pub struct DeduplicatingLogger {
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    window: Mutex<SuppressionWindow>,
}

impl DeduplicatingLogger {
    /// A zero `cooldown` lets every message through.
    pub fn new(sink: Arc<dyn LogSink>, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        DeduplicatingLogger {
            sink,
            clock,
            cooldown,
            window: Mutex::new(SuppressionWindow {
                last_emission: None,
                suppressed: 0,
                emitted: 0,
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Messages dropped since the last emission.
    pub fn suppressed(&self) -> u64 {
        self.lock().suppressed
    }

    /// Messages written since creation.
    pub fn emitted(&self) -> u64 {
        self.lock().emitted
    }

    fn lock(&self) -> MutexGuard<'_, SuppressionWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check and update the window in one step. Returns the number of
    /// messages dropped before this one if it may be written.
    fn admit(&self) -> Option<u64> {
        let mut window = self.lock();
        let now = self.clock.now();
        let due = self.cooldown.is_zero()
            || window.last_emission.map_or(true, |last| {
                // A clock that went backwards counts as no time elapsed.
                now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO) >= self.cooldown
            });
        if !due {
            window.suppressed += 1;
            return None;
        }
        window.last_emission = Some(now);
        window.emitted += 1;
        Some(std::mem::take(&mut window.suppressed))
    }

    /// Write `message` unless a previous message was written less than one
    /// cooldown ago. Never fails; write errors are logged and dropped.
    pub fn emit(&self, message: &[u8]) {
        if let Some(discarded) = self.admit() {
            self.write(discarded, message);
        }
    }

    /// Like [`emit`](Self::emit), with the current thread's backtrace appended.
    /// The backtrace is only captured for messages that get written.
    pub fn emit_stack(&self, message: &str) {
        if let Some(discarded) = self.admit() {
            let trace = Backtrace::force_capture();
            self.write(discarded, format!("{message}\n{trace}\n").as_bytes());
        }
    }

    /// The notice and the message go out in one write so nothing lands
    /// between them.
    fn write(&self, discarded: u64, message: &[u8]) {
        let mut buf = Vec::with_capacity(message.len() + 48);
        if discarded > 0 {
            buf.extend_from_slice(format!("discarded {discarded} stack-trace messages\n").as_bytes());
        }
        buf.extend_from_slice(message);
        if let Err(err) = self.sink.write(&buf) {
            warn!(%err, "failed to write stack trace");
        }
    }
}
