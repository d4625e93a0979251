//! Exactly-once setup, readiness and teardown of the per-category sinks.

use {
    crate::{
        clock::{Clock, SystemClock},
        config::{Config, LogMode},
        console::ConsoleSink,
        dedup::DeduplicatingLogger,
        naming::BackupNaming,
        retention::{Compression, RetentionPolicy},
        sink::{LogSink, RotatingFileSinkBuilder, RotationSize},
        LogError,
    },
    std::{
        backtrace::Backtrace,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
        },
        thread,
    },
    tracing::{debug, warn},
};

/// Host directory used in volume mode when the host name can't be resolved.
pub const DEFAULT_HOST_NAME: &str = "logkeeper";

/// The log streams a context writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Access,
    Error,
    Slow,
    Stat,
}

impl Category {
    /// Every category, in shutdown order.
    pub const ALL: [Category; 4] = [Category::Access, Category::Error, Category::Slow, Category::Stat];

    pub fn file_name(&self) -> &'static str {
        match self {
            Category::Access => "access.log",
            Category::Error => "error.log",
            Category::Slow => "slow.log",
            Category::Stat => "stat.log",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn console(self) -> ConsoleSink {
        match self {
            Category::Access | Category::Stat => ConsoleSink::info(),
            Category::Error => ConsoleSink::error(),
            Category::Slow => ConsoleSink::slow(),
        }
    }
}

enum SetupState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(LogError),
}

struct Sinks {
    /// Indexed by [`Category::index`].
    by_category: Vec<Arc<dyn LogSink>>,
    stack: DeduplicatingLogger,
}

impl Sinks {
    fn get(&self, category: Category) -> &Arc<dyn LogSink> {
        &self.by_category[category.index()]
    }
}

/// The handle every log call goes through.
///
/// A context starts out writing to the console. [`set_up`](Self::set_up)
/// creates the configured sinks once and flips the readiness flag; from then
/// on writes go to the sinks. [`shutdown`](Self::shutdown) closes them.
pub struct LogContext {
    clock: Arc<dyn Clock>,
    ready: AtomicBool,
    state: Mutex<SetupState>,
    resolved: Condvar,
    sinks: OnceLock<Sinks>,
}

impl Default for LogContext {
    fn default() -> Self {
        LogContext::new()
    }
}

impl LogContext {
    pub fn new() -> Self {
        LogContext::with_clock(Arc::new(SystemClock))
    }

    /// A context whose sinks and stack-trace cooldown read time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        LogContext {
            clock,
            ready: AtomicBool::new(false),
            state: Mutex::new(SetupState::Uninitialized),
            resolved: Condvar::new(),
            sinks: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SetupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the sinks described by `config`.
    ///
    /// Only the first call does any work. Calls racing with it wait for it to
    /// finish; every later call returns the same outcome, including the same
    /// error, whatever config it passes.
    pub fn set_up(&self, config: &Config) -> Result<(), LogError> {
        let mut state = self.lock();
        loop {
            match &*state {
                SetupState::Uninitialized => break,
                SetupState::Initializing => {}
                SetupState::Ready => return Ok(()),
                SetupState::Failed(err) => return Err(err.clone()),
            }
            state = self.resolved.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state = SetupState::Initializing;
        drop(state);

        let _unwinding = UnwindGuard(self);
        let outcome = self.build(config);

        let mut state = self.lock();
        let result = match outcome {
            Ok(sinks) => {
                if self.sinks.set(sinks).is_err() {
                    // Unreachable: only the initializing caller gets here.
                    warn!("log sinks were already set");
                }
                self.ready.store(true, Ordering::Release);
                *state = SetupState::Ready;
                debug!(mode = ?config.mode, "logging ready");
                Ok(())
            }
            Err(err) => {
                *state = SetupState::Failed(err.clone());
                Err(err)
            }
        };
        self.resolved.notify_all();
        result
    }

    fn build(&self, config: &Config) -> Result<Sinks, LogError> {
        match config.mode {
            LogMode::Console => Ok(self.console_sinks(config)),
            LogMode::File => {
                if config.path.as_os_str().is_empty() {
                    return Err(LogError::PathNotSet);
                }
                self.file_sinks(&config.path, config)
            }
            LogMode::Volume => {
                if config.namespace.is_empty() {
                    return Err(LogError::NamespaceNotSet);
                }
                self.file_sinks(&volume_directory(config), config)
            }
        }
    }

    fn console_sinks(&self, config: &Config) -> Sinks {
        let info: Arc<dyn LogSink> = Arc::new(ConsoleSink::info());
        let error: Arc<dyn LogSink> = Arc::new(ConsoleSink::error());
        let slow: Arc<dyn LogSink> = Arc::new(ConsoleSink::slow());
        Sinks {
            stack: DeduplicatingLogger::new(error.clone(), config.stack_cooldown(), self.clock.clone()),
            by_category: vec![info.clone(), error, slow, info],
        }
    }

    fn file_sinks(&self, directory: &Path, config: &Config) -> Result<Sinks, LogError> {
        let naming = BackupNaming::default()
            .with_granularity(config.rotation)
            .with_time_zone(config.time_zone);
        let mut policy = RetentionPolicy::new(naming).keep_days(config.keep_days);
        if config.compress {
            policy = policy.compression(Compression::Gzip);
        }
        if let Some(mode) = config.file_mode {
            policy = policy.file_mode(mode);
        }
        let policy = Arc::new(policy);

        let mut by_category: Vec<Arc<dyn LogSink>> = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let mut builder = RotatingFileSinkBuilder::new(directory.join(category.file_name()))
                .policy(policy.clone())
                .clock(self.clock.clone());
            if let Some(max_size) = config.max_size {
                builder = builder.max_size(RotationSize::Bytes(max_size));
            }
            match builder.build() {
                Ok(sink) => by_category.push(Arc::new(sink)),
                Err(err) => {
                    // Leave nothing half-open behind a failed setup.
                    for sink in &by_category {
                        let _ = sink.close();
                    }
                    return Err(err);
                }
            }
        }

        let error = by_category[Category::Error.index()].clone();
        Ok(Sinks {
            stack: DeduplicatingLogger::new(error, config.stack_cooldown(), self.clock.clone()),
            by_category,
        })
    }

    /// Whether setup has completed successfully. Never goes back to `false`.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn ready_sinks(&self) -> Option<&Sinks> {
        if self.is_ready() {
            self.sinks.get()
        } else {
            None
        }
    }

    /// Write `bytes` to `category`, or to the console before setup.
    pub fn write(&self, category: Category, bytes: &[u8]) -> Result<(), LogError> {
        match self.ready_sinks() {
            Some(sinks) => sinks.get(category).write(bytes).map(|_| ()),
            None => category.console().write(bytes).map(|_| ()),
        }
    }

    /// Write a stack-trace message through the cooldown. Never fails.
    pub fn emit_suppressed(&self, bytes: &[u8]) {
        match self.ready_sinks() {
            Some(sinks) => sinks.stack.emit(bytes),
            None => {
                let _ = Category::Error.console().write(bytes);
            }
        }
    }

    /// Like [`emit_suppressed`](Self::emit_suppressed), appending the current
    /// backtrace.
    pub fn emit_stack(&self, message: &str) {
        match self.ready_sinks() {
            Some(sinks) => sinks.stack.emit_stack(message),
            None => {
                let trace = Backtrace::force_capture();
                let _ = Category::Error.console().write(format!("{message}\n{trace}\n").as_bytes());
            }
        }
    }

    /// The stack-trace logger, once ready.
    pub fn stack_logger(&self) -> Option<&DeduplicatingLogger> {
        self.ready_sinks().map(|sinks| &sinks.stack)
    }

    /// Close every sink, access first and stat last.
    ///
    /// A failing close doesn't stop the others; the first error is returned.
    /// Calling this before setup, or again, succeeds and does nothing.
    pub fn shutdown(&self) -> Result<(), LogError> {
        let Some(sinks) = self.sinks.get() else {
            return Ok(());
        };
        let mut first_err = None;
        for category in Category::ALL {
            if let Err(err) = sinks.get(category).close() {
                warn!(?category, %err, "failed to close log sink");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Fails a setup whose `build` panicked, so callers waiting on it wake up.
struct UnwindGuard<'a>(&'a LogContext);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        *self.0.lock() = SetupState::Failed(LogError::InternalError("log setup panicked".to_string()));
        self.0.resolved.notify_all();
    }
}

/// The host directory name for volume mode.
fn host_name() -> String {
    host_name_or_default(resolve_host_name())
}

fn host_name_or_default(resolved: Option<String>) -> String {
    resolved
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST_NAME.to_string())
}

#[cfg(unix)]
fn resolve_host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[cfg(not(unix))]
fn resolve_host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Directory the sinks of a volume-mode `config` write to on this host.
pub fn volume_directory(config: &Config) -> PathBuf {
    config.path.join(&config.namespace).join(host_name())
}
