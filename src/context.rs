//! Process-wide engine state: which backends are up, the eager-execution
//! flag, the logging level and the gradient-context depth. All of it lives
//! in one lazily initialized [`Context`] so startup and shutdown have a
//! single owner.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use tracing::info;

/// Bitmask selecting which backends to initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendMask(pub u8);

impl BackendMask {
    pub const CPU: BackendMask = BackendMask(0b01);
    pub const GPU: BackendMask = BackendMask(0b10);
    pub const BOTH: BackendMask = BackendMask(0b11);

    pub fn contains(self, other: BackendMask) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Logging verbosity, one process-wide filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

pub(crate) struct Context {
    initialized: AtomicU8,
    eager: AtomicBool,
    log_level: AtomicU8,
    gradient_depth: AtomicUsize,
}

pub(crate) static CONTEXT: Lazy<Context> = Lazy::new(|| Context {
    initialized: AtomicU8::new(0),
    eager: AtomicBool::new(false),
    log_level: AtomicU8::new(LogLevel::Warning as u8),
    gradient_depth: AtomicUsize::new(0),
});

impl Context {
    pub(crate) fn mark_initialized(&self, mask: BackendMask) {
        self.initialized.fetch_or(mask.0, Ordering::SeqCst);
    }

    pub(crate) fn mark_uninitialized(&self, mask: BackendMask) {
        self.initialized.fetch_and(!mask.0, Ordering::SeqCst);
    }

    pub(crate) fn initialized(&self) -> BackendMask {
        BackendMask(self.initialized.load(Ordering::SeqCst))
    }
}

/// Backends that have been initialized so far.
pub fn initialized_backends() -> BackendMask {
    CONTEXT.initialized()
}

/// Turns eager execution on or off. While on, every builder executes its
/// node immediately after construction.
pub fn set_eager_execution(on: bool) {
    CONTEXT.eager.store(on, Ordering::SeqCst);
    info!(eager = on, "eager execution toggled");
}

pub fn is_eager_execution() -> bool {
    CONTEXT.eager.load(Ordering::SeqCst)
}

pub fn set_logging_level(level: LogLevel) {
    CONTEXT.log_level.store(level as u8, Ordering::SeqCst);
}

pub fn logging_level() -> LogLevel {
    match CONTEXT.log_level.load(Ordering::SeqCst) {
        0 => LogLevel::None,
        1 => LogLevel::Error,
        2 => LogLevel::Warning,
        3 => LogLevel::Info,
        4 => LogLevel::Verbose,
        _ => LogLevel::Debug,
    }
}

/// Installs a `tracing` subscriber honoring `level`. Optional; embedders
/// that already have a subscriber should skip this and call
/// [`set_logging_level`] only.
pub fn init_logging(level: LogLevel) {
    set_logging_level(level);
    let filter = match level {
        LogLevel::None => tracing_subscriber::filter::LevelFilter::OFF,
        LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        LogLevel::Warning => tracing_subscriber::filter::LevelFilter::WARN,
        LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
        LogLevel::Verbose => tracing_subscriber::filter::LevelFilter::DEBUG,
        LogLevel::Debug => tracing_subscriber::filter::LevelFilter::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .try_init();
}

/// Enters the gradient context. Nestable; bookkeeping for new nodes stays
/// on until every nested context has been left.
pub fn start_gradient_context() {
    CONTEXT.gradient_depth.fetch_add(1, Ordering::SeqCst);
}

/// Leaves one level of gradient context.
pub fn stop_gradient_context() {
    let prev = CONTEXT.gradient_depth.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "stop_gradient_context without matching start");
}

pub fn in_gradient_context() -> bool {
    CONTEXT.gradient_depth.load(Ordering::SeqCst) > 0
}

/// RAII guard for the gradient context.
pub struct GradientContext(());

impl GradientContext {
    #[allow(clippy::new_without_default)]
    pub fn new() -> GradientContext {
        start_gradient_context();
        GradientContext(())
    }
}

impl Drop for GradientContext {
    fn drop(&mut self) {
        stop_gradient_context();
    }
}
