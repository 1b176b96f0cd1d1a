use std::cell::RefCell;

use thiserror::Error;

/// Discriminant of [`FlintError`], queryable through [`last_error_kind`]
/// so language bindings without exceptions can inspect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WrongType,
    IllegalDimension,
    IllegalDimensionality,
    IncompatibleShapes,
    InvalidSelect,
    OclError,
    InternalError,
    OutOfMemory,
    IllegalDerive,
    IoError,
}

#[derive(Error, Debug)]
pub enum FlintError {
    #[error("wrong data type: {0}")]
    WrongType(String),
    #[error("illegal dimension: {0}")]
    IllegalDimension(String),
    #[error("illegal dimensionality: {0}")]
    IllegalDimensionality(String),
    #[error("incompatible shapes: {a:?} and {b:?} ({context})")]
    IncompatibleShapes {
        a: Vec<usize>,
        b: Vec<usize>,
        context: String,
    },
    #[error("invalid select: {0}")]
    InvalidSelect(String),
    #[error("OpenCL error: {0}")]
    OclError(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("illegal derivative: {0}")]
    IllegalDerive(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FlintError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlintError::WrongType(_) => ErrorKind::WrongType,
            FlintError::IllegalDimension(_) => ErrorKind::IllegalDimension,
            FlintError::IllegalDimensionality(_) => ErrorKind::IllegalDimensionality,
            FlintError::IncompatibleShapes { .. } => ErrorKind::IncompatibleShapes,
            FlintError::InvalidSelect(_) => ErrorKind::InvalidSelect,
            FlintError::OclError(_) => ErrorKind::OclError,
            FlintError::InternalError(_) => ErrorKind::InternalError,
            FlintError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            FlintError::IllegalDerive(_) => ErrorKind::IllegalDerive,
            FlintError::IoError(_) => ErrorKind::IoError,
        }
    }

    pub(crate) fn incompatible_shapes(
        a: &[usize],
        b: &[usize],
        context: impl Into<String>,
    ) -> Self {
        FlintError::IncompatibleShapes {
            a: a.to_vec(),
            b: b.to_vec(),
            context: context.into(),
        }
    }
}

pub type FlintResult<T> = Result<T, FlintError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorKind, String)>> = const { RefCell::new(None) };
}

/// Records `err` in the calling thread's last-error slot and passes it on.
pub(crate) fn record<T>(res: FlintResult<T>) -> FlintResult<T> {
    if let Err(err) = &res {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((err.kind(), err.to_string())));
    }
    res
}

/// Kind of the most recent error raised on this thread, if any.
pub fn last_error_kind() -> Option<ErrorKind> {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|(k, _)| *k))
}

/// Message of the most recent error raised on this thread, or an empty string.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    })
}

/// Clears the calling thread's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}
