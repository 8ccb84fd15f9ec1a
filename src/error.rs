use thiserror::Error;

/// Error kinds surfaced to API callers and carried on return-code topics.
///
/// Every kind has a stable negative i32 representation so that return-code
/// messages (`{topic}#`) can round-trip through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("unspecified failure")]
    Unspecified,

    #[error("invalid parameter")]
    ParameterInvalid,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("in use")]
    InUse,

    #[error("busy")]
    Busy,

    #[error("unavailable")]
    Unavailable,

    #[error("out of memory")]
    NotEnoughMemory,

    #[error("not supported")]
    NotSupported,

    #[error("provided buffer is too small")]
    TooSmall,

    #[error("timed out")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error("syntax error")]
    SyntaxError,

    #[error("input/output error")]
    Io,
}

pub type Result<T> = std::result::Result<T, ErrorCode>;

impl ErrorCode {
    pub fn to_i32(self) -> i32 {
        match self {
            ErrorCode::Unspecified => -1,
            ErrorCode::ParameterInvalid => -2,
            ErrorCode::NotFound => -3,
            ErrorCode::AlreadyExists => -4,
            ErrorCode::InUse => -5,
            ErrorCode::Busy => -6,
            ErrorCode::Unavailable => -7,
            ErrorCode::NotEnoughMemory => -8,
            ErrorCode::NotSupported => -9,
            ErrorCode::TooSmall => -10,
            ErrorCode::Timeout => -11,
            ErrorCode::Aborted => -12,
            ErrorCode::SyntaxError => -13,
            ErrorCode::Io => -14,
        }
    }

    /// Maps a return-code value back to an error kind.
    ///
    /// Returns `None` for 0 (success). Unknown non-zero values map to
    /// [`ErrorCode::Unspecified`].
    pub fn from_i32(rc: i32) -> Option<ErrorCode> {
        match rc {
            0 => None,
            -2 => Some(ErrorCode::ParameterInvalid),
            -3 => Some(ErrorCode::NotFound),
            -4 => Some(ErrorCode::AlreadyExists),
            -5 => Some(ErrorCode::InUse),
            -6 => Some(ErrorCode::Busy),
            -7 => Some(ErrorCode::Unavailable),
            -8 => Some(ErrorCode::NotEnoughMemory),
            -9 => Some(ErrorCode::NotSupported),
            -10 => Some(ErrorCode::TooSmall),
            -11 => Some(ErrorCode::Timeout),
            -12 => Some(ErrorCode::Aborted),
            -13 => Some(ErrorCode::SyntaxError),
            -14 => Some(ErrorCode::Io),
            _ => Some(ErrorCode::Unspecified),
        }
    }

    pub fn rc_from_result(result: Result<()>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(e) => e.to_i32(),
        }
    }

    pub fn result_from_rc(rc: i32) -> Result<()> {
        match ErrorCode::from_i32(rc) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
