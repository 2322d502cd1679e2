use crate::stream::StreamError;

/// Error taxonomy of the interpreter. `BadHeader` is the only kind the
/// algorithm selector catches routinely; `Fatal` bypasses every catch
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrowKind {
    MalformedInput,
    BadHeader,
    UnresolvedSymbol,
    ArityMismatch,
    ScopeViolation,
    RangeError,
    IoError,
    FrozenEof,
    Fatal,
}

impl ThrowKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::MalformedInput => "MalformedInput",
            Self::BadHeader => "BadHeader",
            Self::UnresolvedSymbol => "UnresolvedSymbol",
            Self::ArityMismatch => "ArityMismatch",
            Self::ScopeViolation => "ScopeViolation",
            Self::RangeError => "RangeError",
            Self::IoError => "IoError",
            Self::FrozenEof => "FrozenEof",
            Self::Fatal => "Fatal",
        }
    }
}

/// One in-flight throw, unwinding toward the nearest catch frame.
#[derive(Debug, Clone)]
pub struct Thrown {
    pub kind: ThrowKind,
    pub message: String,
}

pub type TResult<T> = Result<T, Thrown>;

impl Thrown {
    pub fn new(kind: ThrowKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ThrowKind::Fatal, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ThrowKind::MalformedInput, message)
    }

    pub fn bad_header(wanted: u64, found: u64) -> Self {
        Self::new(
            ThrowKind::BadHeader,
            format!("Wanted header value {wanted} but found {found}"),
        )
    }

    pub fn cant_read() -> Self {
        Self::new(ThrowKind::MalformedInput, "Unable to read value")
    }

    pub fn cant_write() -> Self {
        Self::new(ThrowKind::IoError, "Unable to write value")
    }

    pub fn is_catchable(&self) -> bool {
        self.kind != ThrowKind::Fatal
    }
}

impl std::fmt::Display for Thrown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for Thrown {}

impl From<StreamError> for Thrown {
    fn from(error: StreamError) -> Self {
        let kind = match error {
            StreamError::Frozen => ThrowKind::FrozenEof,
            StreamError::Retired(_) | StreamError::Source => ThrowKind::IoError,
            StreamError::PastEob | StreamError::PastEof | StreamError::Overlong => {
                ThrowKind::MalformedInput
            }
        };
        Self::new(kind, error.to_string())
    }
}
