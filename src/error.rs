/// A quorumkv error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed or unknown wire data. Messages yielding this error are
    /// dropped by the event loop.
    InvalidData(String),
    /// Invalid user input, typically command-line arguments.
    InvalidInput(String),
    /// An IO error, including transport failures.
    IO(String),
}

/// A quorumkv result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Allows returning errors directly from result-returning functions, e.g.
/// return errinput!("expected at least two peers").
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}
