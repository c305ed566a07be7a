/// chainkv errors. Internal replication handlers mostly communicate failure
/// by dropping a message or returning false (the chain retransmits); Error is
/// for faults that must propagate, e.g. malformed encodings.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid data, e.g. a truncated wire payload or a misordered map
    /// encoding.
    InvalidData(String),
    /// A version that is already present in a keyholder queue.
    DuplicateVersion(u64),
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::DuplicateVersion(version) => write!(f, "duplicate version {version}"),
        }
    }
}

/// A chainkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows the error constructor macro to build a Result directly, e.g.
/// `return errdata!("truncated payload")`.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}
