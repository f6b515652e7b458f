use std::fmt;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Usage,
    Internal,
    Sanity,
    Environment,
    Compile,
    Dwarf,
    Loading,
    NotCalculated,
    ProcessState,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for Error {}

impl Error {
    pub fn new(kind: ErrorKind, message: String) -> Self {
        Error {kind, message}
    }

    pub fn is_loading(&self) -> bool { self.kind == ErrorKind::Loading }
    pub fn is_not_calculated(&self) -> bool { self.kind == ErrorKind::NotCalculated }
}

// err!(Usage, "unknown flag: {}", flag)
#[macro_export]
macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        Err($crate::error::Error::new($crate::error::ErrorKind::$kind, format!($($arg)*)))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::new(ErrorKind::Environment, format!("io error: {}", e))
    }
}

impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Error {
        Error::new(ErrorKind::Dwarf, format!("dwarf error: {}", e))
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Error {
        Error::new(ErrorKind::Dwarf, format!("wasm container error: {}", e))
    }
}
