//! Error types for the Enigma2 configuration formats.

use thiserror::Error;

/// Errors raised while decoding or encoding receiver configuration data.
///
/// A format error always refers to a single record (one reference string,
/// one transponder element, one bouquet line). Batch parsers log these and
/// skip the offending record instead of aborting the whole file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// A service reference had fewer positional fields than required.
    #[error("Service reference has too few fields: expected at least {expected}, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    /// A positional field could not be parsed as a number.
    #[error("Invalid numeric field '{value}' at position {position}")]
    InvalidField { position: usize, value: String },

    /// A flag/CAS/PID token could not be interpreted.
    #[error("Invalid flag token: {0:?}")]
    InvalidFlagToken(String),

    /// A required XML attribute was missing.
    #[error("Missing attribute '{0}'")]
    MissingAttribute(&'static str),

    /// A numeric attribute code is outside its closed value set.
    #[error("Unknown {table} code: {code:?}")]
    UnknownCode { table: &'static str, code: String },

    /// The XML document itself was malformed.
    #[error("Malformed XML: {0}")]
    Xml(String),
}

impl From<quick_xml::Error> for FormatError {
    fn from(e: quick_xml::Error) -> Self {
        FormatError::Xml(e.to_string())
    }
}
