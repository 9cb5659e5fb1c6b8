use std::io::Error as IoError;
use thiserror::Error;

/// An MSC Result, conveniently wrapping the [MscError]
pub type Result<T> = std::result::Result<T, MscError>;

#[derive(Error, Debug)]
/// Error types which can occur while encoding or decoding MSC frames.
pub enum MscError {
    #[error("I/O error during frame decoding")]
    Io(#[from] IoError),
    #[error("CRCs do not match. Signalled {signalled:#06X} != Calculated {calculated:#06X}.")]
    InvalidCrc {
        /// The CRC computed over the received frame.
        calculated: u16,
        /// The CRC carried in the last two bytes of the frame.
        signalled: u16,
    },
    #[error("the buffer ended inside a frame")]
    Incomplete,
    #[error("unsupported field combination: {0}")]
    UnsupportedFeature(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
