//! Main crate error enum.

use crate::common::DecodeError;
use crate::core::StoreError;

#[derive(thiserror::Error, Debug)]
/// Overline crate error enum.
pub enum Error {
    /// Id bytes were not exactly [ID_LENGTH](crate::common::ID_LENGTH) long.
    #[error("invalid id length {0}")]
    InvalidIdLength(usize),

    /// Id hex string could not be parsed.
    #[error("invalid id encoding: {0}")]
    InvalidIdEncoding(#[from] hex::FromHexError),

    #[error(transparent)]
    /// A frame failed to decode.
    Decode(#[from] DecodeError),

    #[error(transparent)]
    /// Publishing a value failed.
    Store(#[from] StoreError),

    /// The node's event loop is no longer running.
    #[error("node was shut down")]
    Shutdown,
}
