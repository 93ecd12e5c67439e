//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns one of these variants
//! rather than a string; callers match on structured fields instead of
//! parsing messages. See spec.md (as reproduced in SPEC_FULL.md) §7.

use crate::apdu::{Status, StatusClass};

pub type Result<T> = std::result::Result<T, Error>;

/// Why BER-TLV decoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecErrorReason {
    #[error("input ended before a tag/length/value could be read in full")]
    Truncated,
    #[error("length field uses a non-minimal or out-of-range long form")]
    IllegalLengthForm,
    #[error("indefinite length (0x80) is not valid in BER-TLV/EMV")]
    IndefiniteLength,
    #[error("constructed value has bytes left over after its last child")]
    TrailingGarbageInConstructed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("TLV decode error at offset {offset}: {reason}")]
    Codec {
        offset: usize,
        reason: CodecErrorReason,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("card returned {sw}: {class}")]
    ErrorResponse { sw: Status, class: StatusClass },

    #[error("application {adf} not found on card")]
    MissingApp { adf: String },

    #[error("incorrect PIN, {tries_left} attempt(s) remaining")]
    InvalidPin { tries_left: u8 },

    #[error("PIN is blocked")]
    PinBlocked,

    #[error("PIN must be 4-12 digits")]
    InvalidPinInput,

    #[error("CAP error: {0}")]
    Cap(#[from] CapError),

    #[error("session has faulted and cannot be used further")]
    SessionFaulted,

    #[error("no application is selected; call select_application first")]
    NoApplicationSelected,
}

/// Physical/transport-layer fault: reader unplugged, card removed, etc.
/// Distinct from [`Error::ErrorResponse`], which is a card-level status word.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct TransportError {
    pub cause: String,
}

impl From<pcsc::Error> for Error {
    fn from(e: pcsc::Error) -> Self {
        Error::Transport(TransportError {
            cause: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CapError {
    #[error("an amount was given without a challenge")]
    AmountWithoutChallenge,
    #[error("amount has too many digits to fit the 6-byte BCD field")]
    AmountTooLarge,
    #[error("challenge has too many digits to fit the 4-byte BCD field")]
    ChallengeTooLarge,
    #[error("tag 0x9F10 (Issuer Application Data) was not present in the response")]
    MissingIad,
    #[error("tag 0x9F26 (Application Cryptogram) was not present in the response")]
    MissingAc,
    #[error("IAD layout does not match a supported CAP profile")]
    UnsupportedIadFormat,
}

impl Error {
    /// Builds the `MissingApp` variant from a raw application/ADF identifier.
    pub fn missing_app(adf: impl Into<Vec<u8>>) -> Self {
        Error::MissingApp {
            adf: hex::encode_upper(adf.into()),
        }
    }

    /// True if this is a `MissingApp` or a card-level `ErrorResponse` - the
    /// two kinds the `info` flow treats as "this optional read didn't pan
    /// out" rather than fatal.
    pub fn is_recoverable_during_discovery(&self) -> bool {
        matches!(self, Error::MissingApp { .. } | Error::ErrorResponse { .. })
    }
}

