//! ISO 7816-4 command/response APDUs and status word classification.
//!
//! Generalizes the shape the teacher's `core/apdu.rs` already had - `Request`,
//! `Response`, `Status`, `StatusClass` - into something that can actually be
//! serialized to and parsed from wire bytes, covering all four ISO 7816-4
//! APDU cases.

use crate::error::{Error, Result};

/// A command APDU (CAPDU): `CLA INS P1 P2 [Lc data] [Le]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Expected response length. `None` means no Le byte (case 1/3); most
    /// callers want `Some(0)`, which asks for "however much the card has to
    /// give" (Le=0x00, the usual EMV convention).
    pub le: Option<usize>,
}

impl Request {
    pub fn new<T: Into<Vec<u8>>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: data.into(),
            le: None,
        }
    }

    pub fn expect(mut self, le: usize) -> Self {
        self.le = Some(le);
        self
    }

    /// Serializes to wire bytes. Only short (single-byte Lc/Le) forms are
    /// produced - every command this crate issues fits comfortably under 256
    /// bytes of data and response.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le as u8);
        }
        out
    }
}

/// A response APDU (RAPDU): response data followed by a two-byte status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    pub fn new<T: Into<Vec<u8>>>(status: Status, data: T) -> Self {
        Self {
            data: data.into(),
            status,
        }
    }

    /// Parses a raw RAPDU: the final two bytes are SW1/SW2, everything
    /// before that is response data.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Transport(crate::error::TransportError {
                cause: format!("response too short to hold a status word ({} bytes)", bytes.len()),
            }));
        }
        let (data, sw) = bytes.split_at(bytes.len() - 2);
        Ok(Self::new(Status(sw[0], sw[1]), data.to_vec()))
    }

    /// Turns a non-success status into an `Error::ErrorResponse`, leaving
    /// success responses untouched.
    pub fn into_result(self) -> Result<Self> {
        match self.status.class() {
            StatusClass::OK => Ok(self),
            class => Err(Error::ErrorResponse {
                sw: self.status,
                class,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8, pub u8);

impl Status {
    pub fn sw1(&self) -> u8 {
        self.0
    }

    pub fn sw2(&self) -> u8 {
        self.1
    }

    pub fn class(&self) -> StatusClass {
        match (self.0, self.1) {
            (0x90, 0x00) => StatusClass::OK,
            (0x61, x) => StatusClass::BytesRemaining(x),
            (y @ 0x62, 0x00) => StatusClass::Generic(y),
            (0x62, x @ 0x02..=0x80) => StatusClass::CardQuery(x),
            (0x62, 0x82) => StatusClass::EOF,
            (0x62, 0x83) => StatusClass::SelectedFileDeactivated,
            (0x62, 0x84) => StatusClass::BadFileOrDataControlInformation,
            (0x62, 0x85) => StatusClass::SelectedFileInTerminationState,
            (0x62, 0x86) => StatusClass::NoSensorInput,
            (0x62, 0x87) => StatusClass::DeactivatedReference,
            (y @ 0x63, 0x00) => StatusClass::Generic(y),
            (0x63, 0x40) => StatusClass::UnsuccessfulComparison,
            (0x63, 0x81) => StatusClass::FullByLastWrite,
            (0x63, x @ 0xC0..=0xCF) => StatusClass::Counter(x & 0x0F),
            (y @ 0x64, 0x00) => StatusClass::Generic(y),
            (0x64, 0x01) => StatusClass::ErrImmediateResponseRequired,
            (0x64, x @ 0x02..=0x80) => StatusClass::ErrCardQuery(x),
            (0x64, 0x81) => StatusClass::ErrChannelShareAccessDenied,
            (0x64, 0x82) => StatusClass::ErrChannelOpenAccessDenied,
            (y @ 0x65, 0x00) => StatusClass::Generic(y),
            (0x65, 0x81) => StatusClass::ErrMemoryFailure,
            (y @ 0x67, 0x00) => StatusClass::Generic(y),
            (0x67, 0x01) => StatusClass::ErrMalformedAPDU,
            (0x67, 0x02) => StatusClass::ErrInvalidLc,
            (y @ 0x68, 0x00) => StatusClass::Generic(y),
            (0x68, 0x81) => StatusClass::ErrChannelUnsupported,
            (0x68, 0x82) => StatusClass::ErrSecureMessagingUnsupported,
            (0x68, 0x83) => StatusClass::ErrChainLastCommandExpected,
            (0x68, 0x84) => StatusClass::ErrChainUnsupported,
            (y @ 0x69, 0x00) => StatusClass::Generic(y),
            (0x69, 0x81) => StatusClass::ErrIncompatibleFileStructure,
            (0x69, 0x82) => StatusClass::ErrSecurityStatus,
            (0x69, 0x83) => StatusClass::ErrAuthMethodBlocked,
            (0x69, 0x84) => StatusClass::ErrRefDataUnusable,
            (0x69, 0x85) => StatusClass::ErrConditionsNotSatisfied,
            (0x69, 0x86) => StatusClass::ErrNoCurrentEF,
            (0x69, 0x87) => StatusClass::ErrMissingSecureMessagingDOs,
            (0x69, 0x88) => StatusClass::ErrIncorrectSecureMessagingDOs,
            (y @ 0x6A, 0x00) => StatusClass::Generic(y),
            (0x6A, 0x80) => StatusClass::ErrParamsData,
            (0x6A, 0x82) => StatusClass::ErrFileNotFound,
            (0x6A, 0x83) => StatusClass::ErrRecordNotFound,
            (0x6A, 0x88) => StatusClass::ErrReferencedDataNotFound,
            (0x6B, 0x00) => StatusClass::ErrParamsP1P2,
            (0x6C, x) => StatusClass::ErrRetryWithLe(x),
            (0x6D, 0x00) => StatusClass::ErrInstruction,
            (0x6E, 0x00) => StatusClass::ErrClass,
            (0x6F, 0x00) => StatusClass::ErrNoIdea,
            (y, x) => StatusClass::Unknown(y, x),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.class(), StatusClass::OK)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    OK,
    Generic(u8),
    BytesRemaining(u8),
    CardQuery(u8),
    EOF,
    SelectedFileDeactivated,
    BadFileOrDataControlInformation,
    SelectedFileInTerminationState,
    NoSensorInput,
    DeactivatedReference,
    UnsuccessfulComparison,
    FullByLastWrite,
    Counter(u8),
    ErrImmediateResponseRequired,
    ErrCardQuery(u8),
    ErrChannelShareAccessDenied,
    ErrChannelOpenAccessDenied,
    ErrMemoryFailure,
    ErrMalformedAPDU,
    ErrInvalidLc,
    ErrChannelUnsupported,
    ErrSecureMessagingUnsupported,
    ErrChainLastCommandExpected,
    ErrChainUnsupported,
    ErrIncompatibleFileStructure,
    ErrSecurityStatus,
    ErrAuthMethodBlocked,
    ErrRefDataUnusable,
    ErrConditionsNotSatisfied,
    ErrNoCurrentEF,
    ErrMissingSecureMessagingDOs,
    ErrIncorrectSecureMessagingDOs,
    ErrParamsData,
    ErrFileNotFound,
    ErrRecordNotFound,
    ErrReferencedDataNotFound,
    ErrParamsP1P2,
    /// 0x6CXX - wrong Le, retry with Le set to the value the card names.
    ErrRetryWithLe(u8),
    ErrInstruction,
    ErrClass,
    ErrNoIdea,
    Unknown(u8, u8),
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusClass::OK => write!(f, "OK"),
            StatusClass::ErrAuthMethodBlocked => write!(f, "authentication method blocked"),
            StatusClass::ErrRefDataUnusable => write!(f, "referenced data unusable"),
            StatusClass::ErrConditionsNotSatisfied => write!(f, "conditions of use not satisfied"),
            StatusClass::ErrSecurityStatus => write!(f, "security status not satisfied"),
            StatusClass::ErrFileNotFound => write!(f, "file not found"),
            StatusClass::ErrRecordNotFound => write!(f, "record not found"),
            StatusClass::ErrReferencedDataNotFound => write!(f, "referenced data not found"),
            other => write!(f, "{other:?}"),
        }
    }
}
