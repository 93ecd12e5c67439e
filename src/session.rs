//! Card session state machine: SELECT, READ RECORD, GET DATA, VERIFY and
//! GENERATE AC, threaded through the `Idle` / `AppSelected` / `Faulted`
//! machine from spec.md §4.4.
//!
//! Grounded on `probe.rs` (buffer handling, `Option`-returning probes that
//! `warn!` rather than abort on a failed read) and `app/emv/dir.rs` (FCI and
//! directory record parsing that promotes known sub-tags to named fields,
//! with an `extra` bucket for everything else, and a record sweep that stops
//! cleanly at "record not found" rather than propagating it).

use crate::apdu::{Request, Response, Status, StatusClass};
use crate::error::{Error, Result};
use crate::tag;
use crate::tlv::{Tag, Tlv};
use crate::transport::Transport;

const INS_SELECT: u8 = 0xA4;
const INS_READ_RECORD: u8 = 0xB2;
const INS_VERIFY: u8 = 0x20;
const INS_GET_DATA: u8 = 0xCA;

const PSE_CONTACT: &[u8] = b"1PAY.SYS.DDF01";
const PSE_CONTACTLESS: &[u8] = b"2PAY.SYS.DDF01";

/// Built-in AID scan list, tried only when neither PSE directory is present
/// on the card - mirrors `client.py`'s PSE-then-AID-scan fallback in the
/// `info` command.
const FALLBACK_AIDS: &[&[u8]] = &[
    &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10], // Visa Credit/Debit
    &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10], // Mastercard Credit/Debit
    &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x30, 0x60], // Maestro
    &[0xA0, 0x00, 0x00, 0x00, 0x25, 0x01, 0x00], // American Express
];

/// File Control Information returned by a successful SELECT. Known
/// sub-tags are promoted to named fields; anything else lands in `extra`
/// rather than being dropped, per the TLV tree's ordering/duplicate
/// invariant.
#[derive(Debug, Clone, Default)]
pub struct Fci {
    pub df_name: Option<Vec<u8>>,
    pub sfi_of_directory_ef: Option<u8>,
    pub language_preference: Option<String>,
    pub extra: Vec<(Tag, Vec<u8>)>,
}

impl Fci {
    fn from_tree(tree: &Tlv) -> Self {
        let mut fci = Fci::default();
        for (t, v) in tree.iter() {
            match t.as_bytes() {
                [0x84] => fci.df_name = v.as_bytes().map(|b| b.to_vec()),
                [0xA5] => {
                    if let Some(prop) = v.as_tlv() {
                        fci.apply_proprietary(prop);
                    }
                }
                _ => fci
                    .extra
                    .push((t.clone(), v.as_bytes().map(|b| b.to_vec()).unwrap_or_default())),
            }
        }
        fci
    }

    fn apply_proprietary(&mut self, prop: &Tlv) {
        for (t, v) in prop.iter() {
            match t.as_bytes() {
                [0x88] => self.sfi_of_directory_ef = v.as_bytes().and_then(|b| b.first().copied()),
                [0x5F, 0x2D] => {
                    self.language_preference =
                        v.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
                }
                _ => self
                    .extra
                    .push((t.clone(), v.as_bytes().map(|b| b.to_vec()).unwrap_or_default())),
            }
        }
    }
}

/// The selected application: its ADF name (the bytes SELECT was called
/// with - a PSE/PPSE name or an AID) and its parsed FCI.
#[derive(Debug, Clone)]
pub struct Adf {
    pub name: Vec<u8>,
    pub fci: Fci,
}

/// One entry surfaced by [`Session::list_applications`]: an AID paired with
/// its (optional) application label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub aid: Vec<u8>,
    pub label: Option<String>,
}

/// The handful of GET DATA tags `get_metadata` queries. Missing tags are
/// omitted, never an error - the card may simply not support one.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub atc: Option<Vec<u8>>,
    pub pin_try_counter: Option<u8>,
    pub last_online_atc: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    AppSelected(Adf),
    Faulted,
}

/// The stateful driver over a [`Transport`]. Single-threaded, synchronous,
/// exclusively owned by one caller at a time - see spec.md §5.
pub struct Session<T: Transport> {
    transport: T,
    state: State,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: State::default(),
        }
    }

    /// The currently selected application's ADF and FCI, if any.
    pub fn selected_application(&self) -> Option<&Adf> {
        match &self.state {
            State::AppSelected(adf) => Some(adf),
            _ => None,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.state, State::Faulted)
    }

    /// Reads PSE (`1PAY.SYS.DDF01`) then PPSE (`2PAY.SYS.DDF01`), merging
    /// whatever directory entries each yields, and only falls back to a
    /// built-in AID scan if neither PSE is present on the card at all.
    /// Valid from any state; does not change it.
    pub fn list_applications(&mut self) -> Result<Vec<DirectoryEntry>> {
        self.check_not_faulted()?;

        let mut entries = Vec::new();
        let mut any_pse_found = false;
        for pse in [PSE_CONTACT, PSE_CONTACTLESS] {
            match self.list_applications_in_pse(pse) {
                Ok(found) => {
                    any_pse_found = true;
                    entries.extend(found);
                }
                Err(e) if e.is_recoverable_during_discovery() => {
                    tracing::debug!(pse = %String::from_utf8_lossy(pse), error = %e, "PSE not present, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if !any_pse_found {
            tracing::debug!("neither PSE present, falling back to AID scan");
            entries = self.list_applications_by_aid_scan()?;
        }
        Ok(entries)
    }

    fn list_applications_in_pse(&mut self, name: &[u8]) -> Result<Vec<DirectoryEntry>> {
        let tree = self.select_by_name(name)?;
        let fci_tree = tree.get(&tag!("6F")).and_then(|v| v.as_tlv());
        let sfi = fci_tree
            .map(Fci::from_tree)
            .and_then(|fci| fci.sfi_of_directory_ef)
            .ok_or_else(|| Error::missing_app(name))?;

        let mut entries = Vec::new();
        let mut record = 1u8;
        loop {
            match self.read_record_at(sfi, record) {
                Ok(rec) => {
                    entries.extend(directory_entries_from_record(&rec));
                    record += 1;
                }
                Err(Error::ErrorResponse {
                    class: StatusClass::ErrRecordNotFound,
                    ..
                }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    fn list_applications_by_aid_scan(&mut self) -> Result<Vec<DirectoryEntry>> {
        let mut entries = Vec::new();
        for aid in FALLBACK_AIDS {
            match self.select_by_name(aid) {
                Ok(tree) => {
                    let fci = tree
                        .get(&tag!("6F"))
                        .and_then(|v| v.as_tlv())
                        .map(Fci::from_tree)
                        .unwrap_or_default();
                    let label = fci
                        .df_name
                        .as_deref()
                        .map(|b| String::from_utf8_lossy(b).into_owned());
                    entries.push(DirectoryEntry {
                        aid: aid.to_vec(),
                        label,
                    });
                }
                Err(e) if e.is_recoverable_during_discovery() => {
                    tracing::debug!(aid = %hex::encode_upper(aid), error = %e, "AID not found, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// SELECTs an application by ADF name (PSE/PPSE name or AID), parses
    /// its FCI, and transitions to `AppSelected`.
    pub fn select_application(&mut self, name: &[u8]) -> Result<()> {
        self.check_not_faulted()?;
        let tree = self.select_by_name(name)?;
        let fci = tree
            .get(&tag!("6F"))
            .and_then(|v| v.as_tlv())
            .map(Fci::from_tree)
            .unwrap_or_default();
        self.state = State::AppSelected(Adf {
            name: name.to_vec(),
            fci,
        });
        Ok(())
    }

    fn select_by_name(&mut self, name: &[u8]) -> Result<Tlv> {
        let req = Request::new(0x00, INS_SELECT, 0x04, 0x00, name.to_vec()).expect(0x00);
        match self.call(req) {
            Ok(res) => crate::tlv::decode(&res.data),
            Err(Error::ErrorResponse {
                class: StatusClass::ErrFileNotFound | StatusClass::ErrRecordNotFound,
                ..
            }) => Err(Error::missing_app(name)),
            Err(e) => Err(e),
        }
    }

    /// Reads one record of a file by SFI and record number. Only valid once
    /// an application is selected.
    pub fn read_record(&mut self, sfi: u8, record: u8) -> Result<Tlv> {
        self.require_selected()?;
        self.read_record_at(sfi, record)
    }

    fn read_record_at(&mut self, sfi: u8, record: u8) -> Result<Tlv> {
        let req = Request::new(0x00, INS_READ_RECORD, record, (sfi << 3) | 0b100, Vec::new())
            .expect(0x00);
        let res = self.call(req)?;
        crate::tlv::decode(&res.data)
    }

    /// Verifies a plaintext PIN against the card (VERIFY, P2=0x80), packed
    /// as an ISO-9564-1 format-2 PIN block. Only valid once an application
    /// is selected.
    pub fn verify_pin(&mut self, pin: &str) -> Result<()> {
        self.require_selected()?;
        let block = pin_block_format2(pin)?;
        let req = Request::new(0x00, INS_VERIFY, 0x00, 0x80, block.to_vec());
        match self.call(req) {
            Ok(_) => Ok(()),
            Err(Error::ErrorResponse { sw, .. }) if sw.sw1() == 0x63 && sw.sw2() & 0xF0 == 0xC0 => {
                Err(Error::InvalidPin {
                    tries_left: sw.sw2() & 0x0F,
                })
            }
            Err(Error::ErrorResponse { sw, .. }) if sw == Status(0x69, 0x83) => Err(Error::PinBlocked),
            Err(e) => Err(e),
        }
    }

    /// GET DATA for ATC (9F36), PIN try counter (9F17) and last online ATC
    /// register (9F13). Tags the card doesn't support are simply omitted.
    /// Only valid once an application is selected.
    pub fn get_metadata(&mut self) -> Result<Metadata> {
        self.require_selected()?;
        Ok(Metadata {
            atc: self.get_data_tag(0x9F, 0x36)?,
            pin_try_counter: self.get_data_tag(0x9F, 0x17)?.and_then(|b| b.first().copied()),
            last_online_atc: self.get_data_tag(0x9F, 0x13)?,
        })
    }

    fn get_data_tag(&mut self, p1: u8, p2: u8) -> Result<Option<Vec<u8>>> {
        let req = Request::new(0x80, INS_GET_DATA, p1, p2, Vec::new()).expect(0x00);
        match self.call(req) {
            Ok(res) => {
                let tree = crate::tlv::decode(&res.data)?;
                Ok(tree.iter().next().and_then(|(_, v)| v.as_bytes().map(|b| b.to_vec())))
            }
            Err(Error::ErrorResponse { .. }) => {
                tracing::debug!(p1, p2, "GET DATA tag unsupported, omitting");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends a GENERATE AC request (normally built by
    /// [`crate::cap::build_arqc_request`]) and returns the parsed response
    /// template. Only valid once an application is selected.
    pub fn generate_ac(&mut self, request: Request) -> Result<Tlv> {
        self.require_selected()?;
        let res = self.call(request)?;
        crate::tlv::decode(&res.data)
    }

    fn check_not_faulted(&self) -> Result<()> {
        match self.state {
            State::Faulted => Err(Error::SessionFaulted),
            _ => Ok(()),
        }
    }

    fn require_selected(&self) -> Result<()> {
        match &self.state {
            State::Faulted => Err(Error::SessionFaulted),
            State::Idle => Err(Error::NoApplicationSelected),
            State::AppSelected(_) => Ok(()),
        }
    }

    /// Runs one APDU exchange. A transport-level fault (reader/card
    /// disconnect) transitions the session to `Faulted`; a card-level
    /// status-word error does not - the caller decides what to do with it.
    fn call(&mut self, req: Request) -> Result<Response> {
        match self.transport.call_apdu(req) {
            Ok(res) => Ok(res),
            Err(err @ Error::Transport(_)) => {
                self.state = State::Faulted;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn directory_entries_from_record(tree: &Tlv) -> Vec<DirectoryEntry> {
    let mut out = Vec::new();
    let Some(template) = tree.get(&tag!("70")).and_then(|v| v.as_tlv()) else {
        return out;
    };
    for (t, v) in template.iter() {
        if t.as_bytes() != [0x61] {
            continue;
        }
        let Some(app) = v.as_tlv() else { continue };
        let Some(aid) = app.get(&tag!("4F")).and_then(|v| v.as_bytes()) else {
            continue;
        };
        let label = app
            .get(&tag!("50"))
            .and_then(|v| v.as_bytes())
            .map(|b| String::from_utf8_lossy(b).trim_end().to_string());
        out.push(DirectoryEntry {
            aid: aid.to_vec(),
            label,
        });
    }
    out
}

/// Packs a decimal PIN into an ISO-9564-1 format-2 PIN block: control
/// nibble `0x2`, a length nibble, the PIN's digits, and `0xF` padding to
/// fill out 8 bytes. EMV VERIFY sends this unenciphered - this crate never
/// encrypts PIN blocks under an issuer key (see spec.md §1 Non-goals).
fn pin_block_format2(pin: &str) -> Result<[u8; 8]> {
    if !(4..=12).contains(&pin.len()) || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidPinInput);
    }
    let mut nibbles = Vec::with_capacity(16);
    nibbles.push(0x2);
    nibbles.push(pin.len() as u8);
    nibbles.extend(pin.chars().map(|c| c.to_digit(10).unwrap() as u8));
    nibbles.resize(16, 0xF);

    let mut block = [0u8; 8];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::parse_hex;
    use std::cell::RefCell;

    struct ScriptedTransport {
        responses: RefCell<Vec<Response>>,
        calls: RefCell<Vec<Request>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Response>) -> Self {
            Self {
                responses: RefCell::new(responses),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn call_raw_apdu(&self, req: &Request) -> Result<Response> {
            self.calls.borrow_mut().push(req.clone());
            let res = self.responses.borrow_mut().remove(0);
            match res.status.class() {
                StatusClass::OK => Ok(res),
                _ => res.into_result(),
            }
        }
    }

    fn ok(data: &str) -> Response {
        Response::new(Status(0x90, 0x00), parse_hex(data).unwrap())
    }

    fn status(sw1: u8, sw2: u8) -> Response {
        Response::new(Status(sw1, sw2), Vec::new())
    }

    #[test]
    fn test_pin_block_format2_even_length() {
        // PIN "1234" -> control=2, len=4, digits 1 2 3 4, then 0xF padding.
        assert_eq!(
            pin_block_format2("1234").unwrap(),
            [0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_pin_block_format2_rejects_bad_input() {
        assert!(matches!(pin_block_format2("12").unwrap_err(), Error::InvalidPinInput));
        assert!(matches!(pin_block_format2("12ab").unwrap_err(), Error::InvalidPinInput));
    }

    #[test]
    fn test_select_application_success() {
        // SELECT response: FCI with DF name "1PAY.SYS.DDF01" and SFI 1.
        let fci = ok("6F 1A 84 0E 31 50 41 59 2E 53 59 53 2E 44 44 46 30 31 A5 08 88 01 01 5F 2D 02 65 6E");
        let transport = ScriptedTransport::new(vec![fci]);
        let mut session = Session::new(transport);

        session.select_application(b"1PAY.SYS.DDF01").unwrap();
        let adf = session.selected_application().unwrap();
        assert_eq!(adf.fci.df_name.as_deref(), Some(b"1PAY.SYS.DDF01".as_slice()));
        assert_eq!(adf.fci.sfi_of_directory_ef, Some(1));
        assert_eq!(adf.fci.language_preference.as_deref(), Some("en"));
    }

    #[test]
    fn test_select_missing_app() {
        let transport = ScriptedTransport::new(vec![status(0x6A, 0x82)]);
        let mut session = Session::new(transport);
        let err = session.select_application(b"2PAY.SYS.DDF01").unwrap_err();
        assert!(matches!(err, Error::MissingApp { .. }));
    }

    #[test]
    fn test_operations_from_idle_require_selection() {
        let transport = ScriptedTransport::new(vec![]);
        let mut session = Session::new(transport);
        assert!(matches!(
            session.read_record(1, 1).unwrap_err(),
            Error::NoApplicationSelected
        ));
        assert!(matches!(
            session.verify_pin("1234").unwrap_err(),
            Error::NoApplicationSelected
        ));
    }

    #[test]
    fn test_verify_pin_invalid_reports_tries_left() {
        let fci = ok("6F 04 84 02 6F 6F");
        let transport = ScriptedTransport::new(vec![fci, status(0x63, 0xC2)]);
        let mut session = Session::new(transport);
        session.select_application(b"\x6F\x6F").unwrap();

        let err = session.verify_pin("1234").unwrap_err();
        assert!(matches!(err, Error::InvalidPin { tries_left: 2 }));
    }

    #[test]
    fn test_verify_pin_blocked() {
        let fci = ok("6F 04 84 02 6F 6F");
        let transport = ScriptedTransport::new(vec![fci, status(0x69, 0x83)]);
        let mut session = Session::new(transport);
        session.select_application(b"\x6F\x6F").unwrap();

        let err = session.verify_pin("1234").unwrap_err();
        assert!(matches!(err, Error::PinBlocked));
    }

    #[test]
    fn test_get_metadata_omits_missing_tags() {
        let fci = ok("6F 04 84 02 6F 6F");
        let transport = ScriptedTransport::new(vec![
            fci,
            ok("9F3602 0001"),         // ATC present
            status(0x6A, 0x88),        // PIN try counter unsupported
            status(0x6A, 0x88),        // last online ATC unsupported
        ]);
        let mut session = Session::new(transport);
        session.select_application(b"\x6F\x6F").unwrap();

        let meta = session.get_metadata().unwrap();
        assert_eq!(meta.atc, Some(vec![0x00, 0x01]));
        assert_eq!(meta.pin_try_counter, None);
        assert_eq!(meta.last_online_atc, None);
    }

    #[test]
    fn test_transport_error_faults_session() {
        struct DeadTransport;
        impl Transport for DeadTransport {
            fn call_raw_apdu(&self, _req: &Request) -> Result<Response> {
                Err(Error::Transport(crate::error::TransportError {
                    cause: "reader unplugged".into(),
                }))
            }
        }
        let mut session = Session::new(DeadTransport);
        assert!(session.list_applications().is_err());
        assert!(session.is_faulted());
        assert!(matches!(
            session.select_application(b"1PAY.SYS.DDF01").unwrap_err(),
            Error::SessionFaulted
        ));
    }

    #[test]
    fn test_list_applications_merges_both_pses() {
        let pse1_fci = ok("6F 12 84 0E 31 50 41 59 2E 53 59 53 2E 44 44 46 30 31 A5 00");
        // no SFI in proprietary template -> PSE is present but unreadable, treated as recoverable.
        let pse2_fci = ok("6F 15 84 0E 32 50 41 59 2E 53 59 53 2E 44 44 46 30 31 A5 03 88 01 01");
        let record = ok("70 0C 61 0A 4F 05 A0 00 00 00 03 50 01 56");
        let record_not_found = status(0x6A, 0x83);

        let transport = ScriptedTransport::new(vec![pse1_fci, pse2_fci, record, record_not_found]);
        let mut session = Session::new(transport);
        let entries = session.list_applications().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].aid, parse_hex("A000000003").unwrap());
        assert_eq!(entries[0].label.as_deref(), Some("V"));
    }
}
