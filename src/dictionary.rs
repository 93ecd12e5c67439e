//! EMV tag registry and value rendering.
//!
//! Grounded on `examples/zedseven-pemv/src/emv/tag_basic_info.rs` and
//! `tlv_parsing.rs`: a flat tag -> metadata table plus a small per-tag
//! rendering rule, generalized here into a closed `TagType` set and a
//! `sensitive` flag so cardholder data can be redacted on the way out to a
//! terminal.

use crate::tlv::Tag;

/// BER tag class, carried in bits 7-6 of the first tag byte (EMV Book 3,
/// Annex B1). Matches `zedseven-pemv`'s `TagClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl TagClass {
    pub fn of(tag: &Tag) -> Self {
        match tag.as_bytes().first().map(|b| (b & 0b1100_0000) >> 6) {
            Some(0b00) => TagClass::Universal,
            Some(0b01) => TagClass::Application,
            Some(0b10) => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }
}

impl std::fmt::Display for TagClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TagClass::Universal => "universal",
            TagClass::Application => "application",
            TagClass::ContextSpecific => "context-specific",
            TagClass::Private => "private",
        })
    }
}

/// The closed set of EMV primitive value encodings this crate knows how to
/// render. Matches the `TagType` shape spec.md §3 calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    /// Raw bytes, rendered as grouped hex. The fallback for unknown tags.
    Binary,
    /// Text, decoded as Latin-1/cp1252 (EMV's "an" format uses 8859-1).
    Text,
    /// ASCII decimal digits stored one digit per byte (EMV's "n" format,
    /// left-padded in the wire encoding some tags use).
    Numeric,
    /// Decimal digits packed two per byte, `0xF` padded (EMV's "cn" format).
    CompressedNumeric,
    /// BCD `YYMMDD`.
    Date,
    /// Compressed-numeric minor units (eg. cents), rendered with 2 decimals.
    Amount,
    /// ISO 3166-1 numeric country code, compressed-numeric.
    Country,
    /// ISO 4217 numeric currency code, compressed-numeric.
    Currency,
    /// A Data Object List: a sequence of `(tag, expected length)` pairs.
    Dol,
}

#[derive(Debug, Clone, Copy)]
pub struct TagInfo {
    pub tag: &'static str,
    pub name: &'static str,
    pub kind: TagType,
    pub sensitive: bool,
}

/// The tag registry. Not exhaustive - EMV Book 3 Annex A1 alone runs to
/// hundreds of entries - but covers everything this crate's session and CAP
/// flows touch, plus the handful of tags every `info` dump shows.
static REGISTRY: &[TagInfo] = &[
    TagInfo { tag: "4F", name: "Application Identifier (AID)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "50", name: "Application Label", kind: TagType::Text, sensitive: false },
    TagInfo { tag: "57", name: "Track 2 Equivalent Data", kind: TagType::Binary, sensitive: true },
    TagInfo { tag: "5A", name: "Application Primary Account Number (PAN)", kind: TagType::CompressedNumeric, sensitive: true },
    TagInfo { tag: "5F20", name: "Cardholder Name", kind: TagType::Text, sensitive: true },
    TagInfo { tag: "5F24", name: "Application Expiration Date", kind: TagType::Date, sensitive: false },
    TagInfo { tag: "5F25", name: "Application Effective Date", kind: TagType::Date, sensitive: false },
    TagInfo { tag: "5F28", name: "Issuer Country Code", kind: TagType::Country, sensitive: false },
    TagInfo { tag: "5F2D", name: "Language Preference", kind: TagType::Text, sensitive: false },
    TagInfo { tag: "5F30", name: "Service Code", kind: TagType::Numeric, sensitive: false },
    TagInfo { tag: "5F34", name: "Application PAN Sequence Number", kind: TagType::Numeric, sensitive: false },
    TagInfo { tag: "61", name: "Application Template", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "6F", name: "File Control Information (FCI) Template", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "70", name: "READ RECORD Response Template", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "77", name: "Response Message Template Format 2", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "82", name: "Application Interchange Profile", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "84", name: "Dedicated File (DF) Name", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "87", name: "Application Priority Indicator", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "88", name: "Short File Identifier (SFI)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "8C", name: "Card Risk Management Data Object List 1 (CDOL1)", kind: TagType::Dol, sensitive: false },
    TagInfo { tag: "8D", name: "Card Risk Management Data Object List 2 (CDOL2)", kind: TagType::Dol, sensitive: false },
    TagInfo { tag: "8E", name: "Cardholder Verification Method (CVM) List", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "8F", name: "Certification Authority Public Key Index", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "90", name: "Issuer Public Key Certificate", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "92", name: "Issuer Public Key Remainder", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "93", name: "Signed Static Application Data", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "94", name: "Application File Locator (AFL)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "95", name: "Terminal Verification Results (TVR)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9A", name: "Transaction Date", kind: TagType::Date, sensitive: false },
    TagInfo { tag: "9C", name: "Transaction Type", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F02", name: "Amount, Authorised", kind: TagType::Amount, sensitive: false },
    TagInfo { tag: "9F03", name: "Amount, Other", kind: TagType::Amount, sensitive: false },
    TagInfo { tag: "9F06", name: "Application Identifier, terminal (AID)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F07", name: "Application Usage Control", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F08", name: "Application Version Number", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F10", name: "Issuer Application Data (IAD)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F11", name: "Issuer Code Table Index", kind: TagType::Numeric, sensitive: false },
    TagInfo { tag: "9F12", name: "Application Preferred Name", kind: TagType::Text, sensitive: false },
    TagInfo { tag: "9F13", name: "Last Online ATC Register", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F17", name: "PIN Try Counter", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F1A", name: "Terminal Country Code", kind: TagType::Country, sensitive: false },
    TagInfo { tag: "9F26", name: "Application Cryptogram (AC)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F27", name: "Cryptogram Information Data", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F34", name: "Cardholder Verification Method (CVM) Results", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F36", name: "Application Transaction Counter (ATC)", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F37", name: "Unpredictable Number", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "9F38", name: "Processing Options Data Object List (PDOL)", kind: TagType::Dol, sensitive: false },
    TagInfo { tag: "9F42", name: "Application Currency Code", kind: TagType::Currency, sensitive: false },
    TagInfo { tag: "A5", name: "FCI Proprietary Template", kind: TagType::Binary, sensitive: false },
    TagInfo { tag: "BF0C", name: "FCI Issuer Discretionary Data", kind: TagType::Binary, sensitive: false },
];

/// Looks up registry metadata for a tag, by exact hex match (eg. `"9F02"`).
pub fn lookup(tag: &Tag) -> Option<&'static TagInfo> {
    let hex = tag.to_string();
    REGISTRY.iter().find(|info| info.tag == hex)
}

/// Placeholder shown in place of a sensitive tag's value when redaction is on.
pub const REDACTED_PLACEHOLDER: &str = "<redacted>";

/// Renders a tag's raw value as a human-readable string, following the
/// registry's `TagType` for known tags and falling back to grouped hex for
/// anything unregistered. Sensitive tags are replaced with
/// [`REDACTED_PLACEHOLDER`] when `redact` is set.
pub fn render(tag: &Tag, value: &[u8], redact: bool) -> String {
    let info = lookup(tag);
    if redact && info.is_some_and(|i| i.sensitive) {
        return REDACTED_PLACEHOLDER.to_string();
    }
    match info.map(|i| i.kind).unwrap_or(TagType::Binary) {
        TagType::Binary => crate::util::format_hex_grouped(value),
        TagType::Text => render_text(value),
        TagType::Numeric | TagType::CompressedNumeric => crate::util::unpack_bcd_digits(value),
        TagType::Date => render_date(value).unwrap_or_else(|| crate::util::format_hex_grouped(value)),
        TagType::Amount => render_amount(value),
        TagType::Country => render_country(value),
        TagType::Currency => render_currency(value),
        TagType::Dol => render_dol(value),
    }
}

/// ISO 3166-1 numeric country codes this crate's `info`/`cap` flows are
/// likely to actually see - terminal/issuer country code tags carry these,
/// not the full UN registry. Unknown codes fall back to the raw digits.
static ISO_3166_NUMERIC: &[(&str, &str)] = &[
    ("036", "Australia"),
    ("124", "Canada"),
    ("250", "France"),
    ("276", "Germany"),
    ("372", "Ireland"),
    ("380", "Italy"),
    ("528", "Netherlands"),
    ("620", "Portugal"),
    ("724", "Spain"),
    ("752", "Sweden"),
    ("756", "Switzerland"),
    ("826", "United Kingdom"),
    ("840", "United States"),
];

/// ISO 4217 numeric currency codes, same rationale as [`ISO_3166_NUMERIC`].
static ISO_4217_NUMERIC: &[(&str, &str)] = &[
    ("036", "AUD"),
    ("124", "CAD"),
    ("208", "DKK"),
    ("348", "HUF"),
    ("392", "JPY"),
    ("578", "NOK"),
    ("752", "SEK"),
    ("756", "CHF"),
    ("826", "GBP"),
    ("840", "USD"),
    ("978", "EUR"),
];

fn render_country(value: &[u8]) -> String {
    render_iso_numeric(value, ISO_3166_NUMERIC)
}

fn render_currency(value: &[u8]) -> String {
    render_iso_numeric(value, ISO_4217_NUMERIC)
}

/// Renders a compressed-numeric ISO country/currency code, looked up
/// against a static table; an unrecognised code renders as the raw digits
/// (spec §4.2), not an error - new codes get assigned over time and this
/// crate doesn't track the full registry.
///
/// The wire format (EMV "n3" over 2 bytes) packs the 3-digit ISO code with
/// a leading pad zero, so `unpack_bcd_digits` yields 4 digits (eg. `"0826"`
/// for the UK's `826`); the registry stores the bare 3-digit code, so the
/// pad nibble is stripped before comparing, not before display.
fn render_iso_numeric(value: &[u8], table: &[(&str, &str)]) -> String {
    let digits = crate::util::unpack_bcd_digits(value);
    let code = match digits.len() {
        4 => &digits[1..],
        _ => digits.as_str(),
    };
    match table.iter().find(|(c, _)| *c == code) {
        Some((_, name)) => format!("{digits} ({name})"),
        None => digits,
    }
}

fn render_text(value: &[u8]) -> String {
    let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(value);
    if had_errors {
        crate::util::format_hex_grouped(value)
    } else {
        decoded.trim_end().to_string()
    }
}

/// EMV dates are BCD `YYMMDD`; EMV's epoch rolls over at `YY >= 50` per Book
/// 3, so this treats `00`-`49` as 2000-2049 and `50`-`99` as 1950-1999.
fn render_date(value: &[u8]) -> Option<String> {
    if value.len() != 3 {
        return None;
    }
    let digits = crate::util::unpack_bcd_digits(value);
    let yy: i32 = digits.get(0..2)?.parse().ok()?;
    let mm: u32 = digits.get(2..4)?.parse().ok()?;
    let dd: u32 = digits.get(4..6)?.parse().ok()?;
    let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
    let date = chrono::NaiveDate::from_ymd_opt(year, mm, dd)?;
    Some(date.format("%Y-%m-%d").to_string())
}

fn render_amount(value: &[u8]) -> String {
    let digits = crate::util::unpack_bcd_digits(value);
    let digits = digits.trim_start_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };
    if digits.len() <= 2 {
        format!("0.{digits:0>2}")
    } else {
        let (major, minor) = digits.split_at(digits.len() - 2);
        format!("{major}.{minor}")
    }
}

fn render_dol(value: &[u8]) -> String {
    let mut entries = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let Ok((tag, _value, after_tag)) = crate::tlv::decode_one(&pad_for_dol(rest)) else {
            break;
        };
        // DOL entries are tag + one-byte length, with no value bytes; strip
        // the phantom empty value `decode_one` parsed so we can read the
        // real length byte that follows the tag.
        let tag_len = rest.len() - after_tag.len();
        let Some(&len_byte) = rest.get(tag_len) else {
            break;
        };
        entries.push(format!("{tag}({len_byte})"));
        rest = &rest[tag_len + 1..];
    }
    entries.join(", ")
}

/// A DOL entry is `tag || length`, with no value - not a real TLV. This pads
/// a zero length byte on so the ordinary tag reader can be reused to find
/// where the tag ends.
fn pad_for_dol(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.push(0x00);
    out
}
