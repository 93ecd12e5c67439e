//! ISO 7816 / EMV flavoured BER-TLV (Tag-Length-Value) codec.
//!
//! BER is an ASN.1 encoding, originally documented in ISO 8825. The subset
//! used here is the one EMV Book 3, Annex B documents (itself drawn from
//! ISO 7816-6) - identical in spirit to the one-shot `parse_next` this crate
//! used to have, generalized into a full tree so duplicate tags and nested
//! constructed values round-trip losslessly.

use byteorder::{BigEndian, ByteOrder};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;

use crate::error::{CodecErrorReason, Error};

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// A BER tag identifier: 1-3 raw bytes, compared by full byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<u8>);

impl Tag {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this tag's class bit marks it constructed (holds further TLVs)
    /// rather than primitive (holds raw data).
    pub fn is_constructed(&self) -> bool {
        self.0.first().is_some_and(|b| b & (1 << 5) != 0)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Convenience constructor from a hex literal, eg. `tag!("9F10")`.
#[macro_export]
macro_rules! tag {
    ($hex:expr) => {
        $crate::tlv::Tag::new(
            $crate::util::parse_hex($hex).expect("invalid hex literal in tag!()"),
        )
    };
}

/// A decoded TLV value: either raw bytes (primitive) or a nested tree
/// (constructed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Primitive(Vec<u8>),
    Constructed(Tlv),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Primitive(b) => Some(b),
            Value::Constructed(_) => None,
        }
    }

    pub fn as_tlv(&self) -> Option<&Tlv> {
        match self {
            Value::Constructed(t) => Some(t),
            Value::Primitive(_) => None,
        }
    }
}

/// An ordered, duplicate-tolerant TLV tree: a sequence of `(Tag, Value)`
/// pairs that preserves insertion order for round-trip fidelity. EMV records
/// rarely repeat a tag, but the codec must not silently drop repeats.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tlv {
    entries: Vec<(Tag, Value)>,
}

impl Tlv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: Tag, value: Value) {
        self.entries.push((tag, value));
    }

    /// First value stored under `tag`, if any.
    pub fn get(&self, tag: &Tag) -> Option<&Value> {
        self.entries.iter().find(|(t, _)| t == tag).map(|(_, v)| v)
    }

    /// All values stored under `tag`, in insertion order.
    pub fn get_all<'a>(&'a self, tag: &'a Tag) -> impl Iterator<Item = &'a Value> + 'a {
        self.entries.iter().filter(move |(t, _)| t == tag).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Tag, Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads a (possibly multi-byte) tag starting at `data`, returning the tag
/// bytes and the rest of the input.
///
/// If bits 1-5 of the first byte are all set, the tag continues until and
/// including the first subsequent byte without bit 8 set. See EMV Book 3,
/// Annex B1. Built on `nom::bytes::complete::take`, the way `ber.rs`'s own
/// `take_tag` is.
fn take_tag(data: &[u8], offset: usize) -> Result<(&[u8], &[u8]), Error> {
    let truncated = || Error::Codec {
        offset,
        reason: CodecErrorReason::Truncated,
    };
    let (rest, first): (&[u8], &[u8]) =
        take::<_, _, NomError>(1usize)(data).map_err(|_| truncated())?;
    if first[0] & 0b0001_1111 != 0b0001_1111 {
        return Ok((rest, first));
    }
    let mut tag_len = 2usize;
    loop {
        match rest.get(tag_len - 2) {
            Some(b) if b & 0b1000_0000 != 0 => tag_len += 1,
            Some(_) => break,
            None => return Err(truncated()),
        }
    }
    let (rest, tag): (&[u8], &[u8]) =
        take::<_, _, NomError>(tag_len)(data).map_err(|_| truncated())?;
    Ok((rest, tag))
}

/// Reads a BER length field. Returns the decoded length, the rest of the
/// input, and whether the encoding was minimal (short form for lengths
/// <= 127, shortest possible long form otherwise). Built on
/// `nom::number::complete::be_u8` and `nom::bytes::complete::take`, the way
/// `ber.rs`'s own `take_len` is.
fn take_len(data: &[u8], offset: usize) -> Result<(&[u8], usize, bool), Error> {
    let truncated = || Error::Codec {
        offset,
        reason: CodecErrorReason::Truncated,
    };
    let (rest, first): (&[u8], u8) = be_u8::<_, NomError>(data).map_err(|_| truncated())?;
    if first & 0x80 == 0 {
        return Ok((rest, first as usize, true));
    }
    if first == 0x80 {
        return Err(Error::Codec {
            offset,
            reason: CodecErrorReason::IndefiniteLength,
        });
    }
    let n = (first & 0x7F) as usize;
    if n == 0 || n > 4 {
        return Err(Error::Codec {
            offset,
            reason: CodecErrorReason::IllegalLengthForm,
        });
    }
    let (rest, len_bytes): (&[u8], &[u8]) =
        take::<_, _, NomError>(n)(rest).map_err(|_| truncated())?;
    let len = BigEndian::read_uint(len_bytes, n) as usize;
    // Non-minimal: a long form that could have been expressed in fewer
    // bytes, or one whose value fits in the short form entirely.
    let minimal = len_bytes[0] != 0 && len > 127;
    Ok((rest, len, minimal))
}

/// Decodes exactly one `(tag, value)` entry from the front of `data`,
/// recursing into constructed values. Returns the decoded tag, value, and
/// whatever bytes remain - the streaming form used to walk chained
/// structures one entry at a time.
pub fn decode_one(data: &[u8]) -> Result<(Tag, Value, &[u8]), Error> {
    decode_one_at(data, 0)
}

fn decode_one_at(data: &[u8], base_offset: usize) -> Result<(Tag, Value, &[u8]), Error> {
    decode_one_tolerant(data, base_offset, true)
}

fn decode_one_tolerant(
    data: &[u8],
    base_offset: usize,
    tolerant: bool,
) -> Result<(Tag, Value, &[u8]), Error> {
    let (rest, tag_bytes) = take_tag(data, base_offset)?;
    let tag = Tag::new(tag_bytes.to_vec());
    let len_offset = base_offset + tag_bytes.len();
    let (rest, len, minimal) = take_len(rest, len_offset)?;
    if !tolerant && !minimal {
        return Err(Error::Codec {
            offset: len_offset,
            reason: CodecErrorReason::IllegalLengthForm,
        });
    }
    if rest.len() < len {
        return Err(Error::Codec {
            offset: len_offset,
            reason: CodecErrorReason::Truncated,
        });
    }
    let (value_bytes, rest) = rest.split_at(len);
    let value_offset = base_offset + (data.len() - rest.len() - len);
    let value = if tag.is_constructed() {
        // The constructed value's own length is a hard boundary - anything
        // left over inside it once its children stop decoding cleanly is
        // trailing garbage, not a truncated/malformed outer buffer.
        Value::Constructed(decode_tree_tolerant(value_bytes, value_offset, tolerant, true)?)
    } else {
        Value::Primitive(value_bytes.to_vec())
    };
    Ok((tag, value, rest))
}

/// Decodes a full buffer into a TLV tree. Trailing `0x00` padding bytes
/// (common between EMV records) are skipped rather than treated as a
/// malformed tag.
pub fn decode(data: &[u8]) -> Result<Tlv, Error> {
    decode_tree_tolerant(data, 0, true, false)
}

/// As [`decode`], but rejects non-minimal BER length encodings instead of
/// tolerating them. EMV cards in the wild emit both forms, so [`decode`]
/// tolerates by default; this is for callers that want strict BER.
pub fn decode_strict(data: &[u8]) -> Result<Tlv, Error> {
    decode_tree_tolerant(data, 0, false, false)
}

/// `bounded` is true when `data` is a constructed value's own declared
/// byte range (as opposed to an outer streaming buffer with no declared
/// total length): once at least one child has decoded cleanly in that
/// range, anything afterwards that fails to decode as a further child is
/// `TrailingGarbageInConstructed`, not whatever `decode_one_tolerant`
/// itself would have reported (`Truncated`/`IllegalLengthForm`).
fn decode_tree_tolerant(
    mut data: &[u8],
    mut offset: usize,
    tolerant: bool,
    bounded: bool,
) -> Result<Tlv, Error> {
    let mut tree = Tlv::new();
    while let Some(&b) = data.first() {
        if b == 0x00 {
            data = &data[1..];
            offset += 1;
            continue;
        }
        let consumed_before = data.len();
        match decode_one_tolerant(data, offset, tolerant) {
            Ok((tag, value, rest)) => {
                offset += consumed_before - rest.len();
                tree.push(tag, value);
                data = rest;
            }
            Err(_) if bounded && !tree.is_empty() => {
                return Err(Error::Codec {
                    offset,
                    reason: CodecErrorReason::TrailingGarbageInConstructed,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(tree)
}

/// Encodes a length using the minimal BER form: short form for `<= 127`,
/// otherwise the shortest long form that holds it.
fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len <= 127 {
        out.push(len as u8);
        return;
    }
    let mut len_bytes = Vec::new();
    let mut v = len as u64;
    while v > 0 {
        len_bytes.push((v & 0xFF) as u8);
        v >>= 8;
    }
    len_bytes.reverse();
    out.push(0x80 | len_bytes.len() as u8);
    out.extend_from_slice(&len_bytes);
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Primitive(bytes) => out.extend_from_slice(bytes),
        Value::Constructed(tree) => encode_into(tree, out),
    }
}

fn encode_into(tree: &Tlv, out: &mut Vec<u8>) {
    for (tag, value) in tree.iter() {
        out.extend_from_slice(tag.as_bytes());
        let mut body = Vec::new();
        encode_value(value, &mut body);
        encode_len(body.len(), out);
        out.extend_from_slice(&body);
    }
}

/// Encodes a TLV tree to bytes. The symmetric operation to [`decode`]:
/// `decode(encode(t)) == t` for any tree `decode` can produce.
pub fn encode(tree: &Tlv) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(tree, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(hex: &str) -> Tag {
        Tag::new(crate::util::parse_hex(hex).unwrap())
    }

    #[test]
    fn test_is_constructed() {
        assert!(t("6F").is_constructed());
        assert!(t("BF0C").is_constructed());
        assert!(!t("84").is_constructed());
        assert!(!t("5F2D").is_constructed());
    }

    #[test]
    fn test_decode_emv_directory_fci() {
        // SELECT '1PAY.SYS.DDF01' response, as seen from a real contactless card.
        let data = crate::util::parse_hex(
            "6F 1E 84 0E 31 50 41 59 2E 53 59 53 2E 44 44 46 30 31 A5 0C 88 01 01 5F 2D 02 65 6E 9F 11 01 01",
        )
        .unwrap();
        let tree = decode(&data).unwrap();
        assert_eq!(tree.len(), 1);
        let fci = tree.get(&t("6F")).unwrap().as_tlv().unwrap();
        assert_eq!(
            fci.get(&t("84")).unwrap().as_bytes().unwrap(),
            "1PAY.SYS.DDF01".as_bytes()
        );
        let prop = fci.get(&t("A5")).unwrap().as_tlv().unwrap();
        assert_eq!(prop.get(&t("88")).unwrap().as_bytes().unwrap(), &[0x01]);
        assert_eq!(
            prop.get(&t("5F2D")).unwrap().as_bytes().unwrap(),
            "en".as_bytes()
        );
        assert_eq!(prop.get(&t("9F11")).unwrap().as_bytes().unwrap(), &[0x01]);
    }

    #[test]
    fn test_round_trip_s6() {
        // S6 from spec.md §8.
        let mut prop = Tlv::new();
        prop.push(t("88"), Value::Primitive(vec![0x01]));
        let mut root = Tlv::new();
        root.push(t("84"), Value::Primitive("1PAY.SYS.DDF01".into()));
        root.push(t("A5"), Value::Constructed(prop));
        let mut tree = Tlv::new();
        tree.push(t("6F"), Value::Constructed(root));

        let bytes = encode(&tree);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_duplicate_tags_preserved_in_order() {
        let mut tree = Tlv::new();
        tree.push(t("9F02"), Value::Primitive(vec![0x01]));
        tree.push(t("9F02"), Value::Primitive(vec![0x02]));
        let all: Vec<_> = tree.get_all(&t("9F02")).collect();
        assert_eq!(all, vec![&Value::Primitive(vec![0x01]), &Value::Primitive(vec![0x02])]);
        assert_eq!(tree.get(&t("9F02")), Some(&Value::Primitive(vec![0x01])));

        let bytes = encode(&tree);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_trailing_padding_skipped() {
        // 9F 02 01 02 -- followed by trailing zero padding.
        let bytes = crate::util::parse_hex("9F0201020000").unwrap();
        let tree = decode(&bytes).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&t("9F02")).unwrap().as_bytes().unwrap(), &[0x02]);
    }

    #[test]
    fn test_reject_indefinite_length() {
        let bytes = [0x9F, 0x02, 0x80];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                reason: CodecErrorReason::IndefiniteLength,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_value() {
        let bytes = [0x9F, 0x02, 0x05, 0x01, 0x02];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                reason: CodecErrorReason::Truncated,
                ..
            }
        ));
    }

    #[test]
    fn test_trailing_garbage_in_constructed() {
        // A5 declares a 4-byte value: tag 88 decodes cleanly as one
        // complete child (88 01 01), leaving one non-padding byte (FF)
        // inside A5's own declared length that doesn't parse as another
        // child.
        let bytes = crate::util::parse_hex("A5 04 88 01 01 FF").unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                reason: CodecErrorReason::TrailingGarbageInConstructed,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_constructed_with_no_complete_child_is_not_trailing_garbage() {
        // Nothing inside A5's value ever decodes as a complete child, so
        // this is an ordinary truncation, not "garbage after the last
        // child" - there is no last child.
        let bytes = crate::util::parse_hex("A5 01 9F").unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                reason: CodecErrorReason::Truncated,
                ..
            }
        ));
    }

    #[test]
    fn test_non_minimal_length_tolerated_by_default() {
        // 0x81 0x01 is a non-minimal long form for a length of 1.
        let bytes = [0x9F, 0x02, 0x81, 0x01, 0xAA];
        let tree = decode(&bytes).unwrap();
        assert_eq!(tree.get(&t("9F02")).unwrap().as_bytes().unwrap(), &[0xAA]);
    }

    #[test]
    fn test_non_minimal_length_rejected_when_strict() {
        let bytes = [0x9F, 0x02, 0x81, 0x01, 0xAA];
        let err = decode_strict(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                reason: CodecErrorReason::IllegalLengthForm,
                ..
            }
        ));
    }
}
