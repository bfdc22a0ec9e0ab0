//! Content identifiers.
//!
//! Two layouts are understood:
//!
//! - CIDv0: a bare sha2-256 multihash (`0x12 0x20 <32 bytes>`), written as
//!   base58btc without a multibase prefix (the familiar `Qm...` strings).
//! - CIDv1: `<version varint><codec varint><multihash>`, written as a
//!   multibase string. The canonical form is base32-lower (`b...`).

use std::fmt;
use std::str::FromStr;

/// Multicodec for raw binary content.
pub const CODEC_RAW: u64 = 0x55;
/// Multicodec for protobuf-encoded merkle dag nodes (the only v0 codec).
pub const CODEC_DAG_PB: u64 = 0x70;
/// Multihash code for sha2-256.
pub const MULTIHASH_SHA2_256: u64 = 0x12;
/// Multihash code for blake3.
pub const MULTIHASH_BLAKE3: u64 = 0x1e;

const CID_V0_LEN: usize = 34;
const CID_V0_STR_LEN: usize = 46;
const MAX_VARINT_LEN: usize = 9;

#[derive(thiserror::Error, Debug)]
pub enum CidError {
    #[error("invalid multibase string: {0}")]
    Multibase(#[from] multibase::Error),
    #[error("empty cid")]
    Empty,
    #[error("invalid varint at byte {0}")]
    InvalidVarint(usize),
    #[error("unsupported cid version {0}")]
    UnsupportedVersion(u64),
    #[error("invalid multihash: {0}")]
    InvalidMultihash(&'static str),
    #[error("cidv0 must be a 34 byte sha2-256 multihash, got {0} bytes")]
    InvalidV0(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CidVersion {
    V0,
    V1,
}

/// Content identifier.
///
/// A `Cid` is immutable and ordered by version, then codec number, then
/// multihash bytes. This is not the order of the binary form once a codec
/// needs more than one varint byte. Pin listings use it as a stable order
/// independent of insertion history.
///
/// ```
/// use pinset_core::Cid;
///
/// let cid: Cid = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmq".parse().unwrap();
/// assert_eq!(cid.to_string(), "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmq");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    version: CidVersion,
    codec: u64,
    multihash: Box<[u8]>,
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cid").field(&self.to_string()).finish()
    }
}

impl Cid {
    /// Creates a CIDv0 from a sha2-256 digest.
    pub fn new_v0(sha256_digest: [u8; 32]) -> Self {
        let mut multihash = Vec::with_capacity(CID_V0_LEN);
        multihash.push(MULTIHASH_SHA2_256 as u8);
        multihash.push(32);
        multihash.extend_from_slice(&sha256_digest);
        Self {
            version: CidVersion::V0,
            codec: CODEC_DAG_PB,
            multihash: multihash.into_boxed_slice(),
        }
    }

    /// Creates a CIDv1 from a codec, a multihash code and the digest bytes.
    pub fn new_v1(codec: u64, hash_code: u64, digest: &[u8]) -> Self {
        let mut multihash = Vec::with_capacity(digest.len() + 2 * MAX_VARINT_LEN);
        write_uvarint(&mut multihash, hash_code);
        write_uvarint(&mut multihash, digest.len() as u64);
        multihash.extend_from_slice(digest);
        Self {
            version: CidVersion::V1,
            codec,
            multihash: multihash.into_boxed_slice(),
        }
    }

    /// Hashes `data` with blake3 and returns the CIDv1 addressing it.
    pub fn blake3(codec: u64, data: impl AsRef<[u8]>) -> Self {
        let hash = blake3::hash(data.as_ref());
        Self::new_v1(codec, MULTIHASH_BLAKE3, hash.as_bytes())
    }

    /// Parses any supported string encoding.
    pub fn parse(s: &str) -> Result<Self, CidError> {
        if s.is_empty() {
            return Err(CidError::Empty);
        }
        if s.len() == CID_V0_STR_LEN && s.starts_with("Qm") {
            let bytes = multibase::Base::Base58Btc.decode(s)?;
            return Self::from_v0_multihash(bytes);
        }
        let (_, bytes) = multibase::decode(s)?;
        Self::from_bytes(&bytes)
    }

    /// Decodes the binary form produced by [`Cid::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        if bytes.is_empty() {
            return Err(CidError::Empty);
        }
        if bytes.len() == CID_V0_LEN && bytes[0] == MULTIHASH_SHA2_256 as u8 && bytes[1] == 32 {
            return Self::from_v0_multihash(bytes.to_vec());
        }

        let (version, mut offset) = read_uvarint(bytes, 0)?;
        if version != 1 {
            return Err(CidError::UnsupportedVersion(version));
        }
        let (codec, read) = read_uvarint(bytes, offset)?;
        offset = read;

        let multihash = &bytes[offset..];
        validate_multihash(multihash)?;

        Ok(Self {
            version: CidVersion::V1,
            codec,
            multihash: multihash.into(),
        })
    }

    fn from_v0_multihash(bytes: Vec<u8>) -> Result<Self, CidError> {
        if bytes.len() != CID_V0_LEN {
            return Err(CidError::InvalidV0(bytes.len()));
        }
        if bytes[0] != MULTIHASH_SHA2_256 as u8 || bytes[1] != 32 {
            return Err(CidError::InvalidMultihash("cidv0 requires sha2-256"));
        }
        Ok(Self {
            version: CidVersion::V0,
            codec: CODEC_DAG_PB,
            multihash: bytes.into_boxed_slice(),
        })
    }

    pub fn version(&self) -> CidVersion {
        self.version
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// The full multihash (code, length and digest).
    pub fn multihash(&self) -> &[u8] {
        &self.multihash
    }

    /// Binary form. CIDv0 is the bare multihash.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.version {
            CidVersion::V0 => self.multihash.to_vec(),
            CidVersion::V1 => {
                let mut bytes = Vec::with_capacity(self.multihash.len() + 2 * MAX_VARINT_LEN);
                write_uvarint(&mut bytes, 1);
                write_uvarint(&mut bytes, self.codec);
                bytes.extend_from_slice(&self.multihash);
                bytes
            }
        }
    }

    /// Short form for logs: the last 8 characters of the canonical string.
    pub fn fmt_short(&self) -> String {
        let s = self.to_string();
        let start = s.len().saturating_sub(8);
        s[start..].to_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            CidVersion::V0 => f.write_str(&multibase::Base::Base58Btc.encode(&self.multihash)),
            CidVersion::V1 => f.write_str(&multibase::encode(
                multibase::Base::Base32Lower,
                self.to_bytes(),
            )),
        }
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s)
    }
}

fn validate_multihash(multihash: &[u8]) -> Result<(), CidError> {
    if multihash.is_empty() {
        return Err(CidError::InvalidMultihash("missing multihash"));
    }
    let (_, offset) = read_uvarint(multihash, 0)?;
    let (len, offset) = read_uvarint(multihash, offset)?;
    if multihash.len() - offset != len as usize {
        return Err(CidError::InvalidMultihash("digest length mismatch"));
    }
    Ok(())
}

fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Reads an unsigned varint starting at `offset`, returning the value and
/// the offset just past it.
fn read_uvarint(bytes: &[u8], offset: usize) -> Result<(u64, usize), CidError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = bytes.get(offset + i) else {
            return Err(CidError::InvalidVarint(offset + i));
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, offset + i + 1));
        }
    }
    Err(CidError::InvalidVarint(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CID_1: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmq";
    const TEST_CID_2: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmma";

    #[test]
    fn test_parse_v0_roundtrip() {
        let cid = Cid::parse(TEST_CID_1).unwrap();
        assert_eq!(cid.version(), CidVersion::V0);
        assert_eq!(cid.codec(), CODEC_DAG_PB);
        assert_eq!(cid.to_string(), TEST_CID_1);
        assert_eq!(cid.to_bytes().len(), CID_V0_LEN);
    }

    #[test]
    fn test_distinct_v0_strings_are_distinct() {
        let a = Cid::parse(TEST_CID_1).unwrap();
        let b = Cid::parse(TEST_CID_2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_v0_display_parses_back() {
        let cid = Cid::new_v0([7u8; 32]);
        let s = cid.to_string();
        assert!(s.starts_with("Qm"));
        assert_eq!(Cid::parse(&s).unwrap(), cid);
    }

    #[test]
    fn test_v1_blake3_roundtrip() {
        let cid = Cid::blake3(CODEC_RAW, b"hello");
        assert_eq!(cid.version(), CidVersion::V1);
        let s = cid.to_string();
        assert!(s.starts_with('b'), "canonical v1 form is base32: {s}");
        let parsed: Cid = s.parse().unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(Cid::from_bytes(&cid.to_bytes()).unwrap(), cid);
    }

    #[test]
    fn test_v1_accepts_other_multibase_encodings() {
        let cid = Cid::blake3(CODEC_RAW, b"other bases");
        let b58 = multibase::encode(multibase::Base::Base58Btc, cid.to_bytes());
        let b16 = multibase::encode(multibase::Base::Base16Lower, cid.to_bytes());
        assert_eq!(Cid::parse(&b58).unwrap(), cid);
        assert_eq!(Cid::parse(&b16).unwrap(), cid);
        // Canonical output does not depend on the input encoding.
        assert_eq!(Cid::parse(&b58).unwrap().to_string(), cid.to_string());
    }

    #[test]
    fn test_large_codec_varint() {
        let cid = Cid::new_v1(0x0129, MULTIHASH_BLAKE3, &[1u8; 32]);
        let parsed = Cid::from_bytes(&cid.to_bytes()).unwrap();
        assert_eq!(parsed.codec(), 0x0129);
    }

    #[test]
    fn test_order_is_version_codec_multihash() {
        let v0 = Cid::new_v0([9u8; 32]);
        let raw = Cid::new_v1(CODEC_RAW, MULTIHASH_BLAKE3, &[9u8; 32]);
        let pb = Cid::new_v1(CODEC_DAG_PB, MULTIHASH_BLAKE3, &[0u8; 32]);
        assert!(v0 < raw);
        assert!(raw < pb);

        // 0x81 encodes as [0x81, 0x01] and 0x100 as [0x80, 0x02].
        let small = Cid::new_v1(0x81, MULTIHASH_BLAKE3, &[1u8; 32]);
        let large = Cid::new_v1(0x100, MULTIHASH_BLAKE3, &[1u8; 32]);
        assert!(small < large);
        assert!(small.to_bytes() > large.to_bytes());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Cid::parse(""), Err(CidError::Empty)));
        assert!(Cid::parse("agadfaegf").is_err());
        assert!(Cid::parse("QmNotPresent").is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let bytes = [2u8, 0x55, 0x1e, 0x01, 0x00];
        assert!(matches!(
            Cid::from_bytes(&bytes),
            Err(CidError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_digest_length_mismatch() {
        let mut bytes = Cid::blake3(CODEC_RAW, b"x").to_bytes();
        bytes.pop();
        assert!(matches!(
            Cid::from_bytes(&bytes),
            Err(CidError::InvalidMultihash(_))
        ));
    }

    #[test]
    fn test_truncated_varint() {
        assert!(matches!(
            Cid::from_bytes(&[0x81]),
            Err(CidError::InvalidVarint(_))
        ));
    }

    #[test]
    fn test_fmt_short() {
        let cid = Cid::parse(TEST_CID_1).unwrap();
        assert_eq!(cid.fmt_short(), "cPzpqmmq");
    }
}
