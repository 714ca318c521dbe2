//! OTRv3 DSA key codec and fingerprints.
//!
//! Wire layout (ASCII-armored as base64 for transport):
//!
//! ```text
//! PublicDsa:  [SHORT keytype=0x0000][MPI p][MPI q][MPI g][MPI y]
//! PrivateDsa: [SHORT keytype=0x0000][MPI p][MPI q][MPI g][MPI y][MPI x]
//! ```
//!
//! Decoding dispatches on the keytype code through a fixed registry. The
//! fingerprint is the SHA-1 of the public parameters' wire encodings; DSA
//! keys hash without their keytype prefix, other key types hash it first.

use crate::crypto::{self, SHA1_LEN};
use crate::ints::{Mpi, Reader, Width};
use crate::record::{Node, Record};
use crate::sexp::Value;
use crate::KeyTrustError;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

/// Keytype code of OTR DSA keys.
pub const DSA_KEY_TYPE: u16 = 0x0000;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// SHA-1 fingerprint of a public key, rendered as 40 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; SHA1_LEN]);

impl Fingerprint {
    /// Fingerprint over the given keytype and public parameters.
    pub fn compute(key_type: u16, params: &[&Mpi]) -> Self {
        let mut hashed = Vec::new();
        // Type 0 (DSA) predates typed keys: its code is not part of the hash.
        if key_type != DSA_KEY_TYPE {
            hashed.extend_from_slice(&key_type.to_be_bytes());
        }
        for param in params {
            param.write_to(&mut hashed);
        }
        let fingerprint = Fingerprint(crypto::sha1_digest([hashed.as_slice()]));
        trace!(key_type, fingerprint = %fingerprint, "computed fingerprint");
        fingerprint
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a hex rendering, ignoring case and surrounding
    /// whitespace, in constant time.
    pub fn matches_hex(&self, text: &str) -> bool {
        match hex::decode(text.trim()) {
            Ok(bytes) => crypto::constant_time_equal(&bytes, &self.0),
            Err(_) => false,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = KeyTrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| KeyTrustError::structural(0, format!("invalid fingerprint: {}", e)))?;
        let digest: [u8; SHA1_LEN] = bytes.as_slice().try_into().map_err(|_| {
            KeyTrustError::structural(
                0,
                format!("fingerprint must be {} bytes, got {}", SHA1_LEN, bytes.len()),
            )
        })?;
        Ok(Fingerprint(digest))
    }
}

// ---------------------------------------------------------------------------
// DSA keys
// ---------------------------------------------------------------------------

/// OTR public authentication DSA key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicDsa {
    pub p: Mpi,
    pub q: Mpi,
    pub g: Mpi,
    pub y: Mpi,
}

/// DSA private key: the public parameters plus the secret exponent `x`.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateDsa {
    pub public: PublicDsa,
    pub x: Mpi,
}

impl fmt::Debug for PrivateDsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateDsa")
            .field("public", &self.public)
            .field("x", &"<redacted>")
            .finish()
    }
}

fn read_header(reader: &mut Reader<'_>, expected: u16) -> Result<(), KeyTrustError> {
    let key_type = reader.read_short()?;
    if key_type != expected {
        return Err(KeyTrustError::UnknownKeyType(key_type));
    }
    Ok(())
}

impl PublicDsa {
    pub fn params(&self) -> [&Mpi; 4] {
        [&self.p, &self.q, &self.g, &self.y]
    }

    fn read_params(reader: &mut Reader<'_>) -> Result<Self, KeyTrustError> {
        Ok(PublicDsa {
            p: reader.read_mpi()?,
            q: reader.read_mpi()?,
            g: reader.read_mpi()?,
            y: reader.read_mpi()?,
        })
    }

    /// Decode exactly one DSA public key (keytype plus four MPIs).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyTrustError> {
        let mut reader = Reader::new(bytes);
        read_header(&mut reader, DSA_KEY_TYPE)?;
        let key = PublicDsa::read_params(&mut reader)?;
        reader.finish()?;
        Ok(key)
    }

    /// Decode the base64 armor of a DSA public key.
    ///
    /// # Errors
    /// Fails like `from_bytes`, or with `KeyTrustError::Structural` if the
    /// armor is not valid base64.
    pub fn from_base64(text: &str) -> Result<Self, KeyTrustError> {
        PublicDsa::from_bytes(&crypto::base64_decode(text)?)
    }

    /// Read `p`, `q`, `g` and `y` from a `(dsa (p ..) (q ..) (g ..) (y ..) ..)`
    /// record. Further fields are ignored.
    pub fn from_record(record: &Record) -> Result<Self, KeyTrustError> {
        expect_algorithm(record, "dsa")?;
        Ok(PublicDsa {
            p: mpi_field(record, "p")?,
            q: mpi_field(record, "q")?,
            g: mpi_field(record, "g")?,
            y: mpi_field(record, "y")?,
        })
    }

    /// Wire form: keytype followed by `p`, `q`, `g` and `y` as MPIs.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(DSA_KEY_TYPE, &self.params())
    }

    /// Base64 armor of `to_bytes`.
    pub fn to_base64(&self) -> String {
        crypto::base64_encode(&self.to_bytes())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(DSA_KEY_TYPE, &self.params())
    }
}

impl PrivateDsa {
    pub fn params(&self) -> [&Mpi; 5] {
        let [p, q, g, y] = self.public.params();
        [p, q, g, y, &self.x]
    }

    pub fn public_key(&self) -> &PublicDsa {
        &self.public
    }

    /// Decode exactly one DSA private key (keytype plus five MPIs).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyTrustError> {
        let mut reader = Reader::new(bytes);
        read_header(&mut reader, DSA_KEY_TYPE)?;
        let public = PublicDsa::read_params(&mut reader)?;
        let x = read_secret(&mut reader)?;
        reader.finish()?;
        Ok(PrivateDsa { public, x })
    }

    /// Decode the base64 armor of a DSA private key.
    ///
    /// # Errors
    /// Fails like `from_bytes`, or with `KeyTrustError::Structural` if the
    /// armor is not valid base64.
    pub fn from_base64(text: &str) -> Result<Self, KeyTrustError> {
        PrivateDsa::from_bytes(&crypto::base64_decode(text)?)
    }

    /// Read a private key from a `(dsa (p ..) (q ..) (g ..) (y ..) (x ..))`
    /// record.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Schema` if a field is missing or malformed, or
    /// if `x` is zero.
    pub fn from_record(record: &Record) -> Result<Self, KeyTrustError> {
        let public = PublicDsa::from_record(record)?;
        let x = mpi_field(record, "x")?;
        if x.byte_len() == 0 {
            return Err(KeyTrustError::Schema(
                "DSA secret exponent 'x' is zero".to_string(),
            ));
        }
        Ok(PrivateDsa { public, x })
    }

    /// Wire form: the public parameters followed by `x`.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(DSA_KEY_TYPE, &self.params())
    }

    /// Base64 armor of `to_bytes`.
    pub fn to_base64(&self) -> String {
        crypto::base64_encode(&self.to_bytes())
    }

    /// Fingerprint of the public part; `x` is never hashed.
    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }
}

/// Read the secret exponent, which must be non-zero.
fn read_secret(reader: &mut Reader<'_>) -> Result<Mpi, KeyTrustError> {
    let at = reader.offset();
    let x = reader.read_mpi()?;
    if x.byte_len() == 0 {
        return Err(KeyTrustError::structural(at, "DSA secret exponent x is zero"));
    }
    Ok(x)
}

fn encode(key_type: u16, params: &[&Mpi]) -> Vec<u8> {
    let mut out = key_type.to_be_bytes().to_vec();
    for param in params {
        param.write_to(&mut out);
    }
    out
}

fn expect_algorithm(record: &Record, algorithm: &str) -> Result<(), KeyTrustError> {
    if record.key() != algorithm {
        return Err(KeyTrustError::Schema(format!(
            "expected a '{}' key record, found '{}'",
            algorithm,
            record.key()
        )));
    }
    Ok(())
}

/// Convert the atom stored under `name` to an MPI.
fn mpi_field(record: &Record, name: &str) -> Result<Mpi, KeyTrustError> {
    match record.atom(name)? {
        Value::Bytes(bytes) => Mpi::from_be_bytes(bytes),
        Value::Integer(n) => {
            let n = n.to_biguint().ok_or_else(|| {
                KeyTrustError::Schema(format!("key parameter '{}' is negative", name))
            })?;
            Mpi::new(n)
        }
        other => Err(KeyTrustError::Schema(format!(
            "key parameter '{}' must be a number or byte string, found {}",
            name, other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Key registry
// ---------------------------------------------------------------------------

/// Any key this codec can decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    PublicDsa(PublicDsa),
    PrivateDsa(PrivateDsa),
}

/// Decodes the parameters following a keytype code.
pub type Decoder = fn(&mut Reader<'_>) -> Result<Key, KeyTrustError>;

/// Registered keytype codes and their decoders.
const DECODERS: &[(u16, Decoder)] = &[(DSA_KEY_TYPE, decode_dsa)];

/// Look up the decoder registered for `key_type`.
pub fn decoder_for(key_type: u16) -> Option<Decoder> {
    DECODERS
        .iter()
        .find(|(code, _)| *code == key_type)
        .map(|(_, decoder)| *decoder)
}

/// Four MPIs make a public key; a fifth makes it private. Fewer bytes than
/// an MPI length prefix after `y` are trailing data.
fn decode_dsa(reader: &mut Reader<'_>) -> Result<Key, KeyTrustError> {
    let public = PublicDsa::read_params(reader)?;
    match reader.remaining() {
        0 => Ok(Key::PublicDsa(public)),
        remaining if remaining < Width::Int.len() => Err(KeyTrustError::TrailingData {
            offset: reader.offset(),
            remaining,
        }),
        _ => {
            let x = read_secret(reader)?;
            Ok(Key::PrivateDsa(PrivateDsa { public, x }))
        }
    }
}

impl Key {
    pub fn key_type(&self) -> u16 {
        match self {
            Key::PublicDsa(_) | Key::PrivateDsa(_) => DSA_KEY_TYPE,
        }
    }

    /// Parameters in wire order, including secret ones.
    pub fn params(&self) -> Vec<&Mpi> {
        match self {
            Key::PublicDsa(k) => k.params().to_vec(),
            Key::PrivateDsa(k) => k.params().to_vec(),
        }
    }

    /// The public half of this key.
    pub fn public_key(&self) -> Key {
        match self {
            Key::PublicDsa(k) => Key::PublicDsa(k.clone()),
            Key::PrivateDsa(k) => Key::PublicDsa(k.public.clone()),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Key::PrivateDsa(_))
    }

    /// Decode a key from its binary wire form.
    ///
    /// # Errors
    /// - `KeyTrustError::UnknownKeyType` if the keytype code is not registered
    /// - `KeyTrustError::LengthMismatch` if the buffer ends inside a field
    /// - `KeyTrustError::TrailingData` if bytes remain after the last parameter
    pub fn from_bytes(bytes: &[u8]) -> Result<Key, KeyTrustError> {
        let mut reader = Reader::new(bytes);
        let key_type = reader.read_short()?;
        let decode = decoder_for(key_type).ok_or(KeyTrustError::UnknownKeyType(key_type))?;
        let key = decode(&mut reader)?;
        reader.finish()?;
        debug!(key_type, private = key.is_private(), "decoded key");
        Ok(key)
    }

    /// Decode a key from its base64 armor.
    pub fn from_base64(text: &str) -> Result<Key, KeyTrustError> {
        Key::from_bytes(&crypto::base64_decode(text)?)
    }

    /// Build a key from an algorithm record such as `(dsa (p ..) .. (x ..))`.
    /// The key is private if the record carries an `x` field.
    pub fn from_record(record: &Record) -> Result<Key, KeyTrustError> {
        if record.entries("x").next().is_some() {
            Ok(Key::PrivateDsa(PrivateDsa::from_record(record)?))
        } else {
            Ok(Key::PublicDsa(PublicDsa::from_record(record)?))
        }
    }

    /// Build a key from a folded node, which must be an algorithm record.
    pub fn from_node(node: &Node) -> Result<Key, KeyTrustError> {
        let record = node
            .as_record()
            .ok_or_else(|| KeyTrustError::Schema("key must be an algorithm record".to_string()))?;
        Key::from_record(record)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.key_type(), &self.params())
    }

    pub fn to_base64(&self) -> String {
        crypto::base64_encode(&self.to_bytes())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Key::PublicDsa(k) => k.fingerprint(),
            Key::PrivateDsa(k) => k.fingerprint(),
        }
    }
}

impl From<PublicDsa> for Key {
    fn from(key: PublicDsa) -> Self {
        Key::PublicDsa(key)
    }
}

impl From<PrivateDsa> for Key {
    fn from(key: PrivateDsa) -> Self {
        Key::PrivateDsa(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::parse;
    use proptest::prelude::*;

    const SMALL_PUBLIC: &str = "AAAAAAAC/AEAAAABgQAAAAECAAAAAA==";
    const SMALL_PRIVATE: &str = "AAAAAAAC/AEAAAABgQAAAAECAAAAAAAAAAEH";
    const SMALL_FINGERPRINT: &str = "7c55064380d93fa173b24f7f04df0547994c04fa";

    fn small_key() -> PublicDsa {
        PublicDsa {
            p: Mpi::from(0xfc01u32),
            q: Mpi::from(0x81u32),
            g: Mpi::from(2u32),
            y: Mpi::from(0u32),
        }
    }

    #[test]
    fn test_encode_public() {
        assert_eq!(small_key().to_base64(), SMALL_PUBLIC);
    }

    #[test]
    fn test_encode_private() {
        let key = PrivateDsa {
            public: small_key(),
            x: Mpi::from(7u32),
        };
        assert_eq!(key.to_base64(), SMALL_PRIVATE);
        assert_eq!(PrivateDsa::from_base64(SMALL_PRIVATE).unwrap(), key);
    }

    #[test]
    fn test_decode_dispatch() {
        assert_eq!(
            Key::from_base64(SMALL_PUBLIC).unwrap(),
            Key::PublicDsa(small_key())
        );
        assert!(Key::from_base64(SMALL_PRIVATE).unwrap().is_private());
    }

    #[test]
    fn test_fingerprint_excludes_dsa_keytype() {
        let key = small_key();
        assert_eq!(key.fingerprint().to_hex(), SMALL_FINGERPRINT);
        let mut hashed = Vec::new();
        for param in key.params() {
            hashed.extend(param.encode());
        }
        assert_eq!(key.fingerprint().to_hex(), crypto::sha1_hex(&hashed));
    }

    #[test]
    fn test_fingerprint_includes_other_keytypes() {
        let key = small_key();
        let params = key.params();
        let typed = Fingerprint::compute(0x0001, &params);
        assert_eq!(typed.to_hex(), "bf1ecafab655a6c5327d0dc860963d54d98103ca");
        assert_ne!(typed, key.fingerprint());
    }

    #[test]
    fn test_private_fingerprint_is_public() {
        let key = PrivateDsa::from_base64(SMALL_PRIVATE).unwrap();
        assert_eq!(key.fingerprint().to_hex(), SMALL_FINGERPRINT);
    }

    #[test]
    fn test_unknown_key_type() {
        let err = Key::from_base64("AAEAAAAC/AEAAAABgQAAAAECAAAAAAAAAAEH").unwrap_err();
        assert!(matches!(err, KeyTrustError::UnknownKeyType(1)));
        assert_eq!(err.offset(), Some(0));
        assert!(err.to_string().contains("at offset 0"));
    }

    #[test]
    fn test_typed_decoders_are_strict() {
        assert!(matches!(
            PublicDsa::from_base64(SMALL_PRIVATE).unwrap_err(),
            KeyTrustError::TrailingData { remaining: 5, .. }
        ));
        assert!(matches!(
            PrivateDsa::from_base64(SMALL_PUBLIC).unwrap_err(),
            KeyTrustError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn test_trailing_after_private() {
        let mut bytes = crypto::base64_decode(SMALL_PRIVATE).unwrap();
        bytes.push(0xff);
        assert!(matches!(
            Key::from_bytes(&bytes).unwrap_err(),
            KeyTrustError::TrailingData { remaining: 1, .. }
        ));
    }

    #[test]
    fn test_short_trailing_after_public() {
        let mut bytes = crypto::base64_decode(SMALL_PUBLIC).unwrap();
        let end = bytes.len();
        bytes.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(
            Key::from_bytes(&bytes).unwrap_err(),
            KeyTrustError::TrailingData { offset, remaining: 2 } if offset == end
        ));
    }

    #[test]
    fn test_zero_secret_rejected() {
        let mut bytes = crypto::base64_decode(SMALL_PUBLIC).unwrap();
        let end = bytes.len();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        let err = Key::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, KeyTrustError::Structural { offset, .. } if offset == end));
        assert!(PrivateDsa::from_bytes(&bytes).is_err());

        let value = parse("(dsa (p #00fc01#) (q #81#) (g 2) (y #00#) (x #00#))").unwrap();
        let record = Record::from_value(&value).unwrap();
        assert!(matches!(
            Key::from_record(&record).unwrap_err(),
            KeyTrustError::Schema(_)
        ));
    }

    #[test]
    fn test_fingerprint_parse() {
        let fp: Fingerprint = SMALL_FINGERPRINT.parse().unwrap();
        assert_eq!(fp, small_key().fingerprint());
        assert!(fp.matches_hex(&SMALL_FINGERPRINT.to_uppercase()));
        assert!(!fp.matches_hex("7c55"));
        assert!("zz".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_from_record() {
        let value = parse("(dsa (p #00fc01#) (q #81#) (g 2) (y #00#) (x #07#))").unwrap();
        let record = Record::from_value(&value).unwrap();
        let key = Key::from_record(&record).unwrap();
        assert_eq!(key.to_base64(), SMALL_PRIVATE);
        assert_eq!(key.public_key().to_base64(), SMALL_PUBLIC);
    }

    #[test]
    fn test_from_record_missing_field() {
        let value = parse("(dsa (p #00fc01#) (q #81#) (y #00#))").unwrap();
        let record = Record::from_value(&value).unwrap();
        assert!(matches!(
            Key::from_record(&record).unwrap_err(),
            KeyTrustError::Schema(_)
        ));
    }

    #[test]
    fn test_from_record_wrong_algorithm() {
        let value = parse("(rsa (n #01#) (e #03#))").unwrap();
        let record = Record::from_value(&value).unwrap();
        assert!(Key::from_record(&record).is_err());
    }

    #[test]
    fn test_private_debug_redacts_secret() {
        let key = PrivateDsa::from_base64(SMALL_PRIVATE).unwrap();
        assert!(format!("{:?}", key).contains("<redacted>"));
    }

    fn mpi_strategy() -> impl Strategy<Value = Mpi> {
        proptest::collection::vec(any::<u8>(), 0..160).prop_map(|b| Mpi::from_be_bytes(&b).unwrap())
    }

    proptest! {
        #[test]
        fn prop_key_roundtrip(
            p in mpi_strategy(),
            q in mpi_strategy(),
            g in mpi_strategy(),
            y in mpi_strategy(),
            x in proptest::option::of(mpi_strategy().prop_filter("x is non-zero", |x| x.byte_len() > 0)),
        ) {
            let public = PublicDsa { p, q, g, y };
            let key = match x {
                Some(x) => Key::PrivateDsa(PrivateDsa { public, x }),
                None => Key::PublicDsa(public),
            };
            let decoded = Key::from_base64(&key.to_base64()).unwrap();
            prop_assert_eq!(&decoded, &key);
            prop_assert_eq!(decoded.to_bytes(), key.to_bytes());
        }
    }
}
