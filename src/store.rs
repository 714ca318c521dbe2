//! libpurple OTR key store and fingerprint table.
//!
//! The private key store is an S-expression of the form
//!
//! ```text
//! (privkeys
//!   (account
//!     (name "alice@example.org")
//!     (protocol prpl-jabber)
//!     (private-key (dsa (p #..#) (q #..#) (g #..#) (y #..#) (x #..#)))))
//! ```
//!
//! and the fingerprint table is a tab-separated file with one known remote
//! key per line: `uid  account  protocol  fingerprint  [verified]`.
//! Loaders take any reader; nothing here opens files on its own.

use crate::key::{Fingerprint, PrivateDsa};
use crate::record::Record;
use crate::sexp::{self, Value};
use crate::KeyTrustError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::str::FromStr;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Private key store
// ---------------------------------------------------------------------------

/// A local account with its OTR private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub protocol: String,
    pub private_key: PrivateDsa,
}

/// What is handed to the signing collaborator for one account: the public
/// key's base64 wire form and its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    pub account: String,
    pub protocol: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub fingerprint: String,
}

impl Account {
    /// Decode an `(account (name ..) (protocol ..) (private-key ..))` record.
    pub fn from_record(record: &Record) -> Result<Self, KeyTrustError> {
        if record.key() != "account" {
            return Err(KeyTrustError::Schema(format!(
                "expected an 'account' record, found '{}'",
                record.key()
            )));
        }
        let key_record = record.value("private-key")?.as_record().ok_or_else(|| {
            KeyTrustError::Schema("'private-key' must hold an algorithm record".to_string())
        })?;
        Ok(Account {
            name: record.text("name")?,
            protocol: record.text("protocol")?,
            private_key: PrivateDsa::from_record(key_record)?,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.private_key.fingerprint()
    }

    /// Public material for this account. The secret `x` is never included.
    pub fn export(&self) -> ExportedKey {
        let public = self.private_key.public_key();
        ExportedKey {
            account: self.name.clone(),
            protocol: self.protocol.clone(),
            public_key: public.to_base64(),
            fingerprint: public.fingerprint().to_hex(),
        }
    }
}

/// The set of local accounts in a `privkeys` store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivKeys {
    pub accounts: Vec<Account>,
}

impl PrivKeys {
    /// Decode a parsed `(privkeys (account ..) ...)` expression.
    ///
    /// One account and several accounts decode the same way.
    pub fn from_value(value: &Value) -> Result<Self, KeyTrustError> {
        // `(privkeys)` folds to a bare token, so handle the empty store here.
        if let Some([head]) = value.as_list() {
            if head.as_token() == Some("privkeys") {
                return Ok(PrivKeys::default());
            }
        }
        PrivKeys::from_record(&Record::from_value(value)?)
    }

    pub fn from_record(record: &Record) -> Result<Self, KeyTrustError> {
        if record.key() != "privkeys" {
            return Err(KeyTrustError::Schema(format!(
                "expected a 'privkeys' record, found '{}'",
                record.key()
            )));
        }
        let accounts = record
            .entries("account")
            .map(Account::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PrivKeys { accounts })
    }

    /// Parse key-store text.
    pub fn parse(text: &str) -> Result<Self, KeyTrustError> {
        Self::parse_bytes(text.as_bytes())
    }

    fn parse_bytes(bytes: &[u8]) -> Result<Self, KeyTrustError> {
        let keys = PrivKeys::from_value(&sexp::parse_bytes(bytes)?)?;
        debug!(accounts = keys.accounts.len(), "loaded private keys");
        Ok(keys)
    }

    /// Read and parse a whole key store from `reader`.
    pub fn load<R: Read>(mut reader: R) -> Result<Self, KeyTrustError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::parse_bytes(&bytes)
    }

    /// Accounts whose name starts with `uid`.
    pub fn matching<'a>(&'a self, uid: &'a str) -> impl Iterator<Item = &'a Account> + 'a {
        self.accounts.iter().filter(move |a| a.name.starts_with(uid))
    }
}

// ---------------------------------------------------------------------------
// Fingerprint table
// ---------------------------------------------------------------------------

/// One line of the fingerprint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    /// Remote user id.
    pub uid: String,
    /// Local account the remote key was seen from.
    pub account: String,
    pub protocol: String,
    /// Hex fingerprint as stored in the file.
    pub fingerprint: String,
    pub verified: bool,
}

impl FingerprintEntry {
    /// Parse one tab-separated line; `offset` is where the line starts in
    /// the file and is used for error reporting.
    pub fn parse_line(line: &str, offset: usize) -> Result<Self, KeyTrustError> {
        let fields: Vec<&str> = line.trim_end_matches(&['\r', '\n'][..]).split('\t').collect();
        let (uid, account, protocol, fingerprint, trust) = match fields.as_slice() {
            [u, a, p, f] => (*u, *a, *p, *f, ""),
            [u, a, p, f, t] => (*u, *a, *p, *f, *t),
            _ => {
                return Err(KeyTrustError::structural(
                    offset,
                    format!(
                        "fingerprint line needs 4 or 5 tab-separated fields, found {}",
                        fields.len()
                    ),
                ))
            }
        };
        Ok(FingerprintEntry {
            uid: uid.to_string(),
            account: account.to_string(),
            protocol: protocol.to_string(),
            fingerprint: fingerprint.to_string(),
            verified: !trust.is_empty(),
        })
    }
}

impl FromStr for FingerprintEntry {
    type Err = KeyTrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FingerprintEntry::parse_line(s, 0)
    }
}

/// Renders the line this entry was read from (without the newline).
impl fmt::Display for FingerprintEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            self.uid,
            self.account,
            self.protocol,
            self.fingerprint,
            if self.verified { "verified" } else { "" }
        )
    }
}

/// Outcome of checking a verified key against the fingerprint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The stored fingerprint matched and the entry is now marked verified.
    Verified,
    /// The uid is known but its stored fingerprint differs.
    Mismatch { stored: String },
    /// The uid has no entry in the table.
    UnknownUid,
}

/// Fingerprint table keyed by uid.
///
/// A later line for the same uid replaces the earlier one but keeps its
/// position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintTable {
    entries: Vec<FingerprintEntry>,
    /// Position of each uid in `entries`.
    index: HashMap<String, usize>,
}

impl FingerprintTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a table from `reader`. Blank lines are skipped.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self, KeyTrustError> {
        let mut table = FingerprintTable::new();
        let mut offset = 0;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            if !line.trim().is_empty() {
                table.insert(FingerprintEntry::parse_line(&line, offset)?);
            }
            offset += read;
        }
        debug!(entries = table.count(), "loaded fingerprint table");
        Ok(table)
    }

    pub fn parse(text: &str) -> Result<Self, KeyTrustError> {
        Self::from_reader(text.as_bytes())
    }

    /// Write every entry as one line.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), KeyTrustError> {
        for entry in &self.entries {
            writeln!(writer, "{}", entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Add `entry`, replacing any entry for the same uid in place.
    pub fn insert(&mut self, entry: FingerprintEntry) {
        match self.index.get(&entry.uid) {
            Some(&at) => self.entries[at] = entry,
            None => {
                self.index.insert(entry.uid.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&FingerprintEntry> {
        self.index.get(uid).map(|&at| &self.entries[at])
    }

    pub fn has(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    /// Mark `uid` verified if its stored fingerprint equals `fingerprint`.
    ///
    /// The table is only modified on a match.
    pub fn verify(&mut self, uid: &str, fingerprint: &Fingerprint) -> Verification {
        let Some(entry) = self.index.get(uid).map(|&at| &mut self.entries[at]) else {
            warn!(uid, "no fingerprint entry for uid");
            return Verification::UnknownUid;
        };
        if fingerprint.matches_hex(&entry.fingerprint) {
            entry.verified = true;
            debug!(uid, "fingerprint verified");
            Verification::Verified
        } else {
            warn!(uid, stored = %entry.fingerprint, presented = %fingerprint, "fingerprint mismatch");
            Verification::Mismatch {
                stored: entry.fingerprint.clone(),
            }
        }
    }
}
