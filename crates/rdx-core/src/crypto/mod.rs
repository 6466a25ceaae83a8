//! Upload envelope decryption.
//!
//! An envelope is newline separated. The first non-blank line carries the
//! file's AES key, RSA-wrapped for the participant. Every following line is
//! one encrypted observation: `iv:ciphertext`, or `wrapped_key:iv:ciphertext`
//! when the line brings its own key. All fields are URL-safe base64 and the
//! ciphertext is AES-CBC with PKCS#7 padding.
//!
//! A line that fails is dropped and recorded; the rest of the file is still
//! decrypted. Only an unusable file key, an envelope with no lines, or a file
//! where every line fails is reported as a [`DecryptionFailure`].

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{
    alphabet,
    engine::{general_purpose::GeneralPurpose, DecodePaddingMode, GeneralPurposeConfig},
    Engine,
};
use rand::{rngs::OsRng, RngCore};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tracing::debug;

pub mod ledger;

pub use ledger::{FailureLedger, IndexLedger};

const IV_LEN: usize = 16;
const AES_BLOCK: usize = 16;

/// URL-safe base64 that accepts input with or without padding.
pub(crate) const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineErrorKind {
    AesKeyBadLength,
    EmptyKey,
    InvalidLength,
    IvBadLength,
    IvMissing,
    LineEmpty,
    MalformedConfig,
    PaddingError,
}

impl LineErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AesKeyBadLength => "AES_KEY_BAD_LENGTH",
            Self::EmptyKey => "EMPTY_KEY",
            Self::InvalidLength => "INVALID_LENGTH",
            Self::IvBadLength => "IV_BAD_LENGTH",
            Self::IvMissing => "IV_MISSING",
            Self::LineEmpty => "LINE_EMPTY",
            Self::MalformedConfig => "MALFORMED_CONFIG",
            Self::PaddingError => "PADDING_ERROR",
        }
    }
}

impl fmt::Display for LineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dropped line and its surroundings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LineFailure {
    pub kind: LineErrorKind,
    /// Position among the envelope's data lines, starting at zero.
    pub index: usize,
    pub line: String,
    pub prev_line: String,
    pub next_line: String,
    /// Base64 form of the key the line was decrypted with.
    pub key_b64: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptionFailure {
    #[error("[RD301] upload envelope has no content")]
    EmptyEnvelope,
    #[error("[RD302] upload file key is unusable: {reason}")]
    InvalidKey { reason: String },
    #[error("[RD303] all {} encrypted lines failed to decrypt", .failures.len())]
    AllLinesFailed { failures: Vec<LineFailure> },
}

impl DecryptionFailure {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyEnvelope => "RD301",
            Self::InvalidKey { .. } => "RD302",
            Self::AllLinesFailed { .. } => "RD303",
        }
    }

    /// Soft failures are acknowledged without an operator alert.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::EmptyEnvelope)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decrypted {
    /// Decrypted lines joined with `\n`.
    pub plaintext: Vec<u8>,
    pub total_lines: usize,
    pub failures: Vec<LineFailure>,
}

/// Decrypt an envelope without recording anything.
///
/// # Errors
/// Returns a [`DecryptionFailure`] for holistic failures; line-level
/// failures are reported in [`Decrypted::failures`].
pub fn decrypt_envelope(raw: &[u8], private_key: &RsaPrivateKey) -> Result<Decrypted, DecryptionFailure> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect();
    let Some((key_line, data_lines)) = lines.split_first() else {
        return Err(DecryptionFailure::EmptyEnvelope);
    };

    let file_key = unwrap_key(key_line, private_key).map_err(|reason| DecryptionFailure::InvalidKey { reason })?;
    if !matches!(file_key.len(), 16 | 32) {
        return Err(DecryptionFailure::InvalidKey {
            reason: format!("decoded key is {} bytes", file_key.len()),
        });
    }
    let file_key_b64 = URL_SAFE_LENIENT.encode(&file_key);

    let mut plain_lines: Vec<Vec<u8>> = Vec::with_capacity(data_lines.len());
    let mut failures = Vec::new();
    for (index, line) in data_lines.iter().enumerate() {
        match decrypt_line(line, &file_key, &file_key_b64, private_key) {
            Ok(plain) => plain_lines.push(plain),
            Err((kind, key_b64)) => {
                debug!(index, kind = %kind, "dropping undecryptable line");
                failures.push(LineFailure {
                    kind,
                    index,
                    line: (*line).to_string(),
                    prev_line: index
                        .checked_sub(1)
                        .and_then(|prev| data_lines.get(prev))
                        .map_or_else(String::new, |prev| (*prev).to_string()),
                    next_line: data_lines
                        .get(index + 1)
                        .map_or_else(String::new, |next| (*next).to_string()),
                    key_b64,
                });
            }
        }
    }

    if !data_lines.is_empty() && plain_lines.is_empty() {
        return Err(DecryptionFailure::AllLinesFailed { failures });
    }
    Ok(Decrypted {
        plaintext: plain_lines.join(&b'\n'),
        total_lines: data_lines.len(),
        failures,
    })
}

fn unwrap_key(wrapped_b64: &str, private_key: &RsaPrivateKey) -> Result<Vec<u8>, String> {
    let wrapped = URL_SAFE_LENIENT
        .decode(wrapped_b64.trim())
        .map_err(|err| format!("key line is not base64: {err}"))?;
    let inner = private_key
        .decrypt(Pkcs1v15Encrypt, &wrapped)
        .map_err(|err| format!("RSA decryption failed: {err}"))?;
    URL_SAFE_LENIENT
        .decode(&inner)
        .map_err(|err| format!("unwrapped key is not base64: {err}"))
}

fn decrypt_line(
    line: &str,
    file_key: &[u8],
    file_key_b64: &str,
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, (LineErrorKind, String)> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    let (key, key_b64, iv_field, data_field) = match fields.as_slice() {
        [iv, data] => (file_key.to_vec(), file_key_b64.to_string(), *iv, *data),
        [wrapped, iv, data] => {
            if wrapped.is_empty() {
                return Err((LineErrorKind::EmptyKey, String::new()));
            }
            let key = unwrap_key(wrapped, private_key)
                .map_err(|_| (LineErrorKind::MalformedConfig, (*wrapped).to_string()))?;
            (key, (*wrapped).to_string(), *iv, *data)
        }
        _ => return Err((LineErrorKind::MalformedConfig, file_key_b64.to_string())),
    };
    let fail = |kind: LineErrorKind| (kind, key_b64.clone());

    if !matches!(key.len(), 16 | 32) {
        return Err(fail(LineErrorKind::AesKeyBadLength));
    }
    if iv_field.is_empty() {
        return Err(fail(LineErrorKind::IvMissing));
    }
    let iv = URL_SAFE_LENIENT
        .decode(iv_field)
        .map_err(|_| fail(LineErrorKind::PaddingError))?;
    if iv.len() != IV_LEN {
        return Err(fail(LineErrorKind::IvBadLength));
    }
    if data_field.is_empty() {
        return Err(fail(LineErrorKind::LineEmpty));
    }
    let ciphertext = URL_SAFE_LENIENT
        .decode(data_field)
        .map_err(|_| fail(LineErrorKind::PaddingError))?;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK != 0 {
        return Err(fail(LineErrorKind::InvalidLength));
    }

    let plain = if key.len() == 16 {
        Aes128CbcDec::new_from_slices(&key, &iv)
            .map_err(|_| fail(LineErrorKind::AesKeyBadLength))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
    } else {
        Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|_| fail(LineErrorKind::AesKeyBadLength))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
    };
    plain.map_err(|_| fail(LineErrorKind::PaddingError))
}

/// Decrypts envelopes and records every failure it sees.
pub struct CryptoGate<'a> {
    ledger: &'a dyn FailureLedger,
}

impl<'a> CryptoGate<'a> {
    pub fn new(ledger: &'a dyn FailureLedger) -> Self {
        Self { ledger }
    }

    /// Decrypt `raw` for `participant_id`. Line failures and holistic
    /// failures are handed to the ledger before returning.
    ///
    /// # Errors
    /// Returns the holistic [`DecryptionFailure`], if any.
    pub fn decrypt(
        &self,
        raw: &[u8],
        private_key: &RsaPrivateKey,
        participant_id: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, DecryptionFailure> {
        match decrypt_envelope(raw, private_key) {
            Ok(decrypted) => {
                if !decrypted.failures.is_empty() {
                    self.ledger.record_line_failures(
                        participant_id,
                        file_name,
                        decrypted.total_lines,
                        &decrypted.failures,
                    );
                }
                Ok(decrypted.plaintext)
            }
            Err(failure) => {
                if let DecryptionFailure::AllLinesFailed { failures } = &failure {
                    self.ledger
                        .record_line_failures(participant_id, file_name, failures.len(), failures);
                }
                if !failure.is_soft() {
                    self.ledger
                        .record_key_failure(participant_id, file_name, raw, &failure);
                }
                Err(failure)
            }
        }
    }
}

/// Encrypt one observation line as `iv:ciphertext`.
///
/// # Errors
/// Fails when `key` is not 16 or 32 bytes.
pub fn encrypt_line(key: &[u8], plaintext: &[u8]) -> anyhow::Result<String> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| anyhow::anyhow!("bad AES key length"))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| anyhow::anyhow!("bad AES key length"))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        other => anyhow::bail!("AES key must be 16 or 32 bytes, got {other}"),
    };
    Ok(format!(
        "{}:{}",
        URL_SAFE_LENIENT.encode(iv),
        URL_SAFE_LENIENT.encode(ciphertext)
    ))
}

/// RSA-wrap an AES key the way devices do.
///
/// # Errors
/// Fails when RSA encryption fails.
pub fn wrap_key(aes_key: &[u8], public_key: &RsaPublicKey) -> anyhow::Result<String> {
    let inner = URL_SAFE_LENIENT.encode(aes_key);
    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, inner.as_bytes())
        .map_err(|err| anyhow::anyhow!("RSA encryption failed: {err}"))?;
    Ok(URL_SAFE_LENIENT.encode(wrapped))
}

/// Random AES-128 key.
#[must_use]
pub fn generate_file_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt a plaintext file into an upload envelope, one line per
/// plaintext line.
///
/// # Errors
/// Fails when key wrapping or line encryption fails.
pub fn seal_device_file(plaintext: &[u8], public_key: &RsaPublicKey) -> anyhow::Result<Vec<u8>> {
    let file_key = generate_file_key();
    let mut out = wrap_key(&file_key, public_key)?;
    out.push('\n');
    let body = plaintext.strip_suffix(b"\n").unwrap_or(plaintext);
    if !body.is_empty() {
        for line in body.split(|byte| *byte == b'\n') {
            out.push_str(&encrypt_line(&file_key, line)?);
            out.push('\n');
        }
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use rsa::{RsaPrivateKey, RsaPublicKey};

    /// One small key pair shared across tests; generation is slow.
    pub(crate) fn test_keys() -> &'static (RsaPrivateKey, RsaPublicKey) {
        static KEYS: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
        KEYS.get_or_init(|| {
            let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
            let public = RsaPublicKey::from(&private);
            (private, public)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::test_keys;
    use super::*;

    #[derive(Default)]
    struct MemoryLedger {
        lines: Mutex<Vec<LineFailure>>,
        keys: Mutex<Vec<String>>,
    }

    impl FailureLedger for MemoryLedger {
        fn record_line_failures(&self, _participant: &str, _file: &str, _total: usize, failures: &[LineFailure]) {
            self.lines.lock().unwrap().extend_from_slice(failures);
        }

        fn record_key_failure(&self, _participant: &str, _file: &str, _contents: &[u8], failure: &DecryptionFailure) {
            self.keys.lock().unwrap().push(failure.code().to_string());
        }
    }

    const CSV: &str = "timestamp,value\n1609459200000,a\n1609459201000,b\n";

    #[test]
    fn sealed_files_decrypt_back_to_lines() {
        let (private, public) = test_keys();
        let envelope = seal_device_file(CSV.as_bytes(), public).unwrap();
        let decrypted = decrypt_envelope(&envelope, private).unwrap();
        assert_eq!(decrypted.plaintext, CSV.trim_end().as_bytes());
        assert_eq!(decrypted.total_lines, 3);
        assert!(decrypted.failures.is_empty());
    }

    #[test]
    fn one_corrupt_line_is_dropped_and_recorded() {
        let (private, public) = test_keys();
        let envelope = String::from_utf8(seal_device_file(CSV.as_bytes(), public).unwrap()).unwrap();
        let mut lines: Vec<String> = envelope.lines().map(str::to_string).collect();
        let (iv, _) = lines[2].split_once(':').unwrap();
        lines[2] = format!("{iv}:AAAA");
        let tampered = lines.join("\n");

        let ledger = MemoryLedger::default();
        let plain = CryptoGate::new(&ledger)
            .decrypt(tampered.as_bytes(), private, "p1", "p1_gps_1.csv")
            .unwrap();
        assert_eq!(plain, b"timestamp,value\n1609459201000,b");
        let recorded = ledger.lines.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, LineErrorKind::InvalidLength);
        assert_eq!(recorded[0].index, 1);
        assert_eq!(recorded[0].prev_line, lines[1]);
        assert_eq!(recorded[0].next_line, lines[3]);
        assert!(ledger.keys.lock().unwrap().is_empty());
    }

    #[test]
    fn lines_with_empty_wrapped_keys_are_dropped() {
        let (private, public) = test_keys();
        let key = generate_file_key();
        let mut envelope = vec![wrap_key(&key, public).unwrap()];
        for idx in 0..5 {
            let line = encrypt_line(&key, format!("row{idx}").as_bytes()).unwrap();
            envelope.push(if idx % 2 == 1 { format!(":{line}") } else { line });
        }
        let ledger = MemoryLedger::default();
        let plain = CryptoGate::new(&ledger)
            .decrypt(envelope.join("\n").as_bytes(), private, "p1", "f.csv")
            .unwrap();
        assert_eq!(plain, b"row0\nrow2\nrow4");
        let recorded = ledger.lines.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|failure| failure.kind == LineErrorKind::EmptyKey));
    }

    #[test]
    fn lines_may_carry_their_own_key() {
        let (private, public) = test_keys();
        let file_key = generate_file_key();
        let line_key = [7u8; 32];
        let envelope = [
            wrap_key(&file_key, public).unwrap(),
            format!(
                "{}:{}",
                wrap_key(&line_key, public).unwrap(),
                encrypt_line(&line_key, b"own key").unwrap()
            ),
            format!(
                "{}:{}",
                wrap_key(&[1u8; 8], public).unwrap(),
                encrypt_line(&file_key, b"short key").unwrap()
            ),
        ]
        .join("\n");
        let decrypted = decrypt_envelope(envelope.as_bytes(), private).unwrap();
        assert_eq!(decrypted.plaintext, b"own key");
        assert_eq!(decrypted.failures[0].kind, LineErrorKind::AesKeyBadLength);
    }

    #[test]
    fn classifies_line_errors() {
        let (private, public) = test_keys();
        let key = generate_file_key();
        let good = encrypt_line(&key, b"ok").unwrap();
        let (iv, data) = good.split_once(':').unwrap();
        let short_iv = URL_SAFE_LENIENT.encode([0u8; 8]);
        let cases = [
            (format!(":{data}"), LineErrorKind::IvMissing),
            (format!("{short_iv}:{data}"), LineErrorKind::IvBadLength),
            (format!("{iv}:"), LineErrorKind::LineEmpty),
            (format!("{iv}:{data}:x:y"), LineErrorKind::MalformedConfig),
            (format!("{iv}:!!!"), LineErrorKind::PaddingError),
            (format!("{iv}:{}", URL_SAFE_LENIENT.encode([0u8; 15])), LineErrorKind::InvalidLength),
        ];
        let mut envelope = vec![wrap_key(&key, public).unwrap(), good.clone()];
        envelope.extend(cases.iter().map(|(line, _)| line.clone()));
        let decrypted = decrypt_envelope(envelope.join("\n").as_bytes(), private).unwrap();
        assert_eq!(decrypted.plaintext, b"ok");
        let kinds: Vec<LineErrorKind> = decrypted.failures.iter().map(|failure| failure.kind).collect();
        let expected: Vec<LineErrorKind> = cases.iter().map(|(_, kind)| *kind).collect();
        assert_eq!(kinds, expected);
    }

    #[test]
    fn holistic_failures() {
        let (private, public) = test_keys();
        assert_eq!(decrypt_envelope(b"\n\n", private), Err(DecryptionFailure::EmptyEnvelope));
        assert!(matches!(
            decrypt_envelope(b"not-a-key\nAAAA:BBBB", private),
            Err(DecryptionFailure::InvalidKey { .. })
        ));

        let key = generate_file_key();
        let envelope = [wrap_key(&key, public).unwrap(), "x:y".to_string(), ":".to_string()].join("\n");
        let ledger = MemoryLedger::default();
        let err = CryptoGate::new(&ledger)
            .decrypt(envelope.as_bytes(), private, "p1", "f.csv")
            .unwrap_err();
        assert!(matches!(err, DecryptionFailure::AllLinesFailed { ref failures } if failures.len() == 2));
        assert_eq!(ledger.lines.lock().unwrap().len(), 2);
        assert_eq!(ledger.keys.lock().unwrap().as_slice(), ["RD303"]);
    }
}
