//! Participant RSA key pairs, kept in the object store.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rdx_domain::{key_path, KeyHalf};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use crate::store::{ObjectKey, ObjectStore};

fn object_key(study_id: &str, participant_id: &str, half: KeyHalf) -> ObjectKey {
    ObjectKey::path_complete(study_id, &key_path(study_id, participant_id, half))
}

/// Base64 DER (X.509 SubjectPublicKeyInfo), the form handed to devices.
///
/// # Errors
/// Fails if the key cannot be DER encoded.
pub fn public_key_string(public: &RsaPublicKey) -> Result<String> {
    let der = public
        .to_public_key_der()
        .map_err(|err| anyhow!("failed to encode public key: {err}"))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Parse the device-facing form produced by [`public_key_string`].
///
/// # Errors
/// Fails on bad base64 or DER.
pub fn parse_public_key_string(text: &str) -> Result<RsaPublicKey> {
    let der = BASE64.decode(text.trim()).context("public key is not base64")?;
    RsaPublicKey::from_public_key_der(&der).map_err(|err| anyhow!("invalid public key: {err}"))
}

/// Generate and store a key pair for a participant; returns the public key
/// in device form.
///
/// # Errors
/// Fails if generation, encoding or storage fails.
pub fn create_client_key_pair(
    store: &ObjectStore,
    study_id: &str,
    participant_id: &str,
    bits: usize,
) -> Result<String> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|err| anyhow!("failed to generate {bits}-bit RSA key: {err}"))?;
    let public = RsaPublicKey::from(&private);
    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| anyhow!("failed to encode private key: {err}"))?;
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| anyhow!("failed to encode public key: {err}"))?;
    store
        .put(&object_key(study_id, participant_id, KeyHalf::Private), private_pem.as_bytes())
        .with_context(|| format!("failed to store private key for {participant_id}"))?;
    store
        .put(&object_key(study_id, participant_id, KeyHalf::Public), public_pem.as_bytes())
        .with_context(|| format!("failed to store public key for {participant_id}"))?;
    debug!(study_id, participant_id, bits, "client key pair created");
    public_key_string(&public)
}

/// # Errors
/// Fails if the key is missing or malformed.
pub fn client_private_key(store: &ObjectStore, study_id: &str, participant_id: &str) -> Result<RsaPrivateKey> {
    let pem = store
        .get(&object_key(study_id, participant_id, KeyHalf::Private))
        .with_context(|| format!("failed to load private key for {participant_id}"))?;
    let pem = String::from_utf8(pem).context("private key is not UTF-8")?;
    RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|err| anyhow!("invalid private key for {participant_id}: {err}"))
}

/// # Errors
/// Fails if the key is missing or malformed.
pub fn client_public_key(store: &ObjectStore, study_id: &str, participant_id: &str) -> Result<RsaPublicKey> {
    let pem = store
        .get(&object_key(study_id, participant_id, KeyHalf::Public))
        .with_context(|| format!("failed to load public key for {participant_id}"))?;
    let pem = String::from_utf8(pem).context("public key is not UTF-8")?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|err| anyhow!("invalid public key for {participant_id}: {err}"))
}
