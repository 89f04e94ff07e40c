use std::num::NonZeroU32;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

/// First line of every encrypted file.
pub const HEADER: &str = "$VAULT_SENTINEL;1.0;AES256-GCM";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();

/// Per-file decryption failure. Callers log and skip the file; one bad
/// file never aborts its siblings.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed encrypted file: {0}")]
    Format(String),
    #[error("decryption failed (wrong key or corrupted payload)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("decrypted payload is not valid UTF-8")]
    Utf8,
}

fn derive_key(key: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut derived = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        key.as_bytes(),
        &mut derived,
    );
    derived
}

fn aead_key(key: &str, salt: &[u8]) -> Result<LessSafeKey, DecryptError> {
    let derived = derive_key(key, salt);
    let unbound =
        UnboundKey::new(&aead::AES_256_GCM, &derived).map_err(|_| DecryptError::Decrypt)?;
    Ok(LessSafeKey::new(unbound))
}

/// Decrypts an at-rest file with the given symmetric key.
///
/// # Errors
/// Returns an error if the file is unreadable, malformed, encrypted with
/// a different key, or does not decrypt to UTF-8 text.
pub fn decrypt_file(path: &Path, key: &str) -> Result<String, DecryptError> {
    let contents = std::fs::read_to_string(path).map_err(|source| DecryptError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decrypt_str(&contents, key)
}

/// Decrypts the envelope format produced by [`encrypt_to_string`].
///
/// # Errors
/// Returns an error on a bad header, undecodable body, wrong key, or
/// non-UTF-8 plaintext.
pub fn decrypt_str(contents: &str, key: &str) -> Result<String, DecryptError> {
    let mut lines = contents.lines();
    let header = lines
        .next()
        .ok_or_else(|| DecryptError::Format("empty file".to_string()))?;
    if header.trim() != HEADER {
        return Err(DecryptError::Format(format!(
            "unrecognized header {header:?}"
        )));
    }
    let body: String = lines.flat_map(str::split_whitespace).collect();
    let raw = STANDARD
        .decode(body.as_bytes())
        .map_err(|err| DecryptError::Format(format!("body is not valid base64: {err}")))?;
    if raw.len() < SALT_LEN + NONCE_LEN + aead::AES_256_GCM.tag_len() {
        return Err(DecryptError::Format("payload is truncated".to_string()));
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let sealing = aead_key(key, salt)?;
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| DecryptError::Decrypt)?;
    let mut buffer = ciphertext.to_vec();
    let plaintext = sealing
        .open_in_place(nonce, Aad::empty(), &mut buffer)
        .map_err(|_| DecryptError::Decrypt)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| DecryptError::Utf8)
}

/// Seals plaintext into the envelope format, for producing fixtures and
/// operator tooling.
///
/// # Errors
/// Returns an error if the system random source or the AEAD seal fails.
pub fn encrypt_to_string(plaintext: &str, key: &str) -> Result<String, DecryptError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| DecryptError::Encrypt)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| DecryptError::Encrypt)?;

    let sealing = aead_key(key, &salt).map_err(|_| DecryptError::Encrypt)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut buffer = plaintext.as_bytes().to_vec();
    sealing
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
        .map_err(|_| DecryptError::Encrypt)?;

    let mut raw = Vec::with_capacity(SALT_LEN + NONCE_LEN + buffer.len());
    raw.extend_from_slice(&salt);
    raw.extend_from_slice(&nonce_bytes);
    raw.extend_from_slice(&buffer);
    Ok(format!("{HEADER}\n{}\n", STANDARD.encode(raw)))
}
