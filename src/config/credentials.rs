// =============================================================================
// Credential store — AES-256-GCM secrets at rest, key derived via PBKDF2
// =============================================================================
//
// The on-disk envelope is a small JSON object: version, salt, iv (nonce),
// authTag, and encryptedData, all Base64. Decryption fails closed: any
// authentication-tag mismatch returns an error, never partial plaintext.
// Writes use the same atomic tmp-file-then-rename pattern the configuration
// layer uses for its own persistence.
// =============================================================================

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const ENVELOPE_VERSION: u32 = 1;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    salt: String,
    iv: String,
    encrypted_data: String,
}

/// Exchange credentials held in memory only after a successful decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Encrypt `creds` under `passphrase` and persist atomically.
    pub fn save(&self, creds: &ExchangeCredentials, passphrase: &str) -> Result<()> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(creds).context("failed to serialize credentials")?;
        // AES-GCM appends its 16-byte auth tag to the ciphertext; there is no
        // separate authTag field in the envelope produced here, it rides
        // inside encrypted_data the way the `aes-gcm` crate returns it.
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            salt: BASE64.encode(salt),
            iv: BASE64.encode(nonce_bytes),
            encrypted_data: BASE64.encode(ciphertext),
        };

        let content = serde_json::to_string_pretty(&envelope)
            .context("failed to serialize credential envelope")?;

        write_atomic(&self.path, &content)
    }

    /// Decrypt and return credentials. Fails closed: any corruption or
    /// auth-tag mismatch returns an error, never partial plaintext.
    pub fn load(&self, passphrase: &str) -> Result<ExchangeCredentials> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read credential store at {}", self.path.display()))?;
        let envelope: Envelope =
            serde_json::from_str(&content).context("failed to parse credential envelope")?;

        if envelope.version != ENVELOPE_VERSION {
            bail!("unsupported credential envelope version {}", envelope.version);
        }

        let salt = BASE64
            .decode(&envelope.salt)
            .context("invalid salt encoding")?;
        let nonce_bytes = BASE64.decode(&envelope.iv).context("invalid iv encoding")?;
        let ciphertext = BASE64
            .decode(&envelope.encrypted_data)
            .context("invalid ciphertext encoding")?;

        if nonce_bytes.len() != NONCE_LEN {
            bail!("corrupt envelope: nonce has wrong length");
        }

        let key_bytes = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| anyhow::anyhow!("decryption failed: wrong passphrase or corrupted store"))?;

        serde_json::from_slice(&plaintext).context("decrypted payload is not valid credentials JSON")
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("enc.tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write tmp credential file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp credential file to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hunter-core-test-{name}-{}.enc", std::process::id()))
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let path = tmp_path("roundtrip");
        let store = CredentialStore::new(&path);
        let creds = ExchangeCredentials {
            api_key: "key123".into(),
            api_secret: "secret456".into(),
        };
        store.save(&creds, "hunter2 password").unwrap();
        let loaded = store.load("hunter2 password").unwrap();
        assert_eq!(loaded.api_key, creds.api_key);
        assert_eq!(loaded.api_secret, creds.api_secret);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let path = tmp_path("wrongpass");
        let store = CredentialStore::new(&path);
        let creds = ExchangeCredentials {
            api_key: "a".into(),
            api_secret: "b".into(),
        };
        store.save(&creds, "correct horse").unwrap();
        let result = store.load("wrong battery");
        assert!(result.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupted_envelope_fails_closed() {
        let path = tmp_path("corrupt");
        let store = CredentialStore::new(&path);
        let creds = ExchangeCredentials {
            api_key: "a".into(),
            api_secret: "b".into(),
        };
        store.save(&creds, "pw").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut envelope: Envelope = serde_json::from_str(&content).unwrap();
        // Flip a byte in the ciphertext to simulate corruption.
        let mut bytes = BASE64.decode(&envelope.encrypted_data).unwrap();
        bytes[0] ^= 0xFF;
        envelope.encrypted_data = BASE64.encode(bytes);
        std::fs::write(&path, serde_json::to_string(&envelope).unwrap()).unwrap();

        assert!(store.load("pw").is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_errors_cleanly() {
        let store = CredentialStore::new(tmp_path("missing"));
        assert!(store.load("pw").is_err());
    }
}
