use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("reference image encryption failed")]
    EncryptionFailed,
    #[error("reference image decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("stored reference blob too short: {0} bytes")]
    InvalidBlob(usize),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// Profile metadata row (no image bytes).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileInfo {
    pub student_id: String,
    pub display_name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite-backed student profile storage with AES-256-GCM encryption.
///
/// Reference face images are biometric data and are encrypted before storage
/// and decrypted on retrieval. A per-installation 32-byte key is generated at
/// first use and stored at `{db_dir}/.key` with mode 0600.
#[derive(Clone)]
pub struct ProfileStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl ProfileStore {
    /// Open (or create) the database at the given path and create the schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/rollcall"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS profiles (
                     student_id TEXT PRIMARY KEY,
                     display_name TEXT NOT NULL,
                     reference_image BLOB NOT NULL,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert or replace a student's reference image.
    pub async fn upsert_profile(
        &self,
        student_id: &str,
        display_name: &str,
        reference_image: &[u8],
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_image(reference_image)?;
        let now = chrono::Utc::now().to_rfc3339();

        let student_id = student_id.to_string();
        let display_name = display_name.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO profiles (student_id, display_name, reference_image, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(student_id) DO UPDATE SET
                         display_name = excluded.display_name,
                         reference_image = excluded.reference_image,
                         updated_at = excluded.updated_at",
                    rusqlite::params![student_id, display_name, blob, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Fetch a student's reference image, decrypted. `None` when the student
    /// has no profile yet.
    pub async fn get_reference(&self, student_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let student_id = student_id.to_string();

        let blob: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT reference_image FROM profiles WHERE student_id = ?1")?;
                let mut rows = stmt.query([&student_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, Vec<u8>>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;

        blob.map(|b| self.decrypt_image(&b)).transpose()
    }

    pub async fn has_profile(&self, student_id: &str) -> Result<bool, StoreError> {
        let student_id = student_id.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM profiles WHERE student_id = ?1",
                    [&student_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a student's profile. Returns whether a row was deleted.
    pub async fn remove_profile(&self, student_id: &str) -> Result<bool, StoreError> {
        let student_id = student_id.to_string();
        self.conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM profiles WHERE student_id = ?1", [&student_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List profile metadata (no image bytes), ordered by student id.
    pub async fn list_profiles(&self) -> Result<Vec<ProfileInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, display_name, created_at, updated_at
                     FROM profiles ORDER BY student_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ProfileInfo {
                        student_id: row.get(0)?,
                        display_name: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_profiles(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────

    /// Encrypt an image blob with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_image(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_image(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

/// Load the 32-byte encryption key, generating it on first use (mode 0600).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
        tracing::warn!(
            path = %key_path.display(),
            len = bytes.len(),
            "encryption key file has wrong size — regenerating"
        );
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    std::fs::write(key_path, key).map_err(StoreError::KeyIo)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .map_err(StoreError::KeyIo)?;
    }

    tracing::info!(path = %key_path.display(), "generated new profile encryption key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> ProfileStore {
        ProfileStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_fetch_roundtrip() {
        let store = memory_store().await;
        store
            .upsert_profile("s-1001", "Ada Lovelace", b"fake image bytes")
            .await
            .unwrap();

        let fetched = store.get_reference("s-1001").await.unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"fake image bytes"[..]));
    }

    #[tokio::test]
    async fn test_missing_profile_is_none() {
        let store = memory_store().await;
        assert_eq!(store.get_reference("nobody").await.unwrap(), None);
        assert!(!store.has_profile("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_image() {
        let store = memory_store().await;
        store.upsert_profile("s-1", "A", b"first").await.unwrap();
        store.upsert_profile("s-1", "A", b"second").await.unwrap();

        assert_eq!(store.count_profiles().await.unwrap(), 1);
        assert_eq!(
            store.get_reference("s-1").await.unwrap().as_deref(),
            Some(&b"second"[..])
        );
    }

    #[tokio::test]
    async fn test_remove_profile() {
        let store = memory_store().await;
        store.upsert_profile("s-1", "A", b"img").await.unwrap();
        assert!(store.remove_profile("s-1").await.unwrap());
        assert!(!store.remove_profile("s-1").await.unwrap());
        assert_eq!(store.get_reference("s-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stored_blob_is_not_plaintext() {
        let store = memory_store().await;
        let image = b"recognizable plaintext image".to_vec();
        store.upsert_profile("s-1", "A", &image).await.unwrap();

        let raw: Vec<u8> = store
            .conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT reference_image FROM profiles WHERE student_id = 's-1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();

        assert_ne!(raw, image);
        assert!(raw.len() > image.len(), "nonce and tag overhead expected");
    }

    #[tokio::test]
    async fn test_list_profiles_ordered() {
        let store = memory_store().await;
        store.upsert_profile("s-2", "B", b"x").await.unwrap();
        store.upsert_profile("s-1", "A", b"y").await.unwrap();

        let profiles = store.list_profiles().await.unwrap();
        let ids: Vec<_> = profiles.iter().map(|p| p.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s-1", "s-2"]);
    }

    #[tokio::test]
    async fn test_tampered_blob_fails_decryption() {
        let store = memory_store().await;
        let blob = store.encrypt_image(b"payload").unwrap();
        let mut tampered = blob.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;

        assert!(store.decrypt_image(&blob).is_ok());
        assert!(matches!(
            store.decrypt_image(&tampered),
            Err(StoreError::DecryptionFailed)
        ));
    }
}
