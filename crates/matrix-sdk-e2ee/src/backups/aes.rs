// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The symmetric `m.megolm_backup.v1.aes-hmac-sha2` backup algorithm.
//!
//! Every room key is encrypted with AES-256-CTR and authenticated with
//! HMAC-SHA-256, both keys are expanded from the backup key using the session
//! ID as the HKDF info.

use vodozemac::{base64_decode, base64_encode};
use zeroize::Zeroizing;

use super::{BackupDecryptionKey, BackupError};
use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE},
    olm::BackedUpRoomKey,
    types::{AesHmacSha2AuthData, EncryptedSessionData},
};

const KEY_CHECK_INFO: &[u8] = b"";
const KEY_CHECK_PLAINTEXT: [u8; 32] = [0u8; 32];

/// Create the key check of a new backup version for the given key.
pub(crate) fn key_check(key: &BackupDecryptionKey) -> AesHmacSha2AuthData {
    let keys = AesHmacSha2Key::from_secret(key.as_bytes(), KEY_CHECK_INFO);

    let (ciphertext, iv) = keys.encrypt(KEY_CHECK_PLAINTEXT.to_vec());
    let mac = keys.create_mac_tag(&ciphertext);

    AesHmacSha2AuthData::new(base64_encode(iv), base64_encode(mac.as_bytes()))
}

fn decode_iv(iv: &str) -> Result<[u8; IV_SIZE], BackupError> {
    let decoded = base64_decode(iv)?;

    decoded.as_slice().try_into().map_err(|_| BackupError::InvalidIv(decoded.len()))
}

/// The state of the `m.megolm_backup.v1.aes-hmac-sha2` algorithm for a single
/// backup version.
#[derive(Debug)]
pub struct AesHmacSha2Backup {
    auth_data: AesHmacSha2AuthData,
    key: Option<BackupDecryptionKey>,
}

impl AesHmacSha2Backup {
    pub(crate) fn new(auth_data: AesHmacSha2AuthData) -> Self {
        Self { auth_data, key: None }
    }

    /// The auth data of the backup version.
    pub fn auth_data(&self) -> &AesHmacSha2AuthData {
        &self.auth_data
    }

    /// Check if the given key is the key of this backup version.
    ///
    /// The key check of the auth data is recomputed with the candidate key,
    /// a backup without a key check accepts any key.
    pub fn key_matches(&self, key: &BackupDecryptionKey) -> bool {
        let Some(mac) = &self.auth_data.mac else {
            return true;
        };

        let Some(Ok(iv)) = self.auth_data.iv.as_deref().map(decode_iv) else {
            return false;
        };

        let Ok(mac) = base64_decode(mac) else {
            return false;
        };

        let keys = AesHmacSha2Key::from_secret(key.as_bytes(), KEY_CHECK_INFO);
        let ciphertext = keys.encrypt_with_iv(KEY_CHECK_PLAINTEXT.to_vec(), &iv);

        keys.verify_mac(&ciphertext, &mac).is_ok()
    }

    pub(crate) fn set_private_key(&mut self, key: BackupDecryptionKey) {
        self.key = Some(key);
    }

    pub(crate) fn has_private_key(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn release(&mut self) {
        self.key = None;
    }

    pub(crate) fn private_key(&self) -> Result<&BackupDecryptionKey, BackupError> {
        self.key.as_ref().ok_or(BackupError::MissingPrivateKey)
    }

    pub(crate) fn encrypt(
        &self,
        session_id: &str,
        room_key: &BackedUpRoomKey,
    ) -> Result<EncryptedSessionData, BackupError> {
        let key = self.private_key()?;
        let keys = AesHmacSha2Key::from_secret(key.as_bytes(), session_id.as_bytes());

        let plaintext = Zeroizing::new(serde_json::to_vec(room_key)?);
        let (ciphertext, iv) = keys.encrypt(plaintext.to_vec());
        let mac = keys.create_mac_tag(&ciphertext);

        Ok(EncryptedSessionData::AesHmacSha2 {
            ciphertext: base64_encode(ciphertext),
            mac: Some(base64_encode(mac.as_bytes())),
            iv: Some(base64_encode(iv)),
        })
    }

    /// Decrypt a single backed up room key.
    ///
    /// Records without an IV were written by older clients, they are
    /// decrypted with an all-zero IV.
    pub(crate) fn decrypt(
        key: &BackupDecryptionKey,
        session_id: &str,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, BackupError> {
        let EncryptedSessionData::AesHmacSha2 { ciphertext, mac, iv } = session_data else {
            return Err(BackupError::MismatchedSessionData);
        };

        let mac = mac.as_deref().ok_or(BackupError::MissingMac)?;
        let iv = match iv {
            Some(iv) => decode_iv(iv)?,
            None => [0u8; IV_SIZE],
        };

        let ciphertext = base64_decode(ciphertext)?;
        let mac = base64_decode(mac)?;

        let keys = AesHmacSha2Key::from_secret(key.as_bytes(), session_id.as_bytes());
        keys.verify_mac(&ciphertext, &mac).map_err(|_| BackupError::Mac)?;

        let plaintext = Zeroizing::new(keys.decrypt(ciphertext, &iv));

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
