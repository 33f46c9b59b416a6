// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! The public key based `m.megolm_backup.v1.curve25519-aes-sha2` backup
//! algorithm.

use vodozemac::{
    base64_decode, base64_encode,
    pk_encryption::{Message, PkDecryption, PkEncryption},
    Curve25519PublicKey,
};
use zeroize::Zeroizing;

use super::{BackupDecryptionKey, BackupError};
use crate::{olm::BackedUpRoomKey, types::EncryptedSessionData};

/// The state of the `m.megolm_backup.v1.curve25519-aes-sha2` algorithm for a
/// single backup version.
///
/// Encryption only needs the public key of the backup, the private key is
/// needed to decrypt backed up room keys.
#[derive(Debug)]
pub struct Curve25519AesSha2Backup {
    public_key: Curve25519PublicKey,
    key: Option<BackupDecryptionKey>,
}

impl Curve25519AesSha2Backup {
    pub(crate) fn new(public_key: Curve25519PublicKey) -> Self {
        Self { public_key, key: None }
    }

    /// The public key of the backup version.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// Check if the given key is the private key of this backup version.
    pub fn key_matches(&self, key: &BackupDecryptionKey) -> bool {
        key.public_key() == self.public_key
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

    /// Create the decryption context, once per batch of backed up room keys.
    pub(crate) fn pk_decryption(&self) -> Result<PkDecryption, BackupError> {
        self.key
            .as_ref()
            .map(BackupDecryptionKey::pk_decryption)
            .ok_or(BackupError::MissingPrivateKey)
    }

    pub(crate) fn encrypt(
        &self,
        room_key: &BackedUpRoomKey,
    ) -> Result<EncryptedSessionData, BackupError> {
        let pk = PkEncryption::from_key(self.public_key);

        let plaintext = Zeroizing::new(serde_json::to_vec(room_key)?);
        let message = pk.encrypt(&plaintext);

        Ok(EncryptedSessionData::Curve25519AesSha2 {
            ciphertext: base64_encode(message.ciphertext),
            mac: base64_encode(message.mac),
            ephemeral: message.ephemeral_key.to_base64(),
        })
    }

    pub(crate) fn decrypt(
        pk: &PkDecryption,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, BackupError> {
        let EncryptedSessionData::Curve25519AesSha2 { ciphertext, mac, ephemeral } = session_data
        else {
            return Err(BackupError::MismatchedSessionData);
        };

        let message = Message {
            ciphertext: base64_decode(ciphertext)?,
            mac: base64_decode(mac)?,
            ephemeral_key: Curve25519PublicKey::from_base64(ephemeral)?,
        };

        let plaintext = Zeroizing::new(
            pk.decrypt(&message).map_err(|e| BackupError::Decryption(e.to_string()))?,
        );

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
