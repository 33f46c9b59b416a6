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

//! Server-side backup support for room keys, as defined in the
//! [client-server API].
//!
//! Two algorithms are supported, the public key based
//! `m.megolm_backup.v1.curve25519-aes-sha2` and the symmetric
//! `m.megolm_backup.v1.aes-hmac-sha2`. The algorithm of a backup is fixed by
//! its version, see [`BackupAlgorithm::from_version()`].
//!
//! Room keys restored from a `curve25519-aes-sha2` backup are marked as
//! untrusted, anybody that knows the public key of the backup could have
//! uploaded them.
//!
//! [client-server API]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};

mod aes;
mod curve25519;
mod recovery;

pub use aes::AesHmacSha2Backup;
pub use curve25519::Curve25519AesSha2Backup;
pub use recovery::{BackupDecryptionKey, DecodeError};

use crate::{
    error::SessionCreationError,
    olm::{BackedUpRoomKey, ExportedRoomKey, InboundGroupSession},
    progress::ProgressListener,
    store::{BackupKeys, Changes, CryptoStoreError, DeviceSessionStore, RoomKeyCounts},
    types::{
        EncryptedSessionData, KeyBackupData, KeyBackupVersion, RoomKeyBackup, RoomKeyBackupInfo,
        MEGOLM_BACKUP_V1_AES_HMAC_SHA2, MEGOLM_BACKUP_V1_CURVE25519_AES_SHA2,
    },
};

/// Error type for the backup of room keys.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup version uses an algorithm we don't know about.
    #[error("the backup uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The auth data of a `curve25519-aes-sha2` backup has no public key.
    #[error("the auth data of the backup doesn't contain a public key")]
    MissingPublicKey,

    /// The operation needs the private key of the backup, but none was set.
    #[error("the private key of the backup isn't known")]
    MissingPrivateKey,

    /// The given private key doesn't belong to the backup version.
    #[error("the private key doesn't match the backup version")]
    KeyMismatch,

    /// No backup version is active.
    #[error("no backup is enabled")]
    NotEnabled,

    /// A backed up room key doesn't contain a MAC.
    #[error("the backed up room key doesn't contain a MAC")]
    MissingMac,

    /// A backed up room key was encrypted with the other backup algorithm.
    #[error("the backed up room key was encrypted with a different backup algorithm")]
    MismatchedSessionData,

    /// The initialization vector of a backed up room key has the wrong
    /// length.
    #[error("the initialization vector has an invalid length of {0} bytes")]
    InvalidIv(usize),

    /// The MAC of a backed up room key didn't match.
    #[error("the MAC of the backed up room key doesn't match")]
    Mac,

    /// A field of a backed up room key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The ephemeral key of a backed up room key isn't a valid Curve25519
    /// key.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// A backed up room key couldn't be decrypted.
    #[error("the backed up room key couldn't be decrypted: {0}")]
    Decryption(String),

    /// A room key couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A restored room key couldn't be turned into a group session.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),
}

/// The algorithm of a backup version, together with the key material the
/// algorithm needs.
#[derive(Debug)]
pub enum BackupAlgorithm {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` algorithm.
    Curve25519AesSha2(Curve25519AesSha2Backup),
    /// The `m.megolm_backup.v1.aes-hmac-sha2` algorithm.
    AesHmacSha2(AesHmacSha2Backup),
}

impl BackupAlgorithm {
    /// Pick the algorithm of the given backup version.
    pub fn from_version(version: &KeyBackupVersion) -> Result<Self, BackupError> {
        match &version.info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) => {
                let public_key = auth_data.public_key.ok_or(BackupError::MissingPublicKey)?;
                Ok(Self::Curve25519AesSha2(Curve25519AesSha2Backup::new(public_key)))
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(auth_data) => {
                Ok(Self::AesHmacSha2(AesHmacSha2Backup::new(auth_data.clone())))
            }
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                Err(BackupError::UnsupportedAlgorithm(algorithm.clone()))
            }
        }
    }

    /// The name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Curve25519AesSha2(_) => MEGOLM_BACKUP_V1_CURVE25519_AES_SHA2,
            Self::AesHmacSha2(_) => MEGOLM_BACKUP_V1_AES_HMAC_SHA2,
        }
    }

    /// Check if the given key belongs to the backup version.
    pub fn key_matches(&self, key: &BackupDecryptionKey) -> bool {
        match self {
            Self::Curve25519AesSha2(b) => b.key_matches(key),
            Self::AesHmacSha2(b) => b.key_matches(key),
        }
    }

    /// Set the private key of the backup.
    ///
    /// The key is rejected if it doesn't belong to the backup version.
    pub fn set_private_key(&mut self, key: BackupDecryptionKey) -> Result<(), BackupError> {
        if !self.key_matches(&key) {
            return Err(BackupError::KeyMismatch);
        }

        match self {
            Self::Curve25519AesSha2(b) => b.set_private_key(key),
            Self::AesHmacSha2(b) => b.set_private_key(key),
        }

        Ok(())
    }

    /// Do we know the private key of the backup.
    pub fn has_private_key(&self) -> bool {
        match self {
            Self::Curve25519AesSha2(b) => b.has_private_key(),
            Self::AesHmacSha2(b) => b.has_private_key(),
        }
    }

    /// Forget the private key, it's zeroized when dropped.
    pub fn release(&mut self) {
        match self {
            Self::Curve25519AesSha2(b) => b.release(),
            Self::AesHmacSha2(b) => b.release(),
        }
    }

    /// Are room keys restored with this algorithm of unproven origin.
    fn restores_untrusted_keys(&self) -> bool {
        matches!(self, Self::Curve25519AesSha2(_))
    }

    /// Encrypt a single inbound group session for the backup.
    ///
    /// The symmetric algorithm needs the private key to encrypt.
    pub async fn encrypt_session(
        &self,
        session: &InboundGroupSession,
    ) -> Result<KeyBackupData, BackupError> {
        let room_key = session.to_backup().await;

        let session_data = match self {
            Self::Curve25519AesSha2(b) => b.encrypt(&room_key)?,
            Self::AesHmacSha2(b) => b.encrypt(session.session_id(), &room_key)?,
        };

        // We only care whether we received the session directly from its
        // creator, not about the length of the forwarding chain.
        Ok(KeyBackupData {
            first_message_index: session.first_known_index(),
            forwarded_count: session.has_been_imported().into(),
            is_verified: session.is_verified(),
            session_data,
        })
    }

    /// Decrypt all the room keys of a backup.
    ///
    /// Room keys that fail to decrypt are logged and skipped.
    pub fn decrypt_sessions(
        &self,
        backup: &RoomKeyBackup,
    ) -> Result<Vec<ExportedRoomKey>, BackupError> {
        let untrusted = self.restores_untrusted_keys();

        match self {
            Self::Curve25519AesSha2(b) => {
                let pk = b.pk_decryption()?;

                Ok(decrypt_all(backup, untrusted, |_, session_data| {
                    Curve25519AesSha2Backup::decrypt(&pk, session_data)
                }))
            }
            Self::AesHmacSha2(b) => {
                let key = b.private_key()?;

                Ok(decrypt_all(backup, untrusted, |session_id, session_data| {
                    AesHmacSha2Backup::decrypt(key, session_id, session_data)
                }))
            }
        }
    }
}

fn decrypt_all(
    backup: &RoomKeyBackup,
    untrusted: bool,
    decrypt: impl Fn(&str, &EncryptedSessionData) -> Result<BackedUpRoomKey, BackupError>,
) -> Vec<ExportedRoomKey> {
    let mut room_keys = Vec::new();

    for (room_id, sessions) in backup {
        for (session_id, data) in sessions {
            match decrypt(session_id.as_str(), &data.session_data) {
                Ok(mut room_key) => {
                    room_key.untrusted = untrusted;
                    room_keys.push(ExportedRoomKey::from_backed_up_room_key(
                        room_id.to_owned(),
                        session_id.to_owned(),
                        room_key,
                    ));
                }
                Err(e) => {
                    warn!(
                        %room_id,
                        %session_id,
                        error = ?e,
                        "Couldn't decrypt a backed up room key, skipping it"
                    );
                }
            }
        }
    }

    room_keys
}

/// A batch of encrypted room keys that should be uploaded to the backup.
#[derive(Clone, Debug)]
pub struct KeysBackupRequest {
    /// The backup version the room keys were encrypted for.
    pub version: String,
    /// The encrypted room keys.
    pub rooms: RoomKeyBackup,
}

/// The result of an import of room keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the export.
    pub total_count: usize,
}

#[derive(Debug)]
struct ActiveBackup {
    version: String,
    algorithm: BackupAlgorithm,
}

/// A state machine that handles backing up and restoring room keys.
///
/// The state machine can be activated using
/// [`BackupMachine::enable_backup()`]. After that, batches of room keys can be
/// encrypted with [`BackupMachine::backup()`].
#[derive(Clone, Debug)]
pub struct BackupMachine {
    store: DeviceSessionStore,
    backup: Arc<RwLock<Option<ActiveBackup>>>,
}

impl BackupMachine {
    /// Create a new, disabled, backup machine for the given store.
    pub fn new(store: DeviceSessionStore) -> Self {
        Self { store, backup: Default::default() }
    }

    /// Activate the given backup version.
    ///
    /// The private key is optional for a `curve25519-aes-sha2` backup, it's
    /// only needed to restore room keys.
    #[instrument(skip_all, fields(version = %version.version))]
    pub async fn enable_backup(
        &self,
        version: &KeyBackupVersion,
        key: Option<BackupDecryptionKey>,
    ) -> Result<(), BackupError> {
        let mut algorithm = BackupAlgorithm::from_version(version)?;

        if let Some(key) = key {
            algorithm.set_private_key(key)?;
        }

        info!(algorithm = algorithm.name(), "Activated a backup");

        *self.backup.write().await =
            Some(ActiveBackup { version: version.version.clone(), algorithm });

        Ok(())
    }

    /// Is a backup version active.
    pub async fn enabled(&self) -> bool {
        self.backup.read().await.is_some()
    }

    /// Disable and reset our backup state.
    ///
    /// This will release the backup key and reset the backup state of each
    /// room key we have.
    #[instrument(skip(self))]
    pub async fn disable_backup(&self) {
        debug!("Disabling key backup and resetting backup state for room keys");

        if let Some(mut backup) = self.backup.write().await.take() {
            backup.algorithm.release();
        }

        self.store.reset_backup_state();
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub fn room_key_counts(&self) -> RoomKeyCounts {
        self.store.inbound_group_session_counts()
    }

    /// Store the backup key and version in the store.
    pub async fn save_backup_keys(
        &self,
        decryption_key: Option<BackupDecryptionKey>,
        version: Option<String>,
    ) -> Result<(), BackupError> {
        let changes = Changes {
            backup_decryption_key: decryption_key,
            backup_version: version,
            ..Default::default()
        };

        Ok(self.store.save_changes(changes).await?)
    }

    /// Get the backup keys we have saved in our store.
    pub async fn get_backup_keys(&self) -> BackupKeys {
        self.store.load_backup_keys().await
    }

    /// Encrypt a batch of at most `limit` room keys that aren't backed up yet.
    ///
    /// Returns `None` if no backup is active or if all room keys are backed up.
    pub async fn backup(&self, limit: usize) -> Result<Option<KeysBackupRequest>, BackupError> {
        let _access = self.store.read_access().await;

        let backup = self.backup.read().await;
        let Some(backup) = backup.as_ref() else {
            warn!("Trying to backup room keys but no backup is enabled");
            return Ok(None);
        };

        let sessions = self.store.inbound_group_sessions_for_backup(limit);

        if sessions.is_empty() {
            trace!("No room keys need to be backed up");
            return Ok(None);
        }

        let mut rooms = RoomKeyBackup::new();

        for session in &sessions {
            let data = backup.algorithm.encrypt_session(session).await?;

            rooms
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), data);
        }

        info!(
            key_count = sessions.len(),
            version = %backup.version,
            "Successfully created a room keys backup request"
        );

        Ok(Some(KeysBackupRequest { version: backup.version.clone(), rooms }))
    }

    /// Mark the room keys of an uploaded backup request as backed up.
    pub fn mark_as_backed_up(&self, request: &KeysBackupRequest) {
        for (room_id, sessions) in &request.rooms {
            for session_id in sessions.keys() {
                if let Some(session) = self.store.get_inbound_group_session(room_id, session_id) {
                    session.mark_as_backed_up();
                }
            }
        }

        trace!(room_key_counts = ?self.room_key_counts(), "Marked room keys as backed up");
    }

    /// Decrypt the room keys of a backup downloaded from the server.
    pub async fn decrypt_backup(
        &self,
        backup: &RoomKeyBackup,
    ) -> Result<Vec<ExportedRoomKey>, BackupError> {
        let active = self.backup.read().await;
        let active = active.as_ref().ok_or(BackupError::NotEnabled)?;

        active.algorithm.decrypt_sessions(backup)
    }

    /// Decrypt a downloaded backup and import its room keys into the store.
    pub async fn restore_backup(
        &self,
        backup: &RoomKeyBackup,
        listener: &dyn ProgressListener,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let room_keys = self.decrypt_backup(backup).await?;
        self.import_backed_up_room_keys(room_keys, listener).await
    }

    /// Import room keys that were restored from the backup.
    ///
    /// The imported sessions are marked as backed up. Sessions that we already
    /// know at a lower or equal message index are skipped.
    #[instrument(skip_all, fields(key_count = room_keys.len()))]
    pub async fn import_backed_up_room_keys(
        &self,
        room_keys: Vec<ExportedRoomKey>,
        listener: &dyn ProgressListener,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let _access = self.store.read_access().await;

        let total_count = room_keys.len();
        let mut sessions = Vec::new();

        for (i, key) in room_keys.iter().enumerate() {
            match InboundGroupSession::from_export(key) {
                Ok(session) => {
                    let known = self
                        .store
                        .get_inbound_group_session(session.room_id(), session.session_id());

                    let is_better = known.is_none_or(|known| {
                        session.first_known_index() < known.first_known_index()
                    });

                    if is_better {
                        session.mark_as_backed_up();
                        sessions.push(session);
                    }
                }
                Err(e) => {
                    warn!(
                        room_id = %key.room_id,
                        session_id = %key.session_id,
                        error = ?e,
                        "Couldn't import a room key from the backup"
                    );
                }
            }

            listener.on_progress(i + 1, total_count);
        }

        let imported_count = sessions.len();
        let changes = Changes { inbound_group_sessions: sessions, ..Default::default() };
        self.store.save_changes(changes).await?;

        info!(imported_count, total_count, "Imported room keys from the backup");

        Ok(RoomKeyImportResult { imported_count, total_count })
    }
}
