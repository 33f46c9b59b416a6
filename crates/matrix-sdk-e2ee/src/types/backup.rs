// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{deserialize_optional_curve_key, serialize_optional_curve_key};

/// The name of the public key based backup algorithm.
pub const MEGOLM_BACKUP_V1_CURVE25519_AES_SHA2: &str = "m.megolm_backup.v1.curve25519-aes-sha2";
/// The name of the symmetric backup algorithm.
pub const MEGOLM_BACKUP_V1_AES_HMAC_SHA2: &str = "m.megolm_backup.v1.aes-hmac-sha2";

/// Signatures of the auth data, user ID to key ID to signature.
pub type AuthDataSignatures = BTreeMap<String, BTreeMap<String, String>>;

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm
/// as defined in the [client-server API].
///
/// [client-server API]: https://spec.matrix.org/unstable/client-server-api/#backup-algorithm-mmegolm_backupv1curve25519-aes-sha2
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    ///
    /// A backup version without a public key can't be used, creating a
    /// [`BackupAlgorithm`](crate::backups::BackupAlgorithm) for it will fail.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_curve_key",
        serialize_with = "serialize_optional_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_key: Option<Curve25519PublicKey>,
    /// The salt that was used to derive the backup key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The number of PBKDF2 rounds used to derive the backup key from a
    /// passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    /// *Optional.* Signatures of the auth_data, as Signed JSON.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: AuthDataSignatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    /// Create a new [`MegolmV1AuthData`] for the given public key.
    pub fn new(public_key: Curve25519PublicKey) -> Self {
        Self { public_key: Some(public_key), ..Default::default() }
    }
}

/// Auth data for the `m.megolm_backup.v1.aes-hmac-sha2` backup algorithm.
///
/// The `iv` and `mac` fields form the key check: the MAC of 32 zero bytes,
/// encrypted with the backup key and `iv`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AesHmacSha2AuthData {
    /// The initialization vector of the key check, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// The MAC of the key check, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// The salt that was used to derive the backup key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The number of PBKDF2 rounds used to derive the backup key from a
    /// passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    /// *Optional.* Signatures of the auth_data, as Signed JSON.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: AuthDataSignatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl AesHmacSha2AuthData {
    /// Create a new [`AesHmacSha2AuthData`] from an already computed key
    /// check.
    pub fn new(iv: String, mac: String) -> Self {
        Self { iv: Some(iv), mac: Some(mac), ..Default::default() }
    }
}

/// Information pertaining to a room key backup. Can be used to upload a new
/// backup version as defined in the [client-server API].
///
/// [client-server API]: https://spec.matrix.org/unstable/client-server-api/#post_matrixclientv3room_keysversion
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// The `m.megolm_backup.v1.aes-hmac-sha2` variant of a backup.
    MegolmBackupV1AesHmacSha2(AesHmacSha2AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The name of the backup algorithm.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => {
                MEGOLM_BACKUP_V1_CURVE25519_AES_SHA2
            }
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(_) => MEGOLM_BACKUP_V1_AES_HMAC_SHA2,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1_CURVE25519_AES_SHA2 => {
                let data: MegolmV1AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data)
            }
            MEGOLM_BACKUP_V1_AES_HMAC_SHA2 => {
                let data: AesHmacSha2AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(data)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl TryFrom<&RoomKeyBackupInfo> for BackupInfoHelper {
    type Error = serde_json::Error;

    fn try_from(value: &RoomKeyBackupInfo) -> Result<Self, Self::Error> {
        let auth_data = match value {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => serde_json::to_value(d)?,
            RoomKeyBackupInfo::MegolmBackupV1AesHmacSha2(d) => serde_json::to_value(d)?,
            RoomKeyBackupInfo::Other { auth_data, .. } => serde_json::to_value(auth_data)?,
        };

        Ok(BackupInfoHelper { algorithm: value.algorithm().to_owned(), auth_data })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        BackupInfoHelper::try_from(self).map_err(serde::ser::Error::custom)?.serialize(serializer)
    }
}

/// A backup version as returned by the `/room_keys/version` endpoint.
///
/// The algorithm of a version never changes, a new algorithm always means a
/// new version.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "KeyBackupVersionHelper")]
pub struct KeyBackupVersion {
    /// The version string of the backup.
    pub version: String,
    /// The algorithm and auth data of the backup.
    pub info: RoomKeyBackupInfo,
}

#[derive(Serialize, Deserialize)]
struct KeyBackupVersionHelper {
    version: String,
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<KeyBackupVersionHelper> for KeyBackupVersion {
    type Error = serde_json::Error;

    fn try_from(value: KeyBackupVersionHelper) -> Result<Self, Self::Error> {
        let info = BackupInfoHelper { algorithm: value.algorithm, auth_data: value.auth_data };

        Ok(Self { version: value.version, info: info.try_into()? })
    }
}

impl Serialize for KeyBackupVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let BackupInfoHelper { algorithm, auth_data } =
            BackupInfoHelper::try_from(&self.info).map_err(serde::ser::Error::custom)?;

        KeyBackupVersionHelper { version: self.version.clone(), algorithm, auth_data }
            .serialize(serializer)
    }
}

/// The encrypted part of a backed up room key.
///
/// The shape depends on the backup algorithm, all binary fields are encoded
/// as unpadded base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptedSessionData {
    /// A room key encrypted with the `m.megolm_backup.v1.curve25519-aes-sha2`
    /// algorithm.
    Curve25519AesSha2 {
        /// The encrypted room key.
        ciphertext: String,
        /// The MAC of the ciphertext.
        mac: String,
        /// The ephemeral Curve25519 key used for the key agreement.
        ephemeral: String,
    },
    /// A room key encrypted with the `m.megolm_backup.v1.aes-hmac-sha2`
    /// algorithm.
    AesHmacSha2 {
        /// The encrypted room key.
        ciphertext: String,
        /// The MAC of the ciphertext, a record without a MAC can't be
        /// decrypted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
        /// The initialization vector, records from older clients might not
        /// have one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
    },
}

/// A single backed up room key, as stored on the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the key
    /// is from.
    pub is_verified: bool,
    /// The encrypted room key.
    pub session_data: EncryptedSessionData,
}

/// All the backed up room keys of a backup version, room ID to session ID to
/// the backed up key.
pub type RoomKeyBackup = BTreeMap<OwnedRoomId, BTreeMap<String, KeyBackupData>>;
