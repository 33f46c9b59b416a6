// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{DeviceKeyAlgorithm, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        ExportedSessionKey, InboundGroupSession as InnerSession, InboundGroupSessionPickle,
        MegolmMessage, SessionConfig, SessionKey,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    error::{MegolmResult, SessionCreationError},
    types::{
        deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm, SigningKeys,
    },
};

/// An exported version of an [`InboundGroupSession`].
///
/// This is the algorithm agnostic shape of a room key, both backup algorithms
/// encrypt and decrypt it, and it can be shared in an exported file.
#[derive(Deserialize, Serialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: SigningKeys,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// Whether this room key can be shared with users who are invited to the
    /// room in the future, allowing access to history, as defined in
    /// [MSC3061].
    ///
    /// [MSC3061]: https://github.com/matrix-org/matrix-spec-proposals/pull/3061
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,

    /// Is the origin of this room key unproven, keys restored from a public
    /// key backup are.
    #[serde(default)]
    pub untrusted: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_keys", &self.sender_claimed_keys)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .field("shared_history", &self.shared_history)
            .field("untrusted", &self.untrusted)
            .finish_non_exhaustive()
    }
}

impl ExportedRoomKey {
    /// Restore the exported room key of a backed up room key.
    ///
    /// The room ID and session ID aren't part of the encrypted backup, they
    /// are the keys of the backup map.
    pub fn from_backed_up_room_key(
        room_id: OwnedRoomId,
        session_id: String,
        room_key: BackedUpRoomKey,
    ) -> Self {
        let BackedUpRoomKey {
            algorithm,
            sender_key,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
            shared_history,
            untrusted,
        } = room_key;

        Self {
            algorithm,
            room_id,
            sender_key,
            session_id,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
            shared_history,
            untrusted,
        }
    }
}

/// A backed up version of an [`InboundGroupSession`].
///
/// This can be used to backup the [`InboundGroupSession`] to the server.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: SigningKeys,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// Whether this room key can be shared with future room members, see
    /// [`ExportedRoomKey::shared_history`].
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    pub shared_history: bool,

    /// See [`ExportedRoomKey::untrusted`].
    #[serde(default)]
    pub untrusted: bool,
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
            shared_history: k.shared_history,
            untrusted: k.untrusted,
        }
    }
}

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group
/// of participants. Inbound group sessions are used to decrypt the room
/// messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,

    /// A copy of [`InnerSession::session_id`] to avoid having to acquire a lock
    /// to get to the session ID.
    session_id: Arc<str>,

    /// A copy of [`InnerSession::first_known_index`] to avoid having to acquire
    /// a lock to get to the first known index.
    first_known_index: u32,

    /// The Curve25519 key of the device that created the session.
    sender_key: Curve25519PublicKey,

    /// The signing keys the creator of the session claims to own.
    signing_keys: Arc<SigningKeys>,

    /// The chain of devices that forwarded the session to us.
    forwarding_key_chain: Arc<[String]>,

    /// The Room this GroupSession belongs to
    pub room_id: OwnedRoomId,

    /// A flag recording whether the `InboundGroupSession` was received directly
    /// as a `m.room_key` event or indirectly via a forward, a backup or a file
    /// import. Imported sessions aren't verified.
    imported: bool,

    /// Was this room key backed up to the server.
    backed_up: Arc<AtomicBool>,

    /// Whether this [`InboundGroupSession`] can be shared with users who are
    /// invited to the room in the future, allowing access to history, as
    /// defined in [MSC3061].
    ///
    /// [MSC3061]: https://github.com/matrix-org/matrix-spec-proposals/pull/3061
    shared_history: bool,

    /// Was the room key restored from a source that can't prove its origin.
    untrusted: bool,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// These sessions are used to decrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us the
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    ///
    /// * `shared_history` - Can the session be shared with future room members.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        shared_history: bool,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let mut keys = SigningKeys::new();
        keys.insert(DeviceKeyAlgorithm::Ed25519, signing_key.to_base64());

        InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_keys: keys.into(),
            forwarding_key_chain: Vec::new().into(),
            room_id: room_id.into(),
            imported: false,
            backed_up: AtomicBool::new(false).into(),
            shared_history,
            untrusted: false,
        }
    }

    /// Create a new [`InboundGroupSession`] from an exported version of the
    /// group session.
    ///
    /// The session is marked as imported.
    pub fn from_export(exported_session: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        let ExportedRoomKey {
            algorithm,
            room_id,
            sender_key,
            session_id: _,
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain,
            shared_history,
            untrusted,
        } = exported_session;

        if *algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::Algorithm(algorithm.to_string()));
        }

        let session = InnerSession::import(session_key, SessionConfig::version_1());
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            session_id: session.session_id().into(),
            inner: Mutex::new(session).into(),
            first_known_index,
            sender_key: *sender_key,
            signing_keys: sender_claimed_keys.to_owned().into(),
            forwarding_key_chain: forwarding_curve25519_key_chain.as_slice().into(),
            room_id: room_id.to_owned(),
            imported: true,
            backed_up: AtomicBool::from(false).into(),
            shared_history: *shared_history,
            untrusted: *untrusted,
        })
    }

    /// Convert the [`InboundGroupSession`] into a
    /// [`PickledInboundGroupSession`] which can be serialized.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_key: (*self.signing_keys).clone(),
            forwarding_curve25519_key_chain: self.forwarding_key_chain.to_vec(),
            room_id: self.room_id().to_owned(),
            imported: self.imported,
            backed_up: self.backed_up(),
            shared_history: self.shared_history,
            untrusted: self.untrusted,
        }
    }

    /// Restore a Session from a previously pickled string.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let PickledInboundGroupSession {
            pickle,
            sender_key,
            signing_key,
            forwarding_curve25519_key_chain,
            room_id,
            imported,
            backed_up,
            shared_history,
            untrusted,
        } = pickle;

        let session: InnerSession = pickle.into();
        let first_known_index = session.first_known_index();
        let session_id = session.session_id();

        InboundGroupSession {
            inner: Mutex::new(session).into(),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_keys: signing_key.into(),
            forwarding_key_chain: forwarding_curve25519_key_chain.into(),
            room_id,
            imported,
            backed_up: AtomicBool::from(backed_up).into(),
            shared_history,
            untrusted,
        }
    }

    /// Encrypt the pickle of this session with the given pickle key.
    pub async fn encrypted_pickle(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.lock().await.pickle().encrypt(pickle_key)
    }

    /// Export this session at the first known message index.
    ///
    /// If only a limited part of this session should be exported use
    /// [`InboundGroupSession::export_at_index()`].
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    ///
    /// Indices below the first known index are raised to it, so the export
    /// always succeeds.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        let session_key = {
            let mut inner = self.inner.lock().await;
            inner.export_at(message_index).unwrap_or_else(|| inner.export_at_first_known_index())
        };

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id().to_owned(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            forwarding_curve25519_key_chain: self.forwarding_key_chain.to_vec(),
            sender_claimed_keys: (*self.signing_keys).clone(),
            session_key,
            shared_history: self.shared_history,
            untrusted: self.untrusted,
        }
    }

    /// Export the inbound group session into a format that can be uploaded to
    /// the server as a backup.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Decrypt the given Megolm message.
    ///
    /// Returns the plaintext and the message index of the message.
    pub async fn decrypt(&self, message: &MegolmMessage) -> MegolmResult<(String, u32)> {
        let decrypted = self.inner.lock().await.decrypt(message)?;
        let plaintext = String::from_utf8_lossy(&decrypted.plaintext).to_string();

        Ok((plaintext, decrypted.message_index))
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Get the map of signing keys this session was received from.
    pub fn signing_keys(&self) -> &SigningKeys {
        &self.signing_keys
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, SeqCst)
    }

    /// Mark this session as backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst)
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Has the session been imported from a file, a backup or a forward.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Was the session received directly from its creator.
    pub fn is_verified(&self) -> bool {
        !self.imported
    }

    /// Whether this [`InboundGroupSession`] can be shared with users who are
    /// invited to the room in the future, allowing access to history, as
    /// defined in [MSC3061].
    ///
    /// [MSC3061]: https://github.com/matrix-org/matrix-spec-proposals/pull/3061
    pub fn shared_history(&self) -> bool {
        self.shared_history
    }

    /// Was the room key restored from a source that can't prove its origin,
    /// like a public key backup.
    pub fn is_untrusted(&self) -> bool {
        self.untrusted
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the InboundGroupSession.
    pub pickle: InboundGroupSessionPickle,
    /// The public Curve25519 key of the account that sent us the session
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The public ed25519 key of the account that sent us the session.
    pub signing_key: SigningKeys,
    /// The chain of devices that forwarded the session to us.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// Whether this [`InboundGroupSession`] can be shared with users who are
    /// invited to the room in the future.
    #[serde(default)]
    pub shared_history: bool,
    /// Was the room key restored from a source that can't prove its origin.
    #[serde(default)]
    pub untrusted: bool,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};
    use vodozemac::megolm::ExportedSessionKey;

    use super::{ExportedRoomKey, InboundGroupSession, PickledInboundGroupSession};
    use crate::{error::SessionCreationError, olm::Account, types::EventEncryptionAlgorithm};

    #[tokio::test]
    async fn group_session_pair_decrypts() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (mut outbound, inbound) =
            account.create_group_session_pair(room_id!("!test:localhost"), true);

        let message = outbound.encrypt("It's a secret to everybody");
        let (plaintext, index) = inbound.decrypt(&message).await.unwrap();

        assert_eq!(plaintext, "It's a secret to everybody");
        assert_eq!(index, 0);
        assert!(inbound.is_verified());
        assert!(inbound.shared_history());
    }

    #[tokio::test]
    async fn imported_sessions_keep_their_provenance() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account.create_group_session_pair(room_id!("!test:localhost"), false);

        let mut export = inbound.export().await;
        export.untrusted = true;
        let imported = InboundGroupSession::from_export(&export).unwrap();

        assert_eq!(imported, inbound);
        assert!(imported.is_untrusted());
        assert!(imported.export().await.untrusted);
        assert!(imported.to_backup().await.untrusted);
        assert!(imported.has_been_imported());
        assert!(!imported.is_verified());
        assert_eq!(imported.signing_keys(), inbound.signing_keys());

        imported.mark_as_backed_up();
        let pickle = serde_json::to_string(&imported.pickle().await).unwrap();
        let pickle: PickledInboundGroupSession = serde_json::from_str(&pickle).unwrap();
        let restored = InboundGroupSession::from_pickle(pickle);

        assert!(restored.backed_up());
        assert!(restored.has_been_imported());
        assert!(restored.is_untrusted());
        assert_eq!(restored.room_id(), room_id!("!test:localhost"));
    }

    #[tokio::test]
    async fn unknown_algorithms_are_rejected() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account.create_group_session_pair(room_id!("!test:localhost"), false);

        let export = inbound.export().await;
        let export = ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::from("m.megolm.v2.aes-sha2"),
            session_key: ExportedSessionKey::from_base64(&export.session_key.to_base64()).unwrap(),
            ..export
        };

        let result = InboundGroupSession::from_export(&export);
        assert!(matches!(result, Err(SessionCreationError::Algorithm(_))));
    }
}
