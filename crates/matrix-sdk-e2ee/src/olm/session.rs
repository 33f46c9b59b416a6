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

use std::{fmt, sync::Arc};

use ruma::{RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{field::debug, instrument, trace, Span};
use vodozemac::{
    olm::{DecryptionError, OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

use super::StaticAccountData;
use crate::{error::OlmResult, identities::DeviceData, types::CiphertextInfo};

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    /// The static data of our own account, used to bind the plaintext to us.
    pub our_account: StaticAccountData,
    /// The OlmSession
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our sessionId
    pub session_id: Arc<str>,
    /// The Key of the sender
    pub sender_key: Curve25519PublicKey,
    /// When the session was created
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or an `DecryptionError` if decryption
    /// failed.
    ///
    /// # Arguments
    ///
    /// * `message` - The Olm message that should be decrypted.
    #[instrument(skip_all, fields(session))]
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let mut inner = self.inner.lock().await;
        let plaintext = inner.decrypt(message)?;

        Span::current().record("session", debug(&*inner));
        trace!("Decrypted a Olm message");

        let plaintext = String::from_utf8_lossy(&plaintext).to_string();

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Does the given pre-key message belong to this session.
    pub fn matches(&self, message: &PreKeyMessage) -> bool {
        self.session_id() == message.session_id()
    }

    /// Get the sender key that was used to establish this Session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Encrypt the given plaintext as a OlmMessage.
    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let mut session = self.inner.lock().await;

        Span::current().record("session", debug(&*session));
        let message = session.encrypt(plaintext);

        self.last_use_time = SecondsSinceUnixEpoch::now();
        message
    }

    /// Encrypt the given event content for the device this session was
    /// established with.
    ///
    /// The plaintext binds the message to us and to the recipient device, so
    /// it can't be replayed to somebody else.
    ///
    /// # Arguments
    ///
    /// * `recipient_device` - The device for which this message is going to be
    ///   encrypted, this needs to be the device that was used to create this
    ///   session with.
    ///
    /// * `room_id` - The room the event belongs to, if any.
    ///
    /// * `event_type` - The type of the event content.
    ///
    /// * `content` - The content of the event.
    #[instrument(skip_all, fields(session, recipient = ?recipient_device.device_id()))]
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceData,
        room_id: Option<&RoomId>,
        event_type: &str,
        content: Value,
    ) -> OlmResult<CiphertextInfo> {
        let plaintext = {
            let payload = json!({
                "room_id": room_id,
                "sender": &self.our_account.user_id,
                "sender_device": &self.our_account.device_id,
                "keys": {
                    "ed25519": self.our_account.identity_keys.ed25519.to_base64(),
                },
                "recipient": recipient_device.user_id(),
                "recipient_keys": {
                    "ed25519": recipient_device.ed25519_key.to_base64(),
                },
                "type": event_type,
                "content": content,
            });

            serde_json::to_string(&payload)?
        };

        let message = self.encrypt_helper(&plaintext).await;

        Ok(message.into())
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store the session as a serializable pickle.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a Session from a previously pickled string.
    ///
    /// # Arguments
    ///
    /// * `our_account` - The static data of the account that owns the session.
    ///
    /// * `pickle` - The pickled version of the `Session`.
    pub fn from_pickle(our_account: StaticAccountData, pickle: PickledSession) -> Self {
        let session: InnerSession = pickle.pickle.into();
        let session_id = session.session_id();

        Session {
            our_account,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }

    /// Restore a session from a pickle that was encrypted with a pickle key.
    ///
    /// Timestamps aren't part of the encrypted pickle, both are set to the
    /// given time.
    pub fn from_encrypted_pickle(
        our_account: StaticAccountData,
        sender_key: Curve25519PublicKey,
        pickle: &str,
        pickle_key: &[u8; 32],
        last_use_time: SecondsSinceUnixEpoch,
    ) -> Result<Self, PickleError> {
        let pickle = SessionPickle::from_encrypted(pickle, pickle_key)?;

        Ok(Self::from_pickle(
            our_account,
            PickledSession {
                pickle,
                sender_key,
                creation_time: last_use_time,
                last_use_time,
            },
        ))
    }

    /// Encrypt the pickle of this session with the given pickle key.
    pub async fn encrypted_pickle(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.lock().await.pickle().encrypt(pickle_key)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickle string holding the Olm Session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: Curve25519PublicKey,
    /// The Unix timestamp when the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The Unix timestamp when the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
