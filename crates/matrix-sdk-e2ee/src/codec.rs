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

//! The Olm message codec, encrypting to-device events for a set of users and
//! decrypting the ones we receive.

use std::sync::Arc;

use ruma::{OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, trace, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::{EventError, OlmError, OlmResult},
    identities::{DeviceData, KeysQueryService},
    olm::{Session, StaticAccountData},
    store::{CryptoStoreError, DeviceSessionStore},
    types::{DecryptedOlmEvent, OlmPayload, OlmV1EncryptedContent, ToDeviceEncryptedEvent},
};

/// Settings for the encryption of to-device events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Only encrypt for devices we locally marked as verified.
    pub only_allow_trusted_devices: bool,
}

/// Encrypts and decrypts Olm to-device events.
///
/// The codec works on the sessions of the [`DeviceSessionStore`] it was
/// created with, it downloads device keys and claims one-time keys through the
/// given [`KeysQueryService`] when it needs to establish new sessions.
#[derive(Clone, Debug)]
pub struct OlmCodec {
    store: DeviceSessionStore,
    keys: Arc<dyn KeysQueryService>,
    settings: EncryptionSettings,
}

impl OlmCodec {
    /// Create a new codec with the default [`EncryptionSettings`].
    pub fn new(store: DeviceSessionStore, keys: Arc<dyn KeysQueryService>) -> Self {
        Self::with_settings(store, keys, EncryptionSettings::default())
    }

    /// Create a new codec with the given settings.
    pub fn with_settings(
        store: DeviceSessionStore,
        keys: Arc<dyn KeysQueryService>,
        settings: EncryptionSettings,
    ) -> Self {
        Self { store, keys, settings }
    }

    /// The store this codec works on.
    pub fn store(&self) -> &DeviceSessionStore {
        &self.store
    }

    fn static_account(&self) -> Result<StaticAccountData, CryptoStoreError> {
        self.store.static_account().ok_or(CryptoStoreError::AccountUnset)
    }

    fn should_encrypt_for(&self, our: &StaticAccountData, device: &DeviceData) -> bool {
        let own_device = (device.user_id() == our.user_id()
            && device.device_id() == our.device_id())
            || device.curve25519_key == our.identity_keys.curve25519;

        if own_device {
            false
        } else if device.is_blacklisted() {
            trace!(device_id = ?device.device_id(), "Skipping a blacklisted device");
            false
        } else if self.settings.only_allow_trusted_devices && !device.is_locally_trusted() {
            trace!(device_id = ?device.device_id(), "Skipping an untrusted device");
            false
        } else {
            true
        }
    }

    /// Encrypt the given event content for all the devices of the given users.
    ///
    /// A new Olm session is established with every device we don't share a
    /// session with yet. Users whose devices can't be downloaded, and devices
    /// for which no one-time key can be claimed, are skipped.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The room the event belongs to, if any.
    ///
    /// * `event_type` - The type of the event content.
    ///
    /// * `content` - The content that should be encrypted.
    ///
    /// * `users` - The users whose devices should receive the event.
    #[instrument(skip_all, fields(event_type = %event_type, user_count = users.len()))]
    pub async fn encrypt(
        &self,
        room_id: Option<&RoomId>,
        event_type: &str,
        content: &Value,
        users: &[OwnedUserId],
    ) -> OlmResult<OlmV1EncryptedContent> {
        let _access = self.store.read_access().await;
        let our = self.static_account()?;

        let mut encrypted = OlmV1EncryptedContent::new(our.identity_keys.curve25519);

        for user_id in users {
            let devices = match self.keys.query_keys(user_id).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(%user_id, error = ?e, "Couldn't download the devices of a user");
                    continue;
                }
            };

            for device in devices.iter().filter(|d| self.should_encrypt_for(&our, d)) {
                let sender_key = device.curve25519_key.to_base64();
                let entry = self.store.session_entry(&sender_key);
                let mut sessions = entry.lock().await;

                // The entry lock is held until the new session is stored, so
                // concurrent calls share one session per device.
                if sessions.is_empty() {
                    let Some(session) = self.establish_session(device).await? else {
                        continue;
                    };

                    sessions.push(session);
                }

                let Some(session) = sessions.iter_mut().max_by_key(|s| s.last_use_time) else {
                    continue;
                };

                let ciphertext =
                    session.encrypt(device, room_id, event_type, content.clone()).await?;
                encrypted.ciphertext.insert(sender_key, ciphertext);
            }
        }

        debug!(recipient_count = encrypted.ciphertext.len(), "Encrypted a to-device event");

        Ok(encrypted)
    }

    async fn establish_session(&self, device: &DeviceData) -> OlmResult<Option<Session>> {
        let one_time_key = match self.keys.claim_one_time_key(device).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "The device has no one-time keys left, skipping"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(error = ?e, "Couldn't claim a one-time key, skipping the device");
                return Ok(None);
            }
        };

        let session = self.store.account().await?.create_outbound_session(device, one_time_key);

        Ok(Some(session))
    }

    /// Decrypt an `m.olm.v1.curve25519-aes-sha2` to-device event.
    ///
    /// Every session we share with the sender key is tried, a new session is
    /// only created for a pre-key message that none of our sessions belongs
    /// to. The decrypted payload has to be meant for us, and has to come from
    /// the sender of the event.
    ///
    /// The returned event carries the keys the sender claims to own, the
    /// caller decides whether to trust them.
    #[instrument(skip_all, fields(sender = ?event.sender))]
    pub async fn decrypt(&self, event: &ToDeviceEncryptedEvent) -> OlmResult<DecryptedOlmEvent> {
        let _access = self.store.read_access().await;
        let our = self.static_account()?;

        let content = OlmV1EncryptedContent::from_json(&event.content)
            .inspect_err(|e| warn!(error = ?e, "Received a malformed encrypted to-device event"))?;

        let own_key = our.identity_keys.curve25519.to_base64();
        let ciphertext =
            content.ciphertext.get(&own_key).ok_or(EventError::NotIncludedInRecipients)?;
        let message = ciphertext.to_olm_message()?;

        let plaintext =
            self.decrypt_olm_message(&event.sender, content.sender_key, &message).await?;

        parse_payload(&our, event, content.sender_key, &plaintext).inspect_err(|e| match e {
            OlmError::EventError(e) if e.is_trust_error() => {
                error!(security = true, error = ?e, "The decrypted Olm payload isn't meant for us")
            }
            e => warn!(error = ?e, "The decrypted Olm payload is malformed"),
        })
    }

    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        let sender_key_base64 = sender_key.to_base64();

        // Unknown sender keys get an entry only once a session for them exists.
        let entry = self.store.get_sessions(&sender_key_base64);
        let mut sessions = match &entry {
            Some(entry) => Some(entry.lock().await),
            None => None,
        };

        for session in sessions.iter_mut().flat_map(|s| s.iter_mut()) {
            match session.decrypt(message).await {
                Ok(plaintext) => {
                    debug!(session_id = session.session_id(), "Decrypted with session");
                    return Ok(plaintext);
                }
                Err(e) => {
                    trace!(
                        session_id = session.session_id(),
                        error = ?e,
                        "Failed to decrypt with session"
                    );
                }
            }
        }

        let OlmMessage::PreKey(prekey) = message else {
            warn!(
                ?sender_key,
                session_count = sessions.as_ref().map_or(0, |s| s.len()),
                "None of our sessions could decrypt a normal Olm message"
            );
            return Err(OlmError::UnableToDecrypt(sender.to_owned(), sender_key));
        };

        if sessions.iter().flat_map(|s| s.iter()).any(|s| s.matches(prekey)) {
            warn!(
                ?sender_key,
                "A session matching the pre-key message exists but couldn't decrypt it"
            );
            return Err(OlmError::UnableToDecrypt(sender.to_owned(), sender_key));
        }

        let result = match self.store.account().await?.create_inbound_session(sender_key, prekey) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    ?sender_key,
                    error = ?e,
                    "Failed to create a new Olm session from a pre-key message"
                );
                return Err(OlmError::UnableToDecrypt(sender.to_owned(), sender_key));
            }
        };

        match sessions {
            Some(mut sessions) => sessions.push(result.session),
            None => self.store.session_entry(&sender_key_base64).lock().await.push(result.session),
        }

        Ok(result.plaintext)
    }
}

fn parse_payload(
    our: &StaticAccountData,
    event: &ToDeviceEncryptedEvent,
    sender_key: Curve25519PublicKey,
    plaintext: &str,
) -> OlmResult<DecryptedOlmEvent> {
    let value: Value = serde_json::from_str(plaintext)?;
    let payload: OlmPayload = serde_json::from_value(value.clone())?;

    let recipient = payload.recipient.ok_or(EventError::MissingProperty("recipient"))?;

    if recipient != our.user_id().as_str() {
        return Err(EventError::BadRecipient(recipient, our.user_id.clone()).into());
    }

    let recipient_key = payload
        .recipient_keys
        .and_then(|mut keys| keys.remove("ed25519"))
        .ok_or(EventError::MissingProperty("recipient_keys"))?;

    if recipient_key != our.identity_keys.ed25519.to_base64() {
        return Err(
            EventError::BadRecipientKey(recipient_key, Box::new(our.identity_keys.ed25519)).into()
        );
    }

    let sender = payload.sender.ok_or(EventError::MissingProperty("sender"))?;

    if sender != event.sender.as_str() {
        return Err(EventError::ForwardedMessage(sender, event.sender.clone()).into());
    }

    if let Some(room_id) = &event.room_id {
        if payload.room_id.as_deref() != Some(room_id.as_str()) {
            return Err(EventError::BadRoom(Some(room_id.clone()), payload.room_id).into());
        }
    }

    let keys = payload.keys.ok_or(EventError::MissingProperty("keys"))?;
    let claimed_ed25519_key = keys
        .get("ed25519")
        .map(|key| Ed25519PublicKey::from_base64(key))
        .transpose()
        .map_err(|e| EventError::BadEventFormat(e.to_string()))?;

    let event_type = payload.event_type.ok_or(EventError::MissingProperty("type"))?;

    Ok(DecryptedOlmEvent {
        sender: event.sender.clone(),
        sender_device: payload.sender_device,
        sender_curve25519_key: sender_key,
        claimed_ed25519_key,
        event_type,
        content: payload.content,
        room_id: payload.room_id,
        payload: value,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        sync::{Arc, Mutex},
    };

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use ruma::{device_id, room_id, user_id, DeviceId, OwnedDeviceId, OwnedUserId, UserId};
    use serde_json::json;
    use similar_asserts::assert_eq;
    use vodozemac::Curve25519PublicKey;

    use super::{EncryptionSettings, OlmCodec};
    use crate::{
        error::{EventError, OlmError},
        identities::{DeviceData, KeysQueryError, KeysQueryService, LocalTrust},
        olm::Account,
        store::DeviceSessionStore,
        types::ToDeviceEncryptedEvent,
    };

    #[derive(Debug, Default)]
    struct TestKeys {
        devices: Mutex<BTreeMap<OwnedUserId, Vec<DeviceData>>>,
        one_time_keys: Mutex<HashMap<OwnedDeviceId, Vec<Curve25519PublicKey>>>,
        failing: BTreeSet<OwnedUserId>,
    }

    impl TestKeys {
        async fn add_account(&self, store: &DeviceSessionStore) -> DeviceData {
            let mut account = store.account().await.unwrap();
            let device = DeviceData::new(
                account.user_id(),
                account.device_id(),
                account.identity_keys.curve25519,
                account.identity_keys.ed25519,
            );

            let keys = account.one_time_keys().into_values().collect();
            account.mark_keys_as_published();

            self.add_device(device.clone());
            self.one_time_keys.lock().unwrap().insert(device.device_id.clone(), keys);

            device
        }

        fn add_device(&self, device: DeviceData) {
            self.devices.lock().unwrap().entry(device.user_id.clone()).or_default().push(device);
        }
    }

    #[async_trait]
    impl KeysQueryService for TestKeys {
        async fn query_keys(&self, user_id: &UserId) -> Result<Vec<DeviceData>, KeysQueryError> {
            if self.failing.contains(user_id) {
                return Err(KeysQueryError::Download(user_id.to_owned(), "timeout".to_owned()));
            }

            Ok(self.devices.lock().unwrap().get(user_id).cloned().unwrap_or_default())
        }

        async fn claim_one_time_key(
            &self,
            device: &DeviceData,
        ) -> Result<Option<Curve25519PublicKey>, KeysQueryError> {
            Ok(self
                .one_time_keys
                .lock()
                .unwrap()
                .get_mut(&device.device_id)
                .and_then(|keys| keys.pop()))
        }
    }

    fn store_for(user_id: &UserId, device_id: &DeviceId) -> DeviceSessionStore {
        DeviceSessionStore::with_account(Account::with_device_id(user_id, device_id))
    }

    async fn codec_pair(keys: TestKeys) -> (OlmCodec, OlmCodec, Arc<TestKeys>) {
        let alice = store_for(user_id!("@alice:localhost"), device_id!("ALICE"));
        let bob = store_for(user_id!("@bob:localhost"), device_id!("BOB"));

        keys.add_account(&alice).await;
        keys.add_account(&bob).await;

        let keys = Arc::new(keys);

        (OlmCodec::new(alice, keys.clone()), OlmCodec::new(bob, keys.clone()), keys)
    }

    fn alice() -> OwnedUserId {
        user_id!("@alice:localhost").to_owned()
    }

    fn bob() -> OwnedUserId {
        user_id!("@bob:localhost").to_owned()
    }

    #[tokio::test]
    async fn olm_roundtrip() -> anyhow::Result<()> {
        let (alice, bob, _) = codec_pair(TestKeys::default()).await;
        let room_id = room_id!("!test:localhost");
        let content = json!({ "body": "It's a secret to everybody" });

        let encrypted = alice.encrypt(Some(room_id), "m.dummy", &content, &[bob()]).await?;
        assert_eq!(encrypted.ciphertext.len(), 1);

        let event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;
        let decrypted = bob.decrypt(&event).await?;

        assert_eq!(decrypted.content, content);
        assert_eq!(decrypted.event_type.as_str(), "m.dummy");
        assert_eq!(decrypted.room_id.as_deref(), Some(room_id.as_str()));
        assert_eq!(decrypted.sender_device.as_deref(), Some(device_id!("ALICE")));
        assert_eq!(decrypted.sender_curve25519_key, encrypted.sender_key);
        assert_eq!(bob.store().session_count().await, 1);

        // Bob answers with the session that Alice's pre-key message created.
        let reply = json!({ "body": "Same to you" });
        let encrypted = bob.encrypt(None, "m.dummy", &reply, &[alice()]).await?;
        let event = ToDeviceEncryptedEvent::new(bob(), &encrypted)?;

        assert_eq!(alice.decrypt(&event).await?.content, reply);
        assert_eq!(alice.store().session_count().await, 1);
        assert_eq!(bob.store().session_count().await, 1);

        Ok(())
    }

    #[tokio::test]
    async fn normal_messages_never_create_sessions() -> anyhow::Result<()> {
        let (alice, bob, _) = codec_pair(TestKeys::default()).await;

        let content = json!({});
        let encrypted = alice.encrypt(None, "m.dummy", &content, &[bob()]).await?;
        bob.decrypt(&ToDeviceEncryptedEvent::new(alice(), &encrypted)?).await?;

        let encrypted = bob.encrypt(None, "m.dummy", &content, &[alice()]).await?;
        alice.decrypt(&ToDeviceEncryptedEvent::new(bob(), &encrypted)?).await?;

        // Alice received a message on the session, her next one isn't a
        // pre-key message anymore.
        let encrypted = alice.encrypt(None, "m.dummy", &content, &[bob()]).await?;
        assert!(encrypted.ciphertext.values().all(|c| c.message_type == 1));

        let pickle = bob.store().account().await?.pickle();
        let forgetful_bob = DeviceSessionStore::with_account(Account::from_pickle(pickle));
        let forgetful_bob = OlmCodec::new(forgetful_bob, bob.keys.clone());

        let event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;
        assert_matches!(forgetful_bob.decrypt(&event).await, Err(OlmError::UnableToDecrypt(..)));
        assert_eq!(forgetful_bob.store().session_count().await, 0);
        assert!(forgetful_bob.store().get_sessions(&encrypted.sender_key.to_base64()).is_none());

        Ok(())
    }

    #[tokio::test]
    async fn replayed_pre_key_messages_are_rejected() -> anyhow::Result<()> {
        let (alice, bob, _) = codec_pair(TestKeys::default()).await;

        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &[bob()]).await?;
        assert!(encrypted.ciphertext.values().all(|c| c.message_type == 0));

        let event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;
        bob.decrypt(&event).await?;

        // The session the message created can't decrypt it a second time, and
        // no other session may be created for it.
        assert_matches!(bob.decrypt(&event).await, Err(OlmError::UnableToDecrypt(..)));
        assert_eq!(bob.store().session_count().await, 1);

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_encryption_shares_one_session() -> anyhow::Result<()> {
        let (alice, _, keys) = codec_pair(TestKeys::default()).await;
        let one_time_key_count = || keys.one_time_keys.lock().unwrap()[device_id!("BOB")].len();
        let before = one_time_key_count();

        let content = json!({});
        let users = [bob()];
        let (first, second) = tokio::join!(
            alice.encrypt(None, "m.dummy", &content, &users),
            alice.encrypt(None, "m.dummy", &content, &users),
        );

        assert_eq!(first?.ciphertext.len(), 1);
        assert_eq!(second?.ciphertext.len(), 1);
        assert_eq!(alice.store().session_count().await, 1);
        assert_eq!(one_time_key_count(), before - 1);

        Ok(())
    }

    #[tokio::test]
    async fn encryption_skips_devices() -> anyhow::Result<()> {
        let keys = TestKeys {
            failing: BTreeSet::from([user_id!("@dave:localhost").to_owned()]),
            ..Default::default()
        };
        let (alice, _, keys) = codec_pair(keys).await;

        let carol = store_for(user_id!("@carol:localhost"), device_id!("CAROL"));
        let mut carol_device = keys.add_account(&carol).await;
        carol_device.local_trust = LocalTrust::BlackListed;
        keys.devices.lock().unwrap().insert(carol_device.user_id.clone(), vec![carol_device]);

        let users = [
            alice(),
            bob(),
            user_id!("@carol:localhost").to_owned(),
            user_id!("@dave:localhost").to_owned(),
        ];
        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &users).await?;

        let bob_key = keys.devices.lock().unwrap()[&bob()][0].curve25519_key.to_base64();
        assert_eq!(encrypted.ciphertext.keys().collect::<Vec<_>>(), vec![&bob_key]);
        assert_eq!(alice.store().session_count().await, 1);

        // A device without one-time keys is skipped as well.
        let erin = store_for(user_id!("@erin:localhost"), device_id!("ERIN"));
        let erin_device = keys.add_account(&erin).await;
        keys.one_time_keys.lock().unwrap().remove(&erin_device.device_id);

        let encrypted =
            alice.encrypt(None, "m.dummy", &json!({}), &[erin_device.user_id.clone()]).await?;
        assert!(encrypted.ciphertext.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn only_trusted_devices() -> anyhow::Result<()> {
        let (alice, _, keys) = codec_pair(TestKeys::default()).await;
        let alice = OlmCodec::with_settings(
            alice.store().clone(),
            keys.clone(),
            EncryptionSettings { only_allow_trusted_devices: true },
        );

        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &[bob()]).await?;
        assert!(encrypted.ciphertext.is_empty());

        keys.devices.lock().unwrap().get_mut(&bob()).unwrap()[0].local_trust =
            LocalTrust::Verified;

        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &[bob()]).await?;
        assert_eq!(encrypted.ciphertext.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn wrong_recipient_key() -> anyhow::Result<()> {
        let (alice, bob, keys) = codec_pair(TestKeys::default()).await;

        // Alice believes that Bob's device has a different signing key.
        let mallory = Account::with_device_id(user_id!("@mallory:localhost"), device_id!("EVE"));
        keys.devices.lock().unwrap().get_mut(&bob()).unwrap()[0].ed25519_key =
            mallory.identity_keys.ed25519;

        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &[bob()]).await?;
        let event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;

        assert_matches!(
            bob.decrypt(&event).await,
            Err(OlmError::EventError(EventError::BadRecipientKey(..)))
        );

        Ok(())
    }

    #[tokio::test]
    async fn relayed_messages_are_rejected() -> anyhow::Result<()> {
        let (alice, bob, _) = codec_pair(TestKeys::default()).await;

        let encrypted = alice.encrypt(None, "m.dummy", &json!({}), &[bob()]).await?;
        let event =
            ToDeviceEncryptedEvent::new(user_id!("@mallory:localhost").to_owned(), &encrypted)?;

        assert_matches!(bob.decrypt(&event).await, Err(OlmError::EventError(error)));
        assert_matches!(error, EventError::ForwardedMessage(sender, _));
        assert_eq!(sender.as_str(), "@alice:localhost");

        Ok(())
    }

    #[tokio::test]
    async fn room_mismatch() -> anyhow::Result<()> {
        let (alice, bob, _) = codec_pair(TestKeys::default()).await;

        let encrypted = alice
            .encrypt(Some(room_id!("!a:localhost")), "m.dummy", &json!({}), &[bob()])
            .await?;
        let mut event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;
        event.room_id = Some(room_id!("!b:localhost").to_owned());

        assert_matches!(
            bob.decrypt(&event).await,
            Err(OlmError::EventError(EventError::BadRoom(..)))
        );

        Ok(())
    }

    #[tokio::test]
    async fn not_included_in_recipients() -> anyhow::Result<()> {
        let (alice, bob, keys) = codec_pair(TestKeys::default()).await;

        let carol = store_for(user_id!("@carol:localhost"), device_id!("CAROL"));
        let carol_device = keys.add_account(&carol).await;

        let encrypted =
            alice.encrypt(None, "m.dummy", &json!({}), &[carol_device.user_id.clone()]).await?;
        let event = ToDeviceEncryptedEvent::new(alice(), &encrypted)?;

        assert_matches!(
            bob.decrypt(&event).await,
            Err(OlmError::EventError(EventError::NotIncludedInRecipients))
        );

        let event = ToDeviceEncryptedEvent {
            sender: alice(),
            room_id: None,
            content: json!({ "algorithm": "m.olm.v1.curve25519-aes-sha2", "ciphertext": {} }),
        };
        assert_matches!(
            bob.decrypt(&event).await,
            Err(OlmError::EventError(EventError::MissingSenderKey))
        );

        Ok(())
    }
}
