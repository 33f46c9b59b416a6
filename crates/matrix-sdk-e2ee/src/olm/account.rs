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

use std::{collections::HashMap, fmt, ops::Deref, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, field::debug, instrument, trace, Span};
use vodozemac::{
    megolm::{GroupSession, SessionConfig as MegolmSessionConfig},
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, KeyId, PickleError,
};

use super::{InboundGroupSession, Session};
use crate::{error::SessionCreationError, identities::DeviceData};

/// The result of a successful inbound session creation.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that created the session.
    pub plaintext: String,
}

/// Account data that's static for the lifetime of a Client.
///
/// This data never changes once it's set, so it can be freely passed and cloned
/// everywhere.
#[derive(Clone)]
#[cfg_attr(not(tarpaulin_include), derive(Debug))]
pub struct StaticAccountData {
    /// The user_id this account belongs to.
    pub user_id: OwnedUserId,
    /// The device_id of this entry.
    pub device_id: OwnedDeviceId,
    /// The associated identity keys.
    pub identity_keys: Arc<IdentityKeys>,
}

impl StaticAccountData {
    /// Create a group session pair.
    ///
    /// The outbound session is used to encrypt room messages while the inbound
    /// one is used to decrypt messages encrypted by the outbound one.
    pub fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        shared_history: bool,
    ) -> (GroupSession, InboundGroupSession) {
        trace!(?room_id, "Creating a new room key");

        let outbound = GroupSession::new(MegolmSessionConfig::version_1());

        let inbound = InboundGroupSession::new(
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
            room_id,
            &outbound.session_key(),
            shared_history,
        );

        (outbound, inbound)
    }

    /// The user ID of the account owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device ID of the account owner.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.identity_keys
    }
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    pub(crate) static_data: StaticAccountData,
    /// `vodozemac` account.
    inner: Box<InnerAccount>,
    /// Has the account uploaded its device keys to the server.
    shared: bool,
}

impl Deref for Account {
    type Target = StaticAccountData;

    fn deref(&self) -> &Self::Target {
        &self.static_data
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an account.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
    /// Was the account shared.
    pub shared: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    fn new_helper(
        inner: InnerAccount,
        user_id: &UserId,
        device_id: &DeviceId,
        shared: bool,
    ) -> Self {
        let identity_keys = inner.identity_keys();

        Self {
            static_data: StaticAccountData {
                user_id: user_id.into(),
                device_id: device_id.into(),
                identity_keys: Arc::new(identity_keys),
            },
            inner: Box::new(inner),
            shared,
        }
    }

    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn with_device_id(user_id: &UserId, device_id: &DeviceId) -> Self {
        let mut account = InnerAccount::new();
        account.generate_one_time_keys(account.max_number_of_one_time_keys());

        Self::new_helper(account, user_id, device_id, false)
    }

    /// Get a reference to the account's static data.
    pub fn static_data(&self) -> &StaticAccountData {
        &self.static_data
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Get the one-time keys of the account that haven't been published yet.
    pub fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    /// Generate count number of one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    /// Get the maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Get a serializable version of the `Account` so it can be persisted.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            pickle: self.inner.pickle(),
            shared: self.shared(),
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let account: InnerAccount = pickle.pickle.into();

        Self::new_helper(account, &pickle.user_id, &pickle.device_id, pickle.shared)
    }

    /// Restore an account from a pickle that was encrypted with a pickle key.
    pub fn from_encrypted_pickle(
        user_id: &UserId,
        device_id: &DeviceId,
        pickle: &str,
        pickle_key: &[u8; 32],
        shared: bool,
    ) -> Result<Self, PickleError> {
        let pickle = AccountPickle::from_encrypted(pickle, pickle_key)?;

        Ok(Self::new_helper(pickle.into(), user_id, device_id, shared))
    }

    /// Encrypt the pickle of this account with the given pickle key.
    pub fn encrypted_pickle(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Create a new session with another account given a one-time key and a
    /// device.
    ///
    /// # Arguments
    ///
    /// * `device` - The other account's device.
    ///
    /// * `one_time_key` - A one-time key that we claimed for the device.
    #[instrument(skip_all, fields(user_id = ?device.user_id(), device_id = ?device.device_id()))]
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let identity_key = device.curve25519_key;
        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        trace!(%session_id, "Created a new outbound Olm session");

        Session {
            our_account: self.static_data.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us by the other
    ///   account.
    #[instrument(skip_all, fields(session_id))]
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        Span::current().record("session_id", debug(message.session_id()));
        trace!("Creating a new Olm session from a pre-key message");

        let result = self.inner.create_inbound_session(their_identity_key, message)?;
        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        debug!(session=?result.session, "Decrypted an Olm message from a new Olm session");

        let session = Session {
            our_account: self.static_data.clone(),
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok(InboundCreationResult { session, plaintext })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};
    use vodozemac::olm::OlmMessage;

    use super::{Account, PickledAccount};
    use crate::{error::SessionCreationError, identities::DeviceData};

    #[test]
    fn one_time_keys_are_published_once() {
        let mut account =
            Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));

        assert!(!account.one_time_keys().is_empty());
        assert!(account.one_time_keys().len() <= account.max_one_time_keys());

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());

        account.generate_one_time_keys(1);
        assert_eq!(account.one_time_keys().len(), 1);
    }

    #[test]
    fn pickling_keeps_the_identity() {
        let mut account =
            Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        account.mark_as_shared();

        let pickle = serde_json::to_string(&account.pickle()).unwrap();
        let pickle: PickledAccount = serde_json::from_str(&pickle).unwrap();
        let restored = Account::from_pickle(pickle);

        assert_eq!(account.identity_keys(), restored.identity_keys());
        assert_eq!(account.device_id(), restored.device_id());
        assert!(restored.shared());
    }

    #[test]
    fn encrypted_pickles_need_the_right_key() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let pickle = account.encrypted_pickle(&[3u8; 32]);

        let restored = Account::from_encrypted_pickle(
            account.user_id(),
            account.device_id(),
            &pickle,
            &[3u8; 32],
            false,
        )
        .unwrap();
        assert_eq!(account.identity_keys(), restored.identity_keys());

        Account::from_encrypted_pickle(
            account.user_id(),
            account.device_id(),
            &pickle,
            &[4u8; 32],
            false,
        )
        .expect_err("A different pickle key shouldn't unpickle the account");
    }

    #[tokio::test]
    async fn pre_key_messages_for_other_accounts_are_rejected() {
        let alice = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let bob = Account::with_device_id(user_id!("@bob:localhost"), device_id!("BOB"));
        let mut carol = Account::with_device_id(user_id!("@carol:localhost"), device_id!("CAROL"));

        let device = DeviceData::new(
            bob.user_id(),
            bob.device_id(),
            bob.identity_keys.curve25519,
            bob.identity_keys.ed25519,
        );
        let one_time_key = *bob.one_time_keys().values().next().unwrap();
        let mut session = alice.create_outbound_session(&device, one_time_key);

        let OlmMessage::PreKey(message) = session.encrypt_helper("Hello").await else {
            panic!("The first message of a session should be a pre-key message");
        };

        assert_matches!(
            carol.create_inbound_session(alice.identity_keys.curve25519, &message),
            Err(SessionCreationError::InboundCreation(_))
        );
    }
}
