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

//! The read view over the legacy crypto store that a migration consumes.

use std::fmt;

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    locks::RwLock as StdRwLock,
    store::{CrossSigningKeyExport, PendingToDeviceEvent},
    types::SigningKeys,
};

/// The error type of a legacy store.
#[derive(Debug, Error)]
pub enum LegacyStoreError {
    /// The legacy store was already migrated, it's no longer the source of
    /// truth.
    #[error("the legacy store was already migrated")]
    AlreadyMigrated,

    /// An error of the storage backend of the legacy store.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// The account metadata of the legacy store.
///
/// Every field is optional, a store that was never fully initialized may
/// lack any of them.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LegacyAccount {
    /// The user ID of the account owner.
    #[zeroize(skip)]
    pub user_id: Option<OwnedUserId>,
    /// The device ID of the account owner.
    #[zeroize(skip)]
    pub device_id: Option<OwnedDeviceId>,
    /// The Olm account, pickled and encrypted with the pickle key.
    pub pickle: Option<String>,
    /// Were the device keys of the account uploaded to the server.
    pub shared: bool,
    /// The private cross-signing keys.
    pub cross_signing_keys: CrossSigningKeyExport,
    /// The version of the active room key backup.
    pub backup_version: Option<String>,
    /// The recovery key of the active room key backup, base58 encoded.
    pub recovery_key: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for LegacyAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("shared", &self.shared)
            .field("cross_signing_keys", &self.cross_signing_keys)
            .field("backup_version", &self.backup_version)
            .finish_non_exhaustive()
    }
}

/// An Olm session record of the legacy store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LegacyOlmSession {
    /// The Curve25519 key of the device we share the session with, base64
    /// encoded.
    pub device_key: String,
    /// The Olm session, pickled and encrypted with the pickle key.
    pub pickle: String,
    /// When the last message was received over the session, in milliseconds
    /// since the Unix epoch.
    pub last_received_message_ts: u64,
}

/// An inbound group session record of the legacy store.
///
/// Older versions of the legacy store didn't always write every field,
/// records without a sender key, room ID or pickle can't be migrated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LegacyInboundGroupSession {
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Option<String>,
    /// The room the session is used in.
    pub room_id: Option<OwnedRoomId>,
    /// The group session, pickled and encrypted with the pickle key.
    pub pickle: Option<String>,
    /// The signing keys the creator of the session claims to own.
    #[serde(default)]
    pub keys_claimed: SigningKeys,
    /// The chain of devices that forwarded the session to us.
    #[serde(default)]
    pub forwarding_chain: Vec<String>,
    /// Was the session received directly from its creator.
    pub trusted: bool,
    /// Was the session backed up to the server.
    pub backed_up: bool,
}

/// A read view over a legacy crypto store.
///
/// Besides the read accessors, a legacy store knows if it's still the source
/// of truth for its account, and lets the migration drop its Olm sessions.
#[async_trait]
pub trait LegacyCryptoStore: fmt::Debug + Send + Sync {
    /// The key the pickles of the store are encrypted with.
    fn pickle_key(&self) -> &[u8; 32];

    /// Load the account metadata, `None` if the store was never initialized.
    async fn load_account(&self) -> Result<Option<LegacyAccount>, LegacyStoreError>;

    /// Load all the Olm session records.
    async fn load_olm_sessions(&self) -> Result<Vec<LegacyOlmSession>, LegacyStoreError>;

    /// Load all the inbound group session records.
    async fn load_inbound_group_sessions(
        &self,
    ) -> Result<Vec<LegacyInboundGroupSession>, LegacyStoreError>;

    /// Load the users whose device lists we track.
    async fn load_tracked_users(&self) -> Result<Vec<OwnedUserId>, LegacyStoreError>;

    /// Load the to-device events that were received but not processed yet.
    async fn load_pending_to_device(&self)
        -> Result<Vec<PendingToDeviceEvent>, LegacyStoreError>;

    /// Has the store been migrated.
    ///
    /// A store that wasn't migrated is the source of truth for its account.
    async fn is_migrated(&self) -> Result<bool, LegacyStoreError>;

    /// Mark the store as migrated, giving up its authority.
    async fn mark_migrated(&self) -> Result<(), LegacyStoreError>;

    /// Delete all the Olm session records, returns the number of deleted
    /// records.
    async fn delete_olm_sessions(&self) -> Result<usize, LegacyStoreError>;
}

/// An in-memory [`LegacyCryptoStore`].
pub struct MemoryLegacyStore {
    pickle_key: Zeroizing<[u8; 32]>,
    account: StdRwLock<Option<LegacyAccount>>,
    olm_sessions: StdRwLock<Vec<LegacyOlmSession>>,
    inbound_group_sessions: StdRwLock<Vec<LegacyInboundGroupSession>>,
    tracked_users: StdRwLock<Vec<OwnedUserId>>,
    pending_to_device: StdRwLock<Vec<PendingToDeviceEvent>>,
    migrated: StdRwLock<bool>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for MemoryLegacyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLegacyStore")
            .field("account", &*self.account.read())
            .field("olm_sessions", &self.olm_sessions.read().len())
            .field("inbound_group_sessions", &self.inbound_group_sessions.read().len())
            .field("migrated", &*self.migrated.read())
            .finish_non_exhaustive()
    }
}

impl MemoryLegacyStore {
    /// Create a new empty store whose pickles are encrypted with the given
    /// key.
    pub fn new(pickle_key: [u8; 32]) -> Self {
        Self {
            pickle_key: Zeroizing::new(pickle_key),
            account: Default::default(),
            olm_sessions: Default::default(),
            inbound_group_sessions: Default::default(),
            tracked_users: Default::default(),
            pending_to_device: Default::default(),
            migrated: Default::default(),
        }
    }

    /// Store the account metadata.
    pub fn set_account(&self, account: LegacyAccount) {
        *self.account.write() = Some(account);
    }

    /// Add an Olm session record.
    pub fn add_olm_session(&self, session: LegacyOlmSession) {
        self.olm_sessions.write().push(session);
    }

    /// Add an inbound group session record.
    pub fn add_inbound_group_session(&self, session: LegacyInboundGroupSession) {
        self.inbound_group_sessions.write().push(session);
    }

    /// Start tracking the devices of the given user.
    pub fn add_tracked_user(&self, user_id: OwnedUserId) {
        self.tracked_users.write().push(user_id);
    }

    /// Add a to-device event to the inbox.
    pub fn add_pending_to_device(&self, event: PendingToDeviceEvent) {
        self.pending_to_device.write().push(event);
    }
}

#[async_trait]
impl LegacyCryptoStore for MemoryLegacyStore {
    fn pickle_key(&self) -> &[u8; 32] {
        &self.pickle_key
    }

    async fn load_account(&self) -> Result<Option<LegacyAccount>, LegacyStoreError> {
        Ok(self.account.read().clone())
    }

    async fn load_olm_sessions(&self) -> Result<Vec<LegacyOlmSession>, LegacyStoreError> {
        Ok(self.olm_sessions.read().clone())
    }

    async fn load_inbound_group_sessions(
        &self,
    ) -> Result<Vec<LegacyInboundGroupSession>, LegacyStoreError> {
        Ok(self.inbound_group_sessions.read().clone())
    }

    async fn load_tracked_users(&self) -> Result<Vec<OwnedUserId>, LegacyStoreError> {
        Ok(self.tracked_users.read().clone())
    }

    async fn load_pending_to_device(
        &self,
    ) -> Result<Vec<PendingToDeviceEvent>, LegacyStoreError> {
        Ok(self.pending_to_device.read().clone())
    }

    async fn is_migrated(&self) -> Result<bool, LegacyStoreError> {
        Ok(*self.migrated.read())
    }

    async fn mark_migrated(&self) -> Result<(), LegacyStoreError> {
        let mut migrated = self.migrated.write();

        if *migrated {
            Err(LegacyStoreError::AlreadyMigrated)
        } else {
            *migrated = true;
            Ok(())
        }
    }

    async fn delete_olm_sessions(&self) -> Result<usize, LegacyStoreError> {
        let mut sessions = self.olm_sessions.write();
        let count = sessions.len();
        sessions.clear();

        Ok(count)
    }
}
