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

use ruma::OwnedUserId;
use tracing::{debug, instrument};

use super::{
    legacy::{LegacyAccount, LegacyCryptoStore, LegacyInboundGroupSession, LegacyOlmSession},
    MigrationError,
};
use crate::{olm::Account, store::PendingToDeviceEvent};

/// Everything a migration reads out of the legacy store.
///
/// The snapshot is extracted once and never modified, the replay turns it
/// into changes for the new store.
#[derive(Debug)]
pub struct MigrationSnapshot {
    /// The account metadata.
    pub account: LegacyAccount,
    /// The Olm session records.
    pub olm_sessions: Vec<LegacyOlmSession>,
    /// The inbound group session records.
    pub inbound_group_sessions: Vec<LegacyInboundGroupSession>,
    /// The users whose device lists are tracked.
    pub tracked_users: Vec<OwnedUserId>,
    /// The to-device events that weren't processed yet.
    pub pending_to_device: Vec<PendingToDeviceEvent>,
}

impl MigrationSnapshot {
    /// Read all the records of the legacy store.
    ///
    /// Fails with [`MigrationError::EmptyStore`] if the store was never
    /// initialized.
    #[instrument(skip_all)]
    pub async fn extract(store: &dyn LegacyCryptoStore) -> Result<Self, MigrationError> {
        let account = store.load_account().await?.ok_or(MigrationError::EmptyStore)?;

        let snapshot = Self {
            account,
            olm_sessions: store.load_olm_sessions().await?,
            inbound_group_sessions: store.load_inbound_group_sessions().await?,
            tracked_users: store.load_tracked_users().await?,
            pending_to_device: store.load_pending_to_device().await?,
        };

        debug!(
            olm_sessions = snapshot.olm_sessions.len(),
            inbound_group_sessions = snapshot.inbound_group_sessions.len(),
            tracked_users = snapshot.tracked_users.len(),
            pending_to_device = snapshot.pending_to_device.len(),
            "Extracted the legacy store"
        );

        Ok(snapshot)
    }

    /// Check that the snapshot contains a usable identity and restore the
    /// account from it.
    ///
    /// Only the identity is required, every other category may be empty.
    pub fn validate(&self, pickle_key: &[u8; 32]) -> Result<Account, MigrationError> {
        let user_id = self.account.user_id.as_deref().ok_or(MigrationError::MissingIdentity)?;
        let device_id =
            self.account.device_id.as_deref().ok_or(MigrationError::MissingIdentity)?;
        let pickle = self.account.pickle.as_deref().ok_or(MigrationError::MissingIdentity)?;

        Ok(Account::from_encrypted_pickle(
            user_id,
            device_id,
            pickle,
            pickle_key,
            self.account.shared,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, user_id};

    use super::MigrationSnapshot;
    use crate::{
        migration::{
            legacy::{LegacyAccount, MemoryLegacyStore},
            MigrationError,
        },
        olm::Account,
    };

    const PICKLE_KEY: [u8; 32] = [7u8; 32];

    #[tokio::test]
    async fn an_uninitialized_store_is_empty() {
        let store = MemoryLegacyStore::new(PICKLE_KEY);

        assert_matches!(MigrationSnapshot::extract(&store).await, Err(MigrationError::EmptyStore));
    }

    #[tokio::test]
    async fn the_identity_is_required() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let store = MemoryLegacyStore::new(PICKLE_KEY);

        store.set_account(LegacyAccount {
            user_id: Some(account.user_id().to_owned()),
            pickle: Some(account.encrypted_pickle(&PICKLE_KEY)),
            ..Default::default()
        });

        let snapshot = MigrationSnapshot::extract(&store).await.unwrap();
        assert_matches!(snapshot.validate(&PICKLE_KEY), Err(MigrationError::MissingIdentity));

        store.set_account(LegacyAccount {
            user_id: Some(account.user_id().to_owned()),
            device_id: Some(account.device_id().to_owned()),
            pickle: Some(account.encrypted_pickle(&PICKLE_KEY)),
            ..Default::default()
        });

        let snapshot = MigrationSnapshot::extract(&store).await.unwrap();
        assert_matches!(snapshot.validate(&[0u8; 32]), Err(MigrationError::Unpickling(_)));

        let restored = snapshot.validate(&PICKLE_KEY).unwrap();
        assert_eq!(restored.identity_keys().curve25519, account.identity_keys().curve25519);
        assert!(snapshot.olm_sessions.is_empty());
    }
}
