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

//! The devices of other users, as far as the session engine cares about them,
//! and the service that downloads them.

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    #[default]
    Unset = 3,
}

impl From<i64> for LocalTrust {
    fn from(state: i64) -> Self {
        match state {
            0 => LocalTrust::Verified,
            1 => LocalTrust::BlackListed,
            2 => LocalTrust::Ignored,
            _ => LocalTrust::Unset,
        }
    }
}

/// A device of a Matrix user, with the identity keys it published and our
/// local trust state for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    /// The user that owns the device.
    pub user_id: OwnedUserId,
    /// The unique ID of the device.
    pub device_id: OwnedDeviceId,
    /// The long-term Curve25519 identity key of the device.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub curve25519_key: Curve25519PublicKey,
    /// The long-term Ed25519 signing key of the device.
    #[serde(deserialize_with = "deserialize_ed25519_key", serialize_with = "serialize_ed25519_key")]
    pub ed25519_key: Ed25519PublicKey,
    /// Our local trust state of the device.
    #[serde(default)]
    pub local_trust: LocalTrust,
}

impl DeviceData {
    /// Create a new device with an unset trust state.
    pub fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        curve25519_key: Curve25519PublicKey,
        ed25519_key: Ed25519PublicKey,
    ) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            curve25519_key,
            ed25519_key,
            local_trust: LocalTrust::Unset,
        }
    }

    /// The user ID of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any encrypted messages.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }
}

/// Error type for the [`KeysQueryService`].
#[derive(Debug, Error)]
pub enum KeysQueryError {
    /// The device keys of a user couldn't be downloaded.
    #[error("the device keys of {0} couldn't be downloaded: {1}")]
    Download(OwnedUserId, String),

    /// A one-time key of a device couldn't be claimed.
    #[error("a one-time key of {0} {1} couldn't be claimed: {2}")]
    Claim(OwnedUserId, OwnedDeviceId, String),
}

/// The service that resolves users to their devices and hands out one-time
/// keys, usually backed by the `/keys/query` and `/keys/claim` endpoints.
///
/// Calls may be slow, the codec calls them before it encrypts.
#[async_trait]
pub trait KeysQueryService: std::fmt::Debug + Send + Sync {
    /// Get all the devices of the given user.
    async fn query_keys(&self, user_id: &UserId) -> Result<Vec<DeviceData>, KeysQueryError>;

    /// Claim a one-time key of the given device.
    ///
    /// Returns `None` if the device ran out of one-time keys.
    async fn claim_one_time_key(
        &self,
        device: &DeviceData,
    ) -> Result<Option<Curve25519PublicKey>, KeysQueryError>;
}
