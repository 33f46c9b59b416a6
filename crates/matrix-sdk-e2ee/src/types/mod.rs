// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Module containing the wire types this crate produces and consumes.
//!
//! This covers the Olm encrypted to-device content, the room key backup
//! structures, and some serde helpers for `vodozemac` keys which we always
//! encode as unpadded base64.

mod backup;
mod events;

use std::collections::BTreeMap;

pub use backup::*;
pub use events::*;
use ruma::DeviceKeyAlgorithm;
pub use ruma::EventEncryptionAlgorithm;
use serde::{Deserialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// A map from the algorithm of a signing key to the key itself, the keys are
/// encoded as base64.
pub type SigningKeys = BTreeMap<DeviceKeyAlgorithm, String>;

pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let key = key.to_base64();
    s.serialize_str(&key)
}

pub(crate) fn deserialize_optional_curve_key<'de, D>(
    de: D,
) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;
    key.map(|k| Curve25519PublicKey::from_base64(&k))
        .transpose()
        .map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_optional_curve_key<S>(
    key: &Option<Curve25519PublicKey>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match key {
        Some(key) => s.serialize_str(&key.to_base64()),
        None => s.serialize_none(),
    }
}

pub(crate) fn deserialize_ed25519_key<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_ed25519_key<S>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let key = key.to_base64();
    s.serialize_str(&key)
}
