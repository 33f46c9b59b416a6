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

use std::collections::BTreeMap;

use ruma::{EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{
    base64_decode, base64_encode, olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey,
};

use super::{deserialize_curve_key, serialize_curve_key};
use crate::error::EventError;

/// The type and body of a single Olm ciphertext, as found in the `ciphertext`
/// map of an `m.olm.v1.curve25519-aes-sha2` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextInfo {
    /// The Olm message type, `0` for pre-key messages and `1` for normal
    /// messages.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// The base64 encoded ciphertext.
    pub body: String,
}

impl CiphertextInfo {
    /// Convert the ciphertext back into an [`OlmMessage`].
    pub fn to_olm_message(&self) -> Result<OlmMessage, EventError> {
        let body = base64_decode(&self.body).map_err(|e| EventError::BadEventFormat(e.to_string()))?;
        OlmMessage::from_parts(self.message_type, &body)
            .map_err(|e| EventError::BadEventFormat(e.to_string()))
    }
}

impl From<OlmMessage> for CiphertextInfo {
    fn from(message: OlmMessage) -> Self {
        let (message_type, body) = message.to_parts();
        Self { message_type, body: base64_encode(body) }
    }
}

/// The content of an `m.room.encrypted` to-device event using the
/// `m.olm.v1.curve25519-aes-sha2` algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1EncryptedContent {
    /// The algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The Curve25519 identity key of the sending device.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// Map from the recipient Curve25519 identity key to the ciphertext
    /// information for that recipient.
    pub ciphertext: BTreeMap<String, CiphertextInfo>,
}

impl OlmV1EncryptedContent {
    /// Create an empty content for the given sender key.
    pub fn new(sender_key: Curve25519PublicKey) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key,
            ciphertext: BTreeMap::new(),
        }
    }

    /// Parse the content of an encrypted to-device event.
    ///
    /// A missing ciphertext or sender key is reported with a dedicated error,
    /// everything else that doesn't parse is a [`EventError::BadEventFormat`].
    pub fn from_json(content: &Value) -> Result<Self, EventError> {
        let object = content.as_object().ok_or_else(|| {
            EventError::BadEventFormat("the event content isn't a JSON object".to_owned())
        })?;

        match object.get("algorithm").and_then(Value::as_str) {
            Some(algorithm)
                if algorithm == EventEncryptionAlgorithm::OlmV1Curve25519AesSha2.as_str() => {}
            Some(_) => return Err(EventError::UnsupportedAlgorithm),
            None => {
                return Err(EventError::BadEventFormat("missing the algorithm field".to_owned()))
            }
        }

        if object.get("ciphertext").is_none_or(Value::is_null) {
            return Err(EventError::MissingCiphertext);
        }

        if object.get("sender_key").is_none_or(Value::is_null) {
            return Err(EventError::MissingSenderKey);
        }

        serde_json::from_value(content.clone())
            .map_err(|e| EventError::BadEventFormat(e.to_string()))
    }
}

/// An encrypted to-device event, as received from the homeserver.
///
/// The content is kept as raw JSON, it's only parsed when the event gets
/// decrypted so malformed content can be reported precisely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEncryptedEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The room the event claims to belong to, to-device events normally
    /// don't carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// The encrypted content.
    pub content: Value,
}

impl ToDeviceEncryptedEvent {
    /// Create a new encrypted to-device event from the given sender and
    /// content.
    pub fn new(
        sender: OwnedUserId,
        content: &OlmV1EncryptedContent,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self { sender, room_id: None, content: serde_json::to_value(content)? })
    }
}

/// The payload of a decrypted Olm message.
///
/// The payload is bound to a specific sender and recipient, the fields are
/// optional here so that a missing field can be told apart from a mismatched
/// one.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct OlmPayload {
    pub sender: Option<String>,
    pub sender_device: Option<OwnedDeviceId>,
    pub recipient: Option<String>,
    pub recipient_keys: Option<BTreeMap<String, String>>,
    pub keys: Option<BTreeMap<String, String>>,
    pub room_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub content: Value,
}

/// A successfully decrypted and validated Olm to-device event.
///
/// The event carries the keys the sender claims to own, it's up to the
/// caller to decide if those are trusted.
#[derive(Clone, Debug)]
pub struct DecryptedOlmEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The device ID of the sending device, if the payload contained one.
    pub sender_device: Option<OwnedDeviceId>,
    /// The Curve25519 key of the Olm session the event was decrypted with.
    pub sender_curve25519_key: Curve25519PublicKey,
    /// The Ed25519 key the sender claims to own.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,
    /// The type of the decrypted event.
    pub event_type: String,
    /// The content of the decrypted event.
    pub content: Value,
    /// The room ID of the decrypted payload, if any.
    pub room_id: Option<String>,
    /// The full decrypted payload.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::OlmV1EncryptedContent;
    use crate::error::EventError;

    const SENDER_KEY: &str = "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM";

    #[test]
    fn missing_fields_are_named() {
        let content = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": SENDER_KEY,
        });
        assert_matches!(
            OlmV1EncryptedContent::from_json(&content),
            Err(EventError::MissingCiphertext)
        );

        let content = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "ciphertext": {},
        });
        assert_matches!(
            OlmV1EncryptedContent::from_json(&content),
            Err(EventError::MissingSenderKey)
        );

        let content = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": {},
            "sender_key": SENDER_KEY,
        });
        assert_matches!(
            OlmV1EncryptedContent::from_json(&content),
            Err(EventError::UnsupportedAlgorithm)
        );

        assert_matches!(
            OlmV1EncryptedContent::from_json(&json!([])),
            Err(EventError::BadEventFormat(_))
        );
    }

    #[test]
    fn content_parsing() {
        let content = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": SENDER_KEY,
            "ciphertext": {
                SENDER_KEY: { "type": 0, "body": "Awogjvpx458CGhuo77HX" }
            },
        });

        let parsed = OlmV1EncryptedContent::from_json(&content).unwrap();
        assert_eq!(parsed.sender_key.to_base64(), SENDER_KEY);
        assert_eq!(parsed.ciphertext[SENDER_KEY].message_type, 0);
        assert_eq!(serde_json::to_value(&parsed).unwrap(), content);
    }
}
