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

use std::collections::BTreeMap;

use itertools::Itertools;
use ruma::{DeviceId, OwnedDeviceId, UserId};
use tracing::{trace, warn};
use vodozemac::Curve25519PublicKey;

use super::crypto::{hash, EstablishedKeys, SasCryptoError};
use crate::{
    identities::{DeviceData, MasterPubkey},
    types::{
        CancelCode, KeyAgreementProtocol, MacContent, MessageAuthenticationCode,
        VerificationContent,
    },
    verification::{event_enums::ValidMac, Emoji, FlowId},
};

/// The long-term keys both sides of a SAS flow know about.
#[derive(Clone, Debug)]
pub(crate) struct SasIds {
    pub own_device: DeviceData,
    /// Our own master key, only set if we trust it.
    pub own_master_key: Option<MasterPubkey>,
    pub other_device: DeviceData,
    /// All the devices of the other user we know about.
    pub other_devices: BTreeMap<OwnedDeviceId, DeviceData>,
    pub other_master_key: Option<MasterPubkey>,
}

/// Calculate the commitment for a accept event from the public key and the
/// start event.
///
/// # Arguments
///
/// * `public_key` - Our own ephemeral public key that is used for the
///   interactive verification.
///
/// * `canonical_start` - The canonical JSON form of the
///   `m.key.verification.start` event content that started the interactive
///   verification process.
pub(crate) fn calculate_commitment(
    public_key: Curve25519PublicKey,
    canonical_start: &str,
) -> String {
    hash(&format!("{}{canonical_start}", public_key.to_base64()))
}

const EMOJIS: [Emoji; 64] = [
    Emoji { symbol: "🐶", description: "Dog" },
    Emoji { symbol: "🐱", description: "Cat" },
    Emoji { symbol: "🦁", description: "Lion" },
    Emoji { symbol: "🐎", description: "Horse" },
    Emoji { symbol: "🦄", description: "Unicorn" },
    Emoji { symbol: "🐷", description: "Pig" },
    Emoji { symbol: "🐘", description: "Elephant" },
    Emoji { symbol: "🐰", description: "Rabbit" },
    Emoji { symbol: "🐼", description: "Panda" },
    Emoji { symbol: "🐓", description: "Rooster" },
    Emoji { symbol: "🐧", description: "Penguin" },
    Emoji { symbol: "🐢", description: "Turtle" },
    Emoji { symbol: "🐟", description: "Fish" },
    Emoji { symbol: "🐙", description: "Octopus" },
    Emoji { symbol: "🦋", description: "Butterfly" },
    Emoji { symbol: "🌷", description: "Flower" },
    Emoji { symbol: "🌳", description: "Tree" },
    Emoji { symbol: "🌵", description: "Cactus" },
    Emoji { symbol: "🍄", description: "Mushroom" },
    Emoji { symbol: "🌏", description: "Globe" },
    Emoji { symbol: "🌙", description: "Moon" },
    Emoji { symbol: "☁️", description: "Cloud" },
    Emoji { symbol: "🔥", description: "Fire" },
    Emoji { symbol: "🍌", description: "Banana" },
    Emoji { symbol: "🍎", description: "Apple" },
    Emoji { symbol: "🍓", description: "Strawberry" },
    Emoji { symbol: "🌽", description: "Corn" },
    Emoji { symbol: "🍕", description: "Pizza" },
    Emoji { symbol: "🎂", description: "Cake" },
    Emoji { symbol: "❤️", description: "Heart" },
    Emoji { symbol: "😀", description: "Smiley" },
    Emoji { symbol: "🤖", description: "Robot" },
    Emoji { symbol: "🎩", description: "Hat" },
    Emoji { symbol: "👓", description: "Glasses" },
    Emoji { symbol: "🔧", description: "Spanner" },
    Emoji { symbol: "🎅", description: "Santa" },
    Emoji { symbol: "👍", description: "Thumbs Up" },
    Emoji { symbol: "☂️", description: "Umbrella" },
    Emoji { symbol: "⌛", description: "Hourglass" },
    Emoji { symbol: "⏰", description: "Clock" },
    Emoji { symbol: "🎁", description: "Gift" },
    Emoji { symbol: "💡", description: "Light Bulb" },
    Emoji { symbol: "📕", description: "Book" },
    Emoji { symbol: "✏️", description: "Pencil" },
    Emoji { symbol: "📎", description: "Paperclip" },
    Emoji { symbol: "✂️", description: "Scissors" },
    Emoji { symbol: "🔒", description: "Lock" },
    Emoji { symbol: "🔑", description: "Key" },
    Emoji { symbol: "🔨", description: "Hammer" },
    Emoji { symbol: "☎️", description: "Telephone" },
    Emoji { symbol: "🏁", description: "Flag" },
    Emoji { symbol: "🚂", description: "Train" },
    Emoji { symbol: "🚲", description: "Bicycle" },
    Emoji { symbol: "✈️", description: "Aeroplane" },
    Emoji { symbol: "🚀", description: "Rocket" },
    Emoji { symbol: "🏆", description: "Trophy" },
    Emoji { symbol: "⚽", description: "Ball" },
    Emoji { symbol: "🎸", description: "Guitar" },
    Emoji { symbol: "🎺", description: "Trumpet" },
    Emoji { symbol: "🔔", description: "Bell" },
    Emoji { symbol: "⚓", description: "Anchor" },
    Emoji { symbol: "🎧", description: "Headphones" },
    Emoji { symbol: "📁", description: "Folder" },
    Emoji { symbol: "📌", description: "Pin" },
];

/// Get the emoji and its description for the given index.
///
/// The index is taken modulo 64, the size of the emoji table of the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
pub fn emoji_from_index(index: u8) -> Emoji {
    EMOJIS[usize::from(index % 64)].clone()
}

/// The emoji version of the short authentication string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmojiShortAuthString {
    /// The seven indices into the emoji table.
    pub indices: [u8; 7],
    /// The seven emojis the user should compare.
    pub emojis: [Emoji; 7],
}

impl EmojiShortAuthString {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let indices = emoji_indices(bytes)?;
        let emojis = indices.map(emoji_from_index);

        Some(Self { indices, emojis })
    }
}

/// Split the first 42 bits of the short code bytes into seven 6 bit numbers.
pub(crate) fn emoji_indices(bytes: &[u8]) -> Option<[u8; 7]> {
    let bytes: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
    let mut number = [0u8; 8];
    number[2..].copy_from_slice(&bytes);
    let number = u64::from_be_bytes(number) >> 6;

    let mut indices = [0u8; 7];

    for (i, index) in indices.iter_mut().enumerate() {
        // Truncation is fine, the value is masked to 6 bits.
        *index = ((number >> (36 - i * 6)) & 0x3f) as u8;
    }

    Some(indices)
}

/// Convert the first five short code bytes into three four digit numbers.
pub(crate) fn decimals(bytes: &[u8]) -> Option<(u16, u16, u16)> {
    let bytes: [u8; 5] = bytes.get(..5)?.try_into().ok()?;
    let [b0, b1, b2, b3, b4] = bytes.map(u16::from);

    let first = (b0 << 5 | b1 >> 3) + 1000;
    let second = ((b1 & 0x7) << 10 | b2 << 2 | b3 >> 6) + 1000;
    let third = ((b3 & 0x3f) << 7 | b4 >> 1) + 1000;

    Some((first, second, third))
}

/// Join the decimal short authentication string with the given separator.
pub fn format_decimals(decimals: (u16, u16, u16), separator: &str) -> String {
    [decimals.0, decimals.1, decimals.2].iter().join(separator)
}

/// Get the info string that is used to derive the short code bytes.
///
/// The initiator of the flow is always listed first.
pub(crate) fn extra_info_sas(
    ids: &SasIds,
    protocol: &KeyAgreementProtocol,
    keys: &EstablishedKeys,
    flow_id: &str,
    we_started: bool,
) -> String {
    let own = (ids.own_device.user_id(), ids.own_device.device_id(), keys.our_public_key());
    let other =
        (ids.other_device.user_id(), ids.other_device.device_id(), keys.their_public_key());

    let (first, second) = if we_started { (own, other) } else { (other, own) };

    let info = match protocol {
        KeyAgreementProtocol::Curve25519 => format!(
            "MATRIX_KEY_VERIFICATION_SAS{}{}{}{}{flow_id}",
            first.0, first.1, second.0, second.1
        ),
        _ => format!(
            "MATRIX_KEY_VERIFICATION_SAS|{}|{}|{}|{}|{}|{}|{flow_id}",
            first.0,
            first.1,
            first.2.to_base64(),
            second.0,
            second.1,
            second.2.to_base64(),
        ),
    };

    trace!("Generated a SAS extra info: {info}");

    info
}

/// The info of a MAC, `sender` attests its keys to `receiver`.
fn extra_mac_info(sender: &DeviceData, receiver: &DeviceData, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = sender.user_id(),
        first_device = sender.device_id(),
        second_user = receiver.user_id(),
        second_device = receiver.device_id(),
        transaction_id = flow_id,
    )
}

/// Get the content for a m.key.verification.mac event.
///
/// Our device key is always attested, our master key only if we trust it.
pub(crate) fn get_mac_content(
    keys: &EstablishedKeys,
    ids: &SasIds,
    flow_id: &FlowId,
    mac_method: &MessageAuthenticationCode,
) -> Result<VerificationContent, SasCryptoError> {
    let mut mac = BTreeMap::new();
    let info = extra_mac_info(&ids.own_device, &ids.other_device, flow_id.as_str());

    let key_id = ids.own_device.key_id();
    let key = ids.own_device.fingerprint();
    mac.insert(key_id.clone(), keys.calculate_mac(mac_method, &key, &format!("{info}{key_id}"))?);

    if let Some(master_key) = &ids.own_master_key {
        let key_id = master_key.key_id();
        let calculated_mac =
            keys.calculate_mac(mac_method, &master_key.to_base64(), &format!("{info}{key_id}"))?;

        mac.insert(key_id, calculated_mac);
    }

    let key_ids = mac.keys().sorted().join(",");
    let keys = keys.calculate_mac(mac_method, &key_ids, &format!("{info}KEY_IDS"))?;

    Ok(VerificationContent::Mac(MacContent {
        mac: Some(mac),
        keys: Some(keys),
        flow: flow_id.flow_fields(),
    }))
}

/// Check the MAC content the other side sent us.
///
/// Returns the verified devices and whether the master key of the other user
/// got verified.
pub(crate) fn receive_mac_event(
    keys: &EstablishedKeys,
    ids: &SasIds,
    flow_id: &str,
    sender: &UserId,
    mac_method: &MessageAuthenticationCode,
    content: &ValidMac,
) -> Result<(Vec<DeviceData>, bool), CancelCode> {
    let mut verified_devices = Vec::new();
    let mut master_key_verified = false;

    let info = extra_mac_info(&ids.other_device, &ids.own_device, flow_id);

    trace!(
        ?sender,
        device_id = ?ids.other_device.device_id(),
        "Received a key.verification.mac event"
    );

    let key_ids = content.mac.keys().sorted().join(",");
    keys.verify_mac(mac_method, &key_ids, &format!("{info}KEY_IDS"), &content.keys)
        .map_err(|_| CancelCode::KeyMismatch)?;

    for (key_id, key_mac) in &content.mac {
        trace!(?sender, device_id = ?ids.other_device.device_id(), key_id, "Checking a SAS MAC");

        let Some(key_name) = key_id.strip_prefix("ed25519:") else {
            warn!(?sender, key_id, "Unsupported key algorithm in a MAC event");
            continue;
        };

        if let Some(device) = ids.other_devices.get(<&DeviceId>::from(key_name)) {
            keys.verify_mac(mac_method, &device.fingerprint(), &format!("{info}{key_id}"), key_mac)
                .map_err(|_| CancelCode::KeyMismatch)?;

            trace!(?sender, key_id, "Successfully verified a device key");
            verified_devices.push(device.clone());
        } else if let Some(master_key) =
            ids.other_master_key.as_ref().filter(|k| k.to_base64() == key_name)
        {
            keys.verify_mac(
                mac_method,
                &master_key.to_base64(),
                &format!("{info}{key_id}"),
                key_mac,
            )
            .map_err(|_| CancelCode::KeyMismatch)?;

            trace!(?sender, key_id, "Successfully verified a master key");
            master_key_verified = true;
        } else {
            warn!(
                "Key ID {key_id} in MAC event from {sender} {} doesn't belong to any device \
                or user identity",
                ids.other_device.device_id()
            );
        }
    }

    if verified_devices.is_empty() && !master_key_verified {
        Err(CancelCode::KeyMismatch)
    } else {
        Ok((verified_devices, master_key_verified))
    }
}
