//! Manufacturer-data decoding for proximity beacon families.
//!
//! Each advertisement can carry several manufacturer-data entries keyed by
//! a Bluetooth SIG company identifier. [`decode`] turns one entry into at
//! most one [`BeaconRecord`].

use serde_derive::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Apple Inc. (carries iBeacon frames)
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Company id under which Eddystone frames are reported as manufacturer data.
pub const EDDYSTONE_COMPANY_ID: u16 = 0x00AA;

const IBEACON_MIN_LEN: usize = 23;
const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];

const EDDYSTONE_MIN_LEN: usize = 20;
const EDDYSTONE_PREFIX: [u8; 2] = [0xAA, 0xFE];
const EDDYSTONE_UID_FRAME: u8 = 0x00;
const EDDYSTONE_URL_FRAME: u8 = 0x10;

const ALTBEACON_MIN_LEN: usize = 24;

/// Eddystone-URL scheme prefixes, indexed by the scheme byte.
const URL_SCHEMES: [&str; 4] = ["http://www.", "https://www.", "http://", "https://"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid Eddystone-URL scheme index {0}")]
    InvalidUrlScheme(u8),
    #[error("Eddystone-URL body is not ASCII")]
    InvalidEncoding,
    #[error("Payload truncated: needed bytes {start}..{end}, got {len}")]
    Truncated { start: usize, end: usize, len: usize },
}

/// A decoded beacon frame.
///
/// Serialises with a `beacon_type` tag and the variant's fields; byte
/// identifiers are rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "beacon_type")]
pub enum BeaconRecord {
    #[serde(rename = "iBeacon")]
    IBeacon {
        /// Raw 16 bytes in transmission order.
        uuid: Uuid,
        major: u16,
        minor: u16,
        /// Calibrated RSSI at one metre, dBm.
        tx_power: i8,
    },
    #[serde(rename = "Eddystone-UID")]
    EddystoneUid {
        #[serde(serialize_with = "as_hex")]
        namespace: [u8; 10],
        #[serde(serialize_with = "as_hex")]
        instance: [u8; 6],
    },
    #[serde(rename = "Eddystone-URL")]
    EddystoneUrl { url: String },
    /// Heuristic match: any long enough payload from an unrecognised vendor.
    #[serde(rename = "AltBeacon")]
    AltBeacon {
        #[serde(serialize_with = "as_hex")]
        beacon_id: [u8; 20],
    },
}

impl BeaconRecord {
    pub fn beacon_type(&self) -> &'static str {
        match self {
            BeaconRecord::IBeacon { .. } => "iBeacon",
            BeaconRecord::EddystoneUid { .. } => "Eddystone-UID",
            BeaconRecord::EddystoneUrl { .. } => "Eddystone-URL",
            BeaconRecord::AltBeacon { .. } => "AltBeacon",
        }
    }
}

fn as_hex<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}

/// Decode one manufacturer-data entry.
///
/// Returns `Ok(None)` when no beacon family claims the entry. A family whose
/// gate matched but whose body is malformed yields a `DecodeError`.
pub fn decode(company_id: u16, payload: &[u8]) -> Result<Option<BeaconRecord>, DecodeError> {
    match company_id {
        APPLE_COMPANY_ID if payload.len() >= IBEACON_MIN_LEN => decode_ibeacon(payload),
        EDDYSTONE_COMPANY_ID if payload.len() >= EDDYSTONE_MIN_LEN => decode_eddystone(payload),
        _ if payload.len() >= ALTBEACON_MIN_LEN => decode_altbeacon(payload),
        _ => Ok(None),
    }
}

fn decode_ibeacon(payload: &[u8]) -> Result<Option<BeaconRecord>, DecodeError> {
    if payload[..2] != IBEACON_PREFIX {
        return Ok(None);
    }

    let uuid = Uuid::from_bytes(field::<16>(payload, 2)?);
    let major = u16::from_be_bytes(field::<2>(payload, 18)?);
    let minor = u16::from_be_bytes(field::<2>(payload, 20)?);
    let [tx_power] = field::<1>(payload, 22)?;

    Ok(Some(BeaconRecord::IBeacon {
        uuid,
        major,
        minor,
        tx_power: tx_power as i8,
    }))
}

fn decode_eddystone(payload: &[u8]) -> Result<Option<BeaconRecord>, DecodeError> {
    if payload[..2] != EDDYSTONE_PREFIX {
        return Ok(None);
    }

    match payload[2] {
        EDDYSTONE_UID_FRAME => Ok(Some(BeaconRecord::EddystoneUid {
            namespace: field::<10>(payload, 3)?,
            instance: field::<6>(payload, 13)?,
        })),
        EDDYSTONE_URL_FRAME => {
            let [scheme_index] = field::<1>(payload, 3)?;
            let scheme = URL_SCHEMES
                .get(usize::from(scheme_index))
                .ok_or(DecodeError::InvalidUrlScheme(scheme_index))?;

            let body = &payload[4..];
            if !body.is_ascii() {
                return Err(DecodeError::InvalidEncoding);
            }
            let body = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidEncoding)?;

            Ok(Some(BeaconRecord::EddystoneUrl {
                url: format!("{scheme}{body}"),
            }))
        }
        _ => Ok(None),
    }
}

fn decode_altbeacon(payload: &[u8]) -> Result<Option<BeaconRecord>, DecodeError> {
    Ok(Some(BeaconRecord::AltBeacon {
        beacon_id: field::<20>(payload, 2)?,
    }))
}

/// Copy `N` bytes starting at `start` out of `payload`.
fn field<const N: usize>(payload: &[u8], start: usize) -> Result<[u8; N], DecodeError> {
    let end = start + N;
    payload
        .get(start..end)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Truncated {
            start,
            end,
            len: payload.len(),
        })
}
