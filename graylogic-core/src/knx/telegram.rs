//! Group telegrams and the knxd frame codec
//!
//! knxd frames are big-endian and length-prefixed:
//!
//! ```text
//! offset  size  field
//!   0      2    total_length (including these 2 bytes)
//!   2      2    message_type
//!   4      n    payload
//! ```
//!
//! A group-packet payload is `src(2) dst(2) tpci_apci_hi(1) apci_lo(1)
//! [data...]`. Single-byte values in `0x01..=0x3F` ride in the low six bits
//! of the APCI octet; empty payloads are the bare APCI octet; everything
//! else (including `[0x00]`) follows as raw bytes. That split keeps
//! `decode(encode(t)) == t` for every valid telegram.

use std::fmt;

use crate::error::{Error, Result};
use crate::knx::address::GroupAddress;

/// knxd message type: close the connection
pub const EIB_CLOSE: u16 = 0x0006;
/// knxd message type: enter group-socket mode
pub const EIB_OPEN_GROUPCON: u16 = 0x0026;
/// knxd message type: a group telegram in either direction
pub const EIB_GROUP_PACKET: u16 = 0x0027;

/// Upper bound on an encoded frame, matching the broker payload cap
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Maximum telegram payload length in bytes
pub const MAX_PAYLOAD_LEN: usize = 14;

const FRAME_HEADER_LEN: usize = 4;
const GROUP_PACKET_MIN_LEN: usize = 10;

/// Application Protocol Control Information op-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Apci {
    /// GroupValue_Read
    Read = 0x00,
    /// GroupValue_Response
    Response = 0x40,
    /// GroupValue_Write
    Write = 0x80,
}

impl Apci {
    /// The APCI bits as they appear in the high bits of the APCI octet
    #[inline]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Parse the high bits of an APCI octet
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits & 0xC0 {
            0x00 => Ok(Apci::Read),
            0x40 => Ok(Apci::Response),
            0x80 => Ok(Apci::Write),
            other => Err(Error::InvalidApci(other)),
        }
    }
}

impl fmt::Display for Apci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Apci::Read => write!(f, "read"),
            Apci::Response => write!(f, "response"),
            Apci::Write => write!(f, "write"),
        }
    }
}

/// A KNX group telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Destination group address
    pub destination: GroupAddress,
    /// Operation
    pub apci: Apci,
    /// Payload bytes (0-14)
    pub payload: Vec<u8>,
}

impl Telegram {
    /// A GroupValue_Read for `destination`
    pub fn read(destination: GroupAddress) -> Self {
        Self {
            destination,
            apci: Apci::Read,
            payload: Vec::new(),
        }
    }

    /// A GroupValue_Write carrying `payload`
    pub fn write(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Self {
            destination,
            apci: Apci::Write,
            payload,
        }
    }

    /// A GroupValue_Response carrying `payload`
    pub fn response(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Self {
            destination,
            apci: Apci::Response,
            payload,
        }
    }

    /// Encode into a complete knxd frame (length word included)
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidTelegram(format!(
                "payload length {} exceeds {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        // Embed only values the low six bits can represent unambiguously;
        // 0x00 must take the appended form or it would decode as "empty".
        let embedded = self.payload.len() == 1 && (0x01..=0x3F).contains(&self.payload[0]);

        let apci_lo = if embedded {
            self.apci.bits() | self.payload[0]
        } else {
            self.apci.bits()
        };
        let extra: &[u8] = if embedded { &[] } else { &self.payload };

        let total = GROUP_PACKET_MIN_LEN + extra.len();
        if total > MAX_FRAME_LEN {
            return Err(Error::PayloadTooLarge {
                size: total,
                max: MAX_FRAME_LEN,
            });
        }

        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        frame.extend_from_slice(&EIB_GROUP_PACKET.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]); // source, zero on outbound
        frame.extend_from_slice(&self.destination.to_be_bytes());
        frame.push(0x00); // TPCI / APCI high
        frame.push(apci_lo);
        frame.extend_from_slice(extra);

        Ok(frame)
    }

    /// Decode a complete knxd frame (length word included)
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < GROUP_PACKET_MIN_LEN {
            return Err(Error::InvalidTelegram(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }

        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if declared != frame.len() {
            return Err(Error::InvalidTelegram(format!(
                "declared length {} != received {}",
                declared,
                frame.len()
            )));
        }

        let msg_type = u16::from_be_bytes([frame[2], frame[3]]);
        if msg_type != EIB_GROUP_PACKET {
            return Err(Error::InvalidTelegram(format!(
                "unexpected message type {:#06x}",
                msg_type
            )));
        }

        let destination = GroupAddress::from_raw(u16::from_be_bytes([frame[6], frame[7]]));
        let apci_lo = frame[9];
        let apci = Apci::from_bits(apci_lo)
            .map_err(|_| Error::InvalidTelegram(format!("APCI {:#04x}", apci_lo)))?;

        let extra = &frame[GROUP_PACKET_MIN_LEN..];
        let embedded = apci_lo & 0x3F;

        let payload = if !extra.is_empty() {
            if embedded != 0 {
                return Err(Error::InvalidTelegram(
                    "embedded value alongside appended data".to_string(),
                ));
            }
            if extra.len() > MAX_PAYLOAD_LEN {
                return Err(Error::InvalidTelegram(format!(
                    "payload length {} exceeds {}",
                    extra.len(),
                    MAX_PAYLOAD_LEN
                )));
            }
            extra.to_vec()
        } else if embedded != 0 {
            vec![embedded]
        } else {
            Vec::new()
        };

        Ok(Self {
            destination,
            apci,
            payload,
        })
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.apci,
            self.destination,
            self.payload
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}

/// Build an arbitrary knxd frame from a message type and payload
pub(crate) fn encode_frame(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let total = FRAME_HEADER_LEN + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&msg_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// The EIB_OPEN_GROUPCON handshake frame: four zero bytes then a reserved word
pub(crate) fn encode_open_groupcon() -> Vec<u8> {
    encode_frame(EIB_OPEN_GROUPCON, &[0, 0, 0, 0, 0, 0])
}

/// The EIB_CLOSE frame
pub(crate) fn encode_close() -> Vec<u8> {
    encode_frame(EIB_CLOSE, &[])
}
