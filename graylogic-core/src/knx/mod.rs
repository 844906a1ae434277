//! KNX wire codec and knxd protocol client
//!
//! [`GroupAddress`] and [`Telegram`] form the codec for knxd's framed
//! TCP/Unix host protocol; [`KnxClient`] speaks it over a live socket.

pub mod address;
pub mod client;
pub mod telegram;

pub use address::GroupAddress;
pub use client::{KnxClient, KnxStats, TelegramHandler};
pub use telegram::{Apci, Telegram, EIB_CLOSE, EIB_GROUP_PACKET, EIB_OPEN_GROUPCON};
