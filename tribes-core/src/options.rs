use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use anyhow::anyhow;
use bincode::{Decode, Encode};
use itertools::Itertools;

/// Bitwise composable delivery flags carried by every [`ChannelData`](crate::channel_data::ChannelData).
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Encode, Decode)]
pub struct SendOptions(pub u32);

impl SendOptions {
    pub const NONE: SendOptions = SendOptions(0x00);
    pub const BYTE_MESSAGE: SendOptions = SendOptions(0x01);
    pub const USE_ACK: SendOptions = SendOptions(0x02);
    pub const SYNCHRONIZED_ACK: SendOptions = SendOptions(0x04);
    pub const ASYNCHRONOUS: SendOptions = SendOptions(0x08);
    pub const SECURE: SendOptions = SendOptions(0x10);
    pub const UDP: SendOptions = SendOptions(0x20);
    pub const DEFAULT: SendOptions = SendOptions::USE_ACK;

    const NAMES: [(&'static str, SendOptions); 6] = [
        ("async", SendOptions::ASYNCHRONOUS),
        ("byte", SendOptions::BYTE_MESSAGE),
        ("secure", SendOptions::SECURE),
        ("sync_ack", SendOptions::SYNCHRONIZED_ACK),
        ("udp", SendOptions::UDP),
        ("use_ack", SendOptions::USE_ACK),
    ];

    pub fn contains(&self, other: SendOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn use_ack(&self) -> bool {
        self.contains(SendOptions::USE_ACK)
    }

    pub fn is_udp(&self) -> bool {
        self.contains(SendOptions::UDP)
    }

    pub fn is_asynchronous(&self) -> bool {
        self.contains(SendOptions::ASYNCHRONOUS)
    }

    /// The receiver acks as soon as the frame is read, before the message is dispatched.
    pub fn send_ack_async(&self) -> bool {
        self.use_ack() && !self.contains(SendOptions::SYNCHRONIZED_ACK)
    }

    /// The receiver acks only after the message was dispatched successfully.
    pub fn send_ack_sync(&self) -> bool {
        self.use_ack() && self.contains(SendOptions::SYNCHRONIZED_ACK)
    }

    fn name_of(name: &str) -> Option<SendOptions> {
        let name = name.trim().to_ascii_lowercase();
        let alias = match name.as_str() {
            "asynchronous" => "async",
            "byte_message" => "byte",
            "synchronized_ack" => "sync_ack",
            other => other,
        };
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == alias)
            .map(|(_, option)| *option)
    }
}

impl BitOr for SendOptions {
    type Output = SendOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        SendOptions(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromStr for SendOptions {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.trim().parse::<u32>() {
            return Ok(SendOptions(value));
        }
        let mut options = SendOptions::NONE;
        for name in s.split(|c| c == '|' || c == ',').filter(|n| !n.trim().is_empty()) {
            let option = Self::name_of(name).ok_or(anyhow!("unknown send option `{}`", name.trim()))?;
            options |= option;
        }
        Ok(options)
    }
}

impl Display for SendOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = Self::NAMES
            .iter()
            .filter(|(_, option)| self.contains(*option))
            .map(|(name, _)| *name)
            .join("|");
        write!(f, "{}", names)
    }
}
