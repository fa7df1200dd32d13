use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};

use crate::ext::{current_millis, decode_bytes, encode_bytes};
use crate::member::Member;
use crate::options::SendOptions;
use crate::unique_id::UniqueId;

/// The envelope that travels inside one frame: delivery options, identity of the message and
/// of its sender, and the opaque payload produced by the layer above.
#[derive(Debug, Clone, Encode, Decode)]
pub struct ChannelData {
    pub options: SendOptions,
    pub timestamp: i64,
    pub unique_id: UniqueId,
    pub address: Member,
    pub message: Vec<u8>,
}

impl ChannelData {
    pub fn new(address: Member, options: SendOptions, message: Vec<u8>) -> Self {
        Self {
            options,
            timestamp: current_millis(),
            unique_id: UniqueId::random(),
            address,
            message,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        encode_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        decode_bytes(bytes)
    }
}

impl Display for ChannelData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChannelData(id={}, from={}, options={}, {} bytes)",
            self.unique_id,
            self.address.name(),
            self.options,
            self.message.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::channel_data::ChannelData;
    use crate::member::Member;
    use crate::options::SendOptions;

    #[test]
    fn test_stamp_and_codec() -> anyhow::Result<()> {
        let local = Member::new("127.0.0.1:4000".parse()?);
        let data = ChannelData::new(local.clone(), SendOptions::USE_ACK, b"delta".to_vec());
        assert!(data.timestamp > 0);
        let decoded = ChannelData::from_bytes(&data.to_bytes()?)?;
        assert_eq!(decoded.unique_id, data.unique_id);
        assert_eq!(decoded.address, local);
        assert_eq!(decoded.options, SendOptions::USE_ACK);
        assert_eq!(decoded.message, b"delta");
        Ok(())
    }
}
