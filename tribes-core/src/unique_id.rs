use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct UniqueId(pub [u8; 16]);

impl UniqueId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 && index % 4 == 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::unique_id::UniqueId;

    #[test]
    fn test_display() {
        let id = UniqueId([0xab; 16]);
        assert_eq!(id.to_string(), "abababab-abababab-abababab-abababab");
        assert_ne!(UniqueId::random(), UniqueId::random());
    }
}
