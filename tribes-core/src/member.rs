use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use bincode::{Decode, Encode};

use crate::ext::current_millis;
use crate::unique_id::UniqueId;

/// Identity of a cluster node.
///
/// Two members are equal when they share the same socket address and unique id, the alive
/// timestamp and the optional payload fields do not take part in identity.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Member {
    pub addr: SocketAddr,
    pub udp_port: Option<u16>,
    pub unique_id: UniqueId,
    pub alive_time: i64,
    pub domain: Option<String>,
}

impl Member {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            udp_port: None,
            unique_id: UniqueId::random(),
            alive_time: current_millis(),
            domain: None,
        }
    }

    pub fn with_udp_port(mut self, udp_port: u16) -> Self {
        self.udp_port = Some(udp_port);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_port.map(|port| SocketAddr::new(self.addr.ip(), port))
    }

    pub fn name(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn touch(&mut self) {
        self.alive_time = current_millis();
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.unique_id == other.unique_id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.unique_id.hash(state);
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member({},{})", self.name(), self.unique_id)
    }
}
