//! Directional flow identifiers.
//!
//! Each direction of a connection is tracked under its own 4-tuple; the two
//! are linked by tuple reversal (the SYN registers the forward tuple, the
//! SYN/ACK finds it by reversing its own).

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

/// Oriented connection 4-tuple.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowId {
    /// Sender address.
    pub src_ip: Ipv4Addr,
    /// Receiver address.
    pub dst_ip: Ipv4Addr,
    /// Sender port.
    pub src_port: u16,
    /// Receiver port.
    pub dst_port: u16,
}

impl FlowId {
    /// Returns the 4-tuple of the opposite direction.
    pub fn reversed(&self) -> FlowId {
        FlowId {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> ", self.src_ip, self.src_port)?;
        write!(f, "{}:{}", self.dst_ip, self.dst_port)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_flow_id_reversal() {
        let id = FlowId {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 4242,
            dst_port: 80,
        };
        assert_eq!(id.reversed().reversed(), id);
        assert_ne!(id.reversed(), id);
        assert_eq!(id.reversed().src_port, 80);
    }
}
