//! Parsed transport-layer context carried alongside each packet buffer.

use crate::flowtable::flow_id::FlowId;
use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::tcp::{self, Tcp};
use crate::protocols::packet::Packet;

use anyhow::{bail, Result};

/// Parsed TCP context used for flow lookup and sequence tracking.
#[derive(Debug, Clone, Copy)]
pub struct TcpContext {
    /// Oriented 4-tuple of the segment.
    pub flow: FlowId,
    /// Offset of the IPv4 header from the start of the buffer.
    pub ip_offset: usize,
    /// Offset of the TCP header.
    pub tcp_offset: usize,
    /// Offset into the buffer where the payload begins.
    pub offset: usize,
    /// Length of the payload in bytes.
    pub length: usize,
    /// Raw sequence number of the segment.
    pub seq_no: u32,
    /// Raw acknowledgment number of the segment.
    pub ack_no: u32,
    /// TCP flags.
    pub flags: u8,
    /// Advertised receive window.
    pub window: u16,
}

impl TcpContext {
    /// Parses the headers of a buffer that starts at the IPv4 header.
    pub fn parse(mbuf: &Mbuf) -> Result<Self> {
        let ipv4 = mbuf.parse_to::<Ipv4>()?;
        let tcp_pkt = ipv4.parse_to::<Tcp>()?;
        if let Some(payload_size) =
            (ipv4.total_length() as usize).checked_sub(ipv4.header_len() + tcp_pkt.header_len())
        {
            Ok(TcpContext {
                flow: FlowId {
                    src_ip: ipv4.src_addr(),
                    dst_ip: ipv4.dst_addr(),
                    src_port: tcp_pkt.src_port(),
                    dst_port: tcp_pkt.dst_port(),
                },
                ip_offset: 0,
                tcp_offset: ipv4.header_len(),
                offset: tcp_pkt.next_header_offset(),
                length: payload_size,
                seq_no: tcp_pkt.seq_no(),
                ack_no: tcp_pkt.ack_no(),
                flags: tcp_pkt.flags(),
                window: tcp_pkt.window(),
            })
        } else {
            bail!("Malformed Packet");
        }
    }

    #[inline]
    pub fn syn(&self) -> bool {
        self.flags & tcp::SYN != 0
    }

    #[inline]
    pub fn ack(&self) -> bool {
        self.flags & tcp::ACK != 0
    }

    #[inline]
    pub fn rst(&self) -> bool {
        self.flags & tcp::RST != 0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.flags & tcp::FIN != 0
    }

    #[inline]
    pub fn synack(&self) -> bool {
        self.flags & (tcp::SYN | tcp::ACK) == (tcp::SYN | tcp::ACK)
    }

    /// A pure acknowledgment: no payload, no SYN/FIN/RST semantics.
    #[inline]
    pub fn bare_ack(&self) -> bool {
        self.ack() && self.length == 0 && self.flags & (tcp::SYN | tcp::FIN | tcp::RST) == 0
    }

    /// The sequence number that would follow this segment in order. SYN and
    /// FIN each consume one sequence number.
    pub fn next_seq(&self) -> u32 {
        let mut next = self.seq_no.wrapping_add(self.length as u32);
        if self.flags & (tcp::SYN | tcp::FIN) != 0 {
            next = next.wrapping_add(1);
        }
        next
    }

    /// One past the last payload byte.
    pub fn end_seq(&self) -> u32 {
        self.seq_no.wrapping_add(self.length as u32)
    }
}

/// A packet buffer with its parsed transport context.
#[derive(Debug)]
pub struct Segment {
    pub mbuf: Mbuf,
    pub ctxt: TcpContext,
}

impl Segment {
    pub fn new(mbuf: Mbuf, ctxt: TcpContext) -> Self {
        Segment { mbuf, ctxt }
    }

    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.ctxt.seq_no
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.ctxt.length
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.ctxt.flags
    }
}
