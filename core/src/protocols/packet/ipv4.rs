//! IPv4 packet.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{checksum, Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// An IPv4 packet.
///
/// IPv4 options are not parsed by default.
#[derive(Debug)]
pub struct Ipv4<'a> {
    /// Fixed header.
    header: Ipv4Header,
    /// Offset to `header` from the start of `mbuf`.
    offset: usize,
    /// Packet buffer.
    mbuf: &'a Mbuf,
}

impl Ipv4<'_> {
    /// Returns the IP protocol version.
    #[inline]
    pub fn version(&self) -> u8 {
        (self.header.version_ihl & 0xf0) >> 4
    }

    /// Returns the header length measured in 32-bit words (IHL).
    #[inline]
    pub fn ihl(&self) -> u8 {
        self.header.version_ihl & 0x0f
    }

    /// Returns the differentiated services field.
    #[inline]
    pub fn dscp_ecn(&self) -> u8 {
        self.header.dscp_ecn
    }

    /// Returns the total length of the packet in bytes, including the header and data.
    #[inline]
    pub fn total_length(&self) -> u16 {
        self.header.total_length.into()
    }

    /// Returns the identification field.
    #[inline]
    pub fn identification(&self) -> u16 {
        self.header.identification.into()
    }

    /// Returns the 16-bit field containing the flags and fragment offset.
    #[inline]
    pub fn flags_to_frag_offset(&self) -> u16 {
        self.header.flags_to_frag_offset.into()
    }

    /// Returns the time to live.
    #[inline]
    pub fn time_to_live(&self) -> u8 {
        self.header.time_to_live
    }

    /// Returns the encapsulated protocol identifier.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    /// Returns the 16-bit header checksum field.
    #[inline]
    pub fn header_checksum(&self) -> u16 {
        self.header.header_checksum.into()
    }

    /// Returns the sender's IPv4 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.src_addr))
    }

    /// Returns the receiver's IPv4 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.dst_addr))
    }
}

impl<'a> Packet<'a> for Ipv4<'a> {
    fn mbuf(&self) -> &Mbuf {
        self.mbuf
    }

    fn header_len(&self) -> usize {
        self.header.length()
    }

    fn next_header_offset(&self) -> usize {
        self.offset + self.header_len()
    }

    fn next_header(&self) -> Option<usize> {
        Some(self.protocol() as usize)
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        let offset = outer.next_header_offset();
        if let Ok(header) = outer.mbuf().get_data::<Ipv4Header>(offset) {
            let header = unsafe { *header };
            if (header.version_ihl & 0xf0) >> 4 != 4 || (header.version_ihl & 0x0f) < 5 {
                bail!(PacketParseError::InvalidProtocol)
            }
            Ok(Ipv4 {
                header,
                offset,
                mbuf: outer.mbuf(),
            })
        } else {
            bail!(PacketParseError::InvalidRead)
        }
    }
}

/// Fixed portion of an IPv4 header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct Ipv4Header {
    version_ihl: u8,
    dscp_ecn: u8,
    total_length: u16be,
    identification: u16be,
    flags_to_frag_offset: u16be,
    time_to_live: u8,
    protocol: u8,
    header_checksum: u16be,
    src_addr: u32be,
    dst_addr: u32be,
}

impl PacketHeader for Ipv4Header {
    /// Header length measured in bytes. Equivalent to the payload offset.
    fn length(&self) -> usize {
        ((self.version_ihl & 0x0f) * 4).into()
    }
}

// Field offsets within the header, for in-place edits.
const TOTAL_LENGTH: usize = 2;
const HEADER_CHECKSUM: usize = 10;

/// Rewrites the total-length field in place and incrementally updates the
/// header checksum.
pub(crate) fn set_total_length(mbuf: &mut Mbuf, ip_offset: usize, value: u16) -> Result<()> {
    let field = mbuf.get_data_slice_mut(ip_offset + TOTAL_LENGTH, 2)?;
    let old = u16::from_be_bytes([field[0], field[1]]);
    field.copy_from_slice(&value.to_be_bytes());

    let cksum = mbuf.get_data_slice_mut(ip_offset + HEADER_CHECKSUM, 2)?;
    let updated = checksum::update_u16(u16::from_be_bytes([cksum[0], cksum[1]]), old, value);
    cksum.copy_from_slice(&updated.to_be_bytes());
    Ok(())
}

/// Recomputes the header checksum from scratch.
pub(crate) fn compute_header_checksum(mbuf: &mut Mbuf, ip_offset: usize, header_len: usize) -> Result<()> {
    mbuf.get_data_slice_mut(ip_offset + HEADER_CHECKSUM, 2)?
        .copy_from_slice(&[0, 0]);
    let cksum = checksum::ipv4_header_checksum(mbuf.get_data_slice(ip_offset, header_len)?);
    mbuf.get_data_slice_mut(ip_offset + HEADER_CHECKSUM, 2)?
        .copy_from_slice(&cksum.to_be_bytes());
    Ok(())
}
