//! TCP packet.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{checksum, Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use anyhow::{bail, Result};

/// TCP assigned protocol number.
pub const TCP_PROTOCOL: usize = 6;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

// TCP option kinds.
const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_MAXSEG: u8 = 2;
const TCPOPT_WSCALE: u8 = 3;
const TCPOPT_SACK_PERMITTED: u8 = 4;

const TCPOLEN_MAXSEG: u8 = 4;
const TCPOLEN_WSCALE: u8 = 3;
const TCPOLEN_SACK_PERMITTED: u8 = 2;

/// A TCP packet.
///
/// TCP options are not parsed by default; see [`parse_options`].
#[derive(Debug)]
pub struct Tcp<'a> {
    /// Fixed header.
    header: TcpHeader,
    /// Offset to `header` from the start of `mbuf`.
    offset: usize,
    /// Packet buffer.
    mbuf: &'a Mbuf,
}

impl Tcp<'_> {
    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port.into()
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port.into()
    }

    /// Returns the sequence number.
    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.header.seq_no.into()
    }

    /// Returns the acknowledgment number.
    #[inline]
    pub fn ack_no(&self) -> u32 {
        self.header.ack_no.into()
    }

    /// Returns the header length measured in 32-bit words.
    #[inline]
    pub fn data_offset(&self) -> u8 {
        (self.header.data_offset_to_ns & 0xf0) >> 4
    }

    /// Returns the 8-bit TCP flags.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Returns the size of the receive window in window size units.
    #[inline]
    pub fn window(&self) -> u16 {
        self.header.window.into()
    }

    /// Returns the 16-bit checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.header.checksum.into()
    }

    /// Returns the urgent pointer.
    #[inline]
    pub fn urgent_pointer(&self) -> u16 {
        self.header.urgent_pointer.into()
    }

    /// Returns `true` if the acknowledgment flag is set.
    #[inline]
    pub fn ack(&self) -> bool {
        (self.flags() & ACK) != 0
    }

    /// Returns `true` if the reset flag is set.
    #[inline]
    pub fn rst(&self) -> bool {
        (self.flags() & RST) != 0
    }

    /// Returns `true` if the synchronize flag is set.
    #[inline]
    pub fn syn(&self) -> bool {
        (self.flags() & SYN) != 0
    }

    /// Returns `true` if the FIN flag is set.
    #[inline]
    pub fn fin(&self) -> bool {
        (self.flags() & FIN) != 0
    }

    /// Returns `true` if both `SYN` and `ACK` flags are set.
    #[inline]
    pub fn synack(&self) -> bool {
        (self.flags() & (ACK | SYN)) == (ACK | SYN)
    }
}

impl<'a> Packet<'a> for Tcp<'a> {
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
        None
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        let offset = outer.next_header_offset();
        if let Ok(header) = outer.mbuf().get_data(offset) {
            match outer.next_header() {
                Some(TCP_PROTOCOL) => Ok(Tcp {
                    header: unsafe { *header },
                    offset,
                    mbuf: outer.mbuf(),
                }),
                _ => bail!(PacketParseError::InvalidProtocol),
            }
        } else {
            bail!(PacketParseError::InvalidRead)
        }
    }
}

/// Fixed portion of a TCP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct TcpHeader {
    src_port: u16be,
    dst_port: u16be,
    seq_no: u32be,
    ack_no: u32be,
    data_offset_to_ns: u8,
    flags: u8,
    window: u16be,
    checksum: u16be,
    urgent_pointer: u16be,
}

impl PacketHeader for TcpHeader {
    /// Header length measured in bytes. Equivalent to the payload offset.
    ///
    /// This differs from the value of the `Data Offset` field, which measures header length in
    /// 32-bit words.
    fn length(&self) -> usize {
        ((self.data_offset_to_ns & 0xf0) >> 2).into()
    }
}

// Field offsets within the header, for in-place edits.
const SEQ_NO: usize = 4;
const ACK_NO: usize = 8;
const DATA_OFFSET: usize = 12;
const FLAGS: usize = 13;
const CHECKSUM: usize = 16;

fn read_u16(mbuf: &Mbuf, offset: usize) -> Result<u16> {
    let bytes = mbuf.get_data_slice(offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn write_u16(mbuf: &mut Mbuf, offset: usize, value: u16) -> Result<()> {
    mbuf.get_data_slice_mut(offset, 2)?
        .copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn update_cksum_u16(mbuf: &mut Mbuf, tcp_offset: usize, old: u16, new: u16) -> Result<()> {
    let cur = read_u16(mbuf, tcp_offset + CHECKSUM)?;
    write_u16(mbuf, tcp_offset + CHECKSUM, checksum::update_u16(cur, old, new))
}

/// Rewrites the sequence number in place with an incremental checksum update.
pub(crate) fn set_seq_no(mbuf: &mut Mbuf, tcp_offset: usize, value: u32) -> Result<()> {
    let field = mbuf.get_data_slice_mut(tcp_offset + SEQ_NO, 4)?;
    let old = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
    field.copy_from_slice(&value.to_be_bytes());
    let cur = read_u16(mbuf, tcp_offset + CHECKSUM)?;
    write_u16(mbuf, tcp_offset + CHECKSUM, checksum::update_u32(cur, old, value))
}

/// Rewrites the acknowledgment number in place with an incremental checksum update.
pub(crate) fn set_ack_no(mbuf: &mut Mbuf, tcp_offset: usize, value: u32) -> Result<()> {
    let field = mbuf.get_data_slice_mut(tcp_offset + ACK_NO, 4)?;
    let old = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
    field.copy_from_slice(&value.to_be_bytes());
    let cur = read_u16(mbuf, tcp_offset + CHECKSUM)?;
    write_u16(mbuf, tcp_offset + CHECKSUM, checksum::update_u32(cur, old, value))
}

/// Rewrites the flag byte in place with an incremental checksum update.
pub(crate) fn set_flags(mbuf: &mut Mbuf, tcp_offset: usize, flags: u8) -> Result<()> {
    // The flag byte shares a checksum word with the data-offset byte.
    let old_word = read_u16(mbuf, tcp_offset + DATA_OFFSET)?;
    let new_word = (old_word & 0xff00) | flags as u16;
    mbuf.get_data_slice_mut(tcp_offset + FLAGS, 1)?[0] = flags;
    update_cksum_u16(mbuf, tcp_offset, old_word, new_word)
}

/// Recomputes the TCP checksum from scratch over the pseudo-header and the
/// segment bytes starting at `tcp_offset`.
pub(crate) fn compute_checksum(
    mbuf: &mut Mbuf,
    tcp_offset: usize,
    src_addr: u32,
    dst_addr: u32,
) -> Result<()> {
    write_u16(mbuf, tcp_offset + CHECKSUM, 0)?;
    let segment = mbuf.get_data_slice(tcp_offset, mbuf.data_len() - tcp_offset)?;
    let cksum = checksum::tcp_checksum(src_addr, dst_addr, segment);
    write_u16(mbuf, tcp_offset + CHECKSUM, cksum)
}

/// TCP options the middlebox cares about, collected in one walk.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ParsedOptions {
    /// Maximum segment size, from SYN/SYN+ACK.
    pub(crate) mss: Option<u16>,
    /// Window scale shift count, from SYN/SYN+ACK.
    pub(crate) window_scale: Option<u8>,
    /// Offset of a SACK-permitted option from the start of the buffer.
    pub(crate) sack_permitted: Option<usize>,
}

/// Walks the option list between the fixed header and the payload.
/// Malformed options end the walk.
pub(crate) fn parse_options(mbuf: &Mbuf, tcp_offset: usize, header_len: usize) -> ParsedOptions {
    let mut parsed = ParsedOptions::default();
    let end = std::cmp::min(tcp_offset + header_len, mbuf.data_len());
    let mut at = tcp_offset + TcpHeader::size_of();

    while at < end {
        let opts = &mbuf.data()[at..end];
        match opts[0] {
            TCPOPT_EOL => break,
            TCPOPT_NOP => {
                at += 1;
                continue;
            }
            kind => {
                if opts.len() < 2 || opts[1] < 2 || opts[1] as usize > opts.len() {
                    break;
                }
                let len = opts[1];
                match (kind, len) {
                    (TCPOPT_MAXSEG, TCPOLEN_MAXSEG) => {
                        parsed.mss = Some(u16::from_be_bytes([opts[2], opts[3]]));
                    }
                    (TCPOPT_WSCALE, TCPOLEN_WSCALE) => {
                        parsed.window_scale = Some(opts[2]);
                    }
                    (TCPOPT_SACK_PERMITTED, TCPOLEN_SACK_PERMITTED) => {
                        parsed.sack_permitted = Some(at);
                    }
                    _ => {}
                }
                at += len as usize;
            }
        }
    }
    parsed
}

/// NOP-fills the SACK-permitted option at `opt_offset`, keeping the checksum
/// consistent with an incremental update.
pub(crate) fn strip_sack_permitted(
    mbuf: &mut Mbuf,
    tcp_offset: usize,
    opt_offset: usize,
) -> Result<()> {
    let bytes = mbuf.get_data_slice_mut(opt_offset, 2)?;
    let (b0, b1) = (bytes[0], bytes[1]);
    bytes[0] = TCPOPT_NOP;
    bytes[1] = TCPOPT_NOP;

    // Contribution of a two-byte run to the ones-complement sum depends on
    // whether it starts on a checksum word boundary.
    let (old, new) = if (opt_offset - tcp_offset) % 2 == 0 {
        (u16::from_be_bytes([b0, b1]), 0x0101)
    } else {
        (u16::from_be_bytes([b1, b0]), 0x0101)
    };
    update_cksum_u16(mbuf, tcp_offset, old, new)
}
