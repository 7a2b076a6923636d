//! Packet buffer manipulation.
//!
//! ## Remarks
//! An `Mbuf` holds a single packet starting at the IPv4 header; link-layer
//! framing is handled before packets reach this crate. The buffer is owned,
//! so payload resizing grows or shrinks it in place. An annotation area rides
//! along with the bytes and carries the per-packet metadata the middlebox
//! writes for downstream elements.
//!
//! The accessor surface is adapted from
//! [capsule::Mbuf](https://docs.rs/capsule/0.1.5/capsule/struct.Mbuf.html).

use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};

use std::fmt;

use anyhow::{bail, Result};
use thiserror::Error;

/// Per-packet annotation area.
///
/// `initial_ack` preserves the acknowledgment number as it arrived, before
/// any rewriting; `content_offset` is the offset of the TCP payload from the
/// start of the buffer. Both are written by the ingress gate on the resize
/// path. The remaining flag bytes are reserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct Annotations {
    pub initial_ack: u32,
    pub content_offset: u16,
    pub last_useful: bool,
    pub flags: [u8; 5],
}

/// A packet buffer.
#[derive(Clone)]
pub struct Mbuf {
    data: Vec<u8>,
    ann: Annotations,
}

impl Mbuf {
    /// Creates a new Mbuf from a byte slice.
    pub fn from_bytes(data: &[u8]) -> Mbuf {
        Mbuf {
            data: data.to_vec(),
            ann: Annotations::default(),
        }
    }

    /// Returns the length of the data in the Mbuf.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Returns the contents of the Mbuf as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a byte slice of data with length count at offset.
    ///
    /// Errors if `offset` is greater than or equal to the buffer length or
    /// `count` exceeds the size of the data stored at `offset`.
    pub fn get_data_slice(&self, offset: usize, count: usize) -> Result<&[u8]> {
        if offset < self.data_len() {
            if offset + count <= self.data_len() {
                Ok(&self.data[offset..offset + count])
            } else {
                bail!(MbufError::ReadPastBuffer)
            }
        } else {
            bail!(MbufError::BadOffset)
        }
    }

    /// Returns a mutable byte slice of data with length count at offset.
    pub fn get_data_slice_mut(&mut self, offset: usize, count: usize) -> Result<&mut [u8]> {
        if offset < self.data_len() {
            if offset + count <= self.data_len() {
                Ok(&mut self.data[offset..offset + count])
            } else {
                bail!(MbufError::WritePastBuffer)
            }
        } else {
            bail!(MbufError::BadOffset)
        }
    }

    /// Reads the data at `offset` as `T` and returns it as a raw pointer. Errors if `offset` is
    /// greater than or equal to the buffer length or the size of `T` exceeds the size of the data
    /// stored at `offset`.
    pub(crate) fn get_data<T: PacketHeader>(&self, offset: usize) -> Result<*const T> {
        if offset < self.data_len() {
            if offset + T::size_of() <= self.data_len() {
                Ok(self.data[offset..].as_ptr() as *const T)
            } else {
                bail!(MbufError::ReadPastBuffer)
            }
        } else {
            bail!(MbufError::BadOffset)
        }
    }

    /// Removes `count` bytes at `offset`, shrinking the buffer.
    pub(crate) fn remove_bytes(&mut self, offset: usize, count: usize) -> Result<()> {
        if offset + count > self.data_len() {
            bail!(MbufError::ReadPastBuffer)
        }
        self.data.drain(offset..offset + count);
        Ok(())
    }

    /// Inserts `count` zeroed bytes at `offset`, growing the buffer.
    pub(crate) fn insert_bytes(&mut self, offset: usize, count: usize) -> Result<()> {
        if offset > self.data_len() {
            bail!(MbufError::BadOffset)
        }
        self.data.splice(offset..offset, std::iter::repeat(0u8).take(count));
        Ok(())
    }

    /// Returns the annotation area.
    pub fn ann(&self) -> &Annotations {
        &self.ann
    }

    /// Returns the mutable annotation area.
    pub fn ann_mut(&mut self) -> &mut Annotations {
        &mut self.ann
    }
}

impl<'a> Packet<'a> for Mbuf {
    fn mbuf(&self) -> &Mbuf {
        self
    }

    fn header_len(&self) -> usize {
        0
    }

    fn next_header_offset(&self) -> usize {
        0
    }

    fn next_header(&self) -> Option<usize> {
        None
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        // parse_from should never be called for Mbuf.
        bail!(PacketParseError::InvalidProtocol)
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("data_len", &self.data_len())
            .field("content_offset", &self.ann.content_offset)
            .finish()
    }
}

// displays the actual packet data of the frame
impl fmt::Display for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (byte, value) in self.data.iter().enumerate() {
            write!(f, "{:02x} ", value)?;
            if byte % 16 == 15 {
                writeln!(f,)?;
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub(crate) enum MbufError {
    #[error("Offset exceeds Mbuf buffer length")]
    BadOffset,

    #[error("Data read exceeds Mbuf buffer")]
    ReadPastBuffer,

    #[error("Data write exceeds Mbuf buffer")]
    WritePastBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_mbuf_resize() {
        let mut mbuf = Mbuf::from_bytes(&[1, 2, 3, 4, 5, 6]);
        mbuf.remove_bytes(2, 2).unwrap();
        assert_eq!(mbuf.data(), &[1, 2, 5, 6]);
        mbuf.insert_bytes(1, 3).unwrap();
        assert_eq!(mbuf.data(), &[1, 0, 0, 0, 2, 5, 6]);
        assert!(mbuf.remove_bytes(5, 10).is_err());
    }

    #[test]
    fn core_mbuf_slices() {
        let mbuf = Mbuf::from_bytes(&[0xab; 32]);
        assert_eq!(mbuf.get_data_slice(16, 16).unwrap().len(), 16);
        assert!(mbuf.get_data_slice(16, 17).is_err());
        assert!(mbuf.get_data_slice(32, 1).is_err());
    }
}
