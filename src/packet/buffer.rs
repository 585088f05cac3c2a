//! A typed window over a mutable byte buffer.
//!
//! [`Packet`] never allocates: it is a discipline over an externally-owned
//! buffer, exposing the link, network, transport and payload regions as
//! subslices. The offsets are fixed at construction from the protocol triple
//! and are monotone by construction.

use crate::error::PacketError;

use super::{L2, L3, L4};

/// Exclusive mutable view of one packet inside a reusable buffer.
pub struct Packet<'a> {
    buffer: &'a mut [u8],
    l2: L2,
    l3: L3,
    l4: L4,
    l3_offset: usize,
    l4_offset: usize,
    payload_offset: usize,
}

impl<'a> Packet<'a> {
    /// Lay out a packet with the given protocol triple and payload size at
    /// the start of `buffer`. The used region is zeroed so buffers can be
    /// reused across probes.
    pub fn new(
        buffer: &'a mut [u8],
        l2: L2,
        l3: L3,
        l4: L4,
        payload_size: usize,
    ) -> Result<Self, PacketError> {
        let l3_offset = l2.header_size();
        let l4_offset = l3_offset + l3.header_size();
        let payload_offset = l4_offset + l4.header_size();
        let total_size = payload_offset + payload_size;
        if buffer.len() < total_size {
            return Err(PacketError::BufferTooSmall {
                required: total_size,
                available: buffer.len(),
            });
        }
        let buffer = &mut buffer[..total_size];
        buffer.fill(0);
        Ok(Self {
            buffer,
            l2,
            l3,
            l4,
            l3_offset,
            l4_offset,
            payload_offset,
        })
    }

    pub fn l2_protocol(&self) -> L2 {
        self.l2
    }

    pub fn l3_protocol(&self) -> L3 {
        self.l3
    }

    pub fn l4_protocol(&self) -> L4 {
        self.l4
    }

    /// Total on-wire size, link-layer framing included.
    pub fn total_size(&self) -> usize {
        self.buffer.len()
    }

    /// Network-layer size: IP header plus everything after it.
    pub fn l3_size(&self) -> usize {
        self.buffer.len() - self.l3_offset
    }

    /// Transport-layer size: transport header plus payload.
    pub fn l4_size(&self) -> usize {
        self.buffer.len() - self.l4_offset
    }

    pub fn payload_size(&self) -> usize {
        self.buffer.len() - self.payload_offset
    }

    pub fn l2(&self) -> &[u8] {
        &self.buffer[..self.l3_offset]
    }

    pub fn l2_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.l3_offset]
    }

    pub fn l3(&self) -> &[u8] {
        &self.buffer[self.l3_offset..]
    }

    pub fn l3_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.l3_offset..]
    }

    pub fn l4(&self) -> &[u8] {
        &self.buffer[self.l4_offset..]
    }

    pub fn l4_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.l4_offset..]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.payload_offset..]
    }

    /// The finished bytes, for handing to a socket.
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer
    }
}
