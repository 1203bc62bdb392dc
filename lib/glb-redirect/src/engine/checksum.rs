// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum (RFC 1071).
//!
//! [`Checksum`] accumulates a one's complement sum across any number
//! of byte slices, deferring the carry fold until it is finalized
//! into a [`HeaderChecksum`], the two bytes that go on the wire.
//!
//! The bytes being summed are in network order and so is the stored
//! result, which means the sum is computed over native-endian 16-bit
//! words and never byte-swapped. This is the same observation RFC
//! 1071 §1.B makes: the arithmetic works regardless of host byte
//! order as long as you don't convert in either direction.

/// The checksum as stored in a header: the one's complement of the
/// folded sum, in wire order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap checksum bytes read out of a header.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    fn from(mut csum: Checksum) -> HeaderChecksum {
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement sum.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a sum over `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::new();
        csum.add_bytes(bytes);
        csum
    }

    /// Fold `bytes` into the sum.
    ///
    /// Slices are treated as if they were concatenated only when
    /// every slice but the last has an even length, which holds for
    /// all the headers we sum.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.inner += u16::from_ne_bytes([pair[0], pair[1]]) as u32;
            self.fold_if_close();
        }

        if let [last] = chunks.remainder() {
            self.inner += u16::from_ne_bytes([*last, 0]) as u32;
        }
    }

    /// Fold the carries and return the 16-bit sum.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        self.inner as u16
    }

    // Keep a long run of additions from overflowing the accumulator.
    fn fold_if_close(&mut self) {
        if self.inner >= 0xFFFF_0000 {
            self.finalize();
        }
    }
}

impl From<HeaderChecksum> for Checksum {
    fn from(hc: HeaderChecksum) -> Self {
        Self { inner: (!u16::from_ne_bytes(hc.bytes())) as u32 }
    }
}

impl core::ops::Add for Checksum {
    type Output = Self;

    fn add(mut self, mut other: Self) -> Self {
        self.finalize();
        other.finalize();
        Self { inner: self.inner + other.inner }
    }
}

impl core::ops::AddAssign for Checksum {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rfc1071_example() {
        // The sample from RFC 1071 §3.
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        let mut csum = Checksum::compute(&bytes);
        assert_eq!(u16::from_be(csum.finalize()), 0xddf2);
    }

    #[test]
    fn ipv4_header_verifies_to_zero() {
        #[rustfmt::skip]
        let hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00,
            0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00, 0x01,
            0xc0, 0xa8, 0x00, 0xc7,
        ];
        let mut csum = Checksum::compute(&hdr);
        assert_eq!(csum.finalize(), 0xFFFF);

        let mut zeroed = hdr;
        zeroed[10..12].copy_from_slice(&[0, 0]);
        let hc = HeaderChecksum::from(Checksum::compute(&zeroed));
        assert_eq!(hc.bytes(), [0xb8, 0x61]);
    }

    #[test]
    fn split_sums_match() {
        let bytes: Vec<u8> = (0..=255).collect();
        let whole = HeaderChecksum::from(Checksum::compute(&bytes));
        let mut parts = Checksum::compute(&bytes[..100]);
        parts += Checksum::compute(&bytes[100..]);
        assert_eq!(whole, HeaderChecksum::from(parts));
    }
}
