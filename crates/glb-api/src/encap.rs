// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Constants of the GUE envelope and the GLB chained-routing data it
//! carries.

/// The UDP destination port every GUE-encapsulated datagram is sent
/// to.
pub const GUE_PORT: u16 = 19523;

/// The only GUE header variant we speak.
pub const GUE_VERSION: u8 = 0;

/// GUE `proto` value for an encapsulated IPv4 packet.
pub const GUE_PROTO_IPV4: u8 = 4;

/// GUE `proto` value for an encapsulated IPv6 packet.
pub const GUE_PROTO_IPV6: u8 = 41;

/// The private data type identifying a GLB hop chain.
pub const GLB_PRIVATE_TYPE: u16 = 0;

/// The largest number of hops a chain can carry.
///
/// The GUE `hlen` field is five bits of 32-bit words, which caps the
/// private data at 124 bytes: a 4-byte chain header plus 30 IPv4
/// hops. IPv6 chains hit the same wall much sooner, see
/// [`max_hops_for`].
pub const MAX_HOPS: usize = 30;

/// The default hop limit applied when a node does not configure one.
pub const DEF_MAX_HOPS: u8 = 16;

/// The TTL/hop limit stamped on every outer header we originate.
pub const DEFAULT_TTL: u8 = 64;

/// Largest size of the GUE optional data, in bytes.
pub const GUE_MAX_OPT_LEN: usize = 0x1F * 4;

/// The most hops of the given address length that fit in a chain.
pub const fn max_hops_for(addr_len: usize) -> usize {
    let fit = (GUE_MAX_OPT_LEN - 4) / addr_len;
    if fit < MAX_HOPS { fit } else { MAX_HOPS }
}
