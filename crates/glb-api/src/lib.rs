// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the redirect engine, its daemon, and anything
//! that wants to talk about flows and hops without pulling in the
//! packet processing code.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod encap;
pub mod flow;
pub mod ip;
pub mod oracle;

pub use encap::*;
pub use flow::*;
pub use ip::*;
pub use oracle::*;
