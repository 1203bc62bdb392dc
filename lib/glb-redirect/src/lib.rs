// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The GLB redirect engine.
//!
//! Packets arrive GUE-encapsulated with a chain of candidate owners
//! attached. The engine decides, per packet, whether this node
//! terminates the carried connection, whether to pass it down the
//! chain, or whether to hand an unresolvable ICMP error back to the
//! node that sent it. See [`engine::redirect`] for the decision
//! itself.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use glb_api as api;

pub mod d_error;
pub mod engine;
pub mod print;
pub mod sync;
pub mod time;
