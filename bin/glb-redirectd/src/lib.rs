// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The GLB redirect daemon: configuration, the raw-socket transport,
//! the service loop, and offline capture tools.

pub mod config;
pub mod daemon;
pub mod decode;
pub mod net;
