// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flattening of nested error enums into chains of static names.
//!
//! Drop reasons are logged and counted on the hot path. Walking the
//! enum tree and collecting `&'static str` names lets us key counters
//! and log fields on the full reason (`Parse/Gue/BadVersion`) without
//! formatting anything.

use core::fmt;
use core::fmt::Display;
pub use derror_macro::DError;
use heapless::Vec as FVec;

/// A trait used for walking chains of errors which store useful data
/// in a leaf node.
pub trait DError {
    /// Provide the name of an error's discriminant.
    fn discriminant(&self) -> &'static str;

    /// Provide a reference to the next error in the chain.
    fn child(&self) -> Option<&dyn DError>;

    /// Copy data out of a leaf error.
    fn leaf_data(&self, _data: &mut [u64]) {}
}

/// The flattened names of a nested error, outermost first, plus the
/// data of its leaf.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorChain<const L: usize> {
    names: FVec<&'static str, L>,
    more: bool,
    data: [u64; 2],
}

impl<const L: usize> ErrorChain<L> {
    /// Walk `err` down to its leaf. Names past the capacity `L` are
    /// dropped and the chain is marked as truncated.
    pub fn from_err(err: &dyn DError) -> Self {
        let mut out = Self::default();
        let mut top: Option<&dyn DError> = Some(err);

        while let Some(el) = top {
            if out.names.push(el.discriminant()).is_err() {
                out.more = true;
                break;
            }

            top = el.child();
            if top.is_none() {
                el.leaf_data(&mut out.data[..]);
            }
        }

        out
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Were names discarded because the chain was too deep?
    pub fn is_truncated(&self) -> bool {
        self.more
    }

    pub fn data(&self) -> &[u64] {
        &self.data[..]
    }

    /// The innermost name that was recorded.
    pub fn leaf(&self) -> Option<&'static str> {
        self.names.last().copied()
    }
}

impl<const L: usize> Display for ErrorChain<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{name}")?;
        }

        if self.more {
            write!(f, "/...")?;
        }

        Ok(())
    }
}
