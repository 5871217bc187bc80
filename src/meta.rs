//! [`Meta`]: the fused {Version, State} slot header.
//!
//! Packed as a single 32-bit word (top 2 bits state, low 30 bits version) so
//! that a [`Meta`] is exactly the size of the version half of a [`crate::key::Key`]
//! plus its reserved state bits — the two types share a bit layout by design
//! (spec §4.1), not by memory-overlay trickery.

use crate::state::{State, STATE_SHIFT};
use crate::version::Version;
use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Meta(u32);

impl Meta {
    pub(crate) const EMPTY: Meta = Meta::new(Version::INVALID, State::Empty);

    #[inline]
    pub(crate) const fn new(version: Version, state: State) -> Self {
        Meta((state.as_raw() << STATE_SHIFT) | version.as_raw())
    }

    #[inline]
    pub const fn version(self) -> Version {
        Version::from_raw(self.0)
    }

    #[inline]
    pub const fn state(self) -> State {
        State::from_raw(self.0 >> STATE_SHIFT)
    }

    #[inline]
    pub(crate) const fn with_version(self, version: Version) -> Self {
        Meta::new(version, self.state())
    }

    #[inline]
    pub(crate) const fn with_state(self, state: State) -> Self {
        Meta::new(self.version(), state)
    }
}

impl Default for Meta {
    fn default() -> Self {
        Meta::EMPTY
    }
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Meta({}, {:?})", self.state(), self.version())
    }
}
