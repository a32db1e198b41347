use std::ops;

/// Per-operation behaviour flags.
///
/// Combined with `|`, e.g. `Flags::WAIT_ALL | Flags::REALTIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Keep a read or write pending until the full transaction size has
    /// been transferred.
    pub const WAIT_ALL: Flags = Flags(1);
    /// The caller guarantees the buffer stays put; no internal copy is
    /// made.
    pub const NO_COPY: Flags = Flags(2);
    /// Use a precise kernel timer for the timeout instead of the coarse
    /// per-loop sweep, and bypass the synchronous-completion budget.
    pub const REALTIME: Flags = Flags(4);
    /// One-shot semantics for recurring event sources.
    pub const ACTIVE_ONCE: Flags = Flags(8);
    /// Never invoke the completion callback inline on the submitting
    /// thread; always go through the finish queue.
    pub const SERIALIZED: Flags = Flags(16);
    /// Internal bookkeeping; set by the loop while an operation is being
    /// driven.
    pub const RUNNING: Flags = Flags(32);

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl Default for Flags {
    fn default() -> Flags {
        Flags::NONE
    }
}
