//! The filesystem glue collaborator (§2 component 4, §1 Non-goals).
//!
//! A full filesystem is explicitly out of scope for this crate; the
//! supervisor only needs something it can tell to mount or unmount in
//! response to card-detect transitions (§4.6). This module specifies that
//! boundary as a trait and nothing else — no directory, file or FAT logic
//! lives here.

/// What the supervisor calls on card insertion and removal.
///
/// A real binding wraps a FAT (or other) filesystem crate's volume-mount
/// entry points; this crate only ever calls `mount`/`unmount` from inside a
/// dispatch cycle, so an implementation that itself calls back into
/// [`crate::supervisor::Supervisor::touch`] is safe — that call is
/// recognized as re-entrant and returns immediately.
pub trait Filesystem {
    /// Error type for a failed mount/unmount.
    type Error: core::fmt::Debug;

    /// Mount the filesystem found on the card.
    fn mount(&self) -> Result<(), Self::Error>;

    /// Unmount the filesystem, e.g. on card removal.
    fn unmount(&self) -> Result<(), Self::Error>;
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
