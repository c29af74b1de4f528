// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// An argument is out of range or malformed.
    InvalidArgs,
    /// The resource is already claimed.
    Busy,
    /// No more IDs are available from an allocator.
    NotEnoughResources,
    /// A deferred-work record does not fit in the per-CPU buffer.
    WorkOverflow,
    /// The pipeline has not been initialized with [`Pipeline::init`].
    ///
    /// [`Pipeline::init`]: crate::Pipeline::init
    Uninitialized,
}
