//! Error types for accel_dma.

use std::io;

use crate::types::EndpointAddress;

/// Transport errors.
///
/// `PageFault`, `Nack` and `NoRoute` are the terminal transfer outcomes and are
/// never retried by the engine; everything else is a usage or lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A local buffer address could not be translated.
    #[error("page fault: local buffer is not translatable")]
    PageFault,
    /// The remote endpoint rejected the operation.
    #[error("remote endpoint rejected the operation (NACK)")]
    Nack,
    /// The remote endpoint is unreachable.
    #[error("no route to remote endpoint")]
    NoRoute,
    /// This context already has a bound address.
    #[error("context is already bound to {0}")]
    AlreadyBound(EndpointAddress),
    /// The operation requires a bound address.
    #[error("context has no bound address")]
    NotBound,
    /// Another context holds the address.
    #[error("address {0} is bound by another context")]
    AddressInUse(EndpointAddress),
    /// A receive tracking registration is still unresolved.
    #[error("a receive tracking registration is already armed")]
    AlreadyArmed,
    /// The transfer descriptor failed validation.
    #[error("invalid transfer descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    /// The transfer engine has shut down.
    #[error("transfer engine is disconnected")]
    Disconnected,
    /// IO error from the host environment.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// `true` for the terminal transfer outcomes reported by the transport.
    pub fn is_transfer_error(&self) -> bool {
        matches!(self, Error::PageFault | Error::Nack | Error::NoRoute)
    }
}

/// Descriptor validation failures, detected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("segment count must be at least 1")]
    ZeroSegments,
    #[error("contiguous transfers have exactly one segment, got {0}")]
    ContiguousSegments(usize),
    #[error("contiguous transfers cannot be strided")]
    ContiguousStride,
    #[error("scatter transfers read a contiguous source, got source stride {0}")]
    ScatterSourceStride(usize),
    #[error("gather transfers write a contiguous destination, got destination stride {0}")]
    GatherDestinationStride(usize),
    #[error("transfer footprint overflows the address space")]
    Overflow,
}

/// Result type for accel_dma operations.
pub type Result<T> = std::result::Result<T, Error>;
