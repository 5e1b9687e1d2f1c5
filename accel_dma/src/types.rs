//! Addressing and completion status types.
//!
//! Status codes are split by direction, matching what the transport reports:
//! the receive side can observe `NotStarted` (nothing has arrived yet for the
//! tracked registration), the send side can observe `PageFault` (the local
//! buffer failed translation).

use std::fmt;

use crate::error::{Error, Result};

/// The node every endpoint lives on. Multi-node routing is reserved.
pub const LOCAL_NODE: u64 = 0;

/// Logical address of an endpoint: a port on a node.
///
/// A port is only meaningful relative to its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    /// Node identifier. Always [`LOCAL_NODE`] for the current topologies.
    pub node: u64,
    /// Port on the node.
    pub port: u16,
}

impl EndpointAddress {
    /// Create an address on an explicit node.
    pub const fn new(node: u64, port: u16) -> Self {
        Self { node, port }
    }

    /// Create an address on the local node.
    pub const fn local(port: u16) -> Self {
        Self {
            node: LOCAL_NODE,
            port,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.node, self.port)
    }
}

/// Which side of the endpoint moves bytes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local buffer to remote endpoint (left to right).
    Put,
    /// Remote endpoint to local buffer (right to left).
    Get,
}

/// Segment layout of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// One unstrided segment.
    Contiguous,
    /// Contiguous source fanned out to strided destination segments.
    Scatter,
    /// Strided source segments collected into one contiguous destination.
    Gather,
}

/// Terminal outcome of a tracked operation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success = 0,
    PageFault = 2,
    Nack = 3,
    NoRoute = 4,
}

impl Outcome {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            2 => Some(Self::PageFault),
            3 => Some(Self::Nack),
            4 => Some(Self::NoRoute),
            _ => None,
        }
    }

    /// Convert into `Ok(())` for success, or the matching transfer error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::PageFault => Err(Error::PageFault),
            Self::Nack => Err(Error::Nack),
            Self::NoRoute => Err(Error::NoRoute),
        }
    }
}

/// Status of the tracked inbound transfer or immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvStatus {
    /// Nothing has arrived for the armed registration (or nothing is armed).
    NotStarted,
    /// A matching transfer is in flight.
    NotFinished,
    /// The transfer was rejected.
    Nack,
    /// The route to this endpoint went away while armed.
    NoRoute,
    Success,
}

impl RecvStatus {
    /// `true` for every status except `NotStarted` and `NotFinished`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::NotFinished)
    }

    /// Packed integer code reported by test drivers.
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::NotStarted => 1,
            Self::NotFinished => 5,
            Self::Nack => 3,
            Self::NoRoute => 4,
        }
    }

    /// Convert a terminal status into a result.
    ///
    /// Non-terminal statuses are reported as `Ok(false)`.
    pub fn into_result(self) -> Result<bool> {
        match self {
            Self::Success => Ok(true),
            Self::NotStarted | Self::NotFinished => Ok(false),
            Self::Nack => Err(Error::Nack),
            Self::NoRoute => Err(Error::NoRoute),
        }
    }
}

impl From<Outcome> for RecvStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            // A receive never translates a local buffer; a fault seen by the
            // receiving side means the sender was refused.
            Outcome::PageFault | Outcome::Nack => Self::Nack,
            Outcome::NoRoute => Self::NoRoute,
        }
    }
}

/// Status of the operations issued from this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    /// At least one issued operation is still outstanding.
    NotFinished,
    /// A local buffer failed translation.
    PageFault,
    /// The remote endpoint rejected the operation.
    Nack,
    /// The remote endpoint is unreachable.
    NoRoute,
    Success,
}

impl SendStatus {
    /// `true` for every status except `NotFinished`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotFinished)
    }

    /// Packed integer code reported by test drivers.
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::NotFinished => 5,
            Self::PageFault => 2,
            Self::Nack => 3,
            Self::NoRoute => 4,
        }
    }

    /// Convert into `Ok(true)` on success, `Ok(false)` while outstanding,
    /// or the matching transfer error.
    pub fn into_result(self) -> Result<bool> {
        match self {
            Self::Success => Ok(true),
            Self::NotFinished => Ok(false),
            Self::PageFault => Err(Error::PageFault),
            Self::Nack => Err(Error::Nack),
            Self::NoRoute => Err(Error::NoRoute),
        }
    }
}

impl From<Outcome> for SendStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::PageFault => Self::PageFault,
            Outcome::Nack => Self::Nack,
            Outcome::NoRoute => Self::NoRoute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_partition() {
        assert!(!RecvStatus::NotStarted.is_terminal());
        assert!(!RecvStatus::NotFinished.is_terminal());
        assert!(RecvStatus::Nack.is_terminal());
        assert!(RecvStatus::NoRoute.is_terminal());
        assert!(RecvStatus::Success.is_terminal());

        assert!(!SendStatus::NotFinished.is_terminal());
        assert!(SendStatus::PageFault.is_terminal());
        assert!(SendStatus::Success.is_terminal());
    }

    #[test]
    fn test_outcome_roundtrip_through_u8() {
        for outcome in [
            Outcome::Success,
            Outcome::PageFault,
            Outcome::Nack,
            Outcome::NoRoute,
        ] {
            assert_eq!(Outcome::from_u8(outcome as u8), Some(outcome));
        }
        assert_eq!(Outcome::from_u8(1), None);
    }

    #[test]
    fn test_send_status_result() {
        assert!(matches!(SendStatus::Success.into_result(), Ok(true)));
        assert!(matches!(SendStatus::NotFinished.into_result(), Ok(false)));
        assert!(matches!(SendStatus::PageFault.into_result(), Err(Error::PageFault)));
        assert!(matches!(SendStatus::NoRoute.into_result(), Err(Error::NoRoute)));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(EndpointAddress::local(1000).to_string(), "0:1000");
        assert_eq!(EndpointAddress::new(0x2a, 7).to_string(), "2a:7");
    }
}
