//! Transfer descriptors.
//!
//! A descriptor encodes the shape of a transfer: segment size, per-side stride,
//! segment count, remote endpoint and direction. Construction validates the
//! shape eagerly, so the engine never sees an inconsistent descriptor.
//!
//! Strides count the bytes *skipped* between the end of one segment and the
//! start of the next. Segment `i` of a side starts at
//! `base + i * (segment_size + stride)`:
//!
//! ```text
//! gather (src strided, dst contiguous), count = 3
//!
//! src: [seg0]....[seg1]....[seg2]        stride = 4 ("....")
//! dst: [seg0][seg1][seg2]
//! ```
//!
//! A contiguous transfer is the one-segment, zero-stride special case; all
//! convenience constructors route through [`TransferDescriptor::new`].

use crate::error::DescriptorError;
use crate::types::{Direction, EndpointAddress, Shape};

/// Validated description of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    segment_size: usize,
    src_stride: usize,
    dst_stride: usize,
    segment_count: usize,
    remote: EndpointAddress,
    direction: Direction,
    shape: Shape,
    src_span: usize,
    dst_span: usize,
}

/// One segment of a transfer, as offsets from the source and destination bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub len: usize,
}

/// Bytes spanned by `count` segments of `size` bytes separated by `stride`.
fn footprint(size: usize, stride: usize, count: usize) -> Option<usize> {
    let body = size.checked_mul(count)?;
    let gaps = stride.checked_mul(count - 1)?;
    body.checked_add(gaps)
}

impl TransferDescriptor {
    /// Canonical constructor. Every other constructor goes through here.
    ///
    /// # Errors
    /// Returns a [`DescriptorError`] if the strides or count are inconsistent
    /// with `shape`, or the footprint does not fit in `usize`.
    pub fn new(
        remote: EndpointAddress,
        direction: Direction,
        shape: Shape,
        segment_size: usize,
        src_stride: usize,
        dst_stride: usize,
        segment_count: usize,
    ) -> Result<Self, DescriptorError> {
        if segment_count == 0 {
            return Err(DescriptorError::ZeroSegments);
        }
        match shape {
            Shape::Contiguous => {
                if segment_count != 1 {
                    return Err(DescriptorError::ContiguousSegments(segment_count));
                }
                if src_stride != 0 || dst_stride != 0 {
                    return Err(DescriptorError::ContiguousStride);
                }
            }
            Shape::Scatter => {
                if src_stride != 0 {
                    return Err(DescriptorError::ScatterSourceStride(src_stride));
                }
            }
            Shape::Gather => {
                if dst_stride != 0 {
                    return Err(DescriptorError::GatherDestinationStride(dst_stride));
                }
            }
        }

        let src_span =
            footprint(segment_size, src_stride, segment_count).ok_or(DescriptorError::Overflow)?;
        let dst_span =
            footprint(segment_size, dst_stride, segment_count).ok_or(DescriptorError::Overflow)?;

        Ok(Self {
            segment_size,
            src_stride,
            dst_stride,
            segment_count,
            remote,
            direction,
            shape,
            src_span,
            dst_span,
        })
    }

    /// Start building a descriptor targeting `remote`.
    pub fn builder(remote: EndpointAddress) -> DescriptorBuilder {
        DescriptorBuilder::new(remote)
    }

    /// Single-segment transfer of `len` bytes.
    pub fn contiguous(
        remote: EndpointAddress,
        direction: Direction,
        len: usize,
    ) -> Result<Self, DescriptorError> {
        Self::new(remote, direction, Shape::Contiguous, len, 0, 0, 1)
    }

    pub fn contiguous_put(remote: EndpointAddress, len: usize) -> Result<Self, DescriptorError> {
        Self::contiguous(remote, Direction::Put, len)
    }

    pub fn contiguous_get(remote: EndpointAddress, len: usize) -> Result<Self, DescriptorError> {
        Self::contiguous(remote, Direction::Get, len)
    }

    /// Local contiguous buffer fanned out to strided remote segments.
    pub fn scatter_put(
        remote: EndpointAddress,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<Self, DescriptorError> {
        Self::new(
            remote,
            Direction::Put,
            Shape::Scatter,
            segment_size,
            0,
            stride,
            segment_count,
        )
    }

    /// Strided local segments collected into a contiguous remote buffer.
    pub fn gather_put(
        remote: EndpointAddress,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<Self, DescriptorError> {
        Self::new(
            remote,
            Direction::Put,
            Shape::Gather,
            segment_size,
            stride,
            0,
            segment_count,
        )
    }

    /// Contiguous remote buffer fanned out to strided local segments.
    pub fn scatter_get(
        remote: EndpointAddress,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<Self, DescriptorError> {
        Self::new(
            remote,
            Direction::Get,
            Shape::Scatter,
            segment_size,
            0,
            stride,
            segment_count,
        )
    }

    /// Strided remote segments collected into a contiguous local buffer.
    pub fn gather_get(
        remote: EndpointAddress,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<Self, DescriptorError> {
        Self::new(
            remote,
            Direction::Get,
            Shape::Gather,
            segment_size,
            stride,
            0,
            segment_count,
        )
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn src_stride(&self) -> usize {
        self.src_stride
    }

    pub fn dst_stride(&self) -> usize {
        self.dst_stride
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn remote(&self) -> EndpointAddress {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Total payload bytes: `segment_size * segment_count`.
    pub fn total_bytes(&self) -> usize {
        // Cannot overflow: bounded by the validated footprint.
        self.segment_size * self.segment_count
    }

    /// Bytes spanned on the source side, strides included.
    pub fn src_span(&self) -> usize {
        self.src_span
    }

    /// Bytes spanned on the destination side, strides included.
    pub fn dst_span(&self) -> usize {
        self.dst_span
    }

    /// Span of the local buffer: the source of a PUT, the destination of a GET.
    pub fn local_span(&self) -> usize {
        match self.direction {
            Direction::Put => self.src_span,
            Direction::Get => self.dst_span,
        }
    }

    /// Span of the remote buffer: the destination of a PUT, the source of a GET.
    pub fn remote_span(&self) -> usize {
        match self.direction {
            Direction::Put => self.dst_span,
            Direction::Get => self.src_span,
        }
    }

    /// Iterate over the segments in issue order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        // Offsets stay within the validated spans for every index.
        (0..self.segment_count).map(move |i| Segment {
            src_offset: i * self.segment_size + i * self.src_stride,
            dst_offset: i * self.segment_size + i * self.dst_stride,
            len: self.segment_size,
        })
    }
}

/// Step-by-step construction of a [`TransferDescriptor`].
///
/// ```ignore
/// let desc = TransferDescriptor::builder(remote)
///     .get()
///     .scatter(128, 384, 32)
///     .build()?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBuilder {
    remote: EndpointAddress,
    direction: Direction,
    shape: Shape,
    segment_size: usize,
    stride: usize,
    segment_count: usize,
}

impl DescriptorBuilder {
    fn new(remote: EndpointAddress) -> Self {
        Self {
            remote,
            direction: Direction::Put,
            shape: Shape::Contiguous,
            segment_size: 0,
            stride: 0,
            segment_count: 1,
        }
    }

    /// Move bytes from the local buffer to the remote endpoint (default).
    pub fn put(mut self) -> Self {
        self.direction = Direction::Put;
        self
    }

    /// Move bytes from the remote endpoint into the local buffer.
    pub fn get(mut self) -> Self {
        self.direction = Direction::Get;
        self
    }

    pub fn contiguous(mut self, len: usize) -> Self {
        self.shape = Shape::Contiguous;
        self.segment_size = len;
        self.stride = 0;
        self.segment_count = 1;
        self
    }

    pub fn scatter(mut self, segment_size: usize, stride: usize, segment_count: usize) -> Self {
        self.shape = Shape::Scatter;
        self.segment_size = segment_size;
        self.stride = stride;
        self.segment_count = segment_count;
        self
    }

    pub fn gather(mut self, segment_size: usize, stride: usize, segment_count: usize) -> Self {
        self.shape = Shape::Gather;
        self.segment_size = segment_size;
        self.stride = stride;
        self.segment_count = segment_count;
        self
    }

    pub fn build(self) -> Result<TransferDescriptor, DescriptorError> {
        let (src_stride, dst_stride) = match self.shape {
            Shape::Contiguous => (0, 0),
            Shape::Scatter => (0, self.stride),
            Shape::Gather => (self.stride, 0),
        };
        TransferDescriptor::new(
            self.remote,
            self.direction,
            self.shape,
            self.segment_size,
            src_stride,
            dst_stride,
            self.segment_count,
        )
    }
}
