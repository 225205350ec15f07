//! Payload and offset-table buffers, and their normalization into
//! stable-addressed views.
//!
//! A buffer is *stable* when it lives in a dedicated allocation that neither
//! moves nor is freed while a native call holds its address ([`StableBuf`],
//! memory-mapped device regions). Anything else is *staged*: its bytes are
//! copied into the calling thread's scratch buffer for the duration of the
//! call.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut, Range};
use std::ptr::NonNull;

use tracing::trace;

use crate::error::{ArgumentError, Result};
use crate::scratch::Scratch;

/// Size in bytes of a native pointer, and of every offset-table entry.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Alignment of every [`StableBuf`] allocation.
pub const STABLE_ALIGN: usize = 16;

/// Byte order of an offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    #[cfg(target_endian = "little")]
    pub const NATIVE: ByteOrder = ByteOrder::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: ByteOrder = ByteOrder::Big;
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => f.write_str("little-endian"),
            ByteOrder::Big => f.write_str("big-endian"),
        }
    }
}

/// Memory whose address stays fixed for as long as it is borrowed.
///
/// No alignment is promised: a mapping at an unaligned file offset, or a
/// [`Payload::stable_window`] into a buffer, may start at any byte.
/// Relocation writes pointers byte by byte, so holes need no alignment.
///
/// # Safety
///
/// Implementors guarantee that the returned slices cover memory owned by
/// the implementor that is not moved, resized or freed while borrowed, and
/// that both methods return the same address and length.
pub unsafe trait StableMemory {
    fn stable_bytes(&self) -> &[u8];
    fn stable_bytes_mut(&mut self) -> &mut [u8];
}

#[repr(align(16))]
struct Align;

/// Owned, zero-initialised, fixed-size buffer with a stable address.
///
/// Never reallocates, so it can be handed straight to the native layer.
pub struct StableBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: StableBuf uniquely owns its allocation.
unsafe impl Send for StableBuf {}
unsafe impl Sync for StableBuf {}

impl StableBuf {
    /// Allocate `len` zeroed bytes aligned to [`STABLE_ALIGN`].
    pub fn new(len: usize) -> Self {
        if len == 0 {
            return Self {
                ptr: NonNull::<Align>::dangling().cast(),
                len: 0,
            };
        }
        let layout = Self::layout(len);
        // Safety: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.copy_from_slice(data);
        buf
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, STABLE_ALIGN).unwrap_or_else(|_| {
            panic!("stable buffer of {} bytes exceeds the address space", len)
        })
    }
}

impl Deref for StableBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: ptr is valid for len initialised bytes (or dangling with len 0).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for StableBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self gives unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for StableBuf {
    fn drop(&mut self) {
        if self.len != 0 {
            // Safety: allocated in `new` with the same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) }
        }
    }
}

impl fmt::Debug for StableBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StableBuf")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

unsafe impl StableMemory for StableBuf {
    fn stable_bytes(&self) -> &[u8] {
        self
    }

    fn stable_bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

// Mappings are page aligned and stay put until unmapped on drop.
unsafe impl StableMemory for memmap2::MmapMut {
    fn stable_bytes(&self) -> &[u8] {
        self
    }

    fn stable_bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// The data handed to a structured ioctl: one C struct image with
/// pointer-width holes.
#[derive(Debug)]
pub struct Payload<'a> {
    inner: PayloadInner<'a>,
}

#[derive(Debug)]
enum PayloadInner<'a> {
    Stable(&'a mut [u8]),
    Staged(&'a mut [u8]),
}

impl<'a> Payload<'a> {
    /// Use stable memory in place, no copy.
    pub fn stable<M: StableMemory + ?Sized>(mem: &'a mut M) -> Self {
        Self {
            inner: PayloadInner::Stable(mem.stable_bytes_mut()),
        }
    }

    /// Use only `range` of a stable buffer. The native layer sees byte
    /// `range.start` as byte 0 and all offsets are relative to it. The
    /// window keeps the buffer's address but not its alignment.
    pub fn stable_window<M: StableMemory + ?Sized>(
        mem: &'a mut M,
        range: Range<usize>,
    ) -> Result<Self> {
        let bytes = mem.stable_bytes_mut();
        let len = bytes.len();
        if range.start > range.end || range.end > len {
            return Err(ArgumentError::Window {
                start: range.start,
                end: range.end,
                len,
            }
            .into());
        }
        Ok(Self {
            inner: PayloadInner::Stable(&mut bytes[range]),
        })
    }

    /// Stage ordinary memory through the thread scratch buffer. The driver's
    /// response is copied back into `buf` after a successful call.
    pub fn staged(buf: &'a mut [u8]) -> Self {
        Self {
            inner: PayloadInner::Staged(buf),
        }
    }

    /// Number of bytes the native layer will see.
    pub fn len(&self) -> usize {
        match &self.inner {
            PayloadInner::Stable(b) | PayloadInner::Staged(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stable(&self) -> bool {
        matches!(self.inner, PayloadInner::Stable(_))
    }
}

impl<'a> From<&'a mut [u8]> for Payload<'a> {
    fn from(buf: &'a mut [u8]) -> Self {
        Payload::staged(buf)
    }
}

impl<'a> From<&'a mut Vec<u8>> for Payload<'a> {
    fn from(buf: &'a mut Vec<u8>) -> Self {
        Payload::staged(buf.as_mut_slice())
    }
}

impl<'a> From<&'a mut StableBuf> for Payload<'a> {
    fn from(buf: &'a mut StableBuf) -> Self {
        Payload::stable(buf)
    }
}

/// Relocation pairs `(hole, target)` as pointer-width signed integers.
#[derive(Debug, Clone, Copy)]
pub struct OffsetTable<'a> {
    source: TableSource<'a>,
    order: ByteOrder,
}

#[derive(Debug, Clone, Copy)]
enum TableSource<'a> {
    Words(&'a [isize]),
    Bytes(&'a [u8]),
    Stable(&'a [u8]),
}

impl<'a> OffsetTable<'a> {
    /// Native words, staged through the offsets scratch buffer.
    pub fn new(words: &'a [isize]) -> Self {
        Self {
            source: TableSource::Words(words),
            order: ByteOrder::NATIVE,
        }
    }

    /// An empty table: a structured call with nothing to relocate.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Raw bytes holding words in `order`, staged through scratch.
    pub fn from_bytes(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self {
            source: TableSource::Bytes(bytes),
            order,
        }
    }

    /// Words held in stable memory, used in place.
    pub fn stable<M: StableMemory + ?Sized>(mem: &'a M, order: ByteOrder) -> Self {
        Self {
            source: TableSource::Stable(mem.stable_bytes()),
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Check byte order, word framing and pair parity. Runs before any
    /// buffer is normalized.
    pub fn check_shape(&self) -> Result<usize> {
        if self.order != ByteOrder::NATIVE {
            return Err(ArgumentError::ByteOrder {
                requested: self.order,
                native: ByteOrder::NATIVE,
            }
            .into());
        }
        let count = match self.source {
            TableSource::Words(w) => w.len(),
            TableSource::Bytes(b) | TableSource::Stable(b) => {
                if b.len() % WORD_SIZE != 0 {
                    return Err(ArgumentError::RaggedOffsets {
                        len: b.len(),
                        word_size: WORD_SIZE,
                    }
                    .into());
                }
                b.len() / WORD_SIZE
            }
        };
        if count % 2 != 0 {
            return Err(ArgumentError::OddOffsetCount { count }.into());
        }
        Ok(count)
    }

    fn byte_len(&self) -> usize {
        match self.source {
            TableSource::Words(w) => w.len() * WORD_SIZE,
            TableSource::Bytes(b) | TableSource::Stable(b) => b.len(),
        }
    }
}

impl<'a> From<&'a [isize]> for OffsetTable<'a> {
    fn from(words: &'a [isize]) -> Self {
        OffsetTable::new(words)
    }
}

/// A validated-shape relocation table in native byte order.
#[derive(Debug, Clone, Copy)]
pub struct Relocations<'a> {
    bytes: &'a [u8],
}

impl<'a> Relocations<'a> {
    /// Number of `(hole, target)` pairs.
    pub fn pairs_len(&self) -> usize {
        self.bytes.len() / (2 * WORD_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Iterate `(hole, target)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (isize, isize)> + 'a {
        self.bytes.chunks_exact(2 * WORD_SIZE).map(|pair| {
            let (hole, target) = pair.split_at(WORD_SIZE);
            (read_word(hole), read_word(target))
        })
    }

    /// Raw table bytes, as the native layer receives them.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

fn read_word(bytes: &[u8]) -> isize {
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(bytes);
    isize::from_ne_bytes(word)
}

/// Produce the stable relocation table for `table`, staging it in `scratch`
/// unless it already lives in stable memory.
pub(crate) fn normalize_table<'b>(
    table: &OffsetTable<'b>,
    scratch: &'b mut Scratch,
) -> Result<Relocations<'b>> {
    let bytes: &'b [u8] = match table.source {
        TableSource::Stable(b) => b,
        TableSource::Bytes(b) => {
            let staged = scratch.stage(b.len())?;
            staged.copy_from_slice(b);
            staged
        }
        TableSource::Words(w) => {
            let staged = scratch.stage(table.byte_len())?;
            for (dst, word) in staged.chunks_exact_mut(WORD_SIZE).zip(w) {
                dst.copy_from_slice(&word.to_ne_bytes());
            }
            staged
        }
    };
    Ok(Relocations { bytes })
}

/// A payload in stable memory, plus the caller buffer to copy results back
/// into when it had to be staged.
#[derive(Debug)]
pub(crate) struct Normalized<'b> {
    pub(crate) region: &'b mut [u8],
    origin: Option<&'b mut [u8]>,
}

impl Normalized<'_> {
    #[cfg(test)]
    pub(crate) fn is_staged(&self) -> bool {
        self.origin.is_some()
    }

    /// Copy the post-call scratch contents back to the caller's buffer.
    /// Only called after the native call succeeded.
    pub(crate) fn copy_back(self) {
        if let Some(origin) = self.origin {
            origin.copy_from_slice(self.region);
        }
    }
}

/// Produce a stable, tight view of `payload`, staging it in `scratch` when
/// the caller's memory is not stable.
pub(crate) fn normalize_payload<'b>(
    payload: Payload<'b>,
    scratch: &'b mut Scratch,
) -> Result<Normalized<'b>> {
    match payload.inner {
        PayloadInner::Stable(region) => {
            trace!(len = region.len(), "payload used in place");
            Ok(Normalized {
                region,
                origin: None,
            })
        }
        PayloadInner::Staged(origin) => {
            let region = scratch.stage(origin.len())?;
            region.copy_from_slice(origin);
            trace!(len = region.len(), "payload staged through scratch");
            Ok(Normalized {
                region,
                origin: Some(origin),
            })
        }
    }
}
