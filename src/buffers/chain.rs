//! Buffer chains with stable ordinals.
//!
//! A [`BufferChain`] is the append-only storage behind one message content.
//! Buffers are addressed by a monotonically increasing *ordinal* rather than a
//! position, so a [`FieldLocation`](super::FieldLocation) recorded while the
//! chain had 40 buffers still names the same buffer after the first 20 have
//! been released. Appending and releasing from the front are O(1).

use std::collections::VecDeque;

use super::{
    pool,
    reader::{AdvanceableReader, DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

/// A position inside a chain: the buffer's ordinal and an octet offset in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ChainPos {
    pub ordinal: u64,
    pub offset: usize,
}

impl ChainPos {
    pub const fn new(ordinal: u64, offset: usize) -> Self {
        Self { ordinal, offset }
    }
}

/// A chain of pooled buffers.
///
/// Buffers below the protect boundary are *pinned* when released from the
/// front: they leave the resident window (and its buffer count) but remain
/// addressable by ordinal, so field locators recorded by the parser stay
/// valid for the life of the chain.
#[derive(Default)]
pub struct BufferChain {
    bufs: VecDeque<pool::Buffer>,
    /// Ordinal of `bufs[0]`.
    base: u64,
    /// Ordinals below this are pinned on release instead of pooled.
    protect_below: u64,
    /// Pinned buffers, ordered by ordinal. Small: header sections only.
    pinned: Vec<(u64, pool::Buffer)>,
}

impl BufferChain {
    pub fn new() -> Self {
        Self {
            bufs: VecDeque::new(),
            base: 0,
            protect_below: 0,
            pinned: Vec::new(),
        }
    }

    /// Marks every buffer with ordinal below `ordinal` as protected. The
    /// boundary only grows.
    pub fn set_protect_below(&mut self, ordinal: u64) {
        self.protect_below = self.protect_below.max(ordinal);
    }

    /// Number of protected buffers (pinned or still resident).
    pub fn protected_count(&self) -> usize {
        self.protect_below.min(self.tail_ordinal()) as usize
    }

    /// Number of buffers currently in the chain.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Total number of valid octets across all buffers.
    pub fn octets(&self) -> usize {
        self.bufs.iter().map(pool::Buffer::len).sum()
    }

    /// Ordinal of the first buffer still held.
    pub fn head_ordinal(&self) -> u64 {
        self.base
    }

    /// Ordinal one past the last buffer; the ordinal the next push will get.
    pub fn tail_ordinal(&self) -> u64 {
        self.base + self.bufs.len() as u64
    }

    /// The position one past the last valid octet.
    pub fn end_pos(&self) -> ChainPos {
        match self.bufs.back() {
            Some(last) => ChainPos::new(self.tail_ordinal() - 1, last.len()),
            None => ChainPos::new(self.base, 0),
        }
    }

    pub fn get(&self, ordinal: u64) -> Option<&pool::Buffer> {
        match ordinal.checked_sub(self.base) {
            Some(idx) => self.bufs.get(idx as usize),
            None => self
                .pinned
                .binary_search_by_key(&ordinal, |(o, _)| *o)
                .ok()
                .map(|i| &self.pinned[i].1),
        }
    }

    /// Appends a buffer, returning its ordinal.
    pub fn push(&mut self, buf: pool::Buffer) -> u64 {
        self.bufs.push_back(buf);
        self.tail_ordinal() - 1
    }

    /// Moves every buffer of `other` onto the tail of this chain.
    pub fn append(&mut self, other: &mut BufferChain) {
        while let Some(buf) = other.bufs.pop_front() {
            other.base += 1;
            self.bufs.push_back(buf);
        }
    }

    /// Releases the front buffer, advancing the base ordinal. Protected
    /// buffers are pinned instead of returned to the pool.
    pub fn pop_front(&mut self) -> bool {
        match self.bufs.pop_front() {
            Some(buf) => {
                let ordinal = self.base;
                self.base += 1;
                if ordinal < self.protect_below {
                    self.pinned.push((ordinal, buf));
                } else {
                    pool::release(buf);
                }
                true
            }
            None => false,
        }
    }

    /// Releases every buffer with ordinal < `ordinal`. Returns how many were
    /// released.
    pub fn release_before(&mut self, ordinal: u64) -> usize {
        let mut released = 0;
        while self.base < ordinal && self.pop_front() {
            released += 1;
        }
        released
    }

    /// Takes all resident buffers out, leaving the chain empty with its base
    /// advanced. Pinned buffers stay behind.
    pub fn take(&mut self) -> BufferChain {
        let taken = BufferChain {
            bufs: std::mem::take(&mut self.bufs),
            base: self.base,
            protect_below: 0,
            pinned: Vec::new(),
        };
        self.base = taken.base + taken.bufs.len() as u64;
        taken
    }

    /// A reader anchored at `pos`.
    pub fn reader_at(&self, pos: ChainPos) -> ChainReader<'_> {
        ChainReader { chain: self, pos }
    }

    /// A reader over the whole chain.
    pub fn reader(&self) -> ChainReader<'_> {
        self.reader_at(ChainPos::new(self.base, 0))
    }

    /// A writer appending pooled buffers to the tail.
    pub fn writer(&mut self) -> ChainWriter<'_> {
        ChainWriter { chain: self }
    }
}

impl Drop for BufferChain {
    fn drop(&mut self) {
        while let Some(buf) = self.bufs.pop_front() {
            pool::release(buf);
        }
        for (_, buf) in self.pinned.drain(..) {
            pool::release(buf);
        }
    }
}

impl std::fmt::Debug for BufferChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferChain[{}..{}, {} octets]",
            self.base,
            self.tail_ordinal(),
            self.octets()
        )
    }
}

/// Cursor reading octets across buffer boundaries.
///
/// The cursor tracks `(ordinal, offset)`; advancing past the end of one buffer
/// moves to the start of the next. Reading never observes octets behind a
/// buffer's fill cursor.
#[derive(Clone)]
pub struct ChainReader<'a> {
    chain: &'a BufferChain,
    pos: ChainPos,
}

impl ChainReader<'_> {
    /// The current position.
    pub fn pos(&self) -> ChainPos {
        self.pos
    }

    /// Normalizes an end-of-buffer position to the start of the next buffer.
    fn normalize(&mut self) {
        while let Some(buf) = self.chain.get(self.pos.ordinal) {
            if self.pos.offset < buf.len() {
                break;
            }
            self.pos = ChainPos::new(self.pos.ordinal + 1, self.pos.offset - buf.len());
        }
    }
}

impl Reader for ChainReader<'_> {
    fn read(&mut self, into: &mut [u8]) -> Result<usize, DidntRead> {
        let mut read = 0;
        self.normalize();
        while read < into.len() {
            let Some(buf) = self.chain.get(self.pos.ordinal) else {
                break;
            };
            let from = &buf.as_slice()[self.pos.offset..];
            if from.is_empty() {
                break;
            }
            let n = from.len().min(into.len() - read);
            into[read..read + n].copy_from_slice(&from[..n]);
            read += n;
            self.pos.offset += n;
            self.normalize();
        }
        if read == 0 { Err(DidntRead) } else { Ok(read) }
    }

    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        if self.remaining() < into.len() {
            return Err(DidntRead);
        }
        let n = self.read(into)?;
        debug_assert_eq!(n, into.len());
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DidntRead> {
        self.normalize();
        let buf = self.chain.get(self.pos.ordinal).ok_or(DidntRead)?;
        let byte = *buf.as_slice().get(self.pos.offset).ok_or(DidntRead)?;
        self.pos.offset += 1;
        Ok(byte)
    }

    fn remaining(&self) -> usize {
        let mut total = 0;
        let mut ordinal = self.pos.ordinal;
        let mut offset = self.pos.offset;
        while let Some(buf) = self.chain.get(ordinal) {
            total += buf.len().saturating_sub(offset);
            offset = offset.saturating_sub(buf.len());
            ordinal += 1;
        }
        total
    }
}

impl AdvanceableReader for ChainReader<'_> {
    fn skip(&mut self, offset: usize) -> Result<(), DidntRead> {
        if self.remaining() < offset {
            return Err(DidntRead);
        }
        self.pos.offset += offset;
        self.normalize();
        Ok(())
    }
}

/// Writer appending octets to a chain through pooled buffers.
pub struct ChainWriter<'a> {
    chain: &'a mut BufferChain,
}

impl Writer for ChainWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, DidntWrite> {
        self.write_exact(bytes)?;
        Ok(bytes.len())
    }

    fn write_exact(&mut self, mut bytes: &[u8]) -> Result<(), DidntWrite> {
        while !bytes.is_empty() {
            let need_fresh = match self.chain.bufs.back() {
                Some(last) => last.remaining() == 0,
                None => true,
            };
            if need_fresh {
                self.chain.push(pool::alloc());
            }
            let last = self.chain.bufs.back_mut().unwrap();
            let n = last.fill_from(bytes);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BUFFER_SIZE;

    fn chain_with(octets: &[u8]) -> BufferChain {
        let mut chain = BufferChain::new();
        chain.writer().write_exact(octets).unwrap();
        chain
    }

    #[test]
    fn test_writer_spans_buffers() {
        let payload: Vec<u8> = (0..BUFFER_SIZE + 100).map(|i| i as u8).collect();
        let chain = chain_with(&payload);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.octets(), payload.len());

        let mut reader = chain.reader();
        let mut out = vec![0u8; payload.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, payload);
        assert!(!reader.can_read());
    }

    #[test]
    fn test_reader_across_boundary_byte_at_a_time() {
        let payload: Vec<u8> = (0..2 * BUFFER_SIZE).map(|i| (i % 251) as u8).collect();
        let chain = chain_with(&payload);

        let mut reader = chain.reader();
        for &expect in &payload {
            assert_eq!(reader.read_u8().unwrap(), expect);
        }
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_ordinals_stable_after_release() {
        let payload: Vec<u8> = vec![7u8; 3 * BUFFER_SIZE];
        let mut chain = chain_with(&payload);
        assert_eq!(chain.head_ordinal(), 0);

        // Read a marker from the last buffer before releasing the front.
        let marker_pos = ChainPos::new(2, 10);
        let mut reader = chain.reader_at(marker_pos);
        let before = reader.read_u8().unwrap();

        assert_eq!(chain.release_before(2), 2);
        assert_eq!(chain.head_ordinal(), 2);
        assert_eq!(chain.len(), 1);

        let mut reader = chain.reader_at(marker_pos);
        assert_eq!(reader.read_u8().unwrap(), before);
    }

    #[test]
    fn test_skip() {
        let payload: Vec<u8> = (0..BUFFER_SIZE + 50).map(|i| i as u8).collect();
        let chain = chain_with(&payload);

        let mut reader = chain.reader();
        reader.skip(BUFFER_SIZE + 10).unwrap();
        assert_eq!(reader.read_u8().unwrap(), payload[BUFFER_SIZE + 10]);
        assert!(reader.clone().skip(usize::MAX).is_err());
    }

    #[test]
    fn test_append_moves_all() {
        let mut a = chain_with(&[1, 2, 3]);
        let mut b = chain_with(&[4, 5]);
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.octets(), 5);
        // The appended buffer keeps its content but gets a new ordinal.
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_protected_buffers_stay_addressable() {
        let payload: Vec<u8> = (0..3 * BUFFER_SIZE).map(|i| (i % 249) as u8).collect();
        let mut chain = chain_with(&payload);

        // Protect the first buffer (header sections), release the first two.
        chain.set_protect_below(1);
        assert_eq!(chain.release_before(2), 2);

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.protected_count(), 1);

        // The protected buffer is still addressable by ordinal 0.
        let mut reader = chain.reader_at(ChainPos::new(0, 5));
        assert_eq!(reader.read_u8().unwrap(), payload[5]);

        // The released, unprotected buffer 1 is gone.
        assert!(chain.get(1).is_none());
        // The resident buffer 2 is intact.
        let mut reader = chain.reader_at(ChainPos::new(2, 0));
        assert_eq!(reader.read_u8().unwrap(), payload[2 * BUFFER_SIZE]);
    }

    #[test]
    fn test_end_pos() {
        let chain = chain_with(&[1, 2, 3]);
        assert_eq!(chain.end_pos(), ChainPos::new(0, 3));

        let empty = BufferChain::new();
        assert_eq!(empty.end_pos(), ChainPos::new(0, 0));
    }
}
