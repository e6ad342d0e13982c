use crate::CHANN_BUF_SIZE;
use std::collections::VecDeque;
use std::io;

pub(crate) const CHUNK_SIZE: usize = CHANN_BUF_SIZE;

/// One pooled block of an outbound queue. `start` marks the first unsent
/// byte and `len` counts the bytes buffered behind it; once everything is
/// consumed the chunk rewinds so the next append lands at the front.
pub struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    start: usize,
    len: usize,
}

impl Chunk {
    #[inline]
    pub fn new() -> Chunk {
        Chunk {
            data: Box::new([0; CHUNK_SIZE]),
            start: 0,
            len: 0,
        }
    }

    /// Room left behind the buffered region.
    #[inline]
    pub fn room(&self) -> usize {
        CHUNK_SIZE - self.start - self.len
    }

    /// Bytes waiting to be sent.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Stash bytes behind the buffered region; the slice must fit in `room`.
    #[inline]
    pub fn append(&mut self, slice: &[u8]) {
        let tail = self.start + self.len;

        self.data[tail..tail + slice.len()].copy_from_slice(slice);
        self.len += slice.len();
    }

    /// Mark `count` buffered bytes as sent.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        if count > self.len {
            panic!("Consumed more bytes than the chunk holds")
        }

        self.start += count;
        self.len -= count;
        if self.len == 0 {
            self.start = 0;
        }
    }

    /// View of the bytes not yet sent.
    #[inline]
    pub fn unsent(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    #[inline]
    fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

/// Recycles spent chunks across all channels of one event loop, so
/// steady-state traffic stops hitting the allocator.
pub struct ChunkPool {
    spares: Vec<Chunk>,
}

impl ChunkPool {
    pub fn new() -> ChunkPool {
        ChunkPool { spares: Vec::new() }
    }

    /// Hand out a recycled chunk, or a fresh one when the pool ran dry.
    pub fn alloc(&mut self) -> Chunk {
        self.spares.pop().unwrap_or_else(Chunk::new)
    }

    /// Take a spent chunk back for reuse.
    pub fn reclaim(&mut self, mut chunk: Chunk) {
        chunk.reset();
        self.spares.push(chunk)
    }
}

/// Ordered outbound byte queue built from pooled chunks. Bytes retain FIFO
/// order across chunk boundaries.
pub struct SendQueue {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    /// Queued byte count.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append all bytes to the tail of the queue.
    pub fn push(&mut self, pool: &mut ChunkPool, mut data: &[u8]) {
        self.len += data.len();

        while !data.is_empty() {
            let need_chunk = match self.chunks.back() {
                Some(chunk) => chunk.room() == 0,
                None => true,
            };

            if need_chunk {
                self.chunks.push_back(pool.alloc());
            }

            let chunk = self.chunks.back_mut().expect("Queue must have a tail chunk");
            let count = data.len().min(chunk.room());

            chunk.append(&data[..count]);
            data = &data[count..];
        }
    }

    /// Write queued data to the supplied writer until the queue drains or
    /// the writer refuses. Returns the number of bytes written; a would-block
    /// refusal is not an error.
    pub fn drain<W: io::Write>(&mut self, mut writer: W, pool: &mut ChunkPool) -> io::Result<usize> {
        let mut total = 0;

        while let Some(chunk) = self.chunks.front_mut() {
            match writer.write(chunk.unsent()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    chunk.consume(count);
                    self.len -= count;
                    total += count;

                    if chunk.buffered() == 0 {
                        let spent = self.chunks.pop_front().expect("Front chunk must exist");
                        pool.reclaim(spent);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Release all queued chunks back into the pool.
    pub fn clear(&mut self, pool: &mut ChunkPool) {
        while let Some(chunk) = self.chunks.pop_front() {
            pool.reclaim(chunk);
        }
        self.len = 0;
    }
}
