use std::io;

/// How an `ingress` call stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IngressEnd {
    /// The reader has no more data for now.
    WouldBlock,
    /// The reader reached end of stream (peer closed).
    Eof,
    /// The buffer is out of free capacity.
    Full,
}

/// Fixed-capacity contiguous FIFO byte buffer. Data is appended at the tail
/// and consumed from the head; the buffered region is always one contiguous
/// mutable span, which frame assembly relies on for in-place decryption.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity, after compaction.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        if self.head + count > self.tail {
            panic!("Attempted to consume past buffered data")
        }
        self.head += count;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Mutable slice containing data.
    #[inline]
    pub fn data_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Append bytes at the tail. The data must fit in the free capacity.
    pub fn write(&mut self, slice: &[u8]) {
        self.make_room(slice.len());
        self.data[self.tail..(self.tail + slice.len())].copy_from_slice(slice);
        self.tail += slice.len();
    }

    /// Slice of the free tail region, compacted to the full free capacity.
    pub fn write_slice(&mut self) -> &mut [u8] {
        self.make_room(self.free_capacity());
        &mut self.data[self.tail..]
    }

    /// Advance the tail after writing into `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        if self.tail + count > self.data.len() {
            panic!("Attempted to expand past buffer capacity")
        }
        self.tail += count;
    }

    /// Read in data from the supplied reader until it would block, the
    /// stream ends or the buffer fills up. Returns the byte count along with
    /// the reason the read stopped.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, IngressEnd)> {
        self.make_room(self.free_capacity());

        let mut total = 0;

        loop {
            if self.tail == self.data.len() {
                return Ok((total, IngressEnd::Full));
            }

            match reader.read(&mut self.data[self.tail..]) {
                Ok(0) => return Ok((total, IngressEnd::Eof)),
                Ok(count) => {
                    self.tail += count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, IngressEnd::WouldBlock));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Shift the buffered region to the front so `count` bytes of tail room
    /// become available. Panics if the buffer cannot ever hold that much.
    fn make_room(&mut self, count: usize) {
        if self.data.len() - self.tail >= count {
            return;
        }
        if self.free_capacity() < count {
            panic!("Buffer overrun: {} wanted, {} free", count, self.free_capacity());
        }

        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        eof: bool,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                eof: false,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_ingress_until_would_block() {
        let mock_data: Vec<u8> = (0..1000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 177);
        let mut buffer = Buffer::new(4096);

        let (count, end) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(end, IngressEnd::WouldBlock);
        assert_eq!(buffer.read_slice(), &mock_data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut channel = MockChannel::new(vec![1, 2, 3], 16);
        channel.eof = true;

        let mut buffer = Buffer::new(64);
        let (count, end) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 3);
        assert_eq!(end, IngressEnd::Eof);
    }

    #[test]
    fn test_ingress_reports_full() {
        let mock_data: Vec<u8> = vec![9; 200];
        let mut channel = MockChannel::new(mock_data, 50);
        let mut buffer = Buffer::new(128);

        let (count, end) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 128);
        assert_eq!(end, IngressEnd::Full);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_consume_and_compact() {
        let mut buffer = Buffer::new(128);

        buffer.write(&[1, 2, 3, 4, 5]);
        buffer.move_head(2);

        assert_eq!(buffer.read_slice(), &[3, 4, 5]);
        assert_eq!(buffer.len(), 3);

        // Draining resets the cursors
        buffer.move_head(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 128);
    }

    #[test]
    fn test_write_compacts_around_consumed_head() {
        let mut buffer = Buffer::new(8);

        buffer.write(&[1, 2, 3, 4, 5, 6]);
        buffer.move_head(4);

        // Only 2 bytes of tail room remain, but compaction frees the head
        buffer.write(&[7, 8, 9, 10]);

        assert_eq!(buffer.read_slice(), &[5, 6, 7, 8, 9, 10]);
    }

    #[test]
    #[should_panic(expected = "Attempted to consume past buffered data")]
    fn test_consume_past_end_fails() {
        let mut buffer = Buffer::new(16);

        buffer.write(&[1, 2]);
        buffer.move_head(3);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_write_overrun_fails() {
        let mut buffer = Buffer::new(4);

        buffer.write(&[1, 2, 3]);
        buffer.write(&[4, 5]);
    }
}
