use std::io;
use std::os::fd::RawFd;

/// Initial capacity used by [`Buffer::new`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Stack extension used by [`Buffer::receive_from`]. A single vectored read
/// can pull this much beyond the buffer tail before any reallocation.
const EXTRA_SPACE: usize = 65536;

/// Result of one nonblocking vectored receive.
#[derive(Debug)]
pub enum RecvResult {
    /// Bytes appended to the buffer.
    Received(usize),
    /// EAGAIN/EWOULDBLOCK/EINTR. Try again on the next readable event.
    Retry,
    /// Peer closed the connection (read returned 0).
    Closed,
    /// Unrecoverable socket error.
    Error(io::Error),
}

/// Growable byte buffer with separate read and write cursors.
///
/// `[0, read_index)` is reclaimable prefix, `[read_index, write_index)` is
/// unread payload, `[write_index, capacity)` is writable tail. Appends first
/// compact unread bytes to the front when the reclaimable prefix makes room,
/// and only then reallocate (1.5x growth, copying unread bytes only).
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    /// An empty, non-allocating buffer. Cheap to `mem::take` around handler
    /// calls.
    fn default() -> Self {
        Self {
            data: Vec::new(),
            read_index: 0,
            write_index: 0,
        }
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes.
    pub fn unread(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// Writable tail space, before any compaction or growth.
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// The unread region.
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// The writable tail. Pair with [`Buffer::advance_write`].
    pub fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.write_index..]
    }

    /// Marks `n` tail bytes as written.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.writable());
        self.write_index += n;
    }

    /// Appends `bytes`, compacting or growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Discards `n` unread bytes. Returns false (and consumes nothing) if
    /// `n` exceeds the unread count. Cursors reset to the front once the
    /// buffer drains, so a fully consumed buffer reclaims its whole capacity.
    pub fn consume(&mut self, n: usize) -> bool {
        if n > self.unread() {
            return false;
        }
        self.read_index += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
        true
    }

    /// Drops all unread bytes and resets cursors.
    pub fn clear(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.readable_slice().get(offset).copied()
    }

    /// Big-endian u32 at `offset` into the unread region.
    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let unread = self.readable_slice();
        let bytes = unread.get(offset..offset + 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Some(u32::from_be_bytes(buf))
    }

    /// Reads and consumes a big-endian u32.
    pub fn read_u32(&mut self) -> Option<u32> {
        let v = self.peek_u32(0)?;
        self.consume(4);
        Some(v)
    }

    /// Appends a big-endian u32.
    pub fn write_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        let unread = self.unread();
        if self.read_index + self.writable() >= n {
            // Reclaimable prefix plus tail suffices: compact in place.
            self.data.copy_within(self.read_index..self.write_index, 0);
        } else {
            let needed = unread + n;
            let capacity = self.data.len();
            let new_capacity = needed.max(capacity + capacity / 2);
            let mut grown = vec![0u8; new_capacity];
            grown[..unread].copy_from_slice(&self.data[self.read_index..self.write_index]);
            // Old storage is zeroed on drop below.
            let mut old = std::mem::replace(&mut self.data, grown);
            old.fill(0);
        }
        self.read_index = 0;
        self.write_index = unread;
    }

    /// One nonblocking vectored read from `fd` into the writable tail plus a
    /// stack extension. Bytes landing in the extension are appended afterwards,
    /// so a single call can exceed the current capacity.
    pub fn receive_from(&mut self, fd: RawFd) -> RecvResult {
        let mut extra = [0u8; EXTRA_SPACE];
        let writable = self.writable();
        let tail = self.data[self.write_index..].as_mut_ptr();
        let iov = [
            libc::iovec {
                iov_base: tail as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_SPACE,
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RecvResult::Retry,
                _ => RecvResult::Error(err),
            };
        }
        if n == 0 {
            return RecvResult::Closed;
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extra[..n - writable]);
        }
        RecvResult::Received(n)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.data.fill(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_consume_cursors() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"hello world!");
        assert_eq!(buf.unread(), 12);
        assert_eq!(buf.readable_slice(), b"hello world!");

        assert!(buf.consume(6));
        assert_eq!(buf.readable_slice(), b"world!");
        assert!(!buf.consume(7)); // more than unread, rejected whole
        assert_eq!(buf.unread(), 6);

        // draining resets both cursors to the front.
        assert!(buf.consume(6));
        assert!(buf.is_empty());
        assert_eq!(buf.writable(), 16);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789ab");
        assert!(buf.consume(8));
        // 4 unread, 8 reclaimable, 4 tail. 6 more fits after compaction.
        buf.append(b"cdefgh");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable_slice(), b"89abcdefgh");
    }

    #[test]
    fn grows_preserving_unread() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.append(b"0123456789");
        assert!(buf.capacity() >= 16);
        assert_eq!(buf.readable_slice(), b"abcdef0123456789");
    }

    #[test]
    fn default_is_empty_and_grows_on_demand() {
        let mut buf = Buffer::default();
        assert_eq!(buf.capacity(), 0);
        buf.append(b"xy");
        assert_eq!(buf.readable_slice(), b"xy");
    }

    #[test]
    fn u32_round_trip() {
        let mut buf = Buffer::new();
        buf.write_u8(0x01);
        buf.write_u32(0xdead_beef);
        assert_eq!(buf.peek_u8(0), Some(0x01));
        assert_eq!(buf.peek_u32(1), Some(0xdead_beef));
        assert!(buf.consume(1));
        assert_eq!(buf.read_u32(), Some(0xdead_beef));
        assert!(buf.is_empty());
        assert_eq!(buf.read_u32(), None);
    }
}
