use std::io;
use std::os::fd::RawFd;

/// Reserved slack in front of the readable region, enough to prepend a
/// length header without shifting data.
const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
const INITIAL_SIZE: usize = 1024;

/// Scratch used as the overflow iovec in [`Buffer::read_fd`], so a single
/// nonblocking read can pull up to 64 KiB without pre-growing the buffer.
const READ_SCRATCH: usize = 65536;

/// Growable byte buffer with read/write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0              reader_index        writer_index        storage end
/// ```
///
/// Consumers read from `reader_index`, producers append at `writer_index`.
/// When the writable tail is too small but the already-consumed prefix plus
/// the tail would fit the request, the readable region is compacted in place
/// instead of reallocating.
pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Consume `len` bytes from the front of the readable region. Consuming
    /// everything resets both cursors to the cheap-prepend mark.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Consume the whole readable region as a string, replacing invalid
    /// UTF-8 sequences.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Either compact the readable region to the front (when the consumed
    /// prefix plus the writable tail covers the request) or grow the storage.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// One nonblocking `readv(2)` from `fd` into the writable tail plus a
    /// stack scratch. Bytes that land in the scratch are appended afterwards,
    /// so a read larger than the current tail grows the buffer exactly once.
    ///
    /// Returns the byte count (0 means EOF).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; READ_SCRATCH];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.storage[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];
        // Skip the scratch once the tail alone is big enough to cover it.
        let iovcnt = if writable < READ_SCRATCH { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// One nonblocking `write(2)` of the readable region to `fd`. The read
    /// cursor is left untouched; the caller retrieves what was accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.storage[self.reader_index..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn append_and_retrieve_move_the_cursors() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 6);

        // Consuming the rest resets both cursors.
        assert_eq!(buf.retrieve_all_as_string(), "world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn partial_string_retrieval() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        assert_eq!(buf.retrieve_as_bytes(3), b"abc");
        assert_eq!(buf.peek(), b"def");
    }

    #[test]
    fn compacts_in_place_without_reallocating() {
        let mut buf = Buffer::new();
        buf.append(&[b'x'; 1000]);
        buf.retrieve(800);
        let storage_len = buf.storage.len();

        // 900 > writable tail (24), but 800 consumed + 24 tail covers it.
        buf.append(&[b'y'; 900]);
        assert_eq!(buf.storage.len(), storage_len);
        assert_eq!(buf.readable_bytes(), 1100);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..200], &[b'x'; 200][..]);
        assert_eq!(&buf.peek()[200..], &[b'y'; 900][..]);
    }

    #[test]
    fn grows_when_compaction_cannot_cover() {
        let mut buf = Buffer::new();
        buf.append(&[b'a'; 2000]);
        assert_eq!(buf.readable_bytes(), 2000);
        assert_eq!(buf.peek(), &[b'a'; 2000][..]);
    }

    #[test]
    fn read_fd_spills_into_scratch_and_appends() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&[b'z'; 5000]).unwrap();

        let mut buf = Buffer::new();
        // Writable tail is 1024; the remaining 3976 bytes arrive via scratch.
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 5000);
        assert_eq!(buf.readable_bytes(), 5000);
        assert_eq!(buf.peek(), &[b'z'; 5000][..]);
    }

    #[test]
    fn read_fd_reports_eof_as_zero() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let mut buf = Buffer::new();
        assert_eq!(buf.read_fd(rx.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn write_fd_leaves_the_cursor_to_the_caller() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"ping");
        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.readable_bytes(), 4);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 4];
        use std::io::Read;
        (&rx).read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ping");
    }
}
