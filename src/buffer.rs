use std::io;
use std::os::fd::RawFd;

/// Size of the reserved prefix kept in front of the readable region, so a
/// short header can be prepended without shifting the payload.
const CHEAP_PREPEND: usize = 8;

/// Initial size of the writable region.
const INITIAL_SIZE: usize = 1024;

/// Growable byte queue used for per-connection input and output.
///
/// The storage is a single contiguous region with two cursors,
/// `reader_index <= writer_index <= len`. Bytes between the cursors are
/// readable; the tail past `writer_index` is writable; the prefix before
/// `reader_index` is available for prepending. When the queue is fully
/// drained both cursors snap back to the reserved prefix.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `initial` writable bytes.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes waiting to be read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes available in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advances the read cursor by `len`. Draining everything (or more
    /// than everything) resets both cursors.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Resets both cursors to the reserved prefix.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drains the first `len` readable bytes as a string.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result = String::from_utf8_lossy(&self.buf[self.reader_index..self.reader_index + len])
            .into_owned();
        self.retrieve(len);
        result
    }

    /// Drains the whole readable region as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Appends `data` to the writable tail, growing the storage if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` into the space in front of the readable region.
    ///
    /// Panics if the prependable area is smaller than `data`; callers only
    /// prepend short headers into the reserved prefix.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        let start = self.reader_index - data.len();
        self.buf[start..self.reader_index].copy_from_slice(data);
        self.reader_index = start;
    }

    fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    // Either compact the readable region back to the reserved prefix or
    // resize; compaction wins when the combined slack already covers the
    // request.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads from `fd` into the writable tail, spilling into a 64 KiB
    /// on-stack segment when the tail is too small.
    ///
    /// One `readv` absorbs up to the tail plus 64 KiB even when the buffer
    /// is small; any spill is appended afterwards, growing the storage
    /// exactly once. The buffer is unmodified on failure.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt: libc::c_int = if writable < extrabuf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd`. The caller advances the read
    /// cursor with [`retrieve`](Buffer::retrieve) on success.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            self.buf[self.reader_index..].as_ptr() as *const libc::c_void,
            self.readable_bytes(),
        ))?;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}
