//! Blocking reads from the parent's end of a worker pipe

use std::fs::File;
use std::io::{self, Read};
use tracing::debug;

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsHandle, AsRawHandle, BorrowedHandle, OwnedHandle};

/// Outcome of [`read_exact`]
///
/// `read < buf.len()` with no error means the writer closed the pipe.
#[derive(Debug)]
pub struct ReadExact {
    pub read: usize,
    pub error: Option<io::Error>,
}

impl ReadExact {
    pub fn is_complete(&self, wanted: usize) -> bool {
        self.error.is_none() && self.read == wanted
    }
}

/// Fill `buf`, stopping early only on EOF or a non-retryable error
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> ReadExact {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                debug!(read, wanted = buf.len(), "pipe: EOF");
                break;
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(read, wanted = buf.len(), error = %e, "pipe: read failed");
                return ReadExact {
                    read,
                    error: Some(e),
                };
            }
        }
    }
    ReadExact { read, error: None }
}

/// Parent read end of a sync or data pipe
#[derive(Debug)]
pub struct PipeReader {
    file: File,
}

impl PipeReader {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn into_file(self) -> File {
        self.file
    }

    /// Whether a read would return immediately. End-of-file and errors
    /// count as available so the next read observes them.
    #[cfg(unix)]
    pub fn data_available(&self) -> bool {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => false,
            Ok(_) => fds[0].revents().is_some_and(|r| !r.is_empty()),
            Err(e) => {
                debug!(error = %e, "pipe: poll failed");
                true
            }
        }
    }

    #[cfg(windows)]
    pub fn data_available(&self) -> bool {
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        let mut available: u32 = 0;
        let handle = HANDLE(self.file.as_raw_handle());
        // SAFETY: the handle is owned by `self.file` and outlives the call
        let peeked = unsafe {
            PeekNamedPipe(
                handle,
                None,
                0,
                None,
                Some(&mut available as *mut u32),
                None,
            )
        };
        match peeked {
            Ok(()) => available > 0,
            Err(e) => {
                debug!(error = %e, "pipe: PeekNamedPipe failed");
                true
            }
        }
    }

    /// Read one line without blocking.
    ///
    /// Bytes are consumed one at a time while data is available, up to
    /// `max - 1` of them. Returns `Ok(None)` when nothing was waiting and
    /// `UnexpectedEof` when the writer has gone away.
    pub fn gets_nonblock(&mut self, max: usize) -> io::Result<Option<String>> {
        let limit = max.saturating_sub(1);
        let mut line = Vec::new();
        while line.len() < limit {
            if !self.data_available() {
                break;
            }
            match self.read_byte()? {
                None if line.is_empty() => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe closed while reading a line",
                    ))
                }
                None | Some(b'\n') => return Ok(Some(line_text(line))),
                Some(b) => line.push(b),
            }
        }
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(line_text(line)))
        }
    }

    /// Blocking line read, `Ok(None)` at end-of-file
    pub fn read_line(&mut self, max: usize) -> io::Result<Option<String>> {
        let limit = max.saturating_sub(1);
        let mut line = Vec::new();
        while line.len() < limit {
            match self.read_byte()? {
                None if line.is_empty() => return Ok(None),
                None | Some(b'\n') => break,
                Some(b) => line.push(b),
            }
        }
        Ok(Some(line_text(line)))
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let got = read_exact(&mut self.file, &mut byte);
        match got.error {
            Some(e) => Err(e),
            None if got.read == 0 => Ok(None),
            None => Ok(Some(byte[0])),
        }
    }
}

fn line_text(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(unix)]
impl From<OwnedFd> for PipeReader {
    fn from(fd: OwnedFd) -> Self {
        Self::new(File::from(fd))
    }
}

#[cfg(unix)]
impl AsFd for PipeReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

#[cfg(unix)]
impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(windows)]
impl From<OwnedHandle> for PipeReader {
    fn from(handle: OwnedHandle) -> Self {
        Self::new(File::from(handle))
    }
}

#[cfg(windows)]
impl AsHandle for PipeReader {
    fn as_handle(&self) -> BorrowedHandle<'_> {
        self.file.as_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out one byte per call and fails with EINTR in between
    struct Flaky {
        data: Vec<u8>,
        pos: usize,
        interrupt: bool,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct Broken(usize);

    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let n = self.0.min(buf.len());
            buf[..n].fill(b'x');
            self.0 -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_exact_retries_interrupted() {
        let mut reader = Flaky {
            data: b"abcd".to_vec(),
            pos: 0,
            interrupt: false,
        };
        let mut buf = [0u8; 4];
        let got = read_exact(&mut reader, &mut buf);
        assert!(got.is_complete(4));
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_read_exact_short_on_eof() {
        let mut reader: &[u8] = b"ab";
        let mut buf = [0u8; 4];
        let got = read_exact(&mut reader, &mut buf);
        assert_eq!(got.read, 2);
        assert!(got.error.is_none());
        assert!(!got.is_complete(4));
    }

    #[test]
    fn test_read_exact_reports_partial_read_with_error() {
        let mut reader = Broken(3);
        let mut buf = [0u8; 8];
        let got = read_exact(&mut reader, &mut buf);
        assert_eq!(got.read, 3);
        assert_eq!(
            got.error.map(|e| e.kind()),
            Some(io::ErrorKind::BrokenPipe)
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::io::Write;

        fn pipe_pair() -> (PipeReader, File) {
            let (read, write) = nix::unistd::pipe().unwrap();
            (PipeReader::from(read), File::from(write))
        }

        #[test]
        fn test_data_available_tracks_pipe_contents() {
            let (mut reader, mut writer) = pipe_pair();
            assert!(!reader.data_available());

            writer.write_all(b"x").unwrap();
            assert!(reader.data_available());

            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf).unwrap();
            assert!(!reader.data_available());

            drop(writer);
            // EOF is reported as readable
            assert!(reader.data_available());
        }

        #[test]
        fn test_gets_nonblock_reads_lines() {
            let (mut reader, mut writer) = pipe_pair();
            assert_eq!(reader.gets_nonblock(64).unwrap(), None);

            writer.write_all(b"eth0\t10\t2\nlo\t").unwrap();
            assert_eq!(reader.gets_nonblock(64).unwrap().as_deref(), Some("eth0\t10\t2"));
            assert_eq!(reader.gets_nonblock(64).unwrap().as_deref(), Some("lo\t"));
            assert_eq!(reader.gets_nonblock(64).unwrap(), None);

            drop(writer);
            let err = reader.gets_nonblock(64).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }

        #[test]
        fn test_gets_nonblock_respects_limit() {
            let (mut reader, mut writer) = pipe_pair();
            writer.write_all(b"abcdefgh\n").unwrap();
            assert_eq!(reader.gets_nonblock(4).unwrap().as_deref(), Some("abc"));
            assert_eq!(reader.gets_nonblock(64).unwrap().as_deref(), Some("defgh"));
        }

        #[test]
        fn test_read_line_blocks_until_newline_or_eof() {
            let (mut reader, mut writer) = pipe_pair();
            writer.write_all(b"first\r\nsecond").unwrap();
            drop(writer);
            assert_eq!(reader.read_line(128).unwrap().as_deref(), Some("first"));
            assert_eq!(reader.read_line(128).unwrap().as_deref(), Some("second"));
            assert_eq!(reader.read_line(128).unwrap(), None);
        }
    }
}
