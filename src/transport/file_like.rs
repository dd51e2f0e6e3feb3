//! Framed I/O shared by the socket and the trace file.
//!
//! [`FileLike::write`] emits `[u64 length][payload]` and [`FileLike::read`]
//! consumes exactly that, so a sequence of writes can always be read back by
//! the same sequence of reads without any other size negotiation. The raw
//! variants skip the prefix and are only used where both ends already know
//! the size, such as the trace-file header.

use std::fs::File;
use std::io::{Read, Write};

use crate::error::CaptureError;
use crate::transport::stream::MessageStream;
use crate::transport::FRAME_PREFIX_SIZE;

pub enum FileLike<'a> {
    File(&'a mut File),
    Socket(&'a mut MessageStream),
}

impl FileLike<'_> {
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        match self {
            FileLike::File(file) => Ok(file.read_exact(buf)?),
            FileLike::Socket(stream) => stream.recv(buf),
        }
    }

    /// Reads one frame into `buf`, returning the payload length.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let len = self.read_prefix()?;
        if len > buf.len() as u64 {
            return Err(CaptureError::FrameTooLarge {
                len,
                max: buf.len() as u64,
            });
        }
        let len = len as usize;
        self.read_raw(&mut buf[..len])?;
        Ok(len)
    }

    /// Reads one frame of at most `max_len` bytes into a new buffer.
    pub fn read_frame(&mut self, max_len: u64) -> Result<Vec<u8>, CaptureError> {
        let len = self.read_prefix()?;
        if len > max_len {
            return Err(CaptureError::FrameTooLarge { len, max: max_len });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_raw(&mut buf)?;
        Ok(buf)
    }

    fn read_prefix(&mut self) -> Result<u64, CaptureError> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        self.read_raw(&mut prefix)?;
        Ok(u64::from_le_bytes(prefix))
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        match self {
            FileLike::File(file) => Ok(file.write_all(bytes)?),
            FileLike::Socket(stream) => stream.send_raw(bytes, false),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        match self {
            FileLike::File(file) => {
                file.write_all(&(bytes.len() as u64).to_le_bytes())?;
                Ok(file.write_all(bytes)?)
            }
            FileLike::Socket(stream) => stream.send(bytes),
        }
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        match self {
            FileLike::File(file) => Ok(file.flush()?),
            FileLike::Socket(stream) => stream.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TerminationFlag;
    use crate::transport::MessageListener;
    use std::io::{Seek, SeekFrom};
    use std::thread;

    #[test]
    fn test_file_frames_read_back_in_order() {
        let mut file = tempfile::tempfile().unwrap();
        let payloads: Vec<Vec<u8>> = vec![b"first".to_vec(), Vec::new(), vec![7u8; 1000]];
        {
            let mut out = FileLike::File(&mut file);
            for p in &payloads {
                out.write(p).unwrap();
            }
            out.write_raw(b"tail").unwrap();
            out.flush().unwrap();
        }

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut input = FileLike::File(&mut file);
        for p in &payloads {
            assert_eq!(&input.read_frame(4096).unwrap(), p);
        }
        let mut tail = [0u8; 4];
        input.read_raw(&mut tail).unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn test_read_rejects_small_buffer() {
        let mut file = tempfile::tempfile().unwrap();
        FileLike::File(&mut file).write(&[1u8; 32]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 16];
        match FileLike::File(&mut file).read(&mut buf) {
            Err(CaptureError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 32);
                assert_eq!(max, 16);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_socket_and_file_framing_agree() {
        let listener = MessageListener::bind("127.0.0.1", 0).unwrap();
        let port = listener.port();
        let tracer = thread::spawn(move || {
            let mut stream = MessageStream::connect("127.0.0.1", port).unwrap();
            let mut socket = FileLike::Socket(&mut stream);
            socket.write(b"hello").unwrap();
            socket.write(&[0xAB; 300]).unwrap();
            socket.flush().unwrap();
        });

        let mut host = listener.accept(&TerminationFlag::new()).unwrap().unwrap();
        host.handshake().unwrap();
        let mut socket = FileLike::Socket(&mut host);
        let mut buf = [0u8; 512];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let second = socket.read_frame(512).unwrap();
        assert_eq!(second, vec![0xAB; 300]);
        tracer.join().unwrap();

        // The same frames written to a file produce identical bytes.
        let mut file = tempfile::tempfile().unwrap();
        FileLike::File(&mut file).write(b"hello").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).unwrap();
        let mut expected = 5u64.to_le_bytes().to_vec();
        expected.extend_from_slice(b"hello");
        assert_eq!(raw, expected);
    }
}
