use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{decode_wire, encode_wire, LinkConfig};
use crate::error::{Result, StreamError};
use crate::frame::Frame;
use crate::pool;
use crate::stage::{FrameRx, FrameTx, Master};
use crate::worker::{CancelToken, Worker};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A connected byte stream usable as a physical link.
pub trait LinkStream: Read + Write + Send + Sized + 'static {
    /// Create a second handle to the same stream for the reader thread.
    fn try_clone_stream(&self) -> std::io::Result<Self>;
    /// Set the read timeout on the underlying stream.
    fn set_link_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
    /// Shut down both directions.
    fn shutdown_link(&self) -> std::io::Result<()>;
}

impl LinkStream for TcpStream {
    fn try_clone_stream(&self) -> std::io::Result<Self> {
        self.try_clone()
    }

    fn set_link_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn shutdown_link(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl LinkStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> std::io::Result<Self> {
        self.try_clone()
    }

    fn set_link_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn shutdown_link(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

/// Physical link carrying whole frames over a byte stream.
///
/// Outbound frames are written synchronously by `push_frame`. A reader worker
/// decodes inbound frames and hands them to the attached upper stage.
pub struct StreamLink<S: LinkStream> {
    writer: Mutex<WriteHalf<S>>,
    master: Arc<Master>,
    reader: Mutex<Option<Worker>>,
    config: LinkConfig,
}

struct WriteHalf<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: LinkStream> StreamLink<S> {
    /// Wrap a connected stream with default configuration.
    pub fn new(stream: S) -> Result<Arc<Self>> {
        Self::with_config(stream, LinkConfig::default())
    }

    /// Wrap a connected stream with explicit configuration.
    pub fn with_config(stream: S, config: LinkConfig) -> Result<Arc<Self>> {
        let read_half = stream.try_clone_stream()?;
        read_half.set_link_read_timeout(Some(config.read_timeout))?;

        let master = Arc::new(Master::new());
        let reader_master = Arc::clone(&master);
        let max_frame = config.max_frame_size;
        let reader = Worker::spawn("fwlink-link-rx", move |token| {
            read_loop(read_half, &reader_master, max_frame, &token);
        })?;

        Ok(Arc::new(Self {
            writer: Mutex::new(WriteHalf {
                stream,
                buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            }),
            master,
            reader: Mutex::new(Some(reader)),
            config,
        }))
    }

    /// Attach the stage that receives inbound frames.
    pub fn set_slave<R: FrameRx + 'static>(&self, slave: &Arc<R>) {
        self.master.set_slave(slave);
    }

    /// Current link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Whether the reader is still receiving.
    pub fn is_open(&self) -> bool {
        self.reader.lock().as_ref().is_some_and(Worker::is_running)
    }

    /// Stop the reader and shut the stream down.
    pub fn close(&self) {
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            reader.stop();
        }
        let _ = self.writer.lock().stream.shutdown_link();
    }
}

impl<S: LinkStream> FrameTx for StreamLink<S> {
    fn accept_req(&self, size: usize, _zero_copy: bool) -> Result<Frame> {
        Ok(pool::req_frame(size, 0))
    }

    fn push_frame(&self, frame: Frame) -> Result<()> {
        let size = frame.payload();
        if size > self.config.max_frame_size {
            return Err(StreamError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }

        let mut guard = self.writer.lock();
        let half = &mut *guard;
        half.buf.clear();
        encode_wire(&frame.to_bytes(), &mut half.buf)?;

        let mut offset = 0usize;
        while offset < half.buf.len() {
            match half.stream.write(&half.buf[offset..]) {
                Ok(0) => return Err(StreamError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(StreamError::Io(err)),
            }
        }

        loop {
            match half.stream.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(StreamError::Io(err)),
            }
        }
    }
}

impl<S: LinkStream> Drop for StreamLink<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop<S: Read>(mut stream: S, master: &Master, max_frame: usize, token: &CancelToken) {
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while !token.is_cancelled() {
        loop {
            match decode_wire(&mut buf, max_frame) {
                Ok(Some(payload)) => {
                    master.send_frame(Frame::from_slice(&payload));
                }
                Ok(None) => break,
                Err(err) => {
                    // Lost sync with the byte stream; discard what we have.
                    warn!(error = %err, buffered = buf.len(), "link framing error, resyncing");
                    buf.clear();
                    break;
                }
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("link closed by peer");
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(err) => {
                if !token.is_cancelled() {
                    warn!(error = %err, "link read failed");
                }
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    use crossbeam::channel::{self, Receiver, Sender};

    use super::*;

    struct ChannelSink {
        tx: Sender<Frame>,
    }

    impl FrameRx for ChannelSink {
        fn accept_frame(&self, frame: Frame) {
            let _ = self.tx.send(frame);
        }
    }

    fn sink() -> (Arc<ChannelSink>, Receiver<Frame>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(ChannelSink { tx }), rx)
    }

    #[test]
    fn frames_cross_a_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let a = StreamLink::new(left).unwrap();
        let b = StreamLink::new(right).unwrap();
        let (sink_b, rx_b) = sink();
        b.set_slave(&sink_b);

        let mut frame = a.accept_req(5, false).unwrap();
        frame.write(b"hello").unwrap();
        a.push_frame(frame).unwrap();
        a.push_frame(Frame::from_slice(b"world")).unwrap();

        let first = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.to_bytes().as_ref(), b"hello");
        assert_eq!(second.to_bytes().as_ref(), b"world");
    }

    #[test]
    fn oversized_frame_rejected() {
        let (left, _right) = UnixStream::pair().unwrap();
        let cfg = LinkConfig {
            max_frame_size: 4,
            ..LinkConfig::default()
        };
        let link = StreamLink::with_config(left, cfg).unwrap();

        let err = link.push_frame(Frame::from_slice(b"oversized")).unwrap_err();
        assert!(matches!(err, StreamError::FrameTooLarge { size: 9, max: 4 }));
    }

    #[test]
    fn close_stops_reader_promptly() {
        let (left, _right) = UnixStream::pair().unwrap();
        let link = StreamLink::new(left).unwrap();
        assert!(link.is_open());

        let start = Instant::now();
        link.close();
        assert!(!link.is_open());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn peer_hangup_ends_reader() {
        let (left, right) = UnixStream::pair().unwrap();
        let link = StreamLink::new(left).unwrap();
        drop(right);

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.is_open() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!link.is_open());
    }

    #[test]
    fn read_loop_resyncs_after_garbage() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00]);
        let master = Master::new();
        let (sink, rx) = sink();
        master.set_slave(&sink);

        let mut good = BytesMut::new();
        encode_wire(b"ok", &mut good).unwrap();

        // Garbage arrives in one read, a valid frame in the next.
        let reader = TwoReads {
            reads: vec![wire.to_vec(), good.to_vec()],
        };
        read_loop(reader, &master, 1024, &CancelToken::new());

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.to_bytes().as_ref(), b"ok");
    }

    #[test]
    fn read_loop_exits_on_eof() {
        let master = Master::new();
        read_loop(
            Cursor::new(Vec::<u8>::new()),
            &master,
            1024,
            &CancelToken::new(),
        );
    }

    struct TwoReads {
        reads: Vec<Vec<u8>>,
    }

    impl Read for TwoReads {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.reads.is_empty() {
                return Ok(0);
            }
            let next = self.reads.remove(0);
            buf[..next.len()].copy_from_slice(&next);
            Ok(next.len())
        }
    }
}
