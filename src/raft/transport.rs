use super::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::path::Path;
use std::time::Duration;

/// The transport seam: one self-delimited frame per message, with a bounded
/// wait on the receive side. The event loop is the only caller.
pub trait Transport {
    /// Waits up to timeout for the next inbound frame, returning None on
    /// timeout. Zero-length frames are possible and ignored by the caller.
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Sends a single frame.
    fn send(&self, frame: &[u8]) -> Result<()>;
}

/// The production transport: a connected AF_UNIX SOCK_SEQPACKET socket whose
/// path is the replica's ID. The socket carries all peer and client traffic;
/// the far end routes frames by their envelope addresses.
pub struct SeqPacket {
    socket: Socket,
}

impl SeqPacket {
    /// Connects to the cluster socket at the given path.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
        socket.connect(&SockAddr::unix(path)?)?;
        Ok(Self { socket })
    }
}

impl Transport for SeqPacket {
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        // A zero timeout would mean "block forever" to the socket layer.
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buffer = [MaybeUninit::<u8>::uninit(); MAX_MESSAGE_SIZE];
        match self.socket.recv(&mut buffer) {
            // SAFETY: recv() guarantees the first len bytes are initialized.
            Ok(len) => Ok(Some(
                buffer[..len].iter().map(|byte| unsafe { byte.assume_init() }).collect(),
            )),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.socket.send(frame)?;
        Ok(())
    }
}

/// An in-memory transport over a crossed pair of channels, with the same
/// delivery semantics as the socket. Used to drive whole clusters in-process
/// in tests.
pub struct Channel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl Channel {
    /// Creates a connected transport pair.
    pub fn pair() -> (Channel, Channel) {
        let (left_tx, left_rx) = crossbeam::channel::unbounded();
        let (right_tx, right_rx) = crossbeam::channel::unbounded();
        (Channel { tx: left_tx, rx: right_rx }, Channel { tx: right_tx, rx: left_rx })
    }
}

impl Transport for Channel {
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::IO("transport disconnected".to_string()))
            }
        }
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| Error::IO("transport disconnected".to_string()))
    }
}
