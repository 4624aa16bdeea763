//!Connection to the remote finish line device. The finish line speaks a
//!minimal text protocol over a single byte stream: we send `HELO` on
//!connect, `BGIN` to arm it for a race and `ENDR` to disarm it; it sends a
//!4 byte `FIN<k>` token when the car in lane k crosses. Any transport error
//!drops the link back to `Disconnected` and the caller must re-run
//!discovery before the next race.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub mod error;

use error::LinkError;

const HELLO: &[u8; 4] = b"HELO";
const ARM: &[u8; 4] = b"BGIN";
const DISARM: &[u8; 4] = b"ENDR";

///How long to keep draining stale finish notifications right after arming.
///Anything buffered at that point was generated before the race, e.g. by a
///hand passing over a sensor while staging cars.
pub const PURGE_WINDOW: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Armed,
    Disarmed,
}

///Discovery seam for the finish line transport. Production scans for the
///device by its advertised name over TCP; tests hand over an in-memory
///stream.
pub trait LinkTransport: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    ///One scan for a device advertising `name`. Returns `Ok(None)` when the
    ///device was not found this pass; the caller decides when to rescan.
    fn discover(
        &mut self,
        name: &str,
    ) -> impl Future<Output = io::Result<Option<Self::Stream>>> + Send;
}

///Resolves the advertised name as a `host:port` address and connects.
pub struct TcpTransport;

impl LinkTransport for TcpTransport {
    type Stream = TcpStream;

    async fn discover(&mut self, name: &str) -> io::Result<Option<TcpStream>> {
        let addrs = match lookup_host(name).await {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!("could not resolve finish line {}: {}", name, err);
                return Ok(None);
            }
        };
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("found finish line {} at {}", name, addr);
                    return Ok(Some(stream));
                }
                Err(err) => {
                    debug!("finish line {} not reachable at {}: {}", name, addr, err);
                }
            }
        }
        Ok(None)
    }
}

///State and protocol for one finish line connection.
pub struct FinishLineLink<T: LinkTransport> {
    transport: T,
    name: String,
    state: ConnectionState,
    stream: Option<T::Stream>,
    //bytes received but not yet consumed as a whole token
    pending: Vec<u8>,
}

impl<T: LinkTransport> FinishLineLink<T> {
    pub fn new(transport: T, name: &str) -> Self {
        Self {
            transport,
            name: name.to_string(),
            state: ConnectionState::Disconnected,
            stream: None,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }

    ///One discovery pass. `Ok(true)` means the device was found, connected
    ///and greeted; `Ok(false)` means it was not advertising yet.
    pub async fn connect(&mut self) -> Result<bool, LinkError> {
        self.drop_stream();
        self.state = ConnectionState::Connecting;
        match self.transport.discover(&self.name).await {
            Ok(Some(stream)) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                self.send(HELLO).await?;
                info!("connected to finish line {}", self.name);
                Ok(true)
            }
            Ok(None) => {
                self.state = ConnectionState::Disconnected;
                Ok(false)
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err.into())
            }
        }
    }

    ///Arm the finish line for a race. It only reports lane finishes between
    ///`BGIN` and `ENDR`.
    pub async fn arm(&mut self) -> Result<(), LinkError> {
        self.send(ARM).await?;
        self.state = ConnectionState::Armed;
        Ok(())
    }

    ///Stop the finish line from reporting further finishes.
    pub async fn disarm(&mut self) -> Result<(), LinkError> {
        self.send(DISARM).await?;
        self.state = ConnectionState::Disarmed;
        Ok(())
    }

    ///Discard anything buffered on the connection. Run right after arming
    ///so that notifications generated before the race started cannot be
    ///mistaken for real finishes. A read timeout here is the expected case.
    pub async fn purge(&mut self, window: Duration) -> Result<(), LinkError> {
        self.pending.clear();
        let mut buf = [0u8; 64];
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| LinkError::from("purge on disconnected link"))?;
            match timeout(window, stream.read(&mut buf)).await {
                Err(_elapsed) => return Ok(()),
                Ok(Ok(0)) => return Err(self.fail("finish line closed the connection")),
                Ok(Ok(n)) => {
                    debug!("purged {} stale bytes from finish line", n);
                }
                Ok(Err(err)) => return Err(self.fail_io(err)),
            }
        }
    }

    ///Wait up to `wait` for one finish notification. `Ok(Some(k))` reports
    ///lane k (1-based) finished; `Ok(None)` means nothing arrived in time.
    ///Garbled tokens are logged and skipped without changing state.
    pub async fn poll_finish(&mut self, wait: Duration) -> Result<Option<u8>, LinkError> {
        if let Some(lane) = self.take_buffered_lane() {
            return Ok(Some(lane));
        }
        let mut buf = [0u8; 64];
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LinkError::from("poll on disconnected link"))?;
        match timeout(wait, stream.read(&mut buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(0)) => Err(self.fail("finish line closed the connection")),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self.take_buffered_lane())
            }
            Ok(Err(err)) => Err(self.fail_io(err)),
        }
    }

    ///Pull the next valid `FIN<k>` token out of the pending buffer,
    ///resynchronizing past any garbage one byte at a time.
    fn take_buffered_lane(&mut self) -> Option<u8> {
        while self.pending.len() >= 4 {
            if let Some(lane) = parse_finish(&self.pending[..4]) {
                self.pending.drain(..4);
                return Some(lane);
            }
            let dropped = self.pending.remove(0);
            warn!("ignoring unexpected byte from finish line: 0x{:02x}", dropped);
        }
        None
    }

    async fn send(&mut self, token: &[u8; 4]) -> Result<(), LinkError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LinkError::from("send on disconnected link"))?;
        let res = async {
            stream.write_all(token).await?;
            stream.flush().await
        }
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_io(err)),
        }
    }

    fn fail(&mut self, message: &str) -> LinkError {
        self.drop_stream();
        LinkError::from(message)
    }

    fn fail_io(&mut self, err: io::Error) -> LinkError {
        self.drop_stream();
        err.into()
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.state = ConnectionState::Disconnected;
    }
}

fn parse_finish(token: &[u8]) -> Option<u8> {
    if token.len() == 4 && &token[..3] == b"FIN" && (b'1'..=b'4').contains(&token[3]) {
        Some(token[3] - b'0')
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    struct TestTransport {
        stream: Option<DuplexStream>,
    }

    impl LinkTransport for TestTransport {
        type Stream = DuplexStream;

        async fn discover(&mut self, _name: &str) -> io::Result<Option<DuplexStream>> {
            Ok(self.stream.take())
        }
    }

    async fn connected_link() -> (FinishLineLink<TestTransport>, DuplexStream) {
        let (near, far) = duplex(256);
        let mut link = FinishLineLink::new(TestTransport { stream: Some(near) }, "FinishLine");
        assert!(link.connect().await.unwrap());
        (link, far)
    }

    #[tokio::test]
    async fn connect_sends_hello() {
        let (link, mut far) = connected_link().await;
        assert_eq!(link.state(), ConnectionState::Connected);
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELO");
    }

    #[tokio::test]
    async fn discovery_miss_leaves_link_disconnected() {
        let mut link = FinishLineLink::new(TestTransport { stream: None }, "FinishLine");
        assert!(!link.connect().await.unwrap());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn arm_and_disarm_send_tokens() {
        let (mut link, mut far) = connected_link().await;
        link.arm().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Armed);
        link.disarm().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Disarmed);
        let mut buf = [0u8; 12];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELOBGINENDR");
    }

    #[tokio::test]
    async fn poll_parses_finish_notifications() {
        let (mut link, mut far) = connected_link().await;
        far.write_all(b"FIN2FIN1").await.unwrap();
        let first = link.poll_finish(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, Some(2));
        let second = link.poll_finish(Duration::from_millis(100)).await.unwrap();
        assert_eq!(second, Some(1));
    }

    #[tokio::test]
    async fn garbage_is_skipped_without_losing_tokens() {
        let (mut link, mut far) = connected_link().await;
        far.write_all(b"XYZ!FIN3").await.unwrap();
        let lane = link.poll_finish(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lane, Some(3));
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn poll_times_out_with_none() {
        let (mut link, _far) = connected_link().await;
        let lane = link.poll_finish(Duration::from_millis(10)).await.unwrap();
        assert_eq!(lane, None);
    }

    #[tokio::test]
    async fn peer_close_disconnects_link() {
        let (mut link, far) = connected_link().await;
        drop(far);
        let res = link.poll_finish(Duration::from_millis(100)).await;
        assert!(res.is_err());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn purge_discards_stale_notifications() {
        let (mut link, mut far) = connected_link().await;
        far.write_all(b"FIN1").await.unwrap();
        link.arm().await.unwrap();
        link.purge(Duration::from_millis(20)).await.unwrap();
        let lane = link.poll_finish(Duration::from_millis(10)).await.unwrap();
        assert_eq!(lane, None);
    }
}
