//! Cooperative poll step for the listening socket.
//!
//! A [`Poller`] never blocks on the listener. Each [`Poller::poll`] call
//! drains at most one batch of ready connections, serves each one to
//! completion with a bounded read, and tells the scheduler when to call
//! again. Once the session is stopped it returns [`PollOutcome::Stop`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use protocol::{find_header_end, HttpResponse};
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::router::RequestRouter;
use crate::stats::StatsStore;

/// Read chunk size for incoming requests.
const READ_CHUNK: usize = 1024;

/// What the scheduler should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Call again after the given delay.
    Continue(Duration),
    /// The session is over; do not call again.
    Stop,
}

/// Per-poll limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    /// Delay between polls.
    pub interval: Duration,
    /// Receive and send timeout for one connection.
    pub read_timeout: Duration,
    /// Largest request accepted.
    pub max_request_bytes: usize,
    /// Connections served per poll.
    pub max_accepts: usize,
}

impl PollerSettings {
    /// Builds settings from the `[server]` configuration section.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
            max_request_bytes: config.max_request_bytes,
            max_accepts: config.max_accepts_per_tick,
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// The listening socket shared between a session and its poller.
///
/// Closing takes the socket under the same lock the poller holds while
/// serving, so a connection in flight completes before the socket closes.
#[derive(Debug)]
pub struct ListenerSlot {
    live: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
}

impl ListenerSlot {
    /// Wraps a bound, non-blocking listener.
    pub fn new(listener: TcpListener) -> Self {
        Self {
            live: AtomicBool::new(true),
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Returns `true` until [`close`](Self::close) is called.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns the bound address, if still open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Marks the slot dead and closes the socket.
    ///
    /// Returns `true` if a socket was closed by this call.
    pub fn close(&self) -> bool {
        self.live.store(false, Ordering::Release);
        self.lock().take().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serves connections from a [`ListenerSlot`] one batch per call.
pub struct Poller {
    slot: Arc<ListenerSlot>,
    router: Arc<RequestRouter<StatsStore>>,
    settings: PollerSettings,
}

impl Poller {
    /// Creates a poller serving `slot` through `router`.
    pub fn new(
        slot: Arc<ListenerSlot>,
        router: Arc<RequestRouter<StatsStore>>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            slot,
            router,
            settings,
        }
    }

    /// Returns the delay requested between polls.
    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    /// Runs one poll step.
    ///
    /// Accepts until the listener would block or the batch limit is hit.
    /// Errors on individual connections are logged and never escape.
    pub fn poll(&mut self) -> PollOutcome {
        if !self.slot.is_live() {
            return PollOutcome::Stop;
        }

        let guard = self.slot.lock();
        let Some(listener) = guard.as_ref() else {
            return PollOutcome::Stop;
        };

        let mut served = 0;
        while served < self.settings.max_accepts && self.slot.is_live() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    served += 1;
                    if let Err(e) = self.serve(stream, peer) {
                        debug!("Connection from {} failed: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }

        if served > 0 {
            trace!("Served {} connection(s)", served);
        }
        PollOutcome::Continue(self.settings.interval)
    }

    fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let deadline = Instant::now() + self.settings.read_timeout;
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(self.settings.read_timeout))?;

        let response = match read_request(&mut stream, self.settings.max_request_bytes, deadline)? {
            ReadResult::Request(buf) => self.router.route(&buf),
            ReadResult::TooLarge => {
                debug!("Request from {} exceeds {} bytes", peer, self.settings.max_request_bytes);
                HttpResponse::bad_request()
            }
            ReadResult::Empty => {
                trace!("Connection from {} closed without a request", peer);
                return Ok(());
            }
        };

        debug!("{} -> {}", peer, response.status().as_u16());
        stream.write_all(&response.to_bytes())?;
        stream.flush()?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

#[derive(Debug)]
enum ReadResult {
    Request(Vec<u8>),
    TooLarge,
    Empty,
}

/// A byte source whose next read can be bounded in time.
trait DeadlineRead: Read {
    fn limit_next_read(&mut self, remaining: Duration) -> io::Result<()>;
}

impl DeadlineRead for TcpStream {
    fn limit_next_read(&mut self, remaining: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(remaining))
    }
}

/// Reads until the header terminator, EOF, the size limit, or `deadline`.
///
/// The deadline covers the whole request, so a client trickling bytes
/// cannot hold the connection open past it. A timeout after some bytes
/// arrived hands the partial request to the router; the request line is
/// all it needs.
fn read_request<R: DeadlineRead>(
    stream: &mut R,
    max_bytes: usize,
    deadline: Instant,
) -> io::Result<ReadResult> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no request before deadline",
                ));
            }
            break;
        }
        stream.limit_next_read(remaining)?;

        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if find_header_end(&buf).is_some() {
                    break;
                }
                if buf.len() >= max_bytes {
                    return Ok(ReadResult::TooLarge);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) && !buf.is_empty() =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }

    if buf.is_empty() {
        Ok(ReadResult::Empty)
    } else {
        Ok(ReadResult::Request(buf))
    }
}
