//! Drivers that invoke a [`Poller`] repeatedly.
//!
//! The poller itself only knows how to take one step and say when it wants
//! the next one. A [`Scheduler`] decides where those steps run: a dedicated
//! thread, the tokio blocking pool, or a host-owned timer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tokio::runtime::Handle;
use tracing::{debug, error};

use crate::poller::{PollOutcome, Poller};

/// Accepts pollers and keeps calling them until they return
/// [`PollOutcome::Stop`].
pub trait Scheduler: Send {
    /// Takes ownership of `poller` and starts driving it.
    fn register(&mut self, poller: Poller);
}

/// Runs each poller on its own OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn register(&mut self, mut poller: Poller) {
        let spawned = thread::Builder::new()
            .name("render-stats-poller".to_string())
            .spawn(move || {
                while let PollOutcome::Continue(delay) = poller.poll() {
                    thread::sleep(delay);
                }
                debug!("Poller thread exiting");
            });

        if let Err(e) = spawned {
            error!("Failed to spawn poller thread: {}", e);
        }
    }
}

/// Re-arms the poller from an async task; each step runs on the blocking
/// pool so a slow client never stalls the runtime's workers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler for the runtime of the calling thread, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn register(&mut self, poller: Poller) {
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            let mut poller = poller;
            loop {
                let step = handle
                    .spawn_blocking(move || {
                        let outcome = poller.poll();
                        (poller, outcome)
                    })
                    .await;

                match step {
                    Ok((returned, PollOutcome::Continue(delay))) => {
                        poller = returned;
                        tokio::time::sleep(delay).await;
                    }
                    Ok((_, PollOutcome::Stop)) => {
                        debug!("Poller task exiting");
                        break;
                    }
                    Err(e) => {
                        error!("Poller step panicked: {}", e);
                        break;
                    }
                }
            }
        });
    }
}

/// Holds pollers until the host calls [`tick`](Self::tick).
///
/// Suits hosts that own a periodic timer and want every step on that
/// timer's thread. Clones share the same set of pollers.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    pollers: Arc<Mutex<Vec<Poller>>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Polls every registered poller once and drops the ones that stopped.
    ///
    /// Returns how many remain registered.
    pub fn tick(&self) -> usize {
        let mut pollers = self.lock();
        pollers.retain_mut(|poller| matches!(poller.poll(), PollOutcome::Continue(_)));
        pollers.len()
    }

    /// Returns the number of registered pollers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Poller>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn register(&mut self, poller: Poller) {
        self.lock().push(poller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    use crate::access::AccessKey;
    use crate::poller::{ListenerSlot, PollerSettings};
    use crate::router::RequestRouter;
    use crate::stats::StatsStore;

    const KEY: &str = "SchedulerKey0001";

    fn poller() -> (Poller, Arc<ListenerSlot>, SocketAddr) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let slot = Arc::new(ListenerSlot::new(listener));
        let router = Arc::new(RequestRouter::new(StatsStore::new(), AccessKey::from(KEY)));
        let settings = PollerSettings {
            interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(500),
            max_request_bytes: 1024,
            max_accepts: 4,
        };
        (Poller::new(Arc::clone(&slot), router, settings), slot, addr)
    }

    fn fetch(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(format!("GET /stats?key={} HTTP/1.1\r\n\r\n", KEY).as_bytes())
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_manual_scheduler_drops_stopped_pollers() {
        let mut scheduler = ManualScheduler::new();
        let (first, first_slot, _) = poller();
        let (second, _second_slot, _) = poller();
        scheduler.register(first);
        scheduler.register(second);

        assert_eq!(scheduler.tick(), 2);
        first_slot.close();
        assert_eq!(scheduler.tick(), 1);
        assert!(!scheduler.is_empty());
    }

    #[test]
    fn test_manual_scheduler_clones_share_state() {
        let scheduler = ManualScheduler::new();
        let mut registrar = scheduler.clone();
        let (p, _slot, _) = poller();
        registrar.register(p);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_thread_scheduler_serves_and_exits() {
        let (p, slot, addr) = poller();
        ThreadScheduler.register(p);

        assert!(fetch(addr).starts_with("HTTP/1.1 200 OK"));
        slot.close();
        assert!(wait_until(|| TcpStream::connect(addr).is_err()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_serves() {
        let (p, slot, addr) = poller();
        let mut scheduler = TokioScheduler::current().unwrap();
        scheduler.register(p);

        let body = tokio::task::spawn_blocking(move || fetch(addr)).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        slot.close();
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(TokioScheduler::current().is_none());
    }
}
