//! mio runtime: implementasi nyata dari collaborator engine
//!
//! - `EventLoop`: ready queue + timer (BTreeMap ordered by deadline)
//! - `SocketFactory`: non-blocking `mio::net::TcpStream`
//! - `Resolver`: lookup di worker thread, hasil dikirim lewat channel +
//!   `mio::Waker`
//!
//! Semua state bersama ada di `Reactor` (Rc<RefCell>), dan borrow tidak
//! pernah ditahan saat memanggil engine karena engine memanggil balik
//! collaborator.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::NetError;
use crate::protocol::{Message, MessageKind};

use super::backend::{
    ConnectStatus, EventLoop, IoStatus, Resolver, Socket, SocketEvent, SocketFactory,
};
use super::engine::Engine;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
const SOCKET_BUFFER_SIZE: i32 = 256 * 1024;

type Resolved = (u64, Result<Vec<IpAddr>, NetError>);

/// Socket yang terdaftar di poll
#[derive(Debug)]
struct TokenEntry {
    id: u64,
    attempt: u32,
    connecting: bool,
    /// Dibagi dengan `MioSocket` supaya hasil connect bisa dicek di poll loop
    stream: Option<Rc<TcpStream>>,
}

/// State bersama runtime dan collaborator
struct Reactor {
    poll: Poll,
    ready: VecDeque<Message>,
    timers: BTreeMap<(Instant, u64), Message>,
    timer_seq: u64,
    tokens: HashMap<Token, TokenEntry>,
    next_token: usize,
}

impl Reactor {
    fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Message berikutnya: ready queue dulu, lalu timer yang sudah jatuh tempo
    fn pop_due(&mut self, now: Instant) -> Option<Message> {
        if let Some(msg) = self.ready.pop_front() {
            return Some(msg);
        }
        let key = *self.timers.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.timers.remove(&key)
    }
}

/// Runtime single-threaded yang menjalankan engine di atas mio
pub struct MioRuntime {
    reactor: Rc<RefCell<Reactor>>,
    events: Events,
    resolved_rx: Receiver<Resolved>,
    resolved_tx: Sender<Resolved>,
    waker: Arc<Waker>,
}

impl MioRuntime {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (resolved_tx, resolved_rx) = mpsc::channel();

        Ok(Self {
            reactor: Rc::new(RefCell::new(Reactor {
                poll,
                ready: VecDeque::new(),
                timers: BTreeMap::new(),
                timer_seq: 0,
                tokens: HashMap::new(),
                next_token: 0,
            })),
            events: Events::with_capacity(EVENTS_CAPACITY),
            resolved_rx,
            resolved_tx,
            waker,
        })
    }

    pub fn event_loop(&self) -> Box<dyn EventLoop> {
        Box::new(MioEventLoop {
            reactor: Rc::clone(&self.reactor),
        })
    }

    pub fn resolver(&self) -> Box<dyn Resolver> {
        Box::new(ThreadedResolver {
            tx: self.resolved_tx.clone(),
            waker: Arc::clone(&self.waker),
        })
    }

    pub fn socket_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(MioSocketFactory {
            reactor: Rc::clone(&self.reactor),
        })
    }

    /// Satu putaran: poll I/O, kirim completion ke engine, jalankan message
    /// yang jatuh tempo. Returns event untuk consumer.
    pub fn turn(&mut self, engine: &mut Engine, max_wait: Duration) -> io::Result<Vec<Message>> {
        let mut io_events = Vec::new();
        {
            let mut reactor = self.reactor.borrow_mut();
            let timeout = if reactor.ready.is_empty() {
                reactor
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .map_or(max_wait, |wait| wait.min(max_wait))
            } else {
                Duration::ZERO
            };

            match reactor.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }

            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let Some(entry) = reactor.tokens.get_mut(&event.token()) else {
                    continue;
                };
                let (id, attempt) = (entry.id, entry.attempt);

                if entry.connecting {
                    if !(event.is_writable() || event.is_error() || event.is_write_closed()) {
                        continue;
                    }
                    let outcome = match entry.stream.as_deref() {
                        Some(stream) => connect_outcome(stream),
                        None => Err(NetError::ConnectFailed),
                    };
                    match outcome {
                        Ok(false) => continue,
                        Ok(true) => {
                            entry.connecting = false;
                            io_events.push((id, attempt, SocketEvent::Connected));
                        }
                        Err(err) => {
                            entry.connecting = false;
                            io_events.push((id, attempt, SocketEvent::ConnectFailed(err)));
                            continue;
                        }
                    }
                } else if event.is_error() {
                    io_events.push((id, attempt, SocketEvent::Error(NetError::ConnectionReset)));
                    continue;
                } else if event.is_writable() {
                    io_events.push((id, attempt, SocketEvent::Writable));
                }
                if event.is_readable() {
                    io_events.push((id, attempt, SocketEvent::Readable));
                }
            }
        }

        while let Ok((id, result)) = self.resolved_rx.try_recv() {
            engine.on_resolved(id, result);
        }
        for (id, attempt, event) in io_events {
            trace!(conn = id, attempt, ?event, "socket event");
            engine.on_socket_event(id, attempt, event);
        }

        let mut emitted = Vec::new();
        loop {
            let next = self.reactor.borrow_mut().pop_due(Instant::now());
            let Some(msg) = next else {
                break;
            };
            if msg.kind.is_emitted() {
                emitted.push(msg);
            } else {
                engine.handle_message(msg);
            }
        }
        Ok(emitted)
    }
}

// === EventLoop ===

struct MioEventLoop {
    reactor: Rc<RefCell<Reactor>>,
}

impl EventLoop for MioEventLoop {
    fn post_message(&mut self, msg: Message) {
        self.reactor.borrow_mut().ready.push_back(msg);
    }

    fn post_delayed_message(&mut self, msg: Message, delay: Duration) {
        let mut reactor = self.reactor.borrow_mut();
        let seq = reactor.timer_seq;
        reactor.timer_seq += 1;
        reactor.timers.insert((Instant::now() + delay, seq), msg);
    }

    fn remove_delayed_message(&mut self, kind: MessageKind, id: u64) {
        self.reactor
            .borrow_mut()
            .timers
            .retain(|_, msg| !(msg.kind == kind && msg.id == id));
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

// === Sockets ===

struct MioSocketFactory {
    reactor: Rc<RefCell<Reactor>>,
}

impl SocketFactory for MioSocketFactory {
    fn create(
        &mut self,
        id: u64,
        attempt: u32,
        addr: SocketAddr,
    ) -> Result<Box<dyn Socket>, NetError> {
        let mut reactor = self.reactor.borrow_mut();
        let token = Token(reactor.next_token);
        reactor.next_token = reactor.next_token.wrapping_add(1) % WAKER_TOKEN.0;
        reactor.tokens.insert(
            token,
            TokenEntry {
                id,
                attempt,
                connecting: true,
                stream: None,
            },
        );
        trace!(conn = id, attempt, %addr, ?token, "socket created");

        Ok(Box::new(MioSocket {
            stream: None,
            token,
            reactor: Rc::clone(&self.reactor),
        }))
    }
}

struct MioSocket {
    stream: Option<Rc<TcpStream>>,
    token: Token,
    reactor: Rc<RefCell<Reactor>>,
}

impl MioSocket {
    fn stream(&self) -> Result<&TcpStream, NetError> {
        self.stream.as_deref().ok_or(NetError::ConnectFailed)
    }
}

/// Writable pertama belum tentu connect sukses: cek SO_ERROR dulu, lalu
/// `peer_addr`. `Ok(false)` = masih in progress, tunggu event berikutnya.
fn connect_outcome(stream: &TcpStream) -> Result<bool, NetError> {
    if let Some(err) = stream.take_error().map_err(NetError::from_io)? {
        return Err(NetError::from_io(err));
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e)
            if e.kind() == io::ErrorKind::NotConnected
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(e) => Err(NetError::from_io(e)),
    }
}

/// TCP_NODELAY + buffer besar, error diabaikan (tidak semua platform support)
fn tune_stream(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%err, "TCP_NODELAY not applied");
    }

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let optval: libc::c_int = SOCKET_BUFFER_SIZE;
        // SAFETY: fd valid selama `stream` hidup, optval adalah c_int lokal
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

impl Socket for MioSocket {
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectStatus, NetError> {
        let mut stream = TcpStream::connect(addr).map_err(NetError::from_io)?;
        tune_stream(&stream);
        self.reactor
            .borrow()
            .poll
            .registry()
            .register(
                &mut stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(NetError::from_io)?;
        let stream = Rc::new(stream);
        if let Some(entry) = self.reactor.borrow_mut().tokens.get_mut(&self.token) {
            entry.stream = Some(Rc::clone(&stream));
        }
        self.stream = Some(stream);
        Ok(ConnectStatus::InProgress)
    }

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, NetError> {
        let mut stream = self.stream()?;
        match stream.write(buf) {
            Ok(0) if !buf.is_empty() => Ok(IoStatus::Closed),
            Ok(n) => Ok(IoStatus::Done(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(IoStatus::WouldBlock),
            Err(e) => Err(NetError::from_io(e)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, NetError> {
        let mut stream = self.stream()?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Ok(IoStatus::Closed),
            Ok(n) => Ok(IoStatus::Done(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(IoStatus::WouldBlock),
            Err(e) => Err(NetError::from_io(e)),
        }
    }

    fn close(&mut self) {
        let mut reactor = self.reactor.borrow_mut();
        // Entry dibuang dulu supaya stream tidak lagi dibagi
        drop(reactor.tokens.remove(&self.token));
        let Some(stream) = self.stream.take() else {
            return;
        };
        match Rc::try_unwrap(stream) {
            Ok(mut stream) => {
                if let Err(err) = reactor.poll.registry().deregister(&mut stream) {
                    debug!(%err, "deregister failed");
                }
            }
            // Fd tertutup saat drop, epoll ikut membuangnya
            Err(_) => debug!(token = ?self.token, "stream still shared, dropped without deregister"),
        }
    }
}

// === Resolver ===

struct ThreadedResolver {
    tx: Sender<Resolved>,
    waker: Arc<Waker>,
}

fn lookup(host: &str) -> Result<Vec<IpAddr>, NetError> {
    let addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|_| NetError::HostNotFound)?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}

impl Resolver for ThreadedResolver {
    fn resolve(&mut self, id: u64, host: &str) -> Result<(), NetError> {
        let host = host.to_string();
        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);

        thread::Builder::new()
            .name(format!("sluice-resolve-{id}"))
            .spawn(move || {
                let result = lookup(&host);
                if tx.send((id, result)).is_ok() {
                    if let Err(err) = waker.wake() {
                        warn!(%err, "failed to wake event loop");
                    }
                }
            })
            .map_err(|_| NetError::TryAgain)?;
        Ok(())
    }

    fn cancel(&mut self, id: u64) {
        // Worker tetap jalan; engine membuang hasil untuk connection yang sudah tidak resolving
        trace!(conn = id, "resolve cancelled");
    }

    fn resolve_sync(&mut self, host: &str) -> Result<Vec<IpAddr>, NetError> {
        lookup(host)
    }
}
