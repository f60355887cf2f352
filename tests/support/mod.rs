//! In-memory collaborator untuk integration test
//!
//! - `FakeLoop`: manual clock, delayed message urut (deadline, seq)
//! - `FakeResolver`: lookup ditahan sampai test memanggil `complete_resolve`
//! - `FakeNet` / `FakeSocket`: connect behavior per address, partial write
//!   dengan write limit, inbound bytes yang bisa di-push dari test

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use sluice::network::{
    ConnectStatus, EventLoop, IoStatus, Resolver, Socket, SocketEvent, SocketFactory,
};
use sluice::{Engine, EngineConfig, Message, MessageKind, NetError};

// === Event loop ===

#[derive(Debug)]
pub struct LoopState {
    pub now: Instant,
    pub ready: VecDeque<Message>,
    pub timers: Vec<(Instant, u64, Message)>,
    seq: u64,
}

impl LoopState {
    fn pop_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    /// Timer paling awal yang deadline-nya <= `limit`
    fn pop_timer(&mut self, limit: Instant) -> Option<Message> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, (deadline, _, _))| *deadline <= limit)
            .min_by_key(|(_, (deadline, seq, _))| (*deadline, *seq))
            .map(|(index, _)| index)?;
        let (deadline, _, msg) = self.timers.remove(index);
        if deadline > self.now {
            self.now = deadline;
        }
        Some(msg)
    }

    pub fn has_timer(&self, kind: MessageKind, id: u64) -> bool {
        self.timers
            .iter()
            .any(|(_, _, msg)| msg.kind == kind && msg.id == id)
    }
}

pub struct FakeLoop {
    state: Rc<RefCell<LoopState>>,
}

impl EventLoop for FakeLoop {
    fn post_message(&mut self, msg: Message) {
        self.state.borrow_mut().ready.push_back(msg);
    }

    fn post_delayed_message(&mut self, msg: Message, delay: Duration) {
        let mut state = self.state.borrow_mut();
        let deadline = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.timers.push((deadline, seq, msg));
    }

    fn remove_delayed_message(&mut self, kind: MessageKind, id: u64) {
        self.state
            .borrow_mut()
            .timers
            .retain(|(_, _, msg)| !(msg.kind == kind && msg.id == id));
    }

    fn now(&self) -> Instant {
        self.state.borrow().now
    }
}

// === Resolver ===

/// Jawaban resolver yang bisa di-clone (NetError tidak Clone)
#[derive(Debug, Clone)]
pub enum Answer {
    Addrs(Vec<IpAddr>),
    NotFound,
    TryAgain,
}

impl Answer {
    pub fn into_result(self) -> Result<Vec<IpAddr>, NetError> {
        match self {
            Answer::Addrs(addrs) => Ok(addrs),
            Answer::NotFound => Err(NetError::HostNotFound),
            Answer::TryAgain => Err(NetError::TryAgain),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResolverState {
    pub pending: Vec<(u64, String)>,
    pub cancelled: Vec<u64>,
    pub lookups: usize,
    pub sync_answers: HashMap<String, Answer>,
}

pub struct FakeResolver {
    state: Rc<RefCell<ResolverState>>,
}

impl Resolver for FakeResolver {
    fn resolve(&mut self, id: u64, host: &str) -> Result<(), NetError> {
        let mut state = self.state.borrow_mut();
        state.lookups += 1;
        state.pending.push((id, host.to_string()));
        Ok(())
    }

    fn cancel(&mut self, id: u64) {
        let mut state = self.state.borrow_mut();
        state.pending.retain(|(pending, _)| *pending != id);
        state.cancelled.push(id);
    }

    fn resolve_sync(&mut self, host: &str) -> Result<Vec<IpAddr>, NetError> {
        let mut state = self.state.borrow_mut();
        state.lookups += 1;
        state
            .sync_answers
            .get(host)
            .cloned()
            .unwrap_or(Answer::NotFound)
            .into_result()
    }
}

// === Sockets ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// connect() langsung sukses
    Immediate,
    /// connect() InProgress; test mengirim `SocketEvent::Connected`
    Pending,
    /// connect() langsung error
    Refuse,
}

#[derive(Debug)]
pub struct SocketRecord {
    pub id: u64,
    pub attempt: u32,
    pub addr: SocketAddr,
    pub sent: Vec<u8>,
    /// Maksimum byte per `send()`; `Some(0)` = would block
    pub write_limit: Option<usize>,
    pub inbound: VecDeque<u8>,
    pub peer_closed: bool,
    pub closed: bool,
    pub connected: bool,
}

#[derive(Debug)]
pub struct NetState {
    pub default_behavior: ConnectBehavior,
    pub behaviors: HashMap<IpAddr, ConnectBehavior>,
    pub sockets: Vec<SocketRecord>,
    pub default_write_limit: Option<usize>,
}

impl NetState {
    pub fn open_sockets(&self) -> usize {
        self.sockets.iter().filter(|s| !s.closed).count()
    }

    pub fn for_conn(&self, id: u64) -> impl Iterator<Item = &SocketRecord> {
        self.sockets.iter().filter(move |s| s.id == id)
    }

    /// Socket terbuka terakhir milik connection
    pub fn live_mut(&mut self, id: u64) -> Option<&mut SocketRecord> {
        self.sockets
            .iter_mut()
            .rev()
            .find(|s| s.id == id && !s.closed)
    }
}

pub struct FakeFactory {
    state: Rc<RefCell<NetState>>,
}

impl SocketFactory for FakeFactory {
    fn create(
        &mut self,
        id: u64,
        attempt: u32,
        addr: SocketAddr,
    ) -> Result<Box<dyn Socket>, NetError> {
        let mut state = self.state.borrow_mut();
        let write_limit = state.default_write_limit;
        state.sockets.push(SocketRecord {
            id,
            attempt,
            addr,
            sent: Vec::new(),
            write_limit,
            inbound: VecDeque::new(),
            peer_closed: false,
            closed: false,
            connected: false,
        });
        let index = state.sockets.len() - 1;
        Ok(Box::new(FakeSocket {
            state: Rc::clone(&self.state),
            index,
        }))
    }
}

pub struct FakeSocket {
    state: Rc<RefCell<NetState>>,
    index: usize,
}

impl Socket for FakeSocket {
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectStatus, NetError> {
        let mut state = self.state.borrow_mut();
        let behavior = state
            .behaviors
            .get(&addr.ip())
            .copied()
            .unwrap_or(state.default_behavior);
        match behavior {
            ConnectBehavior::Immediate => {
                state.sockets[self.index].connected = true;
                Ok(ConnectStatus::Connected)
            }
            ConnectBehavior::Pending => Ok(ConnectStatus::InProgress),
            ConnectBehavior::Refuse => Err(NetError::ConnectionRefused),
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, NetError> {
        let mut state = self.state.borrow_mut();
        let record = &mut state.sockets[self.index];
        if record.peer_closed {
            return Ok(IoStatus::Closed);
        }
        let n = record.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        if n == 0 && !buf.is_empty() {
            return Ok(IoStatus::WouldBlock);
        }
        record.sent.extend_from_slice(&buf[..n]);
        Ok(IoStatus::Done(n))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, NetError> {
        let mut state = self.state.borrow_mut();
        let record = &mut state.sockets[self.index];
        if record.inbound.is_empty() {
            return Ok(if record.peer_closed {
                IoStatus::Closed
            } else {
                IoStatus::WouldBlock
            });
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = record.inbound.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(IoStatus::Done(n))
    }

    fn close(&mut self) {
        self.state.borrow_mut().sockets[self.index].closed = true;
    }
}

// === Harness ===

pub struct Harness {
    pub engine: Engine,
    pub clock: Rc<RefCell<LoopState>>,
    pub net: Rc<RefCell<NetState>>,
    pub resolver: Rc<RefCell<ResolverState>>,
    pub emitted: Vec<Message>,
}

pub fn ip(text: &str) -> IpAddr {
    text.parse().expect("test ip literal")
}

pub fn config(max_connections: u32, max_per_host: u32) -> EngineConfig {
    EngineConfig {
        max_connections,
        max_connections_per_host: max_per_host,
        connect_timeout_ms: None,
        race_delay_ms: 300,
        max_connect_retries: 2,
        sweep_interval_ms: 10,
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let clock = Rc::new(RefCell::new(LoopState {
            now: Instant::now(),
            ready: VecDeque::new(),
            timers: Vec::new(),
            seq: 0,
        }));
        let net = Rc::new(RefCell::new(NetState {
            default_behavior: ConnectBehavior::Pending,
            behaviors: HashMap::new(),
            sockets: Vec::new(),
            default_write_limit: None,
        }));
        let resolver = Rc::new(RefCell::new(ResolverState::default()));

        let engine = Engine::new(
            config,
            Box::new(FakeLoop {
                state: Rc::clone(&clock),
            }),
            Box::new(FakeResolver {
                state: Rc::clone(&resolver),
            }),
            Box::new(FakeFactory {
                state: Rc::clone(&net),
            }),
        )
        .expect("valid test config");

        Self {
            engine,
            clock,
            net,
            resolver,
            emitted: Vec::new(),
        }
    }

    pub fn behave(&self, addr: &str, behavior: ConnectBehavior) {
        self.net.borrow_mut().behaviors.insert(ip(addr), behavior);
    }

    /// Proses semua message yang siap tanpa memajukan clock
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let next = self.clock.borrow_mut().pop_ready();
            let Some(msg) = next else {
                return;
            };
            self.dispatch(msg);
        }
        panic!("message loop did not settle");
    }

    fn dispatch(&mut self, msg: Message) {
        if msg.kind.is_emitted() {
            self.emitted.push(msg);
        } else {
            self.engine.handle_message(msg);
        }
    }

    /// Majukan clock, jalankan timer yang jatuh tempo secara berurutan
    pub fn advance(&mut self, by: Duration) {
        let limit = self.clock.borrow().now + by;
        self.pump();
        for _ in 0..10_000 {
            let next = self.clock.borrow_mut().pop_timer(limit);
            let Some(msg) = next else {
                self.clock.borrow_mut().now = limit;
                return;
            };
            self.dispatch(msg);
            self.pump();
        }
        panic!("timers did not settle");
    }

    /// Satu sweep interval
    pub fn tick(&mut self) {
        let interval = self.engine.config().sweep_interval();
        self.advance(interval);
    }

    pub fn complete_resolve(&mut self, id: u64, answer: Answer) {
        self.resolver
            .borrow_mut()
            .pending
            .retain(|(pending, _)| *pending != id);
        self.engine.on_resolved(id, answer.into_result());
        self.pump();
    }

    pub fn socket_event(&mut self, id: u64, attempt: u32, event: SocketEvent) {
        self.engine.on_socket_event(id, attempt, event);
        self.pump();
    }

    /// Attempt number socket terbuka terakhir milik connection
    pub fn live_attempt(&self, id: u64) -> Option<u32> {
        self.net.borrow_mut().live_mut(id).map(|s| s.attempt)
    }

    pub fn connect_live(&mut self, id: u64) {
        let attempt = self.live_attempt(id).expect("connection has a live socket");
        self.socket_event(id, attempt, SocketEvent::Connected);
    }

    pub fn push_inbound(&mut self, id: u64, data: &[u8]) {
        let mut net = self.net.borrow_mut();
        let socket = net.live_mut(id).expect("connection has a live socket");
        socket.inbound.extend(data.iter().copied());
    }

    pub fn events_for(&self, id: u64) -> Vec<MessageKind> {
        self.emitted
            .iter()
            .filter(|msg| msg.id == id)
            .map(|msg| msg.kind)
            .collect()
    }

    pub fn count_events(&self, id: u64, kind: MessageKind) -> usize {
        self.emitted
            .iter()
            .filter(|msg| msg.id == id && msg.kind == kind)
            .count()
    }

    pub fn sent_bytes(&self, id: u64) -> Vec<u8> {
        self.net
            .borrow()
            .for_conn(id)
            .flat_map(|s| s.sent.iter().copied())
            .collect()
    }

    /// Invariant budget: global == jumlah socket terbuka, global <= max
    pub fn assert_budget(&self) {
        let stats = self.engine.stats();
        let open = self.net.borrow().open_sockets();
        assert_eq!(stats.active_sockets as usize, open, "global counter != open sockets");
        assert!(stats.active_sockets <= self.engine.config().max_connections);
    }
}
