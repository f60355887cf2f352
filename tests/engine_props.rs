//! Property test engine: urutan aksi acak dengan parent stage yang
//! memanggil balik engine dari dalam callback, dan urutan byte outbound
//! terhadap jadwal partial write sembarang.
//!
//! Jalankan dengan: cargo test --test engine_props

mod support;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use proptest::sample::Index;

use sluice::network::{SocketEvent, Stage};
use sluice::{ConnectOptions, Engine, EngineError, NetError, StageBase};

use support::{config, Answer, ConnectBehavior, Harness};

// =============================================================================
// Reentrancy
// =============================================================================

/// Reaksi parent stage saat menerima callback
#[derive(Debug, Clone, Copy)]
enum Reaction {
    Stop,
    Destroy,
    Send,
    EndLoading,
    Nothing,
}

/// Parent stage yang menjalankan script reaksi secara bergilir
struct ChaosStage {
    base: StageBase,
    script: Vec<Reaction>,
    cursor: Cell<usize>,
    callbacks: Cell<u32>,
    violations: RefCell<Vec<String>>,
}

impl ChaosStage {
    fn new(script: Vec<Reaction>) -> Rc<Self> {
        Rc::new(Self {
            base: StageBase::new(),
            script,
            cursor: Cell::new(0),
            callbacks: Cell::new(0),
            violations: RefCell::new(Vec::new()),
        })
    }

    fn react(&self, engine: &mut Engine, id: u64) {
        self.callbacks.set(self.callbacks.get() + 1);
        if self.script.is_empty() {
            return;
        }
        let cursor = self.cursor.get();
        self.cursor.set(cursor + 1);

        match self.script[cursor % self.script.len()] {
            Reaction::Stop => engine.stop(id),
            Reaction::Destroy => {
                engine.safe_destruction(id);
                if !engine.contains(id) {
                    self.violations
                        .borrow_mut()
                        .push(format!("conn {id} freed inside its own callback"));
                }
            }
            Reaction::Send => {
                let _ = engine.send_data(id, b"chaos".to_vec());
            }
            Reaction::EndLoading => engine.end_loading(id),
            Reaction::Nothing => {}
        }
    }
}

impl Stage for ChaosStage {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn process_received_data(&self, engine: &mut Engine, id: u64) {
        let mut buf = [0u8; 16];
        let _ = engine.read_data(id, &mut buf);
        self.react(engine, id);
    }

    fn loading_finished(&self, engine: &mut Engine, id: u64) {
        self.react(engine, id);
    }

    fn loading_failed(&self, engine: &mut Engine, id: u64, _error: &EngineError) {
        self.react(engine, id);
    }
}

/// Aksi dari luar terhadap satu connection yang masih hidup
#[derive(Debug, Clone)]
enum Action {
    InitLoad,
    Stop,
    Destroy,
    Connected,
    Readable,
    Send(usize),
    ConnectFailed,
    Resolve { retry: bool },
    Idle(bool),
}

#[derive(Debug, Clone)]
enum Op {
    Create {
        host: usize,
        script: Option<Vec<Reaction>>,
    },
    On(Index, Action),
    Advance(u64),
}

const HOSTS: [&str; 5] = ["10.7.0.1", "10.7.0.2", "10.7.0.3", "10.7.0.4", "name.test"];

fn reaction_strategy() -> impl Strategy<Value = Reaction> {
    prop_oneof![
        1 => Just(Reaction::Stop),
        2 => Just(Reaction::Destroy),
        1 => Just(Reaction::Send),
        1 => Just(Reaction::EndLoading),
        1 => Just(Reaction::Nothing),
    ]
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::InitLoad),
        Just(Action::Stop),
        Just(Action::Destroy),
        Just(Action::Connected),
        Just(Action::Readable),
        (1usize..=8).prop_map(Action::Send),
        Just(Action::ConnectFailed),
        any::<bool>().prop_map(|retry| Action::Resolve { retry }),
        any::<bool>().prop_map(Action::Idle),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (
            0..HOSTS.len(),
            prop::option::of(prop::collection::vec(reaction_strategy(), 1..8)),
        )
            .prop_map(|(host, script)| Op::Create { host, script }),
        8 => (any::<Index>(), action_strategy()).prop_map(|(target, action)| Op::On(target, action)),
        1 => (1u64..=25).prop_map(Op::Advance),
    ]
}

fn apply(h: &mut Harness, id: u64, action: &Action) {
    match action {
        Action::InitLoad => {
            let _ = h.engine.init_load(id);
            h.pump();
        }
        Action::Stop => h.engine.stop(id),
        Action::Destroy => {
            h.engine.safe_destruction(id);
            h.pump();
        }
        Action::Connected => {
            if let Some(attempt) = h.live_attempt(id) {
                h.socket_event(id, attempt, SocketEvent::Connected);
            }
        }
        Action::Readable => {
            if let Some(attempt) = h.live_attempt(id) {
                h.push_inbound(id, b"data");
                h.socket_event(id, attempt, SocketEvent::Readable);
            }
        }
        Action::Send(len) => {
            let _ = h.engine.send_data(id, vec![b'x'; *len]);
            h.pump();
        }
        Action::ConnectFailed => {
            if let Some(attempt) = h.live_attempt(id) {
                h.socket_event(
                    id,
                    attempt,
                    SocketEvent::ConnectFailed(NetError::ConnectionReset),
                );
            }
        }
        Action::Resolve { retry } => {
            let answer = if *retry {
                Answer::TryAgain
            } else {
                Answer::Addrs(vec!["10.7.0.9".parse().expect("literal")])
            };
            h.complete_resolve(id, answer);
        }
        Action::Idle(idle) => {
            let _ = h.engine.set_idle(id, *idle);
        }
    }
}

fn check_invariants(h: &Harness, live: &[u64], destroyed: &HashSet<u64>, step: usize) {
    h.assert_budget();
    for &id in live {
        if let Some(conn) = h.engine.connection(id) {
            assert!(
                !(conn.is_connected() && conn.is_closed()),
                "step {step}: conn {id} connected and closed"
            );
        }
    }
    for &id in destroyed {
        assert!(!h.engine.contains(id), "step {step}: conn {id} came back");
    }
    let tracked = live.iter().filter(|&&id| h.engine.contains(id)).count();
    assert_eq!(h.engine.connection_count(), tracked, "step {step}");
}

fn run(ops: &[Op]) {
    let mut cfg = config(3, 2);
    cfg.connect_timeout_ms = Some(40);
    let mut h = Harness::new(cfg);
    h.behave("10.7.0.1", ConnectBehavior::Immediate);
    h.behave("10.7.0.3", ConnectBehavior::Refuse);

    let mut live: Vec<u64> = Vec::new();
    let mut destroyed: HashSet<u64> = HashSet::new();
    let mut stages: Vec<Rc<ChaosStage>> = Vec::new();

    for (step, op) in ops.iter().enumerate() {
        match op {
            Op::Create { host, script } => {
                let parent = script.clone().map(|script| {
                    let stage = ChaosStage::new(script);
                    stages.push(Rc::clone(&stage));
                    stage as Rc<dyn Stage>
                });
                live.push(
                    h.engine
                        .create_connection(HOSTS[*host], ConnectOptions::new(80), parent),
                );
            }
            Op::On(target, action) => {
                if !live.is_empty() {
                    let id = live[target.index(live.len())];
                    apply(&mut h, id, action);
                }
            }
            Op::Advance(ms) => h.advance(Duration::from_millis(*ms)),
        }

        live.retain(|&id| {
            if h.engine.contains(id) {
                true
            } else {
                destroyed.insert(id);
                false
            }
        });
        check_invariants(&h, &live, &destroyed, step);
    }

    // Drain: semua connection di-destroy, sweeper menyelesaikan sisanya
    for &id in &live {
        h.engine.safe_destruction(id);
    }
    h.advance(Duration::from_millis(100));
    assert_eq!(h.engine.connection_count(), 0);
    assert_eq!(h.engine.stats().active_sockets, 0);
    assert_eq!(h.net.borrow().open_sockets(), 0);
    assert_eq!(h.engine.stats().pending_deletes, 0);

    for stage in &stages {
        assert!(
            stage.violations.borrow().is_empty(),
            "{:?}",
            stage.violations.borrow()
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]
    #[test]
    fn prop_reentrant_callbacks_keep_engine_consistent(
        ops in prop::collection::vec(op_strategy(), 1..400),
    ) {
        run(&ops);
    }
}

#[test]
fn test_chaos_stage_callbacks_fire() {
    let mut h = Harness::new(config(2, 2));
    h.behave("10.7.1.1", ConnectBehavior::Immediate);

    let stage = ChaosStage::new(vec![
        Reaction::Nothing,
        Reaction::Send,
        Reaction::Destroy,
    ]);
    let id = h.engine.create_connection(
        "10.7.1.1",
        ConnectOptions::new(80),
        Some(Rc::clone(&stage) as Rc<dyn Stage>),
    );
    h.engine.init_load(id).expect("immediate connect");

    for _ in 0..10 {
        let Some(attempt) = h.live_attempt(id) else {
            break;
        };
        h.push_inbound(id, b"x");
        h.socket_event(id, attempt, SocketEvent::Readable);
    }
    assert_eq!(stage.callbacks.get(), 3);
    assert!(stage.violations.borrow().is_empty());

    h.engine.safe_destruction(id);
    h.tick();
    assert!(!h.engine.contains(id));
    h.assert_budget();
}

// =============================================================================
// Outbound ordering
// =============================================================================

#[derive(Debug, Clone)]
enum Wire {
    Send(Vec<u8>),
    /// Socket writable dengan batas byte per `send()`; 0 = would block
    Writable(usize),
}

fn chunk_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..24)
}

fn wire_strategy() -> impl Strategy<Value = Wire> {
    prop_oneof![
        1 => chunk_strategy().prop_map(Wire::Send),
        2 => (0usize..12).prop_map(Wire::Writable),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]
    #[test]
    fn prop_outbound_order_survives_any_write_schedule(
        early in prop::collection::vec(chunk_strategy(), 0..4),
        initial_limit in 0usize..12,
        schedule in prop::collection::vec(wire_strategy(), 1..64),
        coalesce in prop::option::of(4usize..48),
    ) {
        let mut cfg = config(4, 4);
        cfg.coalesce_limit = coalesce;
        let mut h = Harness::new(cfg);
        h.net.borrow_mut().default_behavior = ConnectBehavior::Immediate;
        h.net.borrow_mut().default_write_limit = Some(initial_limit);

        let id = h.engine.create_connection("10.8.0.1", ConnectOptions::new(80), None);
        let mut expected = Vec::new();
        for chunk in &early {
            h.engine.send_data(id, chunk.clone()).unwrap();
            expected.extend_from_slice(chunk);
        }
        h.engine.init_load(id).unwrap();
        h.pump();
        let attempt = h.live_attempt(id).unwrap();

        for wire in &schedule {
            match wire {
                Wire::Send(chunk) => {
                    h.engine.send_data(id, chunk.clone()).unwrap();
                    expected.extend_from_slice(chunk);
                    h.pump();
                }
                Wire::Writable(limit) => {
                    h.net.borrow_mut().live_mut(id).unwrap().write_limit = Some(*limit);
                    h.socket_event(id, attempt, SocketEvent::Writable);
                }
            }
            let sent = h.sent_bytes(id);
            prop_assert!(expected.starts_with(&sent));
        }

        h.net.borrow_mut().live_mut(id).unwrap().write_limit = None;
        h.socket_event(id, attempt, SocketEvent::Writable);
        prop_assert_eq!(h.sent_bytes(id), expected);
        prop_assert_eq!(h.engine.connection(id).unwrap().outbound_len(), 0);
        h.assert_budget();
    }
}
