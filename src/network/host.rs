//! Host record: nama host, daftar address hasil resolve, dan counter per-host
//!
//! Record di-share (`Rc`) oleh semua connection ke host yang sama dan
//! lifetime-nya dikelola embedder lewat `HostTable`. Connection hanya
//! membaca dan mengubah counter/marking di dalamnya.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::{Rc, Weak};

use crate::error::{EngineError, EngineResult};

/// Klasifikasi network, urut dari paling internal ke paling publik
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkType {
    Localhost,
    Private,
    Public,
}

impl NetworkType {
    pub fn classify(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => classify_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => classify_v4(v4),
                None => classify_v6(v6),
            },
        }
    }

    /// Origin di network `self` boleh mencapai `target`?
    ///
    /// Request tidak boleh "turun" ke network yang lebih internal,
    /// misalnya dari public ke private/localhost.
    #[inline]
    pub fn may_reach(self, target: NetworkType) -> bool {
        target >= self
    }
}

fn classify_v4(ip: Ipv4Addr) -> NetworkType {
    if ip.is_loopback() || ip.is_unspecified() {
        NetworkType::Localhost
    } else if ip.is_private() || ip.is_link_local() || is_shared_v4(ip) {
        NetworkType::Private
    } else {
        NetworkType::Public
    }
}

// 100.64.0.0/10 (carrier-grade NAT)
fn is_shared_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 100 && (b & 0xc0) == 64
}

fn classify_v6(ip: Ipv6Addr) -> NetworkType {
    let first = ip.segments()[0];
    if ip.is_loopback() || ip.is_unspecified() {
        NetworkType::Localhost
    } else if (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 {
        // unique local fc00::/7, link-local fe80::/10
        NetworkType::Private
    } else {
        NetworkType::Public
    }
}

/// Hasil validasi syntax host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    /// IP literal, tidak perlu resolver
    Literal(IpAddr),
    /// Local machine
    Localhost,
    /// Nama yang harus di-resolve
    Name,
}

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Validasi syntax host name dan deteksi literal/localhost
pub fn validate_host(name: &str) -> EngineResult<HostKind> {
    let illegal = || EngineError::IllegalHost(name.to_string());

    if name.is_empty() || name.len() > MAX_HOST_LEN + 2 {
        return Err(illegal());
    }

    let bare = name
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'));
    if let Some(inner) = bare {
        return inner
            .parse::<Ipv6Addr>()
            .map(|ip| HostKind::Literal(IpAddr::V6(ip)))
            .map_err(|_| illegal());
    }

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(HostKind::Literal(ip));
    }

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > MAX_HOST_LEN {
        return Err(illegal());
    }

    for label in trimmed.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(illegal());
        }
    }

    if trimmed.eq_ignore_ascii_case("localhost") {
        return Ok(HostKind::Localhost);
    }

    Ok(HostKind::Name)
}

/// State satu address dalam host record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    Untried,
    Trying,
    Succeeded,
    /// Gagal connect
    Failed,
    /// Kalah race happy-eyeballs; tidak di-penalize
    RaceLost,
}

impl AddrState {
    // Urutan preferensi saat memilih candidate
    fn rank(self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Untried | Self::Trying => 1,
            Self::RaceLost => 2,
            Self::Failed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AddressEntry {
    ip: IpAddr,
    state: AddrState,
}

/// Shared host record
pub struct HostRecord {
    name: String,
    addresses: RefCell<Vec<AddressEntry>>,
    active: Cell<u32>,
    local: Cell<bool>,
}

impl HostRecord {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            addresses: RefCell::new(Vec::new()),
            active: Cell::new(0),
            local: Cell::new(false),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jumlah socket aktif ke host ini
    #[inline(always)]
    pub fn active(&self) -> u32 {
        self.active.get()
    }

    pub(crate) fn increment_active(&self) {
        self.active.set(self.active.get() + 1);
    }

    pub(crate) fn decrement_active(&self) {
        let current = self.active.get();
        debug_assert!(current > 0, "per-host counter underflow for {}", self.name);
        self.active.set(current.saturating_sub(1));
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.local.get()
    }

    /// Tandai host sebagai local machine; resolve berikutnya di-skip.
    pub fn mark_local(&self) {
        self.local.set(true);
        let mut addresses = self.addresses.borrow_mut();
        if addresses.is_empty() {
            for ip in [
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ] {
                addresses.push(AddressEntry {
                    ip,
                    state: AddrState::Untried,
                });
            }
        }
    }

    /// Ganti daftar address (hasil resolve). Duplikat dibuang, urutan dijaga.
    pub fn set_addresses(&self, ips: &[IpAddr]) {
        let mut addresses = self.addresses.borrow_mut();
        addresses.clear();
        for &ip in ips {
            if !addresses.iter().any(|entry| entry.ip == ip) {
                addresses.push(AddressEntry {
                    ip,
                    state: AddrState::Untried,
                });
            }
        }
    }

    /// Buang semua candidate; load berikutnya harus resolve ulang.
    pub fn clear_addresses(&self) {
        self.addresses.borrow_mut().clear();
    }

    #[inline]
    pub fn has_addresses(&self) -> bool {
        !self.addresses.borrow().is_empty()
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.borrow().iter().map(|entry| entry.ip).collect()
    }

    pub fn state_of(&self, ip: IpAddr) -> Option<AddrState> {
        self.addresses
            .borrow()
            .iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.state)
    }

    /// Network type host: address paling internal yang dimiliki
    pub fn network_type(&self) -> Option<NetworkType> {
        self.addresses
            .borrow()
            .iter()
            .map(|entry| NetworkType::classify(entry.ip))
            .min()
    }

    /// Pilih candidate berikutnya untuk satu load attempt.
    ///
    /// Address yang belum dicoba oleh load ini selalu didahulukan; setelah itu
    /// urut berdasarkan state (succeeded, untried, race-lost, failed).
    pub fn next_candidate(&self, tried: &[IpAddr]) -> Option<IpAddr> {
        self.addresses
            .borrow()
            .iter()
            .min_by_key(|entry| (tried.contains(&entry.ip), entry.state.rank()))
            .map(|entry| entry.ip)
    }

    /// Candidate untuk race: family berbeda dari `primary`, belum dicoba.
    pub fn alternate_candidate(&self, primary: IpAddr, tried: &[IpAddr]) -> Option<IpAddr> {
        self.addresses
            .borrow()
            .iter()
            .filter(|entry| entry.ip.is_ipv4() != primary.is_ipv4())
            .filter(|entry| !tried.contains(&entry.ip))
            .filter(|entry| entry.state != AddrState::Failed)
            .min_by_key(|entry| entry.state.rank())
            .map(|entry| entry.ip)
    }

    pub fn mark(&self, ip: IpAddr, state: AddrState) {
        if let Some(entry) = self
            .addresses
            .borrow_mut()
            .iter_mut()
            .find(|entry| entry.ip == ip)
        {
            entry.state = state;
        }
    }

    /// Race loser: tidak menimpa status `Failed` atau `Succeeded`
    pub fn mark_race_lost(&self, ip: IpAddr) {
        if let Some(entry) = self
            .addresses
            .borrow_mut()
            .iter_mut()
            .find(|entry| entry.ip == ip)
        {
            if matches!(entry.state, AddrState::Untried | AddrState::Trying) {
                entry.state = AddrState::RaceLost;
            }
        }
    }
}

impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRecord")
            .field("name", &self.name)
            .field("active", &self.active.get())
            .field("local", &self.local.get())
            .field("addresses", &self.addresses.borrow())
            .finish()
    }
}

/// Registry host record milik embedder
///
/// Menyimpan `Weak` sehingga record hilang saat connection terakhir
/// (dan embedder) melepasnya.
#[derive(Default)]
pub struct HostTable {
    hosts: HashMap<String, Weak<HostRecord>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ambil record yang sudah ada atau buat baru (nama case-insensitive)
    pub fn get_or_insert(&mut self, name: &str) -> Rc<HostRecord> {
        let key = name.to_ascii_lowercase();
        if let Some(host) = self.hosts.get(&key).and_then(Weak::upgrade) {
            return host;
        }

        let host = HostRecord::new(key.clone());
        self.hosts.insert(key, Rc::downgrade(&host));
        host
    }

    pub fn get(&self, name: &str) -> Option<Rc<HostRecord>> {
        self.hosts
            .get(&name.to_ascii_lowercase())
            .and_then(Weak::upgrade)
    }

    /// Buang entry yang record-nya sudah di-drop
    pub fn purge(&mut self) -> usize {
        let before = self.hosts.len();
        self.hosts.retain(|_, host| host.strong_count() > 0);
        before - self.hosts.len()
    }

    /// Iterate record yang masih hidup
    pub fn live(&self) -> impl Iterator<Item = Rc<HostRecord>> + '_ {
        self.hosts.values().filter_map(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
