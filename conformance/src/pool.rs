//! Local address allocation for synthetic peers.
//!
//! A run draws its peer addresses from one IPv4 subnet. Each synthetic peer
//! binds its socket to an address leased from the [`AddressPool`], so the
//! target sees every peer as a distinct network identity.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Failures while preparing the address list. All of them are fatal for a run.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid subnet {input:?}: {detail}")]
    InvalidSubnet { input: String, detail: String },

    #[error("subnet can supply {available} addresses, {requested} requested")]
    SubnetTooSmall { requested: usize, available: u64 },

    #[error("binding {addr} on {interface} failed: {detail}")]
    Bind {
        addr: IpAddr,
        interface: String,
        detail: String,
    },

    #[error("address list {path}: {detail}")]
    AddressList { path: PathBuf, detail: String },

    #[error("address {0} listed twice")]
    DuplicateAddress(IpAddr),

    #[error("address pool is empty")]
    Empty,
}

/// No address is free right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("address pool exhausted ({capacity} addresses, all checked out)")]
pub struct PoolExhausted {
    pub capacity: usize,
}

// =============================================================================
// Subnet
// =============================================================================

/// IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    base: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, AllocationError> {
        let input = format!("{base}/{prefix}");
        if prefix > 32 {
            return Err(AllocationError::InvalidSubnet {
                input,
                detail: "prefix longer than 32 bits".into(),
            });
        }
        let subnet = Self { base, prefix };
        if u32::from(base) & !subnet.mask() != 0 {
            return Err(AllocationError::InvalidSubnet {
                input,
                detail: "host bits set in base address".into(),
            });
        }
        Ok(subnet)
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0)
    }

    pub fn is_loopback(&self) -> bool {
        self.base.is_loopback()
    }

    /// Range of usable host addresses as integers (inclusive).
    fn host_range(&self) -> (u32, u32) {
        let first = u32::from(self.base);
        let last = first | !self.mask();
        if self.prefix >= 31 {
            // Point-to-point and single-host networks have no network or
            // broadcast address (RFC 3021).
            (first, last)
        } else {
            (first + 1, last - 1)
        }
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> u64 {
        let (first, last) = self.host_range();
        u64::from(last - first) + 1
    }

    /// Usable host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let (first, last) = self.host_range();
        (first..=last).map(Ipv4Addr::from)
    }
}

impl FromStr for Subnet {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| AllocationError::InvalidSubnet {
            input: s.to_string(),
            detail: detail.to_string(),
        };
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(|| invalid("missing /prefix"))?;
        let base: Ipv4Addr = addr.parse().map_err(|_| invalid("not an IPv4 address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("prefix is not a number"))?;
        Self::new(base, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

// =============================================================================
// Interface binding
// =============================================================================

/// Makes an address usable as a local source address.
pub trait InterfaceBinder: Send + Sync {
    fn bind(&self, addr: IpAddr, prefix: u8, interface: &str) -> Result<(), String>;
}

/// Leaves the interface untouched (loopback subnets route without binding).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBinder;

impl InterfaceBinder for NoopBinder {
    fn bind(&self, _addr: IpAddr, _prefix: u8, _interface: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Adds secondary addresses with `ip addr add`. Needs `CAP_NET_ADMIN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpCommandBinder;

impl InterfaceBinder for IpCommandBinder {
    fn bind(&self, addr: IpAddr, prefix: u8, interface: &str) -> Result<(), String> {
        let output = Command::new("ip")
            .args(["addr", "add", &format!("{addr}/{prefix}"), "dev", interface])
            .output()
            .map_err(|e| format!("failed to run ip: {e}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            debug!(%addr, interface, "address already bound");
            return Ok(());
        }
        Err(stderr.trim().to_string())
    }
}

/// Pick `count` host addresses from `subnet` and bind them on `interface`.
pub fn allocate(
    subnet: &Subnet,
    count: usize,
    interface: &str,
    binder: &dyn InterfaceBinder,
) -> Result<Vec<IpAddr>, AllocationError> {
    let available = subnet.host_count();
    if count as u64 > available {
        return Err(AllocationError::SubnetTooSmall {
            requested: count,
            available,
        });
    }

    let addrs: Vec<IpAddr> = subnet.hosts().take(count).map(IpAddr::V4).collect();
    for &addr in &addrs {
        binder
            .bind(addr, subnet.prefix(), interface)
            .map_err(|detail| AllocationError::Bind {
                addr,
                interface: interface.to_string(),
                detail,
            })?;
    }
    info!(%subnet, interface, count = addrs.len(), "allocated peer addresses");
    Ok(addrs)
}

/// Persist an address list as a JSON array.
pub fn write_address_list(path: &Path, addrs: &[IpAddr]) -> Result<(), AllocationError> {
    let list_err = |detail: String| AllocationError::AddressList {
        path: path.to_path_buf(),
        detail,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| list_err(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(addrs).map_err(|e| list_err(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| list_err(e.to_string()))
}

/// Read an address list written by [`write_address_list`].
pub fn read_address_list(path: &Path) -> Result<Vec<IpAddr>, AllocationError> {
    let list_err = |detail: String| AllocationError::AddressList {
        path: path.to_path_buf(),
        detail,
    };
    let text = std::fs::read_to_string(path).map_err(|e| list_err(e.to_string()))?;
    let addrs: Vec<IpAddr> = serde_json::from_str(&text).map_err(|e| list_err(e.to_string()))?;
    check_distinct(&addrs)?;
    Ok(addrs)
}

fn check_distinct(addrs: &[IpAddr]) -> Result<(), AllocationError> {
    let mut seen = HashSet::with_capacity(addrs.len());
    for addr in addrs {
        if !seen.insert(addr) {
            return Err(AllocationError::DuplicateAddress(*addr));
        }
    }
    Ok(())
}

// =============================================================================
// Pool
// =============================================================================

struct Slots {
    free: VecDeque<IpAddr>,
    leased: HashSet<IpAddr>,
}

/// Fixed set of local addresses handed out one lease at a time.
pub struct AddressPool {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl fmt::Debug for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl AddressPool {
    pub fn new(addrs: Vec<IpAddr>) -> Result<Arc<Self>, AllocationError> {
        if addrs.is_empty() {
            return Err(AllocationError::Empty);
        }
        check_distinct(&addrs)?;
        Ok(Arc::new(Self {
            capacity: addrs.len(),
            slots: Mutex::new(Slots {
                free: addrs.into(),
                leased: HashSet::new(),
            }),
        }))
    }

    /// Lease the next free address. It returns to the pool when the lease drops.
    pub fn checkout(self: &Arc<Self>) -> Result<AddressLease, PoolExhausted> {
        let mut slots = self.slots.lock();
        let addr = slots.free.pop_front().ok_or(PoolExhausted {
            capacity: self.capacity,
        })?;
        slots.leased.insert(addr);
        Ok(AddressLease {
            addr,
            pool: Arc::clone(self),
        })
    }

    fn give_back(&self, addr: IpAddr) {
        let mut slots = self.slots.lock();
        if slots.leased.remove(&addr) {
            slots.free.push_back(addr);
        }
    }

    pub fn available(&self) -> usize {
        self.slots.lock().free.len()
    }

    pub fn checked_out(&self) -> usize {
        self.slots.lock().leased.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive use of one pool address.
pub struct AddressLease {
    addr: IpAddr,
    pool: Arc<AddressPool>,
}

impl AddressLease {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl fmt::Debug for AddressLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AddressLease").field(&self.addr).finish()
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        self.pool.give_back(self.addr);
    }
}
