//! Free host port probing.

use rand::Rng;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;
use tracing::debug;

/// Source of free host ports.
pub trait PortAllocator: Send + Sync {
    /// Find a port nothing is currently bound to.
    fn allocate(&self) -> Option<u16>;
}

/// Probes random ports in a high range by binding to them.
#[derive(Debug, Clone)]
pub struct FreePortFinder {
    /// Lowest candidate port
    pub min: u16,
    /// Highest candidate port
    pub max: u16,
    /// Random candidates to try before asking the OS
    pub attempts: u32,
}

impl Default for FreePortFinder {
    fn default() -> Self {
        Self {
            min: 40000,
            max: 60000,
            attempts: 50,
        }
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

impl PortAllocator for FreePortFinder {
    fn allocate(&self) -> Option<u16> {
        let mut rng = rand::rng();
        for _ in 0..self.attempts {
            let candidate = rng.random_range(self.min..=self.max);
            if is_free(candidate) {
                return Some(candidate);
            }
        }

        debug!(
            "No free port in {}..={} after {} attempts, asking the OS",
            self.min, self.max, self.attempts
        );
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .ok()
    }
}

/// Hands out consecutive ports without probing. Used where determinism matters.
#[derive(Debug)]
pub struct SequentialPorts {
    next: Mutex<Option<u16>>,
}

impl SequentialPorts {
    /// Start handing out ports at `first`.
    pub fn starting_at(first: u16) -> Self {
        Self {
            next: Mutex::new(Some(first)),
        }
    }

    /// An allocator that never finds a port.
    pub fn exhausted() -> Self {
        Self {
            next: Mutex::new(None),
        }
    }
}

impl PortAllocator for SequentialPorts {
    fn allocate(&self) -> Option<u16> {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        let port = (*next)?;
        *next = port.checked_add(1);
        Some(port)
    }
}
