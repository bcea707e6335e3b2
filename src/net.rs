//! Host networking collaborators.
//!
//! Slot allocation, DNS and the ingress proxy live outside this crate; the
//! sandbox core only acquires a slot at construction, publishes the
//! `(sandbox_id → host_ip)` pair once the VM is live, and undoes both on
//! teardown.

use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;

/// A leased network slot. Immutable for the sandbox's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSlot {
    /// Pool index, used by the pool to identify the lease on return.
    pub idx: u32,
    /// Host-side IP the guest agent is reachable at.
    pub host_ip: Ipv4Addr,
}

impl NetworkSlot {
    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }
}

/// Pre-provisioned slot pool.
#[async_trait]
pub trait NetworkPool: Send + Sync {
    async fn get(&self) -> Result<NetworkSlot>;

    /// Returns a slot to the pool. Idempotent per lease.
    async fn release(&self, slot: NetworkSlot) -> Result<()>;
}

/// Sandbox hostname registration.
#[async_trait]
pub trait Dns: Send + Sync {
    async fn add(&self, sandbox_id: &str, ip: Ipv4Addr);

    async fn remove(&self, sandbox_id: &str, ip: Ipv4Addr);
}

/// Ingress proxy routing table.
#[async_trait]
pub trait Proxy: Send + Sync {
    async fn add_sandbox(&self, sandbox_id: &str, ip: Ipv4Addr, team_id: &str);

    async fn remove_sandbox(&self, sandbox_id: &str, ip: Ipv4Addr);
}
