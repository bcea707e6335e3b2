//! reef — microVM sandbox lifecycle core.
//!
//! A sandbox is a lightweight VM launched from a *template*: a kernel
//! snapshot (snapfile), a memory image (memfile) and a root filesystem
//! image, each memfile/rootfs generation carrying a header that maps every
//! virtual block to the newest ancestor diff containing it.
//!
//! This crate owns three things:
//!
//! - **Construction** ([`Sandbox::create`]): wires the network slot,
//!   per-sandbox files, rootfs CoW overlay, userfault pager and hypervisor
//!   into one ordered start-up, registering the inverse of every completed
//!   step so a failure anywhere unwinds cleanly.
//! - **Supervision** ([`Sandbox::wait`], [`Sandbox::stop`], the health
//!   loop): whichever of the hypervisor/pager pair dies first takes the
//!   peer down with it, and teardown runs exactly once.
//! - **Snapshots** ([`Sandbox::snapshot`]): pause, dump, dirty-diff against
//!   the parent generation, and merge the generational mappings so restores
//!   keep reading untouched blocks from the ancestry chain.
//!
//! Slot allocation, template fetching, DNS/proxy registration, the nbd
//! device pool and the pager/hypervisor binaries are external
//! collaborators behind traits in [`net`], [`template`], [`device`],
//! [`pager`], [`hypervisor`] and [`rootfs`].

pub mod config;
pub mod device;
pub mod hypervisor;
pub mod logging;
pub mod net;
pub mod pager;
pub mod rootfs;
pub mod sandbox;
pub mod template;

pub use config::{RuntimeEnv, SandboxConfig};
pub use sandbox::cleanup::Cleanup;
pub use sandbox::files::{SandboxFiles, SnapshotFiles};
pub use sandbox::health::CancelContext;
pub use sandbox::snapshot::Snapshot;
pub use sandbox::{Sandbox, SandboxDeps, SandboxMetadata, SandboxOptions};
