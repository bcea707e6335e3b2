//! Fake collaborators for the sandbox scenario tests.
//!
//! Every external contract the sandbox core consumes (template cache,
//! network pool, device pool, rootfs CoW device, pager, hypervisor, DNS,
//! proxy) has an in-memory fake here that records what was done to it, so
//! tests can assert the exact inverse-teardown and supervision properties.
//!
//! The fakes mirror the real processes' signalling: pager ready is a watch
//! that flips when the hypervisor "registers", and both process exits are
//! watches a test can trigger to simulate a crash.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use reef::config::{RuntimeEnv, SandboxConfig};
use reef::device::DevicePool;
use reef::hypervisor::{Hypervisor, HypervisorFactory, HypervisorSpec};
use reef::net::{Dns, NetworkPool, NetworkSlot, Proxy};
use reef::pager::{Pager, PagerFactory};
use reef::rootfs::{QuiesceFn, RootfsDevice, RootfsFactory};
use reef::sandbox::health::CancelContext;
use reef::template::diff::{BlockSet, DiffFile};
use reef::template::header::{Header, Metadata, HEADER_VERSION};
use reef::template::{Artifact, LocalFile, Template, TemplateCache, TemplateFiles};
use reef::{SandboxDeps, SandboxOptions};

pub const PAGE_SIZE: u64 = 4096;
pub const MEM_BLOCKS: u64 = 64;
pub const ROOTFS_BLOCK_SIZE: u64 = 4096;
pub const ROOTFS_BLOCKS: u64 = 32;

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn push_event(log: &EventLog, event: &str) {
    log.lock().unwrap().push(event.to_string());
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

pub struct FakeTemplate {
    files: TemplateFiles,
    memfile: Arc<Artifact>,
    rootfs: Arc<Artifact>,
    snapfile_path: PathBuf,
    pub build_id: Uuid,
}

impl FakeTemplate {
    /// Writes a generation-zero template into `dir`: a deterministic
    /// memfile (page i filled with `i % 251`), a rootfs image, and a
    /// placeholder snapfile.
    pub fn generation_zero(dir: &Path, build_id: Uuid) -> Result<Arc<Self>> {
        let memfile_path = dir.join("memfile");
        std::fs::write(&memfile_path, Self::memfile_bytes())?;
        let memfile = Artifact::new(
            memfile_path,
            Header::base(Metadata {
                version: HEADER_VERSION,
                generation: 0,
                block_size: PAGE_SIZE,
                size: PAGE_SIZE * MEM_BLOCKS,
                build_id,
                base_build_id: build_id,
            })?,
        )?;

        let rootfs_path = dir.join("rootfs");
        std::fs::write(
            &rootfs_path,
            vec![0u8; (ROOTFS_BLOCK_SIZE * ROOTFS_BLOCKS) as usize],
        )?;
        let rootfs = Artifact::new(
            rootfs_path,
            Header::base(Metadata {
                version: HEADER_VERSION,
                generation: 0,
                block_size: ROOTFS_BLOCK_SIZE,
                size: ROOTFS_BLOCK_SIZE * ROOTFS_BLOCKS,
                build_id,
                base_build_id: build_id,
            })?,
        )?;

        let snapfile_path = dir.join("snapfile");
        std::fs::write(&snapfile_path, b"snapfile-state-v1")?;

        Ok(Arc::new(Self {
            files: TemplateFiles {
                template_id: "tmpl-base".into(),
                build_id: build_id.to_string(),
                kernel_version: "6.1.102".into(),
                hypervisor_version: "1.10.1".into(),
                huge_pages: false,
                rootfs_block_size: ROOTFS_BLOCK_SIZE,
            },
            memfile: Arc::new(memfile),
            rootfs: Arc::new(rootfs),
            snapfile_path,
            build_id,
        }))
    }

    /// The exact byte content of the generation-zero memfile.
    pub fn memfile_bytes() -> Vec<u8> {
        (0..MEM_BLOCKS)
            .flat_map(|i| vec![(i % 251) as u8; PAGE_SIZE as usize])
            .collect()
    }
}

#[async_trait]
impl Template for FakeTemplate {
    fn files(&self) -> &TemplateFiles {
        &self.files
    }

    async fn memfile(&self) -> Result<Arc<Artifact>> {
        Ok(Arc::clone(&self.memfile))
    }

    async fn rootfs(&self) -> Result<Arc<Artifact>> {
        Ok(Arc::clone(&self.rootfs))
    }

    async fn snapfile(&self) -> Result<LocalFile> {
        LocalFile::new(self.snapfile_path.clone())
    }
}

pub struct FakeTemplateCache {
    pub template: Arc<FakeTemplate>,
    pub fail: AtomicBool,
}

#[async_trait]
impl TemplateCache for FakeTemplateCache {
    async fn get_template(
        &self,
        _template_id: &str,
        _build_id: &str,
        _kernel_version: &str,
        _hypervisor_version: &str,
        _huge_pages: bool,
    ) -> Result<Arc<dyn Template>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("template not in cache");
        }
        Ok(Arc::clone(&self.template) as Arc<dyn Template>)
    }
}

// ---------------------------------------------------------------------------
// Network, DNS, proxy, device pool
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeNetworkPool {
    pub fail_get: AtomicBool,
    pub released: Mutex<Vec<NetworkSlot>>,
}

impl FakeNetworkPool {
    pub fn released_slots(&self) -> Vec<NetworkSlot> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkPool for FakeNetworkPool {
    async fn get(&self) -> Result<NetworkSlot> {
        if self.fail_get.load(Ordering::SeqCst) {
            bail!("network pool exhausted");
        }
        Ok(NetworkSlot {
            idx: 7,
            host_ip: Ipv4Addr::LOCALHOST,
        })
    }

    async fn release(&self, slot: NetworkSlot) -> Result<()> {
        self.released.lock().unwrap().push(slot);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDns {
    pub entries: Mutex<HashMap<String, Ipv4Addr>>,
    pub ops: Mutex<Vec<String>>,
}

impl FakeDns {
    pub fn lookup(&self, sandbox_id: &str) -> Option<Ipv4Addr> {
        self.entries.lock().unwrap().get(sandbox_id).copied()
    }
}

#[async_trait]
impl Dns for FakeDns {
    async fn add(&self, sandbox_id: &str, ip: Ipv4Addr) {
        self.entries.lock().unwrap().insert(sandbox_id.to_string(), ip);
        self.ops.lock().unwrap().push(format!("add {sandbox_id}"));
    }

    async fn remove(&self, sandbox_id: &str, _ip: Ipv4Addr) {
        self.entries.lock().unwrap().remove(sandbox_id);
        self.ops.lock().unwrap().push(format!("remove {sandbox_id}"));
    }
}

#[derive(Default)]
pub struct FakeProxy {
    pub entries: Mutex<HashMap<String, (Ipv4Addr, String)>>,
}

#[async_trait]
impl Proxy for FakeProxy {
    async fn add_sandbox(&self, sandbox_id: &str, ip: Ipv4Addr, team_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), (ip, team_id.to_string()));
    }

    async fn remove_sandbox(&self, sandbox_id: &str, _ip: Ipv4Addr) {
        self.entries.lock().unwrap().remove(sandbox_id);
    }
}

pub struct FakeDevicePool {
    pub device: PathBuf,
    pub released: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl DevicePool for FakeDevicePool {
    async fn acquire(&self) -> Result<PathBuf> {
        Ok(self.device.clone())
    }

    async fn release(&self, path: PathBuf) -> Result<()> {
        self.released.lock().unwrap().push(path);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rootfs CoW device
// ---------------------------------------------------------------------------

pub struct FakeRootfsDevice {
    device_path: PathBuf,
    block_size: u64,
    pub dirty: Mutex<BlockSet>,
    pub block_data: Mutex<HashMap<u64, Vec<u8>>>,
    pub closed: AtomicBool,
    pub quiesce_calls: AtomicU32,
    closed_tx: watch::Sender<bool>,
}

impl FakeRootfsDevice {
    pub fn new(device_path: PathBuf, block_size: u64) -> Result<Arc<Self>> {
        // A regular file stands in for the nbd device node.
        std::fs::write(&device_path, b"")?;
        let (closed_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            device_path,
            block_size,
            dirty: Mutex::new(BlockSet::new()),
            block_data: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            quiesce_calls: AtomicU32::new(0),
            closed_tx,
        }))
    }

    /// Simulates a guest write: marks the block dirty and records its bytes.
    pub fn write_block(&self, index: u64, fill: u8) {
        self.dirty.lock().unwrap().insert(index);
        self.block_data
            .lock()
            .unwrap()
            .insert(index, vec![fill; self.block_size as usize]);
    }
}

#[async_trait]
impl RootfsDevice for FakeRootfsDevice {
    async fn start(&self) -> Result<()> {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn device_path(&self) -> Result<PathBuf> {
        Ok(self.device_path.clone())
    }

    async fn export(&self, sink: &mut DiffFile, quiesce: QuiesceFn) -> Result<BlockSet> {
        self.quiesce_calls.fetch_add(1, Ordering::SeqCst);
        quiesce().await?;

        let dirty = self.dirty.lock().unwrap().clone();
        let block_data = self.block_data.lock().unwrap().clone();
        for index in dirty.iter() {
            let bytes = block_data
                .get(&index)
                .cloned()
                .unwrap_or_else(|| vec![0u8; self.block_size as usize]);
            sink.write_block(&bytes).await?;
        }
        Ok(dirty)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }
}

pub struct FakeRootfsFactory {
    pub device: Arc<FakeRootfsDevice>,
    pub fail: AtomicBool,
}

#[async_trait]
impl RootfsFactory for FakeRootfsFactory {
    async fn create(
        &self,
        _readonly_base: Arc<Artifact>,
        _cache_path: &Path,
        _block_size: u64,
        _device_pool: Arc<dyn DevicePool>,
    ) -> Result<Arc<dyn RootfsDevice>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("no free block device");
        }
        Ok(Arc::clone(&self.device) as Arc<dyn RootfsDevice>)
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

/// None = still running; Some(None) = clean exit; Some(Some(msg)) = error.
type ExitState = Option<Option<String>>;

pub struct FakePager {
    pub events: EventLog,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub disabled: AtomicBool,
    pub fail_start: AtomicBool,
    pub dirty: Mutex<BlockSet>,
    ready_tx: watch::Sender<bool>,
    exit_tx: watch::Sender<ExitState>,
}

impl FakePager {
    pub fn new(events: EventLog) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            events,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            dirty: Mutex::new(BlockSet::new()),
            ready_tx,
            exit_tx,
        })
    }

    pub fn mark_dirty(&self, pages: impl IntoIterator<Item = u64>) {
        let mut dirty = self.dirty.lock().unwrap();
        for page in pages {
            dirty.insert(page);
        }
    }

    /// Simulates the pager process dying.
    pub fn trigger_exit(&self, error: Option<&str>) {
        self.exit_tx.send_modify(|state| {
            if state.is_none() {
                *state = Some(error.map(String::from));
            }
        });
    }
}

#[async_trait]
impl Pager for FakePager {
    async fn start(&self, _sandbox_id: &str) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("uffd socket bind failed");
        }
        self.started.store(true, Ordering::SeqCst);
        push_event(&self.events, "pager_started");
        // The real pager flips ready once the hypervisor registers its
        // memory region; the fake flips it at start.
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                bail!("pager gone before ready");
            }
        }
    }

    fn disable(&self) -> Result<()> {
        self.disabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dirty(&self) -> Result<BlockSet> {
        if !self.disabled.load(Ordering::SeqCst) {
            bail!("dirty set read before disable");
        }
        Ok(self.dirty.lock().unwrap().clone())
    }

    fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.trigger_exit(None);
        Ok(())
    }

    async fn exited(&self) -> Result<()> {
        let mut rx = self.exit_tx.subscribe();
        loop {
            let state = rx.borrow().clone();
            if let Some(outcome) = state {
                return match outcome {
                    None => Ok(()),
                    Some(msg) => Err(anyhow!(msg)),
                };
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

pub struct FakePagerFactory {
    pub pager: Arc<FakePager>,
    pub fail: AtomicBool,
}

#[async_trait]
impl PagerFactory for FakePagerFactory {
    async fn create(
        &self,
        _memfile: Arc<Artifact>,
        _socket_path: &Path,
        _page_size: u64,
        _client_id: &str,
    ) -> Result<Arc<dyn Pager>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("uffd creation failed");
        }
        Ok(Arc::clone(&self.pager) as Arc<dyn Pager>)
    }
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

pub struct FakeHypervisor {
    pub events: EventLog,
    /// Current guest memory image; `create_snapshot` dumps it verbatim.
    pub memory: Mutex<Vec<u8>>,
    pub paused: AtomicBool,
    pub stopped: AtomicBool,
    pub fail_start: AtomicBool,
    pub hang_start: AtomicBool,
    pub fail_pause: AtomicBool,
    pager: Mutex<Option<Arc<dyn Pager>>>,
    exit_tx: watch::Sender<ExitState>,
}

impl FakeHypervisor {
    pub fn new(events: EventLog, memory: Vec<u8>) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            events,
            memory: Mutex::new(memory),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            hang_start: AtomicBool::new(false),
            fail_pause: AtomicBool::new(false),
            pager: Mutex::new(None),
            exit_tx,
        })
    }

    /// Simulates a guest write of `len` bytes of `fill` at `offset`.
    pub fn write_memory(&self, offset: usize, len: usize, fill: u8) {
        let mut memory = self.memory.lock().unwrap();
        memory[offset..offset + len].fill(fill);
    }

    /// Simulates the hypervisor process dying.
    pub fn trigger_exit(&self, error: Option<&str>) {
        self.exit_tx.send_modify(|state| {
            if state.is_none() {
                *state = Some(error.map(String::from));
            }
        });
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn start(&self, _boot_ctx: &CancelContext) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("hypervisor refused to boot");
        }
        if self.hang_start.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pager = self
            .pager
            .lock()
            .unwrap()
            .clone()
            .context("factory must wire the pager before start")?;
        pager.ready().await.context("pager ready signal failed")?;
        push_event(&self.events, "pager_ready_delivered");
        push_event(&self.events, "hypervisor_started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if self.fail_pause.load(Ordering::SeqCst) {
            bail!("vm refused to pause");
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_snapshot(&self, snapfile_path: &Path, memfile_path: &Path) -> Result<()> {
        if !self.paused.load(Ordering::SeqCst) {
            bail!("create_snapshot requires a paused VM");
        }
        tokio::fs::write(snapfile_path, b"snapfile-state-v2").await?;
        let memory = self.memory.lock().unwrap().clone();
        tokio::fs::write(memfile_path, memory).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.trigger_exit(None);
        Ok(())
    }

    async fn exited(&self) -> Result<()> {
        let mut rx = self.exit_tx.subscribe();
        loop {
            let state = rx.borrow().clone();
            if let Some(outcome) = state {
                return match outcome {
                    None => Ok(()),
                    Some(msg) => Err(anyhow!(msg)),
                };
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

pub struct FakeHypervisorFactory {
    pub hypervisor: Arc<FakeHypervisor>,
    pub fail_create: AtomicBool,
    pub last_base_template_id: Mutex<Option<String>>,
}

#[async_trait]
impl HypervisorFactory for FakeHypervisorFactory {
    async fn create(&self, spec: HypervisorSpec) -> Result<Arc<dyn Hypervisor>> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("hypervisor binary missing");
        }
        *self.hypervisor.pager.lock().unwrap() = Some(Arc::clone(&spec.pager));
        *self.last_base_template_id.lock().unwrap() = Some(spec.base_template_id.clone());
        Ok(Arc::clone(&self.hypervisor) as Arc<dyn Hypervisor>)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub const SANDBOX_ID: &str = "sbx-test-1";

/// One full set of fakes plus the deps/options to build a sandbox on them.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub events: EventLog,
    pub template: Arc<FakeTemplate>,
    pub template_cache: Arc<FakeTemplateCache>,
    pub network_pool: Arc<FakeNetworkPool>,
    pub device_pool: Arc<FakeDevicePool>,
    pub rootfs: Arc<FakeRootfsDevice>,
    pub rootfs_factory: Arc<FakeRootfsFactory>,
    pub pager: Arc<FakePager>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub hypervisor_factory: Arc<FakeHypervisorFactory>,
    pub dns: Arc<FakeDns>,
    pub proxy: Arc<FakeProxy>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create harness dir");
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));

        let template = FakeTemplate::generation_zero(dir.path(), Uuid::new_v4())
            .expect("build generation-zero template");
        let template_cache = Arc::new(FakeTemplateCache {
            template: Arc::clone(&template),
            fail: AtomicBool::new(false),
        });

        let rootfs = FakeRootfsDevice::new(dir.path().join("rootfs.dev"), ROOTFS_BLOCK_SIZE)
            .expect("create fake rootfs device");
        let rootfs_factory = Arc::new(FakeRootfsFactory {
            device: Arc::clone(&rootfs),
            fail: AtomicBool::new(false),
        });

        let pager = FakePager::new(Arc::clone(&events));
        let hypervisor = FakeHypervisor::new(Arc::clone(&events), FakeTemplate::memfile_bytes());

        Self {
            events,
            template,
            template_cache,
            network_pool: Arc::new(FakeNetworkPool::default()),
            device_pool: Arc::new(FakeDevicePool {
                device: dir.path().join("nbd3"),
                released: Mutex::new(Vec::new()),
            }),
            rootfs,
            rootfs_factory,
            pager: Arc::clone(&pager),
            hypervisor: Arc::clone(&hypervisor),
            hypervisor_factory: Arc::new(FakeHypervisorFactory {
                hypervisor,
                fail_create: AtomicBool::new(false),
                last_base_template_id: Mutex::new(None),
            }),
            dns: Arc::new(FakeDns::default()),
            proxy: Arc::new(FakeProxy::default()),
            dir,
        }
    }

    pub fn deps(&self) -> SandboxDeps {
        SandboxDeps {
            template_cache: Arc::clone(&self.template_cache) as _,
            network_pool: Arc::clone(&self.network_pool) as _,
            device_pool: Arc::clone(&self.device_pool) as _,
            rootfs_factory: Arc::clone(&self.rootfs_factory) as _,
            pager_factory: Arc::new(FakePagerFactory {
                pager: Arc::clone(&self.pager),
                fail: AtomicBool::new(false),
            }) as _,
            hypervisor_factory: Arc::clone(&self.hypervisor_factory) as _,
            dns: Arc::clone(&self.dns) as _,
            proxy: Arc::clone(&self.proxy) as _,
        }
    }

    /// Default options: a legacy-envd guest (the sync call hits a closed
    /// loopback port and is logged, not fatal) and a short envd timeout so
    /// failure tests stay fast.
    pub fn options(&self) -> SandboxOptions {
        SandboxOptions {
            config: SandboxConfig {
                sandbox_id: SANDBOX_ID.into(),
                template_id: "tmpl-base".into(),
                build_id: self.template.build_id.to_string(),
                team_id: "team-9".into(),
                kernel_version: "6.1.102".into(),
                hypervisor_version: "1.10.1".into(),
                huge_pages: false,
                envd_version: "0.0.9".into(),
                env_vars: HashMap::new(),
            },
            runtime: RuntimeEnv {
                envd_timeout: std::time::Duration::from_millis(500),
                envd_port: 1,
                logs_collector_ip: String::new(),
            },
            base_dir: self.dir.path().join("run"),
            started_at: Utc::now(),
            end_at: Utc::now() + chrono::Duration::hours(1),
            base_template_id: "tmpl-base".into(),
            client_id: "client-1".into(),
            trace_id: Some("trace-1".into()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}
