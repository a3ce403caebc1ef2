//! Cross-process resource broker.
//!
//! Every object that wants the microphone or speaker runs a broker actor on its own
//! thread. Requests are kept in a priority-ordered list inside a [`SharedRegion`]; each
//! change re-runs the allocation pass, and the resulting grants and revokes are delivered
//! to the owning broker, over its mailbox when it lives in this process or over its
//! resource fifo when it does not.
//!
//! ```text
//!   resource_request ──► BrokerMessage ──► ┌───────────────────────────┐
//!   resource fifo ─────── GRANT/REVOKE ──► │ Broker::run (select! loop) │──► ResourceCallback
//!   update timer ────────────────────────► └─────────────┬─────────────┘
//!                                                        │ lock
//!                                                  SharedRegion (list, ids, users)
//! ```
//!
//! The region lives in a POSIX shared memory object (see [`SharedRegion::open`]); list
//! links are offsets so each process may map it at its own address.
//!
//! A periodic update scrubs entries of processes that exited without releasing, so
//! their resources are eventually granted to someone else even without new requests.

pub(crate) mod liveness;
pub(crate) mod notify;
mod region;
mod shm;

pub use liveness::{Liveness, ProcessLiveness};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::device::{
    HalCapabilities, InputCaps, InputDevices, OutputCaps, OutputDevices, ResourceId,
    ResourcePriority,
};
use crate::engine::timer::{FrameTimer, TimerId};
use crate::engine::wait_until;
use crate::event::{ResourceCallback, ResourceEvent};
use crate::VoiceAudioError;

use notify::{MessageType, Notifier};
use region::{Offset, Region};

const BROKER_MAILBOX_CAPACITY: usize = 10;

/// Brokers of this process, by user id.
pub(crate) type LocalBrokers = Arc<Mutex<HashMap<u8, mpsc::Sender<BrokerMessage>>>>;

/// Name of the region used by objects that are not given one explicitly.
pub const GLOBAL_REGION_NAME: &str = "/voice-engine-region";

/// Resource state shared by every object using the audio hardware.
///
/// Holds the capability table, the id allocation tables, the attached user ids and the
/// request list in a shared memory object, locked against other threads and processes
/// on every access. Clones refer to the same mapping; [`SharedRegion::global`] is the one
/// used by objects that are not given a region explicitly.
#[derive(Clone)]
pub struct SharedRegion {
    map: Arc<shm::Mapping>,
    local: LocalBrokers,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("users", &self.user_count())
            .finish_non_exhaustive()
    }
}

impl SharedRegion {
    /// Opens the named region, creating and initialising it if no process has yet.
    ///
    /// # Errors
    ///
    /// Fails when the object cannot be opened or mapped, or exists with another size.
    pub fn open(name: &str) -> io::Result<Self> {
        tracing::debug!(name, "open shared region");
        Ok(Self {
            map: Arc::new(shm::Mapping::open(name)?),
            local: LocalBrokers::default(),
        })
    }

    /// Creates a region private to this process; its name is removed once mapped.
    ///
    /// # Errors
    ///
    /// As [`SharedRegion::open`].
    pub fn new() -> io::Result<Self> {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "/voice-engine-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let shared = Self::open(&name)?;
        Self::unlink(&name)?;
        Ok(shared)
    }

    /// The region named [`GLOBAL_REGION_NAME`], opened once per process.
    ///
    /// # Errors
    ///
    /// As [`SharedRegion::open`]; a failed open is retried on the next call.
    pub fn global() -> io::Result<Self> {
        static GLOBAL: Mutex<Option<SharedRegion>> = parking_lot::const_mutex(None);
        let mut global = GLOBAL.lock();
        if let Some(shared) = global.as_ref() {
            return Ok(shared.clone());
        }
        let shared = Self::open(GLOBAL_REGION_NAME)?;
        *global = Some(shared.clone());
        Ok(shared)
    }

    /// Removes a region name. Processes that have it mapped keep using it.
    ///
    /// # Errors
    ///
    /// Fails when the name does not exist.
    pub fn unlink(name: &str) -> io::Result<()> {
        shm::Mapping::unlink(name)
    }

    pub(crate) fn lock(&self) -> shm::RegionGuard<'_> {
        self.map.lock()
    }

    /// Number of attached users.
    pub fn user_count(&self) -> u32 {
        self.lock().user_count()
    }

    pub(crate) fn attach(
        &self,
        pid: u32,
        capabilities: HalCapabilities,
        probe: &dyn Liveness,
    ) -> Option<u8> {
        self.lock().attach(pid, capabilities, probe)
    }

    pub(crate) fn detach(&self, user_id: u8) {
        self.lock().detach(user_id);
    }

    /// Stores capabilities reported after a device open.
    pub(crate) fn refresh_capabilities(&self, capabilities: HalCapabilities) {
        self.lock().capabilities = capabilities;
    }
}

/// Resource ids granted to an object, with the capabilities of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceGrant {
    /// Granted microphone resource.
    pub record: Option<ResourceId>,
    /// Capabilities of the microphone resource.
    pub record_caps: InputCaps,
    /// Granted speaker resource.
    pub playback: Option<ResourceId>,
    /// Capabilities of the speaker resource.
    pub playback_caps: OutputCaps,
}

/// Grant storage shared between a broker and its object.
pub(crate) type GrantSlot = Arc<Mutex<Option<ResourceGrant>>>;

pub(crate) enum BrokerMessage {
    Request {
        priority: ResourcePriority,
        input: InputDevices,
        output: OutputDevices,
        callback: ResourceCallback,
    },
    Release {
        ack: oneshot::Sender<()>,
    },
    Grant,
    Revoke,
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

/// Static parameters of one broker.
pub(crate) struct BrokerParams {
    pub pid: u32,
    pub user_id: u8,
    pub fifo_dir: PathBuf,
    pub update_interval: Duration,
}

struct Broker {
    pid: u32,
    user_id: u8,
    shared: SharedRegion,
    probe: Arc<dyn Liveness>,
    notifier: Notifier,
    fifo_path: PathBuf,
    entry: Option<Offset>,
    callback: Option<ResourceCallback>,
    grant: GrantSlot,
    update_interval: Duration,
    timers: FrameTimer<()>,
    update_timer: Option<TimerId>,
}

async fn fifo_readable(fifo: Option<&pipe::Receiver>) -> io::Result<()> {
    match fifo {
        Some(fifo) => fifo.readable().await,
        None => std::future::pending().await,
    }
}

impl Broker {
    async fn run(mut self, mut rx: mpsc::Receiver<BrokerMessage>) {
        let fifo = match notify::open_fifo(&self.fifo_path) {
            Ok(fifo) => Some(fifo),
            Err(e) => {
                tracing::error!(path = %self.fifo_path.display(), error = %e, "unable to open resource fifo");
                None
            }
        };
        tracing::debug!(user_id = self.user_id, pid = self.pid, "broker started");
        let mut buf = [0u8; 64];

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(BrokerMessage::Terminate { ack }) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    Some(msg) => self.handle(msg),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                ready = fifo_readable(fifo.as_ref()) => {
                    if let Err(e) = ready {
                        tracing::error!(error = %e, "resource fifo failed");
                        continue;
                    }
                    let Some(fifo) = fifo.as_ref() else { continue };
                    match fifo.try_read(&mut buf) {
                        Ok(n) => {
                            for kind in notify::decode(&buf[..n]) {
                                self.handle_wire(kind);
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => tracing::error!(error = %e, "resource fifo read failed"),
                    }
                },
                () = wait_until(self.timers.next()) => {
                    if !self.timers.expired(Instant::now()).is_empty() {
                        self.update_timer = None;
                        self.on_update_timer();
                    }
                }
            }
        }

        if fifo.is_some() {
            notify::remove_fifo(&self.fifo_path);
        }
        tracing::debug!(user_id = self.user_id, "broker exited");
    }

    fn handle(&mut self, msg: BrokerMessage) {
        match msg {
            BrokerMessage::Request {
                priority,
                input,
                output,
                callback,
            } => self.on_request(priority, input, output, callback),
            BrokerMessage::Release { ack } => {
                self.on_release();
                let _ = ack.send(());
            }
            BrokerMessage::Grant => self.on_grant(),
            BrokerMessage::Revoke => self.on_revoke(),
            // Intercepted by `run`.
            BrokerMessage::Terminate { .. } => {}
        }
    }

    fn handle_wire(&mut self, kind: Option<MessageType>) {
        match kind {
            Some(MessageType::Grant) => self.on_grant(),
            Some(MessageType::Revoke) => self.on_revoke(),
            other => tracing::error!(?other, "unexpected message on resource fifo"),
        }
    }

    /// The entry of this broker, unless it was scrubbed or reset behind its back.
    fn own_entry(&self, region: &Region) -> Option<Offset> {
        self.entry
            .filter(|offset| region.owned_by(*offset, self.pid, self.user_id))
    }

    fn deliver(&self, notices: Vec<region::Notice>) {
        for notice in notices {
            self.notifier.deliver(notice);
        }
    }

    fn on_request(
        &mut self,
        priority: ResourcePriority,
        input: InputDevices,
        output: OutputDevices,
        callback: ResourceCallback,
    ) {
        tracing::info!(user_id = self.user_id, ?priority, ?input, ?output, "resource request");
        self.callback = Some(callback);
        let notices = {
            let mut region = self.shared.lock();
            region.scrub(self.probe.as_ref());
            let entry = match self.own_entry(&region) {
                Some(entry) => {
                    region.remove(entry);
                    region.set_request(entry, priority, input, output);
                    Some(entry)
                }
                None => region.alloc(priority, self.pid, self.user_id, input, output),
            };
            let Some(entry) = entry else {
                tracing::error!("unable to allocate resource list entry");
                return;
            };
            self.entry = Some(entry);
            region.insert(entry);
            region.update()
        };
        self.deliver(notices);
        self.schedule_update();
    }

    /// Pushes the periodic list update one interval into the future.
    fn schedule_update(&mut self) {
        let at = Instant::now() + self.update_interval;
        match self.update_timer {
            Some(id) if self.timers.update(id, at) => {}
            _ => self.update_timer = Some(self.timers.insert(at, ())),
        }
    }

    fn cancel_update(&mut self) {
        if let Some(id) = self.update_timer.take() {
            self.timers.remove(id);
        }
    }

    fn on_release(&mut self) {
        tracing::info!(user_id = self.user_id, "resource release");
        let notices = {
            let mut region = self.shared.lock();
            region.scrub(self.probe.as_ref());
            if let Some(entry) = self.own_entry(&region) {
                region.remove(entry);
                region.free(entry);
            }
            self.entry = None;
            region.update()
        };
        *self.grant.lock() = None;
        self.deliver(notices);
        self.cancel_update();
    }

    fn on_grant(&mut self) {
        let grant = {
            let mut region = self.shared.lock();
            let capabilities = region.capabilities;
            let Some(entry) = self.own_entry(&region) else {
                tracing::warn!(user_id = self.user_id, "grant without a request");
                return;
            };
            region.acknowledge(entry).map(|e| ResourceGrant {
                record: e.record_id(),
                record_caps: e.record_id().map_or(InputCaps::NONE, |id| capabilities.input(id)),
                playback: e.playback_id(),
                playback_caps: e
                    .playback_id()
                    .map_or(OutputCaps::NONE, |id| capabilities.output(id)),
            })
        };
        let Some(grant) = grant else {
            tracing::error!(user_id = self.user_id, "granted entry is missing");
            return;
        };
        tracing::info!(user_id = self.user_id, record = ?grant.record, playback = ?grant.playback, "resources granted");
        *self.grant.lock() = Some(grant);
        self.cancel_update();
        if let Some(callback) = &self.callback {
            callback(ResourceEvent::Granted);
        }
    }

    fn on_revoke(&mut self) {
        tracing::info!(user_id = self.user_id, "resources revoked");
        if let Some(callback) = &self.callback {
            callback(ResourceEvent::Revoked);
        }
    }

    fn on_update_timer(&mut self) {
        let notices = {
            let mut region = self.shared.lock();
            let removed = region.scrub(self.probe.as_ref());
            if removed > 0 {
                tracing::info!(removed, "scrubbed stale resource entries");
            }
            region.update()
        };
        self.deliver(notices);
        self.schedule_update();
    }

    fn shutdown(&mut self) {
        self.shared.local.lock().remove(&self.user_id);
        let notices = {
            let mut region = self.shared.lock();
            match self.entry.take().filter(|o| region.owned_by(*o, self.pid, self.user_id)) {
                Some(entry) => {
                    region.remove(entry);
                    region.free(entry);
                    region.update()
                }
                None => Vec::new(),
            }
        };
        self.deliver(notices);
    }
}

/// Owner handle of a broker thread.
pub(crate) struct BrokerHandle {
    tx: mpsc::Sender<BrokerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    pub(crate) fn spawn(
        params: BrokerParams,
        shared: SharedRegion,
        probe: Arc<dyn Liveness>,
        grant: GrantSlot,
    ) -> Result<Self, VoiceAudioError> {
        let (tx, rx) = mpsc::channel(BROKER_MAILBOX_CAPACITY);
        shared.local.lock().insert(params.user_id, tx.clone());
        let broker = Broker {
            pid: params.pid,
            user_id: params.user_id,
            notifier: Notifier::new(params.pid, params.fifo_dir.clone(), shared.local.clone()),
            fifo_path: notify::fifo_path(&params.fifo_dir, params.user_id),
            shared: shared.clone(),
            probe,
            entry: None,
            callback: None,
            grant,
            update_interval: params.update_interval,
            timers: FrameTimer::new(),
            update_timer: None,
        };
        let thread = std::thread::Builder::new()
            .name("voice-broker".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(broker.run(rx)),
                    Err(e) => tracing::error!(error = %e, "broker runtime could not be built"),
                }
            });
        match thread {
            Ok(thread) => Ok(Self {
                tx,
                thread: Some(thread),
            }),
            Err(e) => {
                shared.local.lock().remove(&params.user_id);
                Err(VoiceAudioError::internal(format!("broker thread: {e}")))
            }
        }
    }

    async fn send(&self, msg: BrokerMessage) -> Result<(), VoiceAudioError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| VoiceAudioError::internal("broker mailbox closed"))
    }

    pub(crate) async fn request(
        &self,
        priority: ResourcePriority,
        input: InputDevices,
        output: OutputDevices,
        callback: ResourceCallback,
    ) -> Result<(), VoiceAudioError> {
        self.send(BrokerMessage::Request {
            priority,
            input,
            output,
            callback,
        })
        .await
    }

    pub(crate) async fn release(&self) -> Result<(), VoiceAudioError> {
        let (ack, done) = oneshot::channel();
        self.send(BrokerMessage::Release { ack }).await?;
        done.await
            .map_err(|_| VoiceAudioError::internal("broker dropped the release"))
    }

    /// Stops the broker and waits for its thread.
    pub(crate) async fn terminate(mut self) -> Result<(), VoiceAudioError> {
        let (ack, done) = oneshot::channel();
        self.send(BrokerMessage::Terminate { ack }).await?;
        let _ = done.await;
        let thread = self
            .thread
            .take()
            .ok_or_else(|| VoiceAudioError::internal("broker already joined"))?;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| VoiceAudioError::internal(format!("broker join: {e}")))?
            .map_err(|_| VoiceAudioError::internal("broker thread panicked"))
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let (ack, _) = oneshot::channel();
            let _ = self.tx.try_send(BrokerMessage::Terminate { ack });
        }
    }
}
