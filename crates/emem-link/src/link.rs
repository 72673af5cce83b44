//! The EtherCAT link.
//!
//! [`EmemLink::open`] brings the chain to Operational and then hands the
//! master to two threads:
//!
//! 1. the cyclic thread, which exchanges process data every `send_cycle`
//!    and applies queued output frames in FIFO order
//! 2. the health thread (see [`crate::health`])
//!
//! The caller only touches the outgoing queue and the latest input image.

use crate::datagram::{RxDatagram, Topology, TxDatagram};
use crate::health::{HealthMonitor, OnLost};
use crate::realtime::init_realtime;
use crate::timer::CycleTimer;
use crossbeam_utils::CachePadded;
use emem_common::config::{LinkConfig, SyncMode};
use emem_common::error::{EmemError, EmemResult};
use emem_common::metrics::{CycleMetrics, MetricsSnapshot};
use emem_master::{list_adapters, open_adapter, FrameTransport, Master, MasterSettings, Port, PreSafeHook, SlaveInfo};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Exchange latencies kept for percentiles.
const METRICS_WINDOW: usize = 10_000;

/// State shared between the caller and the link threads.
pub(crate) struct Shared {
    master: Mutex<Master>,
    open: CachePadded<AtomicBool>,
    wkc: CachePadded<AtomicU16>,
    expected_wkc: u16,
    queue: Mutex<VecDeque<TxDatagram>>,
    queue_space: Condvar,
    buf_size: usize,
    inputs: RwLock<Vec<u8>>,
    metrics: Arc<Mutex<CycleMetrics>>,
}

impl Shared {
    pub(crate) fn master(&self) -> MutexGuard<'_, Master> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn wkc(&self) -> u16 {
        self.wkc.load(Ordering::Acquire)
    }

    pub(crate) fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TxDatagram>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_frame(&self) -> Option<TxDatagram> {
        let frame = self.queue().pop_front();
        if frame.is_some() {
            self.queue_space.notify_one();
        }
        frame
    }

    /// One cycle: exchange, publish, then stage the next queued frame.
    fn exchange(&self, timeout: Duration) {
        let mut master = self.master();
        let start = Instant::now();
        let result = master
            .send_process_data()
            .and_then(|()| master.receive_process_data(timeout));

        match result {
            Ok(reply) => {
                let round_trip = start.elapsed();
                self.wkc.store(reply.wkc, Ordering::Release);
                lock(&self.metrics).record(round_trip, reply.wkc, self.expected_wkc);
                let mut image = self.inputs.write().unwrap_or_else(PoisonError::into_inner);
                image.clear();
                image.extend_from_slice(master.inputs());
                trace!(wkc = reply.wkc, round_trip_us = round_trip.as_micros(), "Cycle");
            }
            Err(e) => {
                self.wkc.store(0, Ordering::Release);
                lock(&self.metrics).record_lost();
                trace!(error = %e, "Exchange failed, retrying next cycle");
            }
        }

        if let Some(frame) = self.pop_frame() {
            let out = master.outputs_mut();
            let n = out.len().min(frame.as_bytes().len());
            out[..n].copy_from_slice(&frame.as_bytes()[..n]);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`EmemLink`].
pub struct EmemLinkBuilder {
    config: LinkConfig,
    transport: Option<Box<dyn FrameTransport>>,
    on_lost: Option<OnLost>,
    pre_safe_hook: Option<PreSafeHook>,
}

impl EmemLinkBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            transport: None,
            on_lost: None,
            pre_safe_hook: None,
        }
    }

    /// Use `transport` instead of opening a network adapter.
    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn FrameTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Called once per slave loss with a diagnostic message.
    #[must_use]
    pub fn on_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_lost = Some(Arc::new(callback));
        self
    }

    /// Run `hook` on every slave between PreOp and SafeOp.
    #[must_use]
    pub fn pre_safe_hook(mut self, hook: PreSafeHook) -> Self {
        self.pre_safe_hook = Some(hook);
        self
    }

    /// Validate the configuration and build the link.
    ///
    /// # Errors
    ///
    /// [`EmemError::Config`] if the configuration is invalid.
    pub fn build(self) -> EmemResult<EmemLink> {
        self.config
            .validate()
            .map_err(|e| EmemError::Config(e.to_string()))?;
        let metrics = CycleMetrics::new(METRICS_WINDOW, self.config.send_cycle);
        Ok(EmemLink {
            injected: self.transport.is_some(),
            transport: self.transport,
            config: self.config,
            on_lost: self.on_lost,
            pre_safe_hook: self.pre_safe_hook,
            metrics: Arc::new(Mutex::new(metrics)),
            shared: None,
            cyclic: None,
            health: None,
            slave_count: 0,
        })
    }
}

/// EtherCAT link to a chain of transducer boards.
pub struct EmemLink {
    config: LinkConfig,
    transport: Option<Box<dyn FrameTransport>>,
    injected: bool,
    on_lost: Option<OnLost>,
    pre_safe_hook: Option<PreSafeHook>,
    metrics: Arc<Mutex<CycleMetrics>>,
    shared: Option<Arc<Shared>>,
    cyclic: Option<JoinHandle<()>>,
    health: Option<HealthMonitor>,
    slave_count: usize,
}

impl fmt::Debug for EmemLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmemLink")
            .field("interface", &self.config.interface)
            .field("open", &self.is_open())
            .field("slave_count", &self.slave_count)
            .finish_non_exhaustive()
    }
}

impl EmemLink {
    /// Builder starting from `config`.
    #[must_use]
    pub fn builder(config: LinkConfig) -> EmemLinkBuilder {
        EmemLinkBuilder::new(config)
    }

    /// Link on a real adapter with no callbacks.
    ///
    /// # Errors
    ///
    /// [`EmemError::Config`] if the configuration is invalid.
    pub fn new(config: LinkConfig) -> EmemResult<Self> {
        EmemLinkBuilder::new(config).build()
    }

    /// Bring the chain up and start the link threads.
    ///
    /// Returns the number of slaves found.
    ///
    /// # Errors
    ///
    /// Adapter, discovery and state machine errors, and
    /// [`EmemError::SlaveCountMismatch`] if the chain does not match
    /// `topology`. No thread is left running on error.
    pub fn open(&mut self, topology: &Topology) -> EmemResult<usize> {
        if self.is_open() {
            return Err(EmemError::Config("link is already open".into()));
        }
        let mut master = self.connect(topology)?;
        if let Err(e) = self.bring_up(&mut master, topology) {
            error!(error = %e, "Bring-up failed");
            if let Err(close_err) = master.close() {
                debug!(error = %close_err, "Close after failed bring-up");
            }
            return Err(e);
        }

        let slave_count = master.slave_count();
        lock(&self.metrics).reset();
        let shared = Arc::new(Shared {
            expected_wkc: master.expected_wkc(),
            inputs: RwLock::new(master.inputs().to_vec()),
            master: Mutex::new(master),
            open: CachePadded::new(AtomicBool::new(true)),
            wkc: CachePadded::new(AtomicU16::new(0)),
            queue: Mutex::new(VecDeque::new()),
            queue_space: Condvar::new(),
            buf_size: self.config.buf_size,
            metrics: Arc::clone(&self.metrics),
        });
        self.shared = Some(Arc::clone(&shared));
        self.slave_count = slave_count;

        let started = spawn_cyclic(Arc::clone(&shared), &self.config).and_then(|cyclic| {
            self.cyclic = Some(cyclic);
            HealthMonitor::spawn(
                Arc::clone(&shared),
                self.config.state_check_interval,
                self.on_lost.clone(),
            )
        });
        match started {
            Ok(health) => self.health = Some(health),
            Err(e) => {
                if let Err(close_err) = self.close() {
                    debug!(error = %close_err, "Close after failed thread start");
                }
                return Err(e);
            }
        }

        info!(
            slave_count,
            expected_wkc = shared.expected_wkc,
            send_cycle_us = self.config.send_cycle.as_micros(),
            timer = ?self.config.timer_strategy,
            "Link open"
        );
        Ok(slave_count)
    }

    fn new_master(&self, transport: Box<dyn FrameTransport>) -> Master {
        let mut master = Master::new(Port::new(transport), MasterSettings::from(&self.config));
        if let Some(hook) = &self.pre_safe_hook {
            master.set_pre_safe_hook(Arc::clone(hook));
        }
        master
    }

    /// Pick the transport: injected, configured adapter, or the first
    /// adapter whose chain matches `topology`.
    fn connect(&mut self, topology: &Topology) -> EmemResult<Master> {
        if let Some(transport) = self.transport.take() {
            return Ok(self.new_master(transport));
        }
        if self.injected {
            return Err(EmemError::Config(
                "injected transport was consumed by a previous open".into(),
            ));
        }
        if let Some(name) = self.config.interface() {
            return Ok(self.new_master(open_adapter(name)?));
        }

        let expected = topology.device_count();
        for adapter in list_adapters()? {
            let transport = match open_adapter(&adapter.name) {
                Ok(t) => t,
                Err(e) => {
                    debug!(adapter = %adapter.name, error = %e, "Skipping adapter");
                    continue;
                }
            };
            let mut master = self.new_master(transport);
            match master.detect_slaves() {
                Ok(found) if found == expected => {
                    info!(adapter = %adapter.name, found, "Adapter selected");
                    return Ok(master);
                }
                Ok(found) => debug!(adapter = %adapter.name, found, expected, "Slave count does not match"),
                Err(e) => debug!(adapter = %adapter.name, error = %e, "No chain on adapter"),
            }
            if let Err(e) = master.driver().port().close() {
                debug!(adapter = %adapter.name, error = %e, "Close failed");
            }
        }
        Err(EmemError::AdapterNotFound { expected })
    }

    fn bring_up(&self, master: &mut Master, topology: &Topology) -> EmemResult<()> {
        let found = master.initialize()?;
        if found != topology.device_count() {
            return Err(EmemError::SlaveCountMismatch {
                expected: topology.device_count(),
                found,
            });
        }
        master.config()?;
        let has_dc = master.config_dc()?;
        match self.config.sync_mode {
            SyncMode::Dc if has_dc => master.config_sync0(self.config.sync0_cycle, 0)?,
            SyncMode::Dc => warn!("No slave supports distributed clocks, running free"),
            SyncMode::FreeRun => debug!("Free run mode"),
        }
        master.request_operational(self.config.state_timeout)
    }

    /// Queue a copy of `tx` for the cyclic thread.
    ///
    /// Blocks while `buf_size` frames are already queued.
    ///
    /// # Errors
    ///
    /// [`EmemError::LinkClosed`] if the link is closed, including while
    /// waiting for queue space.
    pub fn send(&self, tx: &TxDatagram) -> EmemResult<()> {
        let shared = self.shared()?;
        let mut queue = shared.queue();
        if shared.buf_size > 0 {
            queue = shared
                .queue_space
                .wait_while(queue, |q| q.len() >= shared.buf_size && shared.is_open())
                .unwrap_or_else(PoisonError::into_inner);
        }
        if !shared.is_open() {
            return Err(EmemError::LinkClosed);
        }
        queue.push_back(tx.clone());
        Ok(())
    }

    /// Copy the latest input image into `rx`.
    ///
    /// # Errors
    ///
    /// [`EmemError::LinkClosed`] if the link is closed.
    pub fn receive(&self, rx: &mut RxDatagram) -> EmemResult<()> {
        let shared = self.shared()?;
        let image = shared.inputs.read().unwrap_or_else(PoisonError::into_inner);
        rx.copy_from(&image);
        Ok(())
    }

    /// Stop both threads and request Init on every slave.
    ///
    /// Closing a closed link does nothing.
    ///
    /// # Errors
    ///
    /// Transport errors from the final state request.
    pub fn close(&mut self) -> EmemResult<()> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };
        shared.open.store(false, Ordering::Release);
        shared.queue_space.notify_all();

        if let Some(mut health) = self.health.take() {
            health.stop();
        }
        if let Some(cyclic) = self.cyclic.take() {
            if cyclic.join().is_err() {
                warn!("Cyclic thread panicked");
            }
        }

        let result = shared.master().close();
        info!("Link closed");
        result
    }

    /// Whether the link threads are running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.as_ref().is_some_and(|s| s.is_open())
    }

    /// Slaves found by the last successful open.
    #[must_use]
    pub fn slave_count(&self) -> usize {
        self.slave_count
    }

    /// Work counter of the last exchange, 0 when it failed.
    #[must_use]
    pub fn wkc(&self) -> u16 {
        self.shared.as_ref().map_or(0, |s| s.wkc())
    }

    /// Work counter of a complete exchange.
    #[must_use]
    pub fn expected_wkc(&self) -> u16 {
        self.shared.as_ref().map_or(0, |s| s.expected_wkc())
    }

    /// Per-slave snapshot.
    #[must_use]
    pub fn slaves(&self) -> Vec<SlaveInfo> {
        self.shared
            .as_ref()
            .map_or_else(Vec::new, |s| s.master().slave_infos())
    }

    /// Cycle statistics since the last open.
    #[must_use]
    pub fn stats(&self) -> MetricsSnapshot {
        lock(&self.metrics).snapshot()
    }

    /// Empty output frame sized for the open chain.
    #[must_use]
    pub fn tx_datagram(&self) -> TxDatagram {
        TxDatagram::new(
            Topology::new(self.slave_count),
            usize::from(self.config.profile.output_bytes),
        )
    }

    /// Empty input buffer sized for the open chain.
    #[must_use]
    pub fn rx_datagram(&self) -> RxDatagram {
        RxDatagram::new(
            Topology::new(self.slave_count),
            usize::from(self.config.profile.input_bytes),
        )
    }

    fn shared(&self) -> EmemResult<&Arc<Shared>> {
        self.shared
            .as_ref()
            .filter(|s| s.is_open())
            .ok_or(EmemError::LinkClosed)
    }
}

impl Drop for EmemLink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Close on drop failed");
        }
    }
}

fn spawn_cyclic(shared: Arc<Shared>, config: &LinkConfig) -> EmemResult<JoinHandle<()>> {
    let realtime = config.realtime.clone();
    let strategy = config.timer_strategy;
    let period = config.send_cycle;
    let timeout = config.timeout;

    thread::Builder::new()
        .name("emem-cyclic".into())
        .spawn(move || {
            if let Err(e) = init_realtime(&realtime) {
                error!(error = %e, "Real-time setup failed, continuing without it");
            }
            let mut timer = CycleTimer::new(strategy, period);
            while shared.is_open() {
                if timer.wait() {
                    trace!(skipped = timer.skipped(), "Cycle deadline missed");
                }
                shared.exchange(timeout);
            }
            debug!(skipped = timer.skipped(), "Cyclic thread stopped");
        })
        .map_err(|e| EmemError::Config(format!("failed to spawn cyclic thread: {e}")))
}
