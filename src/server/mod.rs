pub(crate) mod connection;
mod group;
mod handlers;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time;

use tracing::{debug, info, warn};

use crate::apci::ApciParameters;
use crate::asdu::{Asdu, AppLayerParameters, Cp56Time2a};
use crate::clock;
use crate::queue::{HighPrioQueue, MessageQueue};
use crate::socket::{ServerSocket, Transport};
use crate::Error;

pub use connection::ConnectionHandle;
pub use group::RedundancyGroup;
pub use handlers::{ConnectionEvent, PluginResult, SlavePlugin};

use connection::{connection_worker, MasterConnection, NO_GROUP};
use group::GroupRuntime;
use handlers::Handlers;

/// Default TCP port for plaintext 104.
pub const DEFAULT_PORT: u16 = 2404;

/// Default TCP port when the link is TLS-guarded.
pub const DEFAULT_TLS_PORT: u16 = 19998;

const CONNECTION_POOL_SIZE: usize = 16;

const DEFAULT_LOW_PRIO_QUEUE_SIZE: usize = 100;
const DEFAULT_HIGH_PRIO_QUEUE_SIZE: usize = 10;

const ACCEPT_RETRY_DELAY: time::Duration = time::Duration::from_millis(10);
const TICK_POLL_TIMEOUT: time::Duration = time::Duration::from_millis(1);
const STOP_POLL_DELAY: time::Duration = time::Duration::from_millis(10);

/// How enqueued ASDUs are routed to connections and which connections
/// may be active simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// One shared queue pair for all connections; at most one connection
    /// is active at a time.
    SingleRedundancyGroup,
    /// Every connection owns its queue pair; enqueued ASDUs are
    /// broadcast to all open connections.
    ConnectionIsRedundancyGroup,
    /// Named groups with IP allow-lists; the peer address selects the
    /// group, and activation is exclusive within each group.
    MultipleRedundancyGroups,
}

#[derive(Clone)]
struct SlaveConfig {
    local_address: String,
    tcp_port: u16,
    server_mode: ServerMode,
    max_open_connections: i32,
    apci_parameters: ApciParameters,
    al_parameters: AppLayerParameters,
    low_queue_size: usize,
    high_queue_size: usize,
}

pub(crate) struct SlaveCore {
    config: RwLock<SlaveConfig>,
    handlers: RwLock<Handlers>,
    plugins: RwLock<Vec<Arc<dyn SlavePlugin>>>,
    // Pooled connection slots; `is_used` marks free ones.
    connections: Vec<Arc<MasterConnection>>,
    // Open connection count, doubling as the connection-table lock.
    open_state: Mutex<i32>,
    shared_low_queue: RwLock<Option<Arc<MessageQueue>>>,
    shared_high_queue: RwLock<Option<Arc<HighPrioQueue>>>,
    groups: RwLock<Vec<Arc<GroupRuntime>>>,
    pending_groups: Mutex<Vec<RedundancyGroup>>,
    listener: RwLock<Option<Arc<ServerSocket>>>,
    tick_poller: Mutex<Option<polling::Poller>>,
    is_running: AtomicBool,
    stop_running: AtomicBool,
    is_threadless: AtomicBool,
}

impl SlaveCore {
    pub(crate) fn apci_parameters(&self) -> ApciParameters {
        self.config.read().unwrap().apci_parameters
    }

    pub(crate) fn al_parameters(&self) -> AppLayerParameters {
        self.config.read().unwrap().al_parameters
    }

    pub(crate) fn plugins(&self) -> Vec<Arc<dyn SlavePlugin>> {
        self.plugins.read().unwrap().clone()
    }

    pub(crate) fn connection_request_handler(
        &self,
    ) -> Option<Arc<handlers::ConnectionRequestHandler>> {
        self.handlers.read().unwrap().connection_request.clone()
    }

    pub(crate) fn interrogation_handler(&self) -> Option<Arc<handlers::InterrogationHandler>> {
        self.handlers.read().unwrap().interrogation.clone()
    }

    pub(crate) fn counter_interrogation_handler(
        &self,
    ) -> Option<Arc<handlers::CounterInterrogationHandler>> {
        self.handlers.read().unwrap().counter_interrogation.clone()
    }

    pub(crate) fn read_handler(&self) -> Option<Arc<handlers::ReadHandler>> {
        self.handlers.read().unwrap().read.clone()
    }

    pub(crate) fn clock_sync_handler(&self) -> Option<Arc<handlers::ClockSyncHandler>> {
        self.handlers.read().unwrap().clock_sync.clone()
    }

    pub(crate) fn reset_process_handler(&self) -> Option<Arc<handlers::ResetProcessHandler>> {
        self.handlers.read().unwrap().reset_process.clone()
    }

    pub(crate) fn delay_acquisition_handler(
        &self,
    ) -> Option<Arc<handlers::DelayAcquisitionHandler>> {
        self.handlers.read().unwrap().delay_acquisition.clone()
    }

    pub(crate) fn asdu_handler(&self) -> Option<Arc<handlers::AsduHandler>> {
        self.handlers.read().unwrap().asdu.clone()
    }

    pub(crate) fn raw_message_handler(&self) -> Option<Arc<handlers::RawMessageHandler>> {
        self.handlers.read().unwrap().raw_message.clone()
    }

    pub(crate) fn emit_connection_event(&self, handle: &ConnectionHandle, event: ConnectionEvent) {
        let handler = self.handlers.read().unwrap().connection_event.clone();

        if let Some(handler) = handler {
            handler(handle, event);
        }
    }

    /// Activates `target`, deactivating every other connection in the
    /// applicable scope first: all of them in single-group mode, the
    /// same redundancy group in multi-group mode.
    pub(crate) fn activate(&self, target: &MasterConnection) {
        let mode = self.config.read().unwrap().server_mode;

        match mode {
            ServerMode::SingleRedundancyGroup => {
                let _open = self.open_state.lock().unwrap();

                for connection in &self.connections {
                    if connection.slot != target.slot {
                        connection.deactivate(self);
                    }
                }
            }
            ServerMode::MultipleRedundancyGroups => {
                let _open = self.open_state.lock().unwrap();
                let group_index = target.group_index();

                for connection in &self.connections {
                    if connection.group_index() == group_index && connection.slot != target.slot {
                        connection.deactivate(self);
                    }
                }
            }
            ServerMode::ConnectionIsRedundancyGroup => {}
        }

        target.activate(self);
    }

    /// Returns a connection slot to the pool. An active connection's
    /// unconfirmed queue entries revert to waiting so a successor
    /// resumes delivery.
    pub(crate) fn remove_connection(&self, connection: &Arc<MasterConnection>) {
        let mut open = self.open_state.lock().unwrap();

        *open -= 1;
        connection.is_used.store(false, Ordering::SeqCst);

        if connection.is_active() {
            if let Some(queue) = connection.low_queue() {
                queue.revert_unconfirmed_to_waiting();
            }
        }

        connection.release_transport();
    }

    /// Routes an ASDU into the low-priority queues selected by the
    /// server mode.
    pub(crate) fn enqueue_asdu(&self, asdu: &Asdu) {
        let asdu_bytes = match asdu.encode(&self.al_parameters()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "ASDU not queued");
                return;
            }
        };

        let now = clock::now_ms();
        let mode = self.config.read().unwrap().server_mode;

        match mode {
            ServerMode::SingleRedundancyGroup => {
                if let Some(queue) = self.shared_low_queue.read().unwrap().clone() {
                    queue.enqueue(&asdu_bytes, now);
                }
            }
            ServerMode::MultipleRedundancyGroups => {
                for runtime in self.groups.read().unwrap().iter() {
                    runtime.low_queue.enqueue(&asdu_bytes, now);
                }
            }
            ServerMode::ConnectionIsRedundancyGroup => {
                let _open = self.open_state.lock().unwrap();

                for connection in &self.connections {
                    if connection.is_used.load(Ordering::SeqCst) {
                        if let Some(queue) = connection.low_queue() {
                            queue.enqueue(&asdu_bytes, now);
                        }
                    }
                }
            }
        }
    }

    fn initialize_queues(&self) {
        let cfg = self.config.read().unwrap().clone();

        match cfg.server_mode {
            ServerMode::SingleRedundancyGroup => {
                *self.shared_low_queue.write().unwrap() =
                    Some(Arc::new(MessageQueue::new(cfg.low_queue_size)));
                *self.shared_high_queue.write().unwrap() =
                    Some(Arc::new(HighPrioQueue::new(cfg.high_queue_size)));
            }
            ServerMode::MultipleRedundancyGroups => {
                let mut groups = self.groups.write().unwrap();
                let mut pending = self.pending_groups.lock().unwrap();

                // Without configured groups everything lands in an
                // unnamed catch-all.
                if groups.is_empty() && pending.is_empty() {
                    pending.push(RedundancyGroup::new(None));
                }

                for group in pending.drain(..) {
                    groups.push(Arc::new(GroupRuntime {
                        group,
                        low_queue: Arc::new(MessageQueue::new(cfg.low_queue_size)),
                        high_queue: Arc::new(HighPrioQueue::new(cfg.high_queue_size)),
                    }));
                }
            }
            ServerMode::ConnectionIsRedundancyGroup => {
                for connection in &self.connections {
                    connection.bind_queues(
                        Arc::new(MessageQueue::new(cfg.low_queue_size)),
                        Arc::new(HighPrioQueue::new(cfg.high_queue_size)),
                    );
                }
            }
        }
    }

    fn get_free_connection(&self) -> Option<Arc<MasterConnection>> {
        let mut open = self.open_state.lock().unwrap();

        for connection in &self.connections {
            if !connection.is_used.load(Ordering::SeqCst) {
                connection.is_used.store(true, Ordering::SeqCst);
                *open += 1;
                return Some(Arc::clone(connection));
            }
        }

        None
    }

    /// Admission control and slot setup for one accepted socket. In
    /// threaded mode the connection gets a worker thread; threadless
    /// connections are driven by `tick`.
    fn handle_new_connection(&self, transport: Transport, threaded: bool) {
        let peer_ip = transport.peer_ip();
        let cfg = self.config.read().unwrap().clone();

        if cfg.max_open_connections > 0
            && *self.open_state.lock().unwrap() >= cfg.max_open_connections
        {
            debug!(%peer_ip, "connection refused, open connection limit reached");
            return;
        }

        if let Some(handler) = self.connection_request_handler() {
            if !handler(peer_ip) {
                debug!(%peer_ip, "connection refused by request handler");
                return;
            }
        }

        let mut bound_queues = None;
        let mut group_index = NO_GROUP;

        match cfg.server_mode {
            ServerMode::SingleRedundancyGroup => {
                let low = self.shared_low_queue.read().unwrap().clone();
                let high = self.shared_high_queue.read().unwrap().clone();

                match (low, high) {
                    (Some(low), Some(high)) => bound_queues = Some((low, high)),
                    _ => {
                        warn!("server queues not initialized, rejecting connection");
                        return;
                    }
                }
            }
            ServerMode::ConnectionIsRedundancyGroup => {
                // The slot's own queues apply; resolved in init.
            }
            ServerMode::MultipleRedundancyGroups => {
                let groups = self.groups.read().unwrap();

                match group::matching_group(&groups, &peer_ip) {
                    Some(index) => {
                        if let Some(name) = groups[index].group.name() {
                            debug!(group = name, %peer_ip, "adding connection to group");
                        }

                        bound_queues = Some((
                            groups[index].low_queue.clone(),
                            groups[index].high_queue.clone(),
                        ));
                        group_index = index;
                    }
                    None => {
                        debug!(%peer_ip, "no matching redundancy group, closing connection");
                        return;
                    }
                }
            }
        }

        let connection = match self.get_free_connection() {
            Some(connection) => connection,
            None => {
                debug!(%peer_ip, "connection attempt failed, no free slot");
                return;
            }
        };

        connection.init(
            transport,
            bound_queues,
            group_index,
            cfg.apci_parameters.k,
            cfg.apci_parameters.t3,
        );
        connection.set_running(true);

        if threaded {
            let worker_connection = Arc::clone(&connection);

            let spawned = thread::Builder::new()
                .name(format!("tele104-con-{}", connection.slot))
                .spawn(move || {
                    let slave = match worker_connection.slave() {
                        Some(slave) => slave,
                        None => return,
                    };

                    connection_worker(worker_connection, slave);
                });

            if spawned.is_err() {
                warn!("failed to spawn connection worker");
                connection.close();
                self.remove_connection(&connection);
            }
        } else {
            let handle = ConnectionHandle::new(Arc::clone(&connection));
            self.emit_connection_event(&handle, ConnectionEvent::Opened);
        }
    }

    /// One cooperative step: an accept attempt, then I/O, timers and
    /// draining for every open connection.
    fn tick(&self) {
        let max_open = self.config.read().unwrap().max_open_connections;

        let below_limit = max_open < 1 || *self.open_state.lock().unwrap() < max_open;

        if below_limit {
            let listener = self.listener.read().unwrap().clone();

            if let Some(listener) = listener {
                if let Some(transport) = listener.accept() {
                    self.handle_new_connection(transport, false);
                }
            }
        }

        self.handle_client_connections();
    }

    fn handle_client_connections(&self) {
        if *self.open_state.lock().unwrap() == 0 {
            return;
        }

        // Reap closed connections, collect the live sockets.
        let mut pollable: Vec<(usize, Arc<Transport>)> = Vec::new();

        for connection in &self.connections {
            if !connection.is_used.load(Ordering::SeqCst) {
                continue;
            }

            if connection.is_running() {
                if let Some(transport) = connection.transport() {
                    pollable.push((connection.slot, transport));
                }
            } else {
                let handle = ConnectionHandle::new(Arc::clone(connection));
                self.emit_connection_event(&handle, ConnectionEvent::Closed);

                debug!(slot = connection.slot, "connection closed");

                self.remove_connection(connection);
            }
        }

        // One bounded poll over all live sockets.
        if !pollable.is_empty() && self.poll_connections(&pollable) {
            for connection in &self.connections {
                if connection.is_used.load(Ordering::SeqCst) {
                    connection.handle_tcp(self);
                }
            }
        }

        // Periodic work for the running ones.
        for connection in &self.connections {
            if connection.is_used.load(Ordering::SeqCst) && connection.is_running() {
                connection.execute_periodic_tasks(self);

                let plugins = self.plugins();

                if !plugins.is_empty() {
                    let handle = ConnectionHandle::new(Arc::clone(connection));

                    for plugin in plugins {
                        plugin.run_periodic(&handle);
                    }
                }
            }
        }
    }

    fn poll_connections(&self, pollable: &[(usize, Arc<Transport>)]) -> bool {
        let poller_slot = self.tick_poller.lock().unwrap();

        let poller = match poller_slot.as_ref() {
            Some(poller) => poller,
            None => return true,
        };

        let mut registered: Vec<&Arc<Transport>> = Vec::new();

        for (slot, transport) in pollable {
            let added = unsafe { poller.add(transport.stream(), polling::Event::readable(*slot)) };

            if added.is_ok() {
                registered.push(transport);
            }
        }

        let mut events = polling::Events::new();
        let ready = matches!(
            poller.wait(&mut events, Some(TICK_POLL_TIMEOUT)),
            Ok(n) if n > 0
        );

        for transport in registered {
            let _ = poller.delete(transport.stream());
        }

        ready
    }
}

fn acceptor_loop(slave: Arc<SlaveCore>) {
    while !slave.stop_running.load(Ordering::SeqCst) {
        let listener = slave.listener.read().unwrap().clone();

        let listener = match listener {
            Some(listener) => listener,
            None => break,
        };

        match listener.accept() {
            Some(transport) => slave.handle_new_connection(transport, true),
            None => thread::sleep(ACCEPT_RETRY_DELAY),
        }
    }

    slave.is_running.store(false, Ordering::SeqCst);
    slave.stop_running.store(false, Ordering::SeqCst);
}

/// The 104 server ("slave" / controlled station): a listener plus a pool
/// of master connections bound to outbound queues according to the
/// server mode.
///
/// Construct, configure (address, mode, parameters, handlers), then run
/// either threaded ([`Slave::start`]) or cooperatively
/// ([`Slave::start_threadless`] + [`Slave::tick`]).
pub struct Slave {
    core: Arc<SlaveCore>,
    listening_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Slave {
    /// A slave with default queue capacities.
    pub fn new() -> Self {
        Self::with_queue_sizes(0, 0)
    }

    /// A slave with explicit low/high priority queue capacities (in
    /// worst-case ASDU slots). Values below 1 select the defaults.
    pub fn with_queue_sizes(low_prio_size: i32, high_prio_size: i32) -> Self {
        let low_queue_size = if low_prio_size < 1 {
            DEFAULT_LOW_PRIO_QUEUE_SIZE
        } else {
            low_prio_size as usize
        };
        let high_queue_size = if high_prio_size < 1 {
            DEFAULT_HIGH_PRIO_QUEUE_SIZE
        } else {
            high_prio_size as usize
        };

        let core = Arc::new_cyclic(|weak| SlaveCore {
            config: RwLock::new(SlaveConfig {
                local_address: "0.0.0.0".to_owned(),
                tcp_port: DEFAULT_PORT,
                server_mode: ServerMode::SingleRedundancyGroup,
                max_open_connections: CONNECTION_POOL_SIZE as i32,
                apci_parameters: ApciParameters::default(),
                al_parameters: AppLayerParameters::default(),
                low_queue_size,
                high_queue_size,
            }),
            handlers: RwLock::new(Handlers::default()),
            plugins: RwLock::new(Vec::new()),
            connections: (0..CONNECTION_POOL_SIZE)
                .map(|slot| {
                    let slave = weak.clone();
                    Arc::new_cyclic(|me| MasterConnection::new(slave, me.clone(), slot))
                })
                .collect(),
            open_state: Mutex::new(0),
            shared_low_queue: RwLock::new(None),
            shared_high_queue: RwLock::new(None),
            groups: RwLock::new(Vec::new()),
            pending_groups: Mutex::new(Vec::new()),
            listener: RwLock::new(None),
            tick_poller: Mutex::new(None),
            is_running: AtomicBool::new(false),
            stop_running: AtomicBool::new(false),
            is_threadless: AtomicBool::new(false),
        });

        Self {
            core,
            listening_thread: Mutex::new(None),
        }
    }

    pub fn set_local_address(&self, address: &str) {
        self.core.config.write().unwrap().local_address = address.to_owned();
    }

    pub fn set_local_port(&self, port: u16) {
        self.core.config.write().unwrap().tcp_port = port;
    }

    pub fn set_server_mode(&self, mode: ServerMode) {
        self.core.config.write().unwrap().server_mode = mode;
    }

    /// Limits concurrently open connections. Zero or negative means
    /// unlimited (bounded only by the slot pool).
    pub fn set_max_open_connections(&self, max: i32) {
        let max = max.min(CONNECTION_POOL_SIZE as i32);

        self.core.config.write().unwrap().max_open_connections = max;
    }

    pub fn set_connection_parameters(&self, parameters: ApciParameters) {
        self.core.config.write().unwrap().apci_parameters = parameters;
    }

    pub fn connection_parameters(&self) -> ApciParameters {
        self.core.apci_parameters()
    }

    pub fn set_app_layer_parameters(&self, parameters: AppLayerParameters) {
        self.core.config.write().unwrap().al_parameters = parameters;
    }

    pub fn app_layer_parameters(&self) -> AppLayerParameters {
        self.core.al_parameters()
    }

    pub fn set_connection_request_handler(
        &self,
        handler: impl Fn(IpAddr) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().connection_request = Some(Arc::new(handler));
    }

    pub fn set_connection_event_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, ConnectionEvent) + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().connection_event = Some(Arc::new(handler));
    }

    pub fn set_interrogation_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().interrogation = Some(Arc::new(handler));
    }

    pub fn set_counter_interrogation_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().counter_interrogation = Some(Arc::new(handler));
    }

    pub fn set_read_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, u32) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().read = Some(Arc::new(handler));
    }

    pub fn set_clock_sync_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, &Cp56Time2a) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().clock_sync = Some(Arc::new(handler));
    }

    pub fn set_reset_process_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().reset_process = Some(Arc::new(handler));
    }

    pub fn set_delay_acquisition_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu, u16) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().delay_acquisition = Some(Arc::new(handler));
    }

    pub fn set_asdu_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &mut Asdu) -> bool + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().asdu = Some(Arc::new(handler));
    }

    /// Audit tap on raw APDUs in both directions (the flag is true for
    /// transmitted frames). The handler observes the connection mid-send
    /// and must not send ASDUs back into it.
    pub fn set_raw_message_handler(
        &self,
        handler: impl Fn(&ConnectionHandle, &[u8], bool) + Send + Sync + 'static,
    ) {
        self.core.handlers.write().unwrap().raw_message = Some(Arc::new(handler));
    }

    pub fn add_plugin(&self, plugin: Arc<dyn SlavePlugin>) {
        self.core.plugins.write().unwrap().push(plugin);
    }

    /// Registers a redundancy group. Only meaningful in
    /// [`ServerMode::MultipleRedundancyGroups`]; queues are bound when
    /// the server starts.
    pub fn add_redundancy_group(&self, group: RedundancyGroup) {
        let mode = self.core.config.read().unwrap().server_mode;

        if mode == ServerMode::MultipleRedundancyGroups {
            self.core.pending_groups.lock().unwrap().push(group);
        }
    }

    /// Queues an ASDU for delivery per the server mode's routing.
    pub fn enqueue_asdu(&self, asdu: &Asdu) {
        self.core.enqueue_asdu(asdu);
    }

    /// Starts the threaded drivers: an acceptor thread plus one worker
    /// thread per accepted connection.
    pub fn start(&self) -> Result<(), Error> {
        if self.core.is_running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        self.core.stop_running.store(false, Ordering::SeqCst);
        self.core.initialize_queues();

        let cfg = self.core.config.read().unwrap().clone();
        let listener = ServerSocket::bind(&cfg.local_address, cfg.tcp_port)?;

        info!(
            address = %cfg.local_address,
            port = cfg.tcp_port,
            "server listening"
        );

        *self.core.listener.write().unwrap() = Some(Arc::new(listener));

        self.core.is_threadless.store(false, Ordering::SeqCst);
        self.core.is_running.store(true, Ordering::SeqCst);

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("tele104-accept".to_owned())
            .spawn(move || acceptor_loop(core))?;

        *self.listening_thread.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Stops the server: the acceptor exits, every connection closes and
    /// its worker is waited out.
    pub fn stop(&self) {
        if self.core.is_threadless.load(Ordering::SeqCst) {
            self.stop_threadless();
            return;
        }

        if self.core.is_running.load(Ordering::SeqCst) {
            self.core.stop_running.store(true, Ordering::SeqCst);
        }

        if let Some(handle) = self.listening_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        {
            let _open = self.core.open_state.lock().unwrap();

            for connection in &self.core.connections {
                if connection.is_used.load(Ordering::SeqCst) {
                    connection.close();
                }
            }
        }

        while self.open_connection_count() > 0 {
            thread::sleep(STOP_POLL_DELAY);
        }

        self.core.is_running.store(false, Ordering::SeqCst);
        *self.core.listener.write().unwrap() = None;
    }

    /// Binds the listener for cooperative mode; the application then
    /// drives everything through [`Slave::tick`].
    pub fn start_threadless(&self) -> Result<(), Error> {
        if self.core.is_running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        self.core.initialize_queues();

        let cfg = self.core.config.read().unwrap().clone();
        let listener = ServerSocket::bind(&cfg.local_address, cfg.tcp_port)?;

        info!(
            address = %cfg.local_address,
            port = cfg.tcp_port,
            "server listening (threadless)"
        );

        *self.core.listener.write().unwrap() = Some(Arc::new(listener));
        *self.core.tick_poller.lock().unwrap() = polling::Poller::new().ok();

        self.core.is_threadless.store(true, Ordering::SeqCst);
        self.core.is_running.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// One cooperative scheduling step: a single accept attempt, one
    /// bounded poll over all connections, then I/O, timers and draining.
    pub fn tick(&self) {
        self.core.tick();
    }

    /// Closes the listener. Connections still open are closed on the
    /// next tick.
    pub fn stop_threadless(&self) {
        self.core.is_running.store(false, Ordering::SeqCst);
        *self.core.listener.write().unwrap() = None;

        let _open = self.core.open_state.lock().unwrap();

        for connection in &self.core.connections {
            if connection.is_used.load(Ordering::SeqCst) {
                connection.close();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running.load(Ordering::SeqCst)
    }

    pub fn open_connection_count(&self) -> usize {
        (*self.core.open_state.lock().unwrap()).max(0) as usize
    }
}

impl Default for Slave {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Slave {
    fn drop(&mut self) {
        if self.core.is_running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}
