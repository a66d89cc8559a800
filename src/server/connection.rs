use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time;

use tracing::{debug, warn};

use crate::apci::{self, Control, UFunction};
use crate::asdu::{self, cot, type_id, Asdu, Cp56Time2a};
use crate::clock;
use crate::queue::{EntryHandle, HighPrioQueue, MessageQueue};
use crate::socket::{SocketWaiter, Transport};

use super::handlers::{ConnectionEvent, PluginResult};
use super::SlaveCore;

const RECV_BUFFER_SIZE: usize = 260;
const FRAME_BUFFER_SIZE: usize = 256;

pub(crate) const NO_GROUP: usize = usize::MAX;

/// One slot of the k-buffer: an I frame sent but not yet acknowledged.
/// `seq_no` is the send counter value after the frame went out, i.e. the
/// N(R) a peer reports once this frame is confirmed.
#[derive(Debug, Clone, Copy, Default)]
struct SentAsdu {
    entry_time: u64,
    queue_entry: Option<EntryHandle>,
    sent_time: u64,
    seq_no: u16,
}

/// FIFO ring of unacknowledged I frames, bounded by the k parameter.
struct SentBuffer {
    entries: Vec<SentAsdu>,
    k: usize,
    oldest: Option<usize>,
    newest: usize,
}

impl SentBuffer {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            k: 1,
            oldest: None,
            newest: 0,
        }
    }

    fn reset(&mut self, k: usize) {
        self.k = k.max(1);
        self.entries = vec![SentAsdu::default(); self.k];
        self.oldest = None;
        self.newest = 0;
    }

    fn is_full(&self) -> bool {
        match self.oldest {
            Some(oldest) => (self.newest + 1) % self.k == oldest,
            None => false,
        }
    }
}

/// Sequence counters and timer state of one APCI association.
struct ApciState {
    send_count: u16,
    receive_count: u16,
    unconfirmed_received_i: u32,
    timeout_t2_triggered: bool,
    // u64::MAX when no confirmation is pending
    last_confirmation_time: u64,
    next_t3_timeout: u64,
    outstanding_testfr_con: u32,
}

impl ApciState {
    fn new() -> Self {
        Self {
            send_count: 0,
            receive_count: 0,
            unconfirmed_received_i: 0,
            timeout_t2_triggered: false,
            last_confirmation_time: u64::MAX,
            next_t3_timeout: 0,
            outstanding_testfr_con: 0,
        }
    }
}

pub(crate) enum Received {
    Nothing,
    Frame(Vec<u8>),
    Error,
}

/// Accumulates the three parts of an APDU - start byte, length byte,
/// remainder - across partial reads.
struct FrameReceiver {
    buffer: [u8; RECV_BUFFER_SIZE],
    pos: usize,
}

impl FrameReceiver {
    fn new() -> Self {
        Self {
            buffer: [0; RECV_BUFFER_SIZE],
            pos: 0,
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn receive(&mut self, transport: &Transport) -> Received {
        let mut pos = self.pos;

        if pos == 0 {
            match transport.read(&mut self.buffer[0..1]) {
                Err(_) => return Received::Error,
                Ok(0) => return Received::Nothing,
                Ok(_) => {
                    if self.buffer[0] != apci::START_BYTE {
                        return Received::Error;
                    }
                    pos = 1;
                }
            }
        }

        if pos == 1 {
            match transport.read(&mut self.buffer[1..2]) {
                Ok(1) => pos = 2,
                _ => {
                    self.pos = 0;
                    return Received::Error;
                }
            }
        }

        let length = self.buffer[1] as usize;
        let remaining = length + 2 - pos;

        match transport.read(&mut self.buffer[pos..pos + remaining]) {
            Err(_) => {
                self.pos = 0;
                Received::Error
            }
            Ok(n) if n == remaining => {
                self.pos = 0;
                Received::Frame(self.buffer[..length + 2].to_vec())
            }
            Ok(n) => {
                self.pos = pos + n;
                Received::Nothing
            }
        }
    }
}

/// Per-session state of one master connection. Slots are created with
/// the server and pooled; `is_used` marks a slot as taken. The driver
/// (a worker thread or the threadless tick) owns the receive path; other
/// threads only flip the flags and enqueue.
pub(crate) struct MasterConnection {
    slave: Weak<SlaveCore>,
    self_weak: Weak<MasterConnection>,
    pub(crate) slot: usize,
    pub(crate) is_used: AtomicBool,
    is_active: AtomicBool,
    is_running: AtomicBool,
    transport: RwLock<Option<Arc<Transport>>>,
    receiver: Mutex<FrameReceiver>,
    apci: Mutex<ApciState>,
    sent_asdus: Mutex<SentBuffer>,
    low_queue: RwLock<Option<Arc<MessageQueue>>>,
    high_queue: RwLock<Option<Arc<HighPrioQueue>>>,
    group_index: AtomicUsize,
}

impl MasterConnection {
    pub(crate) fn new(
        slave: Weak<SlaveCore>,
        self_weak: Weak<MasterConnection>,
        slot: usize,
    ) -> Self {
        Self {
            slave,
            self_weak,
            slot,
            is_used: AtomicBool::new(false),
            is_active: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            transport: RwLock::new(None),
            receiver: Mutex::new(FrameReceiver::new()),
            apci: Mutex::new(ApciState::new()),
            sent_asdus: Mutex::new(SentBuffer::new()),
            low_queue: RwLock::new(None),
            high_queue: RwLock::new(None),
            group_index: AtomicUsize::new(NO_GROUP),
        }
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        self.self_weak.upgrade().map(ConnectionHandle::new)
    }

    pub(crate) fn slave(&self) -> Option<Arc<SlaveCore>> {
        self.slave.upgrade()
    }

    /// Binds connection-scoped queues to this slot (connection-is-group
    /// mode). Done once when the server starts.
    pub(crate) fn bind_queues(&self, low_queue: Arc<MessageQueue>, high_queue: Arc<HighPrioQueue>) {
        *self.low_queue.write().unwrap() = Some(low_queue);
        *self.high_queue.write().unwrap() = Some(high_queue);
    }

    /// Prepares a pooled slot for a freshly accepted socket. With
    /// `bound_queues` the slot joins a shared queue pair; without, its
    /// own connection-scoped pair applies and is scrubbed of whatever a
    /// previous user left behind.
    pub(crate) fn init(
        &self,
        transport: Transport,
        bound_queues: Option<(Arc<MessageQueue>, Arc<HighPrioQueue>)>,
        group_index: usize,
        k: u16,
        t3: u16,
    ) {
        self.is_active.store(false, Ordering::SeqCst);
        self.is_running.store(false, Ordering::SeqCst);

        *self.transport.write().unwrap() = Some(Arc::new(transport));
        self.receiver.lock().unwrap().reset();

        {
            let mut state = self.apci.lock().unwrap();
            *state = ApciState::new();
            state.next_t3_timeout = clock::now_ms() + t3 as u64 * 1000;
        }

        self.sent_asdus.lock().unwrap().reset(k as usize);

        match bound_queues {
            Some((low_queue, high_queue)) => {
                *self.low_queue.write().unwrap() = Some(low_queue);
                *self.high_queue.write().unwrap() = Some(high_queue);
            }
            None => {
                // Connection-scoped queues: a successor must not inherit
                // a dead peer's backlog.
                if let Some(queue) = self.low_queue() {
                    queue.release_all();
                }
            }
        }

        // A reused slot must not hand a new master its predecessor's
        // pending command responses.
        if let Some(queue) = self.high_queue() {
            queue.reset();
        }

        self.group_index.store(group_index, Ordering::SeqCst);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn group_index(&self) -> usize {
        self.group_index.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().unwrap().clone()
    }

    pub(crate) fn release_transport(&self) {
        *self.transport.write().unwrap() = None;
    }

    pub(crate) fn low_queue(&self) -> Option<Arc<MessageQueue>> {
        self.low_queue.read().unwrap().clone()
    }

    fn high_queue(&self) -> Option<Arc<HighPrioQueue>> {
        self.high_queue.read().unwrap().clone()
    }

    pub(crate) fn peer_ip(&self) -> Option<IpAddr> {
        self.transport().map(|t| t.peer_ip())
    }

    pub(crate) fn activate(&self, slave: &SlaveCore) {
        if !self.is_active.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.handle() {
                slave.emit_connection_event(&handle, ConnectionEvent::Activated);
            }
        }
    }

    pub(crate) fn deactivate(&self, slave: &SlaveCore) {
        if self.is_active.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.handle() {
                slave.emit_connection_event(&handle, ConnectionEvent::Deactivated);
            }
        }
    }

    pub(crate) fn reset_t3(&self, now_ms: u64, t3: u16) {
        self.apci.lock().unwrap().next_t3_timeout = now_ms + t3 as u64 * 1000;
    }

    fn write_apdu(&self, slave: &SlaveCore, frame_bytes: &[u8]) -> std::io::Result<()> {
        if let Some(handler) = slave.raw_message_handler() {
            if let Some(handle) = self.handle() {
                handler(&handle, frame_bytes, true);
            }
        }

        match self.transport() {
            Some(transport) => transport.write(frame_bytes),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn receive(&self) -> Received {
        let transport = match self.transport() {
            Some(transport) => transport,
            None => return Received::Error,
        };

        self.receiver.lock().unwrap().receive(&transport)
    }

    /// Validates a peer-reported N(R) and confirms every I frame it
    /// covers. An out-of-window value means the association is broken
    /// and the caller closes the connection.
    fn check_seqno(&self, seq_no: u16) -> bool {
        let send_count = self.apci.lock().unwrap().send_count;
        let low_queue = self.low_queue();

        let mut sent = self.sent_asdus.lock().unwrap();

        let mut seq_no_valid = false;
        let mut overflow_detected = false;
        let mut oldest_valid_seq: Option<u16> = None;

        match sent.oldest {
            None => {
                // Nothing outstanding: only a re-ack of the current
                // counter is acceptable.
                if seq_no == send_count {
                    seq_no_valid = true;
                }
            }
            Some(oldest) => {
                let oldest_seq = sent.entries[oldest].seq_no;
                let newest_seq = sent.entries[sent.newest].seq_no;

                if oldest_seq <= newest_seq {
                    if seq_no >= oldest_seq && seq_no <= newest_seq {
                        seq_no_valid = true;
                    }
                } else {
                    // The 15 bit counter wrapped inside the window.
                    if seq_no >= oldest_seq || seq_no <= newest_seq {
                        seq_no_valid = true;
                    }
                    overflow_detected = true;
                }

                // A repeat of the most recently confirmed number is
                // valid as well.
                let valid_seq = if oldest_seq == 0 {
                    32767
                } else {
                    oldest_seq - 1
                };
                oldest_valid_seq = Some(valid_seq);

                if seq_no == valid_seq {
                    seq_no_valid = true;
                }
            }
        }

        if !seq_no_valid {
            warn!(seq_no, "received sequence number out of range");
            return false;
        }

        while let Some(oldest) = sent.oldest {
            let entry = sent.entries[oldest];

            if !overflow_detected && seq_no < entry.seq_no {
                break;
            }

            if Some(seq_no) == oldest_valid_seq {
                break;
            }

            if let (Some(queue), Some(handle)) = (&low_queue, entry.queue_entry) {
                queue.mark_confirmed(handle);
            }

            if entry.seq_no == seq_no {
                // Arrived at the confirmed number.
                if oldest == sent.newest {
                    sent.oldest = None;
                } else {
                    sent.oldest = Some((oldest + 1) % sent.k);
                }
                break;
            }

            let next = (oldest + 1) % sent.k;

            if next == (sent.newest + 1) % sent.k {
                sent.oldest = None;
                break;
            }

            sent.oldest = Some(next);
        }

        true
    }

    /// Frames `asdu_bytes` as an I message and transmits it, recording
    /// it in a k-buffer slot. The caller holds the k-buffer lock and has
    /// verified there is room.
    fn send_i(
        &self,
        slave: &SlaveCore,
        asdu_bytes: &[u8],
        queue_entry: Option<EntryHandle>,
        entry_time: u64,
        sent: &mut SentBuffer,
    ) {
        let slot = match sent.oldest {
            None => {
                sent.oldest = Some(0);
                0
            }
            Some(_) => (sent.newest + 1) % sent.k,
        };

        let frame_size = apci::APCI_LENGTH + asdu_bytes.len();
        let mut buffer = [0u8; FRAME_BUFFER_SIZE];
        buffer[apci::APCI_LENGTH..frame_size].copy_from_slice(asdu_bytes);

        let (send_count, receive_count) = {
            let state = self.apci.lock().unwrap();
            (state.send_count, state.receive_count)
        };

        apci::write_i_header(&mut buffer, frame_size, send_count, receive_count);

        let write_ok = self.write_apdu(slave, &buffer[..frame_size]).is_ok();

        let seq_no = {
            let mut state = self.apci.lock().unwrap();

            if write_ok {
                debug!(
                    size = frame_size,
                    n_s = send_count,
                    n_r = receive_count,
                    "sent I frame"
                );
                state.send_count = (state.send_count + 1) % 32768;
                state.timeout_t2_triggered = false;
            } else {
                self.is_running.store(false, Ordering::SeqCst);
            }

            // An outgoing I frame carries the acknowledge.
            state.unconfirmed_received_i = 0;
            state.send_count
        };

        sent.entries[slot] = SentAsdu {
            entry_time,
            queue_entry,
            seq_no,
            sent_time: clock::now_ms(),
        };
        sent.newest = slot;
    }

    /// Sends an ASDU through the window, spilling to the high-priority
    /// queue when the window is full. Refused while inactive.
    pub(crate) fn send_asdu_internal(&self, slave: &SlaveCore, asdu: &Asdu) -> bool {
        if !self.is_active() {
            debug!("unable to send response, connection not active");
            return false;
        }

        let asdu_bytes = match asdu.encode(&slave.al_parameters()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "response ASDU not encodable");
                return false;
            }
        };

        let mut sent = self.sent_asdus.lock().unwrap();

        if !sent.is_full() {
            self.send_i(slave, &asdu_bytes, None, 0, &mut sent);
            true
        } else {
            drop(sent);

            match self.high_queue() {
                Some(queue) => queue.enqueue(&asdu_bytes),
                None => false,
            }
        }
    }

    fn respond_cot_unknown(&self, slave: &SlaveCore, asdu: &mut Asdu) {
        debug!(type_id = asdu.type_id(), cot = asdu.cot(), "unknown COT");
        asdu.set_cot(cot::UNKNOWN_COT);
        asdu.set_negative(true);
        self.send_asdu_internal(slave, asdu);
    }

    /// Routes a received ASDU: plugins first, then the built-in command
    /// dispatch, then the fallback handler. Returns false only for an
    /// ASDU too broken to respond to.
    fn handle_asdu(&self, slave: &SlaveCore, asdu: &mut Asdu) -> bool {
        let handle = match self.handle() {
            Some(handle) => handle,
            None => return true,
        };

        for plugin in slave.plugins() {
            if plugin.handle_asdu(&handle, asdu) == PluginResult::Handled {
                return true;
            }
        }

        let params = slave.al_parameters();
        let asdu_cot = asdu.cot();
        let mut handled = false;

        match asdu.type_id() {
            type_id::C_IC_NA_1 => {
                debug!("received interrogation command");

                if asdu_cot == cot::ACTIVATION || asdu_cot == cot::DEACTIVATION {
                    if let Some(handler) = slave.interrogation_handler() {
                        let qoi = match asdu.first_element(&params).and_then(|e| e.first().copied())
                        {
                            Some(qoi) => qoi,
                            None => return false,
                        };

                        if handler(&handle, asdu, qoi) {
                            handled = true;
                        }
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            type_id::C_CI_NA_1 => {
                debug!("received counter interrogation command");

                if asdu_cot == cot::ACTIVATION || asdu_cot == cot::DEACTIVATION {
                    if let Some(handler) = slave.counter_interrogation_handler() {
                        let qcc = match asdu.first_element(&params).and_then(|e| e.first().copied())
                        {
                            Some(qcc) => qcc,
                            None => return false,
                        };

                        if handler(&handle, asdu, qcc) {
                            handled = true;
                        }
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            type_id::C_RD_NA_1 => {
                debug!("received read command");

                if asdu_cot == cot::REQUEST {
                    if let Some(handler) = slave.read_handler() {
                        let address = match asdu.first_object_address(&params) {
                            Some(address) => address,
                            None => return false,
                        };

                        if handler(&handle, asdu, address) {
                            handled = true;
                        }
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            type_id::C_CS_NA_1 => {
                debug!("received clock sync command");

                if asdu_cot == cot::ACTIVATION {
                    if let Some(handler) = slave.clock_sync_handler() {
                        let time = match asdu.first_element(&params).and_then(Cp56Time2a::from_bytes)
                        {
                            Some(time) => time,
                            None => return false,
                        };

                        if handler(&handle, asdu, &time) {
                            // The positive confirmation travels the
                            // event path so it reaches the master even
                            // when the window is saturated.
                            let mut confirmation = Asdu::new(
                                type_id::C_CS_NA_1,
                                cot::ACTIVATION_CON,
                                asdu.common_address(),
                            );
                            confirmation.set_originator(asdu.originator());

                            let mut object = Vec::new();
                            asdu::encode_object_address(&params, 0, &mut object);
                            object.extend_from_slice(time.as_bytes());
                            confirmation.add_information_object_raw(&object);

                            slave.enqueue_asdu(&confirmation);
                        } else {
                            asdu.set_cot(cot::ACTIVATION_CON);
                            asdu.set_negative(true);
                            self.send_asdu_internal(slave, asdu);
                        }

                        handled = true;
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            type_id::C_TS_NA_1 => {
                debug!("received test command");

                if asdu_cot != cot::ACTIVATION {
                    asdu.set_cot(cot::UNKNOWN_COT);
                    asdu.set_negative(true);
                } else {
                    asdu.set_cot(cot::ACTIVATION_CON);
                }

                self.send_asdu_internal(slave, asdu);
                handled = true;
            }

            type_id::C_RP_NA_1 => {
                debug!("received reset process command");

                if asdu_cot == cot::ACTIVATION {
                    if let Some(handler) = slave.reset_process_handler() {
                        let qrp = match asdu.first_element(&params).and_then(|e| e.first().copied())
                        {
                            Some(qrp) => qrp,
                            None => return false,
                        };

                        if handler(&handle, asdu, qrp) {
                            handled = true;
                        }
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            type_id::C_CD_NA_1 => {
                debug!("received delay acquisition command");

                if asdu_cot == cot::ACTIVATION || asdu_cot == cot::SPONTANEOUS {
                    if let Some(handler) = slave.delay_acquisition_handler() {
                        let delay = match asdu.first_element(&params) {
                            Some(element) if element.len() >= 2 => {
                                u16::from_le_bytes([element[0], element[1]])
                            }
                            _ => return false,
                        };

                        if handler(&handle, asdu, delay) {
                            handled = true;
                        }
                    }
                } else {
                    self.respond_cot_unknown(slave, asdu);
                }
            }

            _ => {}
        }

        if !handled {
            if let Some(handler) = slave.asdu_handler() {
                if handler(&handle, asdu) {
                    handled = true;
                }
            }
        }

        if !handled {
            asdu.set_cot(cot::UNKNOWN_TYPE_ID);
            asdu.set_negative(true);
            self.send_asdu_internal(slave, asdu);
        }

        true
    }

    /// Processes one complete APDU. Returns false when the connection
    /// must close (framing or sequence violation, write failure).
    fn handle_message(&self, slave: &SlaveCore, buffer: &[u8]) -> bool {
        let now = clock::now_ms();
        let params = slave.apci_parameters();

        if buffer.len() < 6 {
            debug!("invalid message (too small)");
            return false;
        }

        if buffer[0] != apci::START_BYTE {
            debug!("invalid start character");
            return false;
        }

        if buffer[1] as usize != buffer.len() - 2 {
            debug!("invalid APDU length");
            return false;
        }

        match apci::decode_control(&buffer[2..6]) {
            Control::I { send_seq, recv_seq } => {
                if buffer.len() < 7 {
                    debug!("received I message too small");
                    return false;
                }

                {
                    let mut state = self.apci.lock().unwrap();

                    if !state.timeout_t2_triggered {
                        // Start timeout T2.
                        state.timeout_t2_triggered = true;
                        state.last_confirmation_time = now;
                    }

                    debug!(n_s = send_seq, n_r = recv_seq, "received I frame");

                    if send_seq != state.receive_count {
                        warn!(
                            expected = state.receive_count,
                            got = send_seq,
                            "sequence error, closing connection"
                        );
                        return false;
                    }
                }

                if !self.check_seqno(recv_seq) {
                    return false;
                }

                {
                    let mut state = self.apci.lock().unwrap();
                    state.receive_count = (state.receive_count + 1) % 32768;
                    state.unconfirmed_received_i += 1;
                }

                if self.is_active() {
                    match Asdu::from_bytes(&slave.al_parameters(), &buffer[6..]) {
                        Ok(mut asdu) => {
                            if !self.handle_asdu(slave, &mut asdu) {
                                debug!("ASDU corrupted");
                                return false;
                            }
                        }
                        Err(err) => {
                            debug!(%err, "invalid ASDU");
                            return false;
                        }
                    }
                } else {
                    debug!("connection not activated, skipping I message");
                }
            }

            Control::U(UFunction::TestAct) => {
                debug!("sending TESTFR_CON");

                if self.write_apdu(slave, &apci::TESTFR_CON_MSG).is_err() {
                    return false;
                }
            }

            Control::U(UFunction::StartAct) => {
                slave.activate(self);

                if let Some(queue) = self.high_queue() {
                    queue.reset();
                }

                debug!("sending STARTDT_CON");

                if self.write_apdu(slave, &apci::STARTDT_CON_MSG).is_err() {
                    return false;
                }
            }

            Control::U(UFunction::StopAct) => {
                self.deactivate(slave);

                debug!("sending STOPDT_CON");

                if self.write_apdu(slave, &apci::STOPDT_CON_MSG).is_err() {
                    return false;
                }
            }

            Control::U(UFunction::TestCon) => {
                debug!("received TESTFR_CON");
                self.apci.lock().unwrap().outstanding_testfr_con = 0;
            }

            Control::S { recv_seq } => {
                debug!(n_r = recv_seq, "received S frame");

                if !self.check_seqno(recv_seq) {
                    return false;
                }
            }

            Control::Unknown => {
                debug!("unknown message, ignored");
                return true;
            }
        }

        self.reset_t3(now, params.t3);
        true
    }

    fn send_s_message(&self, slave: &SlaveCore) {
        let receive_count = self.apci.lock().unwrap().receive_count;

        if self
            .write_apdu(slave, &apci::s_frame(receive_count))
            .is_err()
        {
            self.is_running.store(false, Ordering::SeqCst);
        }
    }

    /// Sends the S frame once w received I frames are pending.
    fn check_w_threshold(&self, slave: &SlaveCore) {
        let w = slave.apci_parameters().w as u32;

        let acknowledge = {
            let mut state = self.apci.lock().unwrap();

            if state.unconfirmed_received_i >= w {
                state.last_confirmation_time = clock::now_ms();
                state.unconfirmed_received_i = 0;
                state.timeout_t2_triggered = false;
                true
            } else {
                false
            }
        };

        if acknowledge {
            self.send_s_message(slave);
        }
    }

    /// One complete APDU arrived: tap, process, acknowledge.
    pub(crate) fn process_frame(&self, slave: &SlaveCore, frame: &[u8]) {
        if let Some(handler) = slave.raw_message_handler() {
            if let Some(handle) = self.handle() {
                handler(&handle, frame, false);
            }
        }

        if !self.handle_message(slave, frame) {
            self.is_running.store(false, Ordering::SeqCst);
        }

        self.check_w_threshold(slave);
    }

    /// Non-blocking read step for the threadless driver.
    pub(crate) fn handle_tcp(&self, slave: &SlaveCore) {
        match self.receive() {
            Received::Error => {
                debug!("error reading from socket");
                self.is_running.store(false, Ordering::SeqCst);
            }
            Received::Frame(frame) => {
                if self.is_running() {
                    self.process_frame(slave, &frame);
                }
            }
            Received::Nothing => {}
        }
    }

    /// T1/T2/T3 checks against wall time. Returns false when the
    /// connection must close. Timestamps found in the future are clamped
    /// to now so a stepped system clock does not kill the session.
    pub(crate) fn handle_timeouts(&self, slave: &SlaveCore) -> bool {
        let now = clock::now_ms();
        let params = slave.apci_parameters();

        let mut timeouts_ok = true;

        // T3: probe an idle link, give up after three unanswered probes.
        let t3_ms = params.t3 as u64 * 1000;
        let send_testfr = {
            let mut state = self.apci.lock().unwrap();

            if state.next_t3_timeout > now + t3_ms {
                // Deadline not plausible (system time changed).
                state.next_t3_timeout = now + t3_ms;
            }

            if now > state.next_t3_timeout {
                if state.outstanding_testfr_con > 2 {
                    debug!("timeout for TESTFR_CON message");
                    timeouts_ok = false;
                    false
                } else {
                    state.outstanding_testfr_con += 1;
                    state.next_t3_timeout = now + t3_ms;
                    true
                }
            } else {
                false
            }
        };

        if send_testfr && self.write_apdu(slave, &apci::TESTFR_ACT_MSG).is_err() {
            debug!("failed to write TESTFR_ACT message");
            self.is_running.store(false, Ordering::SeqCst);
        }

        // T2: acknowledge received I frames even below the w threshold.
        let send_s = {
            let mut state = self.apci.lock().unwrap();

            if state.unconfirmed_received_i > 0 {
                if state.last_confirmation_time != u64::MAX && state.last_confirmation_time > now {
                    state.last_confirmation_time = now;
                }

                if now > state.last_confirmation_time
                    && now - state.last_confirmation_time >= params.t2 as u64 * 1000
                {
                    state.last_confirmation_time = now;
                    state.unconfirmed_received_i = 0;
                    state.timeout_t2_triggered = false;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if send_s {
            self.send_s_message(slave);
        }

        // T1: the peer owes us an acknowledge for the oldest I frame.
        {
            let mut sent = self.sent_asdus.lock().unwrap();

            if let Some(oldest) = sent.oldest {
                let entry = &mut sent.entries[oldest];

                if entry.sent_time > now {
                    entry.sent_time = now;
                } else if now - entry.sent_time >= params.t1 as u64 * 1000 {
                    debug!(seq_no = entry.seq_no, "I message timeout");
                    timeouts_ok = false;
                }
            }
        }

        timeouts_ok
    }

    fn send_next_high_priority(&self, slave: &SlaveCore, queue: &HighPrioQueue) -> bool {
        let mut sent = self.sent_asdus.lock().unwrap();

        if sent.is_full() {
            return false;
        }

        let mut buffer = [0u8; FRAME_BUFFER_SIZE];

        match queue.next(&mut buffer) {
            Some(size) => {
                self.send_i(slave, &buffer[..size], None, 0, &mut sent);
                true
            }
            None => false,
        }
    }

    fn send_next_low_priority(&self, slave: &SlaveCore, queue: &MessageQueue) {
        let mut sent = self.sent_asdus.lock().unwrap();

        if sent.is_full() {
            return;
        }

        let mut buffer = [0u8; FRAME_BUFFER_SIZE];

        if let Some((handle, size)) = queue.next_waiting(&mut buffer) {
            self.send_i(
                slave,
                &buffer[..size],
                Some(handle),
                handle.timestamp(),
                &mut sent,
            );
        }
    }

    /// Drains the high-priority queue entirely, then at most one
    /// low-priority ASDU. Returns whether outbound work remains, so the
    /// driver can shorten its poll timeout.
    pub(crate) fn send_waiting_asdus(&self, slave: &SlaveCore) -> bool {
        let high_queue = match self.high_queue() {
            Some(queue) => queue,
            None => return false,
        };
        let low_queue = match self.low_queue() {
            Some(queue) => queue,
            None => return false,
        };

        while high_queue.is_asdu_available() {
            if !self.send_next_high_priority(slave, &high_queue) {
                return true;
            }

            if !self.is_running() {
                return true;
            }
        }

        self.send_next_low_priority(slave, &low_queue);

        low_queue.is_asdu_available()
    }

    /// Drain-then-timers step of the threadless driver.
    pub(crate) fn execute_periodic_tasks(&self, slave: &SlaveCore) {
        if self.is_active() {
            self.send_waiting_asdus(slave);
        }

        if !self.handle_timeouts(slave) {
            self.is_running.store(false, Ordering::SeqCst);
        }
    }
}

/// Dedicated thread driving one connection: bounded socket wait, receive,
/// timers, outbound drain.
pub(crate) fn connection_worker(connection: Arc<MasterConnection>, slave: Arc<SlaveCore>) {
    let params = slave.apci_parameters();
    connection.reset_t3(clock::now_ms(), params.t3);

    let handle = ConnectionHandle::new(Arc::clone(&connection));
    slave.emit_connection_event(&handle, ConnectionEvent::Opened);

    let mut waiter = match connection.transport() {
        Some(transport) => match SocketWaiter::new(transport) {
            Ok(waiter) => Some(waiter),
            Err(_) => {
                connection.close();
                None
            }
        },
        None => {
            connection.close();
            None
        }
    };

    let mut asdu_waiting = false;

    while connection.is_running() {
        // Short wait when outbound work is pending, long otherwise.
        let timeout = if asdu_waiting { 1 } else { 100 };

        let readable = match waiter.as_mut() {
            Some(waiter) => waiter.wait_readable(time::Duration::from_millis(timeout)),
            None => false,
        };

        if readable {
            match connection.receive() {
                Received::Error => {
                    debug!("error reading from socket");
                    break;
                }
                Received::Frame(frame) => {
                    debug!(size = frame.len(), "received message");
                    connection.process_frame(&slave, &frame);
                }
                Received::Nothing => {}
            }
        }

        if !connection.handle_timeouts(&slave) {
            connection.close();
        }

        if connection.is_running() && connection.is_active() {
            asdu_waiting = connection.send_waiting_asdus(&slave);
        }
    }

    slave.emit_connection_event(&handle, ConnectionEvent::Closed);
    debug!("connection closed");

    connection.close();
    slave.remove_connection(&connection);
}

/// What application handlers see of a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<MasterConnection>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<MasterConnection>) -> Self {
        Self { connection }
    }

    /// Whether an ASDU sent right now would go out or at least queue.
    pub fn is_ready(&self) -> bool {
        let connection = &self.connection;

        if !connection.is_active() {
            return false;
        }

        if !connection.sent_asdus.lock().unwrap().is_full() {
            return true;
        }

        match connection.high_queue() {
            Some(queue) => !queue.is_full(),
            None => false,
        }
    }

    /// Sends `asdu` on this connection, bypassing the event queues.
    /// Returns false when the connection is inactive or saturated.
    pub fn send_asdu(&self, asdu: &Asdu) -> bool {
        match self.connection.slave.upgrade() {
            Some(slave) => self.connection.send_asdu_internal(&slave, asdu),
            None => false,
        }
    }

    /// Confirms an activation: COT becomes ACTIVATION_CON, optionally
    /// negative, and the ASDU is sent back.
    pub fn send_act_con(&self, asdu: &mut Asdu, negative: bool) -> bool {
        asdu.set_cot(cot::ACTIVATION_CON);
        asdu.set_negative(negative);

        self.send_asdu(asdu)
    }

    /// Terminates an activation: COT becomes ACTIVATION_TERMINATION.
    pub fn send_act_term(&self, asdu: &mut Asdu) -> bool {
        asdu.set_cot(cot::ACTIVATION_TERMINATION);
        asdu.set_negative(false);

        self.send_asdu(asdu)
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.connection.peer_ip()
    }

    pub fn app_layer_parameters(&self) -> asdu::AppLayerParameters {
        match self.connection.slave.upgrade() {
            Some(slave) => slave.al_parameters(),
            None => asdu::AppLayerParameters::default(),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("slot", &self.connection.slot)
            .field("active", &self.connection.is_active())
            .finish()
    }
}
