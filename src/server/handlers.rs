use std::net::IpAddr;
use std::sync::Arc;

use crate::asdu::{Asdu, Cp56Time2a};

use super::connection::ConnectionHandle;

/// Connection lifecycle notifications delivered to the connection event
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginResult {
    Handled,
    NotHandled,
}

/// An ASDU processing extension. Plugins see every received ASDU before
/// the built-in dispatch; returning [`PluginResult::Handled`] consumes
/// it. `run_periodic` is driven from the threadless tick.
pub trait SlavePlugin: Send + Sync {
    fn handle_asdu(&self, connection: &ConnectionHandle, asdu: &mut Asdu) -> PluginResult;

    fn run_periodic(&self, _connection: &ConnectionHandle) {}
}

/// Gate for incoming connections, called with the peer IP before any
/// resources are bound. Returning false refuses the connection.
pub type ConnectionRequestHandler = dyn Fn(IpAddr) -> bool + Send + Sync;

pub type ConnectionEventHandler = dyn Fn(&ConnectionHandle, ConnectionEvent) + Send + Sync;

/// Interrogation command (type 100); the third argument is the QOI.
pub type InterrogationHandler = dyn Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync;

/// Counter interrogation command (type 101); the third argument is the QCC.
pub type CounterInterrogationHandler =
    dyn Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync;

/// Read command (type 102); the third argument is the object address.
pub type ReadHandler = dyn Fn(&ConnectionHandle, &mut Asdu, u32) -> bool + Send + Sync;

/// Clock synchronization command (type 103).
pub type ClockSyncHandler =
    dyn Fn(&ConnectionHandle, &mut Asdu, &Cp56Time2a) -> bool + Send + Sync;

/// Reset process command (type 105); the third argument is the QRP.
pub type ResetProcessHandler = dyn Fn(&ConnectionHandle, &mut Asdu, u8) -> bool + Send + Sync;

/// Delay acquisition command (type 106); the third argument is the delay
/// in milliseconds.
pub type DelayAcquisitionHandler = dyn Fn(&ConnectionHandle, &mut Asdu, u16) -> bool + Send + Sync;

/// Fallback for ASDUs no specific handler accepted.
pub type AsduHandler = dyn Fn(&ConnectionHandle, &mut Asdu) -> bool + Send + Sync;

/// Audit tap on raw APDUs. The flag is true for transmitted frames,
/// false for received ones. Must not send ASDUs back into the
/// connection it observes.
pub type RawMessageHandler = dyn Fn(&ConnectionHandle, &[u8], bool) + Send + Sync;

#[derive(Default)]
pub(crate) struct Handlers {
    pub connection_request: Option<Arc<ConnectionRequestHandler>>,
    pub connection_event: Option<Arc<ConnectionEventHandler>>,
    pub interrogation: Option<Arc<InterrogationHandler>>,
    pub counter_interrogation: Option<Arc<CounterInterrogationHandler>>,
    pub read: Option<Arc<ReadHandler>>,
    pub clock_sync: Option<Arc<ClockSyncHandler>>,
    pub reset_process: Option<Arc<ResetProcessHandler>>,
    pub delay_acquisition: Option<Arc<DelayAcquisitionHandler>>,
    pub asdu: Option<Arc<AsduHandler>>,
    pub raw_message: Option<Arc<RawMessageHandler>>,
}
