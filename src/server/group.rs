use std::net::IpAddr;
use std::sync::Arc;

use crate::queue::{HighPrioQueue, MessageQueue};

/// A redundancy group: a set of master addresses sharing one queue pair,
/// of which at most one connection is active at a time.
///
/// A group without an allow-list is the catch-all; peers matching no
/// named group land there. With neither a match nor a catch-all the
/// connection is refused.
#[derive(Debug, Clone, Default)]
pub struct RedundancyGroup {
    name: Option<String>,
    allowed_clients: Option<Vec<IpAddr>>,
}

impl RedundancyGroup {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_owned),
            allowed_clients: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Restricts the group to `address`. The first call turns the group
    /// from a catch-all into an allow-listed one.
    pub fn add_allowed_client(&mut self, address: IpAddr) {
        self.allowed_clients
            .get_or_insert_with(Vec::new)
            .push(address);
    }

    pub(crate) fn matches(&self, address: &IpAddr) -> bool {
        match &self.allowed_clients {
            Some(clients) => clients.contains(address),
            None => false,
        }
    }

    pub(crate) fn is_catch_all(&self) -> bool {
        self.allowed_clients.is_none()
    }
}

/// A group bound to its live queue pair. Built when the server starts.
pub(crate) struct GroupRuntime {
    pub group: RedundancyGroup,
    pub low_queue: Arc<MessageQueue>,
    pub high_queue: Arc<HighPrioQueue>,
}

/// First group allowing `address` wins; otherwise the catch-all, if any.
pub(crate) fn matching_group(groups: &[Arc<GroupRuntime>], address: &IpAddr) -> Option<usize> {
    let mut catch_all = None;

    for (index, runtime) in groups.iter().enumerate() {
        if runtime.group.matches(address) {
            return Some(index);
        }

        if catch_all.is_none() && runtime.group.is_catch_all() {
            catch_all = Some(index);
        }
    }

    catch_all
}
