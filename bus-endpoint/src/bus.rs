//! Interfaces between an endpoint and the bus that owns it.

use {
    crate::{endpoint::RemoteEndpoint, features::Guid128, message::Message},
    std::sync::atomic::{AtomicU32, Ordering},
};

/// The bus side of an endpoint: receives inbound traffic and supplies the
/// identity used during the handshake.
pub trait BusDispatcher: Send + Sync {
    /// Deliver one inbound application message. Link-control traffic never
    /// reaches this method. Called from the endpoint's rx pump thread, in
    /// stream order.
    fn dispatch(&self, endpoint: &RemoteEndpoint, msg: Message);

    /// GUID of the local bus instance.
    fn guid(&self) -> Guid128;

    /// The local bus's own unique name, reported to peers.
    fn bus_name(&self) -> String;

    /// A fresh unique name for a newly authenticated incoming peer.
    fn assign_unique_name(&self) -> String;
}

/// Notified when an endpoint has fully stopped.
pub trait EndpointListener: Send + Sync {
    /// Called exactly once, from the last pump thread to exit, after the
    /// endpoint's state reads `Stopped`.
    fn endpoint_exit(&self, endpoint: &RemoteEndpoint);
}

/// Hands out unique names of the form `:<guid-prefix>.<n>`.
///
/// Sequence `1` is the bus itself; peers start at `2`.
#[derive(Debug)]
pub struct UniqueNameAllocator {
    prefix: String,
    next: AtomicU32,
}

impl UniqueNameAllocator {
    /// Create an allocator for the bus identified by `guid`.
    pub fn new(guid: &Guid128) -> Self {
        Self {
            prefix: guid.short_string(),
            next: AtomicU32::new(2),
        }
    }

    /// Name of the bus itself.
    pub fn bus_name(&self) -> String {
        format!(":{}.1", self.prefix)
    }

    /// Allocate the next peer name.
    pub fn allocate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!(":{}.{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn test_allocated_names_are_unique() {
        let guid = Guid128([0x12; 16]);
        let names = UniqueNameAllocator::new(&guid);
        assert_eq!(names.bus_name(), ":12121212.1");
        let allocated: HashSet<_> = (0..100).map(|_| names.allocate()).collect();
        assert_eq!(allocated.len(), 100);
        assert!(allocated.contains(":12121212.2"));
        assert!(!allocated.contains(&names.bus_name()));
    }
}
