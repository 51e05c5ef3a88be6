use lib_common::core::RelayHandle;
use lib_common::retrieve::StreamProxy;

/// Shared by every request handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub proxy: StreamProxy,
    /// Capacity of each connection's outbound event queue.
    pub outbound_buffer: usize,
}

impl AppState {
    pub fn new(relay: RelayHandle, proxy: StreamProxy, outbound_buffer: usize) -> Self {
        Self {
            relay,
            proxy,
            outbound_buffer,
        }
    }
}
