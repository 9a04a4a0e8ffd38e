//! In-process transports for the emulator's cross-bus contract
//!
//! The core crate defines [`EmulatorTransport`] and the typed
//! [`EventEnvelope`] wire form; this crate provides concrete
//! implementations. [`LoopbackTransport`] connects any number of parties
//! through an in-memory hub, which is enough to exercise the full
//! serialization path end-to-end and to bridge two Bus instances inside one
//! test process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use blemu_core::transport::{EmulatorTransport, TransportError};
use blemu_core::DeviceId;

pub use blemu_core::transport::{EventEnvelope, RoutedEvent};

type Frame = (DeviceId, Vec<u8>);

// ----------------------------------------------------------------------------
// Loopback hub
// ----------------------------------------------------------------------------

/// Shared routing table of a loopback network
#[derive(Default)]
struct HubState {
    routes: HashMap<DeviceId, mpsc::UnboundedSender<Frame>>,
}

/// An in-memory network connecting [`LoopbackTransport`] endpoints
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<std::sync::Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub under the given identity
    pub fn endpoint(&self, id: DeviceId) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .expect("hub lock")
            .routes
            .insert(id, tx);
        LoopbackTransport {
            id,
            hub: self.clone(),
            inbox: Mutex::new(rx),
        }
    }

    fn route(&self, source: DeviceId, target: DeviceId, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.lock().expect("hub lock");
        let sender = state
            .routes
            .get(&target)
            .ok_or(TransportError::PeerUnreachable { peer: target })?;
        sender
            .send((source, frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Drop an endpoint's route, closing its inbox
    pub fn disconnect(&self, id: DeviceId) {
        self.state.lock().expect("hub lock").routes.remove(&id);
    }
}

// ----------------------------------------------------------------------------
// Loopback transport
// ----------------------------------------------------------------------------

/// One endpoint of a [`LoopbackHub`]
pub struct LoopbackTransport {
    id: DeviceId,
    hub: LoopbackHub,
    inbox: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl LoopbackTransport {
    /// A connected pair of endpoints on a private hub
    pub fn pair(a: DeviceId, b: DeviceId) -> (Self, Self) {
        let hub = LoopbackHub::new();
        (hub.endpoint(a), hub.endpoint(b))
    }

    pub fn local_id(&self) -> DeviceId {
        self.id
    }
}

#[async_trait]
impl EmulatorTransport for LoopbackTransport {
    async fn send(&self, target: DeviceId, frame: Vec<u8>) -> Result<(), TransportError> {
        debug!(source = %self.id, %target, bytes = frame.len(), "loopback send");
        self.hub.route(self.id, target, frame)
    }

    async fn recv(&self) -> Option<Frame> {
        self.inbox.lock().await.recv().await
    }
}
