//! Transport seam: a best-effort datagram bus.
//!
//! The consensus core only needs `send_data` / `send_signal` plus a stream of
//! parsed incoming messages; everything else (sockets, discovery, QoS) lives
//! outside. `MemoryBus` is the in-process implementation used by tests and
//! the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::state::DroneId;
use crate::sync::message::{decode_message, SolverStateMsg, SyncSignal};

/// Best-effort send failure; the round continues when this happens.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    Send(String),
}

/// A fully parsed incoming message.
#[derive(Debug, Clone)]
pub enum Incoming {
    Signal {
        from: DroneId,
        signal: SyncSignal,
        token: u64,
    },
    Data(SolverStateMsg),
}

/// Outbound half of the bus, held by the coordinator.
pub trait Transport: Send + Sync {
    /// Broadcast an encoded data payload, best effort.
    fn send_data(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Broadcast a negotiation signal, best effort.
    fn send_signal(&self, signal: SyncSignal, token: u64) -> Result<(), TransportError>;
}

struct BusInner {
    peers: Mutex<HashMap<DroneId, Sender<Incoming>>>,
}

/// In-process broadcast bus connecting every agent of a simulation.
///
/// Delivery is reliable and ordered per sender here; the protocol itself only
/// assumes best-effort, so tests inject loss by simply not delivering.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join the bus as `id`; returns the outbound endpoint and the inbound
    /// stream of parsed messages from every other participant.
    pub fn join(&self, id: DroneId) -> (BusEndpoint, Receiver<Incoming>) {
        let (tx, rx) = unbounded();
        self.inner.peers.lock().insert(id, tx);
        (
            BusEndpoint {
                inner: Arc::clone(&self.inner),
                id,
            },
            rx,
        )
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One agent's handle onto a `MemoryBus`.
pub struct BusEndpoint {
    inner: Arc<BusInner>,
    id: DroneId,
}

impl BusEndpoint {
    fn broadcast(&self, msg: Incoming) {
        let peers = self.inner.peers.lock();
        for (peer, tx) in peers.iter() {
            if *peer == self.id {
                continue;
            }
            // A disconnected peer is indistinguishable from a dropped
            // datagram on a real bus.
            let _ = tx.send(msg.clone());
        }
    }
}

impl Transport for BusEndpoint {
    fn send_data(&self, payload: &[u8]) -> Result<(), TransportError> {
        // The receiving side of the transport delivers parsed messages, so
        // the bus decodes once on behalf of every receiver.
        let msg = decode_message(payload).map_err(|e| TransportError::Send(e.to_string()))?;
        self.broadcast(Incoming::Data(msg));
        Ok(())
    }

    fn send_signal(&self, signal: SyncSignal, token: u64) -> Result<(), TransportError> {
        self.broadcast(Incoming::Signal {
            from: self.id,
            signal,
            token,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::message::encode_message;

    #[test]
    fn signals_reach_every_other_peer() {
        let bus = MemoryBus::new();
        let (a, _rx_a) = bus.join(1);
        let (_b, rx_b) = bus.join(2);
        let (_c, rx_c) = bus.join(3);

        a.send_signal(SyncSignal::Ready, 5).unwrap();
        for rx in [&rx_b, &rx_c] {
            match rx.try_recv().unwrap() {
                Incoming::Signal {
                    from,
                    signal,
                    token,
                } => {
                    assert_eq!(from, 1);
                    assert_eq!(signal, SyncSignal::Ready);
                    assert_eq!(token, 5);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[test]
    fn data_is_delivered_parsed_and_not_echoed() {
        let bus = MemoryBus::new();
        let (a, rx_a) = bus.join(1);
        let (_b, rx_b) = bus.join(2);

        let msg = SolverStateMsg::new(1, 3, 0, 0.0);
        a.send_data(&encode_message(&msg).unwrap()).unwrap();

        assert!(rx_a.try_recv().is_err(), "sender must not hear itself");
        match rx_b.try_recv().unwrap() {
            Incoming::Data(m) => assert_eq!(m.solver_token, 3),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
