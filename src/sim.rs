//! Simulated firmware transport for exercising the recovery engine.
//!
//! Completes hardware requests deterministically without real hardware,
//! with scriptable fault injection:
//!
//! - `Fail` - the request completes, the firmware reports failure
//! - `NoMemory` - the request cannot be issued (resource exhaustion)
//! - `Reject` - the request cannot be issued (validation error)
//! - `Timeout` - the request is issued and never completes
//!
//! Used by the `fcrec` CLI scenario runner and by the integration tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::topology::{Adapter, FabricTopology, FcAddress, Wwpn};
use crate::transport::{Completion, HwRequest, HwRequestKind, Transport, TransportError};

/// Injectable fault classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    /// Complete with a firmware-reported failure.
    Fail,
    /// Fail synchronously with resource exhaustion.
    NoMemory,
    /// Fail synchronously with a validation error.
    Reject,
    /// Issue the request and never complete it.
    Timeout,
}

#[derive(Default)]
struct SimState {
    /// Remaining fault budget per (fault, request kind).
    faults: HashMap<(SimFault, HwRequestKind), u32>,
    /// Completions answered with "host connection initializing" before
    /// exchange-config starts succeeding.
    host_init_remaining: u32,
    /// Firmware does not implement exchange-port-data.
    xport_unsupported: bool,
    /// Name-server registrations: WWPN to fabric address.
    fabric: HashMap<Wwpn, FcAddress>,
    /// Every request issued, in order.
    calls: Vec<HwRequestKind>,
    queue_ups: u32,
    queue_downs: u32,
    buffer_refills: u32,
}

/// Deterministic in-process firmware simulator.
pub struct SimTransport {
    topology: FabricTopology,
    /// Artificial completion latency; completions are delivered from a
    /// detached thread when set.
    latency: Option<Duration>,
    jitter: f64,
    state: Mutex<SimState>,
}

impl SimTransport {
    /// A switched-fabric firmware with no faults scripted.
    pub fn fabric() -> Self {
        Self::with_topology(FabricTopology::Fabric)
    }

    /// A point-to-point firmware reporting the given peer.
    pub fn point_to_point(peer_wwpn: Wwpn, peer_did: FcAddress) -> Self {
        Self::with_topology(FabricTopology::PointToPoint {
            peer_wwpn,
            peer_did,
        })
    }

    pub fn with_topology(topology: FabricTopology) -> Self {
        Self {
            topology,
            latency: None,
            jitter: 0.0,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Deliver completions from a background thread after roughly `latency`
    /// (uniformly jittered by `jitter`, 0.0 - 1.0).
    pub fn with_latency(mut self, latency: Duration, jitter: f64) -> Self {
        self.latency = Some(latency);
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Script `count` occurrences of `fault` for `kind` requests.
    pub fn inject(&self, fault: SimFault, kind: HwRequestKind, count: u32) {
        let mut state = self.state.lock().unwrap();
        *state.faults.entry((fault, kind)).or_insert(0) += count;
    }

    /// Script the firmware to report "host connection initializing" for the
    /// next `count` exchange-config requests.
    pub fn host_connection_initializing(&self, count: u32) {
        self.state.lock().unwrap().host_init_remaining = count;
    }

    /// Script a firmware without exchange-port-data support.
    pub fn without_port_data(&self) {
        self.state.lock().unwrap().xport_unsupported = true;
    }

    /// Register a WWPN with the simulated fabric name server.
    pub fn register_fabric_port(&self, wwpn: Wwpn, did: FcAddress) {
        self.state.lock().unwrap().fabric.insert(wwpn, did);
    }

    /// Number of requests issued for one kind.
    pub fn count(&self, kind: HwRequestKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    /// Every request issued so far, in order.
    pub fn calls(&self) -> Vec<HwRequestKind> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn queue_cycles(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.queue_downs, state.queue_ups)
    }

    pub fn buffer_refills(&self) -> u32 {
        self.state.lock().unwrap().buffer_refills
    }

    fn consume_fault(&self, fault: SimFault, kind: HwRequestKind) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.faults.get_mut(&(fault, kind)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Common handling for every asynchronous request kind.
    fn handle<F>(&self, req: HwRequest, on_success: F) -> Result<(), TransportError>
    where
        F: FnOnce(&HwRequest) -> Completion,
    {
        let kind = req.kind();
        self.state.lock().unwrap().calls.push(kind);

        if self.consume_fault(SimFault::NoMemory, kind) {
            return Err(TransportError::NoMemory);
        }
        if self.consume_fault(SimFault::Reject, kind) {
            return Err(TransportError::Rejected(format!(
                "simulated rejection of {}",
                kind
            )));
        }
        if self.consume_fault(SimFault::Timeout, kind) {
            // Issued but never completed; the engine's deadline fires.
            drop(req);
            return Ok(());
        }

        let completion = if self.consume_fault(SimFault::Fail, kind) {
            Completion::Failure
        } else {
            on_success(&req)
        };

        match self.latency {
            None => req.complete(completion),
            Some(latency) => {
                let jittered = jittered(latency, self.jitter);
                thread::spawn(move || {
                    thread::sleep(jittered);
                    req.complete(completion);
                });
            }
        }
        Ok(())
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter == 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter * (rand::random::<f64>() - 0.5) * 2.0;
    Duration::from_secs_f64((base.as_secs_f64() + spread).max(0.0))
}

impl Transport for SimTransport {
    fn open_unit(&self, req: HwRequest) -> Result<(), TransportError> {
        self.handle(req, |_| Completion::Success)
    }

    fn close_unit(&self, req: HwRequest) -> Result<(), TransportError> {
        self.handle(req, |_| Completion::Success)
    }

    fn open_port(&self, req: HwRequest) -> Result<(), TransportError> {
        self.handle(req, |_| Completion::Success)
    }

    fn close_port(&self, req: HwRequest) -> Result<(), TransportError> {
        self.handle(req, |_| Completion::Success)
    }

    fn close_physical_port(&self, req: HwRequest) -> Result<(), TransportError> {
        self.handle(req, |_| Completion::Success)
    }

    fn exchange_config_data(&self, req: HwRequest) -> Result<(), TransportError> {
        let topology = self.topology;
        let still_initializing = {
            let mut state = self.state.lock().unwrap();
            if state.host_init_remaining > 0 {
                state.host_init_remaining -= 1;
                true
            } else {
                false
            }
        };
        self.handle(req, move |_| {
            if still_initializing {
                Completion::HostConnectionInitializing
            } else {
                Completion::ConfigOk(topology)
            }
        })
    }

    fn exchange_port_data(&self, req: HwRequest) -> Result<(), TransportError> {
        let unsupported = self.state.lock().unwrap().xport_unsupported;
        self.handle(req, move |_| {
            if unsupported {
                Completion::Unsupported
            } else {
                Completion::Success
            }
        })
    }

    fn name_server_lookup(&self, req: HwRequest) -> Result<(), TransportError> {
        let resolved = req
            .port()
            .and_then(|p| self.state.lock().unwrap().fabric.get(&p.wwpn()).copied());
        self.handle(req, move |_| match resolved {
            Some(did) => Completion::Resolved(did),
            None => Completion::WwpnUnknown,
        })
    }

    fn bring_queues_up(&self, _adapter: &Adapter) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.queue_ups += 1;
        Ok(())
    }

    fn tear_queues_down(&self, _adapter: &Adapter) {
        let mut state = self.state.lock().unwrap();
        state.queue_downs += 1;
    }

    fn refill_status_buffers(&self, _adapter: &Adapter) {
        let mut state = self.state.lock().unwrap();
        state.buffer_refills += 1;
    }
}
