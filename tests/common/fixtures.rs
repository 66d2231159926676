use std::sync::Arc;
use std::time::Duration;

use fc_recovery::sim::SimTransport;
use fc_recovery::{
    Adapter, ErpEngine, FabricTopology, FcAddress, Lun, Port, RecoveryConfig, Transport, Unit,
    Wwpn,
};

/// Well-known WWPN used for the simulated name-server port.
pub const NS_WWPN: Wwpn = Wwpn(0xfffffffffffffffc);

/// Base WWPN for ordinary remote ports; port i is BASE + 1 + i.
pub const BASE_WWPN: u64 = 0x5005_0763_0000_0000;

pub fn port_wwpn(i: usize) -> Wwpn {
    Wwpn(BASE_WWPN + 1 + i as u64)
}

pub fn port_did(i: usize) -> FcAddress {
    FcAddress(0x01_0000 + i as u32)
}

/// Short timeouts and delays so failure paths run in milliseconds.
pub fn fast_config() -> RecoveryConfig {
    RecoveryConfig {
        max_retries: 2,
        exchange_config_retries: 3,
        request_timeout: Duration::from_millis(200),
        failed_settle_delay: Duration::from_millis(1),
        low_memory_delay: Duration::from_millis(5),
        exchange_config_backoff_base: Duration::from_millis(1),
        exchange_config_backoff_max: Duration::from_millis(4),
    }
}

/// An engine wired to a simulated firmware, with one adapter.
pub struct TestRig {
    pub sim: Arc<SimTransport>,
    pub engine: ErpEngine,
    pub adapter: Arc<Adapter>,
}

impl TestRig {
    /// Switched-fabric rig: a name-server port plus `ports` ordinary ports
    /// of `units_per_port` units each, all registered with the name server.
    pub fn fabric(ports: usize, units_per_port: usize) -> Self {
        let sim = Arc::new(SimTransport::fabric());
        let engine = ErpEngine::new(Arc::clone(&sim) as Arc<dyn Transport>, fast_config());
        let adapter = engine.attach_adapter("fc-test");
        // Seed what exchange-config would have reported, so port-level
        // recovery works without a prior adapter recovery.
        adapter.set_fabric_topology(FabricTopology::Fabric);
        engine.add_port(&adapter, NS_WWPN, true);

        for i in 0..ports {
            let port = engine.add_port(&adapter, port_wwpn(i), false);
            sim.register_fabric_port(port_wwpn(i), port_did(i));
            for lun in 0..units_per_port {
                engine.add_unit(&port, Lun(lun as u64));
            }
        }

        Self {
            sim,
            engine,
            adapter,
        }
    }

    /// Point-to-point rig: one port (the peer) with `units` units, no name
    /// server.
    pub fn point_to_point(units: usize) -> Self {
        let sim = Arc::new(SimTransport::point_to_point(port_wwpn(0), port_did(0)));
        let engine = ErpEngine::new(Arc::clone(&sim) as Arc<dyn Transport>, fast_config());
        let adapter = engine.attach_adapter("fc-test");
        adapter.set_fabric_topology(FabricTopology::PointToPoint {
            peer_wwpn: port_wwpn(0),
            peer_did: port_did(0),
        });
        let port = engine.add_port(&adapter, port_wwpn(0), false);
        for lun in 0..units {
            engine.add_unit(&port, Lun(lun as u64));
        }

        Self {
            sim,
            engine,
            adapter,
        }
    }

    pub fn port(&self, i: usize) -> Arc<Port> {
        self.adapter
            .find_port(port_wwpn(i))
            .expect("test port not configured")
    }

    pub fn unit(&self, port: usize, lun: u64) -> Arc<Unit> {
        self.port(port)
            .find_unit(Lun(lun))
            .expect("test unit not configured")
    }

    /// Wait for recovery to quiesce; panics if it does not within 10s.
    pub fn settle(&self) {
        assert!(
            self.engine
                .wait_for_quiescence_timeout(&self.adapter, Duration::from_secs(10)),
            "recovery did not quiesce"
        );
    }
}
