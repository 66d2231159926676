use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fc_recovery::sim::{SimFault, SimTransport};
use fc_recovery::{
    ErpEngine, FcAddress, HwRequestKind, RecoveryConfig, Status, TargetRef, Wwpn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fcrec")]
#[command(about = "Fibre-Channel adapter recovery engine - scenario simulator")]
#[command(version = "1.0.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fault-injected recovery scenario against the simulated firmware
    Simulate {
        /// Number of remote ports
        #[arg(long, default_value_t = 2)]
        ports: usize,

        /// Logical units per port
        #[arg(long, default_value_t = 2)]
        units: usize,

        /// Fabric topology (fabric, p2p)
        #[arg(long, default_value = "fabric")]
        topology: String,

        /// Peer WWPN for p2p (hex or colon form, e.g. 50:05:07:63:00:00:00:01)
        #[arg(long)]
        peer_wwpn: Option<String>,

        /// Inject N port-open failures
        #[arg(long, default_value_t = 0)]
        fail_port_opens: u32,

        /// Inject N unit-open failures
        #[arg(long, default_value_t = 0)]
        fail_unit_opens: u32,

        /// Inject N port-open timeouts
        #[arg(long, default_value_t = 0)]
        timeout_port_opens: u32,

        /// Firmware reports "host connection initializing" N times
        #[arg(long, default_value_t = 0)]
        host_init: u32,

        /// Firmware without exchange-port-data support
        #[arg(long)]
        no_port_data: bool,

        /// Leave ports unregistered with the name server (lookup fails)
        #[arg(long)]
        unregistered: bool,

        /// Simulated completion latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,

        /// Recovery configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the last N trace records
        #[arg(long, default_value_t = 64)]
        trace: usize,
    },

    /// Print the effective recovery configuration as JSON
    Config {
        /// Recovery configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            ports,
            units,
            topology,
            peer_wwpn,
            fail_port_opens,
            fail_unit_opens,
            timeout_port_opens,
            host_init,
            no_port_data,
            unregistered,
            latency_ms,
            config,
            trace,
        } => simulate(SimulateArgs {
            ports,
            units,
            topology,
            peer_wwpn,
            fail_port_opens,
            fail_unit_opens,
            timeout_port_opens,
            host_init,
            no_port_data,
            unregistered,
            latency_ms,
            config,
            trace,
        }),
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

struct SimulateArgs {
    ports: usize,
    units: usize,
    topology: String,
    peer_wwpn: Option<String>,
    fail_port_opens: u32,
    fail_unit_opens: u32,
    timeout_port_opens: u32,
    host_init: u32,
    no_port_data: bool,
    unregistered: bool,
    latency_ms: u64,
    config: Option<PathBuf>,
    trace: usize,
}

fn load_config(path: Option<&std::path::Path>) -> Result<RecoveryConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(RecoveryConfig::default()),
    }
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    // First remote WWPN; further ports count up from here.
    let base_wwpn = 0x5005_0763_0000_0000u64;
    let peer = match &args.peer_wwpn {
        Some(raw) => raw.parse::<Wwpn>()?,
        None => Wwpn(base_wwpn + 1),
    };

    let sim = match args.topology.as_str() {
        "fabric" => SimTransport::fabric(),
        "p2p" => SimTransport::point_to_point(peer, FcAddress(0x0000ef)),
        other => anyhow::bail!("unknown topology {:?}, expected fabric or p2p", other),
    };

    sim.inject(SimFault::Fail, HwRequestKind::OpenPort, args.fail_port_opens);
    sim.inject(SimFault::Fail, HwRequestKind::OpenUnit, args.fail_unit_opens);
    sim.inject(
        SimFault::Timeout,
        HwRequestKind::OpenPort,
        args.timeout_port_opens,
    );
    sim.host_connection_initializing(args.host_init);
    if args.no_port_data {
        sim.without_port_data();
    }

    let sim = if args.latency_ms > 0 {
        sim.with_latency(Duration::from_millis(args.latency_ms), 0.3)
    } else {
        sim
    };

    let transport = Arc::new(sim);
    let engine = ErpEngine::new(Arc::clone(&transport) as Arc<dyn fc_recovery::Transport>, config);
    let adapter = engine.attach_adapter("fc0");

    if args.topology == "fabric" {
        engine.add_port(&adapter, Wwpn(0xfffffffffffffffc), true);
    }
    for i in 0..args.ports {
        // In p2p the first configured port is the wire peer.
        let wwpn = if args.topology == "p2p" && i == 0 {
            peer
        } else {
            Wwpn(base_wwpn + 1 + i as u64)
        };
        let port = engine.add_port(&adapter, wwpn, false);
        if !args.unregistered {
            transport.register_fabric_port(wwpn, FcAddress(0x010000 + i as u32));
        }
        for lun in 0..args.units {
            engine.add_unit(&port, fc_recovery::Lun(lun as u64));
        }
    }

    println!(
        "{} adapter fc0, {} port(s), {} unit(s)/port, topology {}",
        "simulating:".bold(),
        args.ports,
        args.units,
        args.topology
    );

    engine.request_reopen(
        &TargetRef::Adapter(Arc::clone(&adapter)),
        Status::empty(),
        "simulated link-up",
    )?;

    let quiesced = engine.wait_for_quiescence_timeout(&adapter, Duration::from_secs(60));
    if !quiesced {
        println!("{}", "recovery did not quiesce within 60s".red().bold());
    }

    println!();
    println!("{}", "trace:".bold());
    for record in engine.trace().recent(args.trace) {
        println!("  {}", record);
    }

    println!();
    println!("{}", "final state:".bold());
    print_target(&format!("adapter {}", adapter.name()), adapter.status().load());
    for port in adapter.ports() {
        let label = if port.is_nameserver() {
            format!("port {} (name server)", port.wwpn())
        } else {
            format!("port {}", port.wwpn())
        };
        print_target(&label, port.status().load());
        for unit in port.units() {
            print_target(&format!("  unit {}", unit.lun()), unit.status().load());
        }
    }

    let (downs, ups) = transport.queue_cycles();
    println!();
    println!(
        "queue cycles: {} down / {} up, status-buffer refills: {}",
        downs,
        ups,
        transport.buffer_refills()
    );

    engine.detach_adapter(&adapter).ok();
    Ok(())
}

fn print_target(label: &str, status: Status) {
    let state = if status.contains(Status::ERP_FAILED) {
        "FAILED".red().bold()
    } else if status.contains(Status::OPEN) || status.contains(Status::QUEUES_UP) {
        "open".green()
    } else {
        "closed".yellow()
    };
    let blocked = if status.contains(Status::UNBLOCKED) {
        "unblocked".green()
    } else {
        "blocked".yellow()
    };
    println!("  {:<44} {} / {}", label, state, blocked);
}
