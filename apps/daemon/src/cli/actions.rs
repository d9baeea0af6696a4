use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, metadata::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt};

use nan_core::time::SystemClock;
use nan_core::{Config, Engine};
use nan_wire::EtherAddr;

use crate::cli::arguments;
use crate::config::DaemonConfig;
use crate::dump::PcapDump;
use crate::link::packet::PacketSocket;
use crate::link::tap::TapDevice;
use crate::link::{DevLink, HostLink, LoggingNeighbors, NeighborObserver, WlanLink};
use crate::reactor::{Reactor, Verbosity};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_path(path.clone())?,
        None => DaemonConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let mut base_level: LevelFilter = config.logger.level.into();
    for _ in 0..args.verbose {
        base_level = louder(base_level);
    }
    let (filter, handle) = reload::Layer::new(base_level);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let verbosity = Verbosity::new(handle, base_level);

    let dump = match &config.dump {
        Some(path) => Some(PcapDump::open(path)?),
        None => None,
    };

    if args.dev {
        let (wlan, _wlan_peer) = DevLink::pair()?;
        let (host, _host_peer) = DevLink::pair()?;
        let address = random_local_address();
        info!(target: "nand", "dev mode (addr {})", address);
        run_with_links(&config, address, wlan, host, dump, verbosity).await
    } else {
        let wlan = PacketSocket::open(&config.wlan.interface)?;
        let address = PacketSocket::hardware_address(&config.wlan.interface)?;
        let host = TapDevice::open(&config.host.interface)?;
        info!(
            target: "nand",
            "wlan device: {} (addr {})", config.wlan.interface, address
        );
        info!(target: "nand", "host device: {}", host.name);
        run_with_links(&config, address, wlan, host, dump, verbosity).await
    }
}

async fn run_with_links<W: WlanLink, H: HostLink>(
    config: &DaemonConfig,
    address: EtherAddr,
    wlan: W,
    host: H,
    dump: Option<PcapDump>,
    verbosity: Verbosity,
) -> eyre::Result<()> {
    let hostname = hostname();
    let core_config: Config = config.core_config();

    let mut engine = Engine::new(
        &hostname,
        address,
        SystemClock::new(),
        fastrand::Rng::new(),
        core_config,
    );
    engine
        .state
        .peers
        .set_observer(Box::new(NeighborObserver::new(LoggingNeighbors)));

    // Service events are mirrored to an observer task; the reflex logic
    // itself lives inside the state machine.
    let (events_tx, events_rx) = flume::unbounded();
    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            info!(target: "nand::event", "{:?}", event);
        }
    });

    let mut reactor = Reactor::new(wlan, host, true, dump, Some(verbosity), Some(events_tx));

    let cancellation = CancellationToken::new();
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    select! {
        result = reactor.run(&mut engine, cancellation.clone()) => {
            result?;
        }
        _ = sigterm.recv() => {
            info!(target: "nand", "received SIGTERM, shutting down");
            cancellation.cancel();
        }
        _ = sigint.recv() => {
            info!(target: "nand", "received SIGINT, shutting down");
            cancellation.cancel();
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut DaemonConfig, args: &arguments::Run) {
    if let Some(interface) = &args.interface {
        config.wlan.interface = interface.clone();
    }
    if let Some(host_interface) = &args.host_interface {
        config.host.interface = host_interface.clone();
    }
    if let Some(channel) = args.channel {
        config.wlan.channel = channel;
    }
    if let Some(dump) = &args.dump {
        config.dump = Some(dump.clone());
    }
    if args.no_monitor {
        config.wlan.no_monitor = true;
    }
    if args.no_channel {
        config.wlan.no_channel = true;
    }
    if args.no_updown {
        config.wlan.no_updown = true;
    }
}

fn louder(level: LevelFilter) -> LevelFilter {
    match level {
        LevelFilter::OFF => LevelFilter::ERROR,
        LevelFilter::ERROR => LevelFilter::WARN,
        LevelFilter::WARN => LevelFilter::INFO,
        LevelFilter::INFO => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if rc != 0 {
        return "nan-device".to_owned();
    }
    let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

/// A random locally-administered unicast address for dev mode.
fn random_local_address() -> EtherAddr {
    let mut rng = fastrand::Rng::new();
    let mut octets = [0u8; 6];
    for octet in octets.iter_mut() {
        *octet = rng.u8(..);
    }
    octets[0] = (octets[0] | 0x02) & !0x01;
    EtherAddr(octets)
}
