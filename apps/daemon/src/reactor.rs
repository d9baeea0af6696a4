//! Poll-based reactor: a single thread multiplexing the radio, the host
//! TAP, stdin and the protocol timers, driving the [`Engine`].

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{debug, error, info, trace};
use tracing_subscriber::{reload, Registry};

use nan_core::event::ServiceEvent;
use nan_core::time::Clock;
use nan_core::{Engine, Io, TimerKind};
use nan_wire::BUF_MAX_LENGTH;

use crate::dump::PcapDump;
use crate::link::{HostLink, WlanLink, HOST_MTU};

/// Maximum wait when no timer is armed.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Wlan,
    Host,
    Stdin,
}

/// Deadline table keyed by timer kind; arming a kind again replaces its
/// deadline, which is the protocol's only cancellation idiom.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, u64>,
}

impl Timers {
    pub fn arm(&mut self, kind: TimerKind, at_usec: u64) {
        self.deadlines.insert(kind, at_usec);
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().copied().min()
    }

    /// Pop every timer due at `now`, earliest deadline first.
    pub fn expired(&mut self, now_usec: u64) -> Vec<TimerKind> {
        let mut due: Vec<(TimerKind, u64)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now_usec)
            .map(|(kind, at)| (*kind, *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        for (kind, _) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(kind, _)| kind).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }
}

/// Runtime-adjustable log verbosity (`v+` / `v-`).
pub struct Verbosity {
    handle: reload::Handle<LevelFilter, Registry>,
    index: usize,
}

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

impl Verbosity {
    pub fn new(handle: reload::Handle<LevelFilter, Registry>, initial: LevelFilter) -> Self {
        let index = LEVELS.iter().position(|l| *l == initial).unwrap_or(2);
        Self { handle, index }
    }

    pub fn adjust(&mut self, delta: i8) {
        let index = (self.index as i64 + delta as i64).clamp(0, LEVELS.len() as i64 - 1) as usize;
        if index == self.index {
            return;
        }
        self.index = index;
        let level = LEVELS[index];
        if self.handle.modify(|filter| *filter = level).is_ok() {
            info!(target: "nand", "log level set to {}", level);
        }
    }
}

pub struct Reactor<W, H> {
    sources: popol::Sources<Source>,
    events: Vec<Event<Source>>,
    timers: Timers,
    wlan: W,
    host: H,
    stdin_buffer: Vec<u8>,
    dump: Option<PcapDump>,
    verbosity: Option<Verbosity>,
    service_events: Option<flume::Sender<ServiceEvent>>,
}

impl<W: WlanLink, H: HostLink> Reactor<W, H> {
    pub fn new(
        wlan: W,
        host: H,
        attach_stdin: bool,
        dump: Option<PcapDump>,
        verbosity: Option<Verbosity>,
        service_events: Option<flume::Sender<ServiceEvent>>,
    ) -> Self {
        let mut sources = popol::Sources::new();
        sources.register(Source::Wlan, &wlan, popol::interest::READ);
        sources.register(Source::Host, &host, popol::interest::READ);
        if attach_stdin {
            sources.register(Source::Stdin, &std::io::stdin(), popol::interest::READ);
        }

        Self {
            sources,
            events: Vec::with_capacity(32),
            timers: Timers::default(),
            wlan,
            host,
            stdin_buffer: Vec::new(),
            dump,
            verbosity,
            service_events,
        }
    }

    /// Run the engine until cancelled.
    pub async fn run<C: Clock>(
        &mut self,
        engine: &mut Engine<C>,
        cancellation: CancellationToken,
    ) -> io::Result<()> {
        engine.initialize();
        self.process(engine);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "nand", "reactor cancelled");
                    break Ok(());
                }
                result = async { self.step(engine) } => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        }
    }

    fn step<C: Clock>(&mut self, engine: &mut Engine<C>) -> io::Result<()> {
        let now = engine.clock().now_usec();
        let timeout = match self.timers.next_deadline() {
            Some(at) => Duration::from_micros(at.saturating_sub(now)),
            None => WAIT_TIMEOUT,
        };

        trace!(
            target: "nand",
            "polling {} source(s) and {} timer(s), waking up in {:?}",
            self.sources.len(), self.timers.len(), timeout
        );

        match self.sources.wait_timeout(&mut self.events, timeout) {
            Ok(_) => {
                let ready: Vec<Source> = self
                    .events
                    .drain(..)
                    .filter(|event| event.is_readable())
                    .map(|event| event.key)
                    .collect();
                for source in ready {
                    match source {
                        Source::Wlan => self.read_wlan(engine),
                        Source::Host => self.read_host(engine),
                        Source::Stdin => self.read_stdin(engine),
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err),
        }

        let now = engine.clock().now_usec();
        for kind in self.timers.expired(now) {
            engine.timer_expired(kind);
        }
        self.process(engine);

        Ok(())
    }

    fn read_wlan<C: Clock>(&mut self, engine: &mut Engine<C>) {
        let mut buffer = [0u8; BUF_MAX_LENGTH];
        loop {
            match self.wlan.receive_frame(&mut buffer) {
                Ok(0) => break,
                Ok(length) => engine.frame_received(&buffer[..length]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(target: "nand", "wlan read error: {}", err);
                    break;
                }
            }
        }
    }

    fn read_host<C: Clock>(&mut self, engine: &mut Engine<C>) {
        let mut buffer = [0u8; HOST_MTU + 64];
        match self.host.receive_frame(&mut buffer) {
            Ok(length) if length > 0 => engine.host_frame_received(&buffer[..length]),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!(target: "nand", "could not read from host: {}", err),
        }
    }

    fn read_stdin<C: Clock>(&mut self, engine: &mut Engine<C>) {
        let mut buffer = [0u8; 4096];
        let read = unsafe {
            libc::read(
                0,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if read == 0 {
            // Stdin closed; stop polling it.
            self.sources.unregister(&Source::Stdin);
            return;
        }
        if read < 0 {
            return;
        }
        self.stdin_buffer.extend_from_slice(&buffer[..read as usize]);

        while let Some(newline) = self.stdin_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.stdin_buffer.drain(..=newline).collect();
            if let Ok(line) = std::str::from_utf8(&line) {
                engine.command_line(line.trim_end());
            }
        }
    }

    /// Apply the engine's pending outputs.
    fn process<C: Clock>(&mut self, engine: &mut Engine<C>) {
        let now = engine.clock().now_usec();
        let outputs: Vec<Io> = engine.outputs().collect();

        for output in outputs {
            match output {
                Io::Wlan(frame) => {
                    if let Err(err) = self.wlan.send_frame(&frame) {
                        error!(target: "nand", "could not send frame: {}", err);
                    }
                }
                Io::Host(frame) => {
                    if let Err(err) = self.host.send_frame(&frame) {
                        error!(target: "nand", "could not write to host: {}", err);
                    }
                }
                Io::SetTimer(kind, in_usec) => {
                    self.timers.arm(kind, now + in_usec);
                }
                Io::Event(event) => {
                    debug!(target: "nand", "event: {:?}", event);
                    if let Some(sender) = &self.service_events {
                        sender.send(event).ok();
                    }
                }
                Io::DumpFrame(frame) => {
                    if let Some(dump) = &mut self.dump {
                        if let Err(err) = dump.write_frame(&frame) {
                            error!(target: "nand", "could not dump frame: {}", err);
                        }
                    }
                }
                Io::AdjustVerbosity(delta) => {
                    if let Some(verbosity) = &mut self.verbosity {
                        verbosity.adjust(delta);
                    }
                }
            }
        }
    }
}
