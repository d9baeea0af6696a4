use std::path::PathBuf;

use clap::{ArgAction, Args};

#[derive(Args)]
pub struct Run {
    /// Path to the TOML configuration file.
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// The wireless interface to use for frame capturing and injection.
    /// Must support monitor mode.
    #[clap(value_name = "INTERFACE")]
    pub interface: Option<String>,

    /// Change the virtual host interface name.
    #[clap(short = 'n', long, value_name = "NAME")]
    pub host_interface: Option<String>,

    /// Set the interface channel.
    #[clap(short = 'c', long)]
    pub channel: Option<u32>,

    /// Dump failed frames into a .pcap file.
    #[clap(short = 'd', long, value_name = "FILE")]
    pub dump: Option<PathBuf>,

    /// Increase log verbosity.
    #[clap(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Do not enable monitor mode on the interface.
    #[clap(short = 'M', long)]
    pub no_monitor: bool,

    /// Do not set the channel on the interface.
    #[clap(short = 'C', long)]
    pub no_channel: bool,

    /// Do not set the interface up or down.
    #[clap(short = 'U', long)]
    pub no_updown: bool,

    /// Run against an in-process loopback link instead of real devices.
    #[clap(long)]
    pub dev: bool,
}
