use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use clap::{Args, Subcommand};
use fwlink::srp::{BridgeConfig, Version};
use fwlink::StackConfig;

use crate::exit::{io_error, CliError, CliResult, TRANSPORT_ERROR, USAGE};
use crate::output::OutputFormat;

pub mod decode_rssi;
pub mod loopback;
pub mod read;
pub mod serve;
pub mod version;
pub mod write;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve an emulated register space over TCP.
    Serve(ServeArgs),
    /// Read registers from a device.
    Read(ReadArgs),
    /// Write registers on a device.
    Write(WriteArgs),
    /// Run host and device in-process and verify a write/read-back.
    Loopback(LoopbackArgs),
    /// Decode an RSSI segment header given as hex.
    DecodeRssi(DecodeRssiArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Read(args) => read::run(args, format),
        Command::Write(args) => write::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::DecodeRssi(args) => decode_rssi::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Protocol options shared by every command that builds a stack.
#[derive(Args, Debug)]
pub struct StackArgs {
    /// Register protocol layout (default, v0, v3).
    #[arg(long = "srp-version", default_value = "default")]
    pub srp_version: Version,
    /// Packetizer channel carrying the register stream.
    #[arg(long, default_value = "0")]
    pub channel: u8,
    /// Transaction and connect timeout (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

impl StackArgs {
    pub fn config(&self) -> CliResult<StackConfig> {
        let timeout = parse_duration(&self.timeout)?;
        Ok(StackConfig {
            bridge: BridgeConfig {
                version: self.srp_version,
                timeout,
            },
            channel: self.channel,
            open_timeout: timeout,
            ..StackConfig::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:8200")]
    pub addr: String,
    /// First emulated register address.
    #[arg(long, default_value = "0x0")]
    pub base: String,
    /// Emulated memory size in bytes.
    #[arg(long, default_value = "65536")]
    pub size: usize,
    /// Exit after the first connection ends.
    #[arg(long)]
    pub once: bool,
    #[command(flatten)]
    pub stack: StackArgs,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Device address (host:port).
    pub addr: String,
    /// Register address (decimal or 0x-prefixed hex).
    #[arg(long)]
    pub address: String,
    /// Bytes to read.
    #[arg(long, default_value = "4")]
    pub size: usize,
    #[command(flatten)]
    pub stack: StackArgs,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Device address (host:port).
    pub addr: String,
    /// Register address (decimal or 0x-prefixed hex).
    #[arg(long)]
    pub address: String,
    /// Bytes to write, as hex.
    #[arg(long)]
    pub data: String,
    /// Do not wait for the device to acknowledge.
    #[arg(long)]
    pub posted: bool,
    #[command(flatten)]
    pub stack: StackArgs,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Register address to exercise.
    #[arg(long, default_value = "0x0")]
    pub address: String,
    /// Bytes to write and read back, as hex.
    #[arg(long, default_value = "deadbeef")]
    pub data: String,
    #[command(flatten)]
    pub stack: StackArgs,
}

#[derive(Args, Debug)]
pub struct DecodeRssiArgs {
    /// Segment bytes as hex (whitespace allowed).
    pub hex: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn parse_address(input: &str) -> CliResult<u64> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(&digits.replace('_', ""), 16),
        None => input.replace('_', "").parse(),
    };
    parsed.map_err(|_| CliError::new(USAGE, format!("invalid address: {input}")))
}

pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(CliError::new(
            USAGE,
            format!("hex data must be a non-empty, even number of digits: {input}"),
        ));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| CliError::new(USAGE, format!("invalid hex data: {input}")))
        })
        .collect()
}

/// Connect to the first address `addr` resolves to that accepts within `timeout`.
pub fn connect(addr: &str, timeout: Duration) -> CliResult<TcpStream> {
    let candidates = addr
        .to_socket_addrs()
        .map_err(|err| io_error(&format!("cannot resolve {addr}"), err))?;

    let mut last = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => last = Some(err),
        }
    }
    Err(match last {
        Some(err) => io_error(&format!("connect to {addr} failed"), err),
        None => CliError::new(TRANSPORT_ERROR, format!("{addr} resolved to no addresses")),
    })
}
