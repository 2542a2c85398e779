use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use fwlink::{Stack, StackStats};
use serde::Serialize;

use crate::cmd::{parse_address, parse_hex, LoopbackArgs};
use crate::exit::{io_error, srp_error, stack_error, CliResult, FAILURE, SUCCESS};
use crate::output::{hex, print_report, OutputFormat, Report};

#[derive(Serialize)]
struct LoopbackReport {
    version: String,
    address: u64,
    written: String,
    read: String,
    matched: bool,
    round_trip_us: u128,
    host: StackStats,
}

impl Report for LoopbackReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.clone()),
            ("address", format!("{:#x}", self.address)),
            ("written", self.written.clone()),
            ("read", self.read.clone()),
            ("matched", self.matched.to_string()),
            ("round_trip_us", self.round_trip_us.to_string()),
            ("tx_segments", self.host.rssi.tx_segments.to_string()),
            ("retransmits", self.host.rssi.retransmits.to_string()),
        ]
    }
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let data = parse_hex(&args.data)?;
    let config = args.stack.config()?;
    let (client, server) = local_pair()?;

    let device = Stack::device(server, &config, address, data.len().max(4096))
        .map_err(|err| stack_error("device setup failed", err))?;
    let host = Stack::host(client, &config).map_err(|err| stack_error("connect failed", err))?;

    let started = Instant::now();
    host.bridge()
        .write(address, &data, false)
        .map_err(|err| srp_error("write failed", err))?;
    let read = host
        .bridge()
        .read(address, data.len())
        .map_err(|err| srp_error("read failed", err))?;
    let round_trip_us = started.elapsed().as_micros();

    let report = LoopbackReport {
        version: config.bridge.version.to_string(),
        address,
        written: hex(&data),
        read: hex(&read),
        matched: read == data,
        round_trip_us,
        host: host.stats(),
    };
    host.close();
    device.close();

    print_report(&report, format);
    Ok(if report.matched { SUCCESS } else { FAILURE })
}

fn local_pair() -> CliResult<(TcpStream, TcpStream)> {
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|err| io_error("loopback bind failed", err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| io_error("loopback bind failed", err))?;
    let client = TcpStream::connect(addr).map_err(|err| io_error("loopback connect failed", err))?;
    let (server, _) = listener
        .accept()
        .map_err(|err| io_error("loopback accept failed", err))?;
    Ok((client, server))
}
