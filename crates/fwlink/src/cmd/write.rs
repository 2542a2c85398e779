use std::time::Instant;

use fwlink::Stack;
use serde::Serialize;

use crate::cmd::{connect, parse_address, parse_hex, WriteArgs};
use crate::exit::{srp_error, stack_error, CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Serialize)]
struct WriteReport {
    address: u64,
    size: usize,
    posted: bool,
    elapsed_us: u128,
}

impl Report for WriteReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("address", format!("{:#x}", self.address)),
            ("size", self.size.to_string()),
            ("posted", self.posted.to_string()),
            ("elapsed_us", self.elapsed_us.to_string()),
        ]
    }
}

pub fn run(args: WriteArgs, format: OutputFormat) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let data = parse_hex(&args.data)?;
    let config = args.stack.config()?;
    let stream = connect(&args.addr, config.open_timeout)?;
    let host = Stack::host(stream, &config).map_err(|err| stack_error("connect failed", err))?;

    let started = Instant::now();
    host.bridge()
        .write(address, &data, args.posted)
        .map_err(|err| srp_error("write failed", err))?;

    print_report(
        &WriteReport {
            address,
            size: data.len(),
            posted: args.posted,
            elapsed_us: started.elapsed().as_micros(),
        },
        format,
    );
    Ok(SUCCESS)
}
