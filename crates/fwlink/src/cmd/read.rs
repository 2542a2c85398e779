use std::time::Instant;

use fwlink::Stack;
use serde::Serialize;

use crate::cmd::{connect, parse_address, ReadArgs};
use crate::exit::{srp_error, stack_error, CliResult, SUCCESS};
use crate::output::{hex, print_report, OutputFormat, Report};

#[derive(Serialize)]
struct ReadReport {
    address: u64,
    size: usize,
    data: String,
    elapsed_us: u128,
}

impl Report for ReadReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("address", format!("{:#x}", self.address)),
            ("size", self.size.to_string()),
            ("data", self.data.clone()),
            ("elapsed_us", self.elapsed_us.to_string()),
        ]
    }
}

pub fn run(args: ReadArgs, format: OutputFormat) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let config = args.stack.config()?;
    let stream = connect(&args.addr, config.open_timeout)?;
    let host = Stack::host(stream, &config).map_err(|err| stack_error("connect failed", err))?;

    let started = Instant::now();
    let data = host
        .bridge()
        .read(address, args.size)
        .map_err(|err| srp_error("read failed", err))?;

    print_report(
        &ReadReport {
            address,
            size: data.len(),
            data: hex(&data),
            elapsed_us: started.elapsed().as_micros(),
        },
        format,
    );
    Ok(SUCCESS)
}
