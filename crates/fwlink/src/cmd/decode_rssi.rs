use fwlink::rssi::{Header, SynParams};
use fwlink::stream::Frame;
use serde::Serialize;

use crate::cmd::{parse_hex, DecodeRssiArgs};
use crate::exit::{rssi_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Serialize)]
struct HeaderReport {
    segment_size: usize,
    header_size: u8,
    syn: bool,
    ack: bool,
    eack: bool,
    rst: bool,
    nul: bool,
    busy: bool,
    sequence: u16,
    acknowledge: u16,
    checksum: u16,
    checksum_ok: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    eacks: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    syn_params: Option<SynParams>,
}

impl HeaderReport {
    fn from_header(header: &Header, segment_size: usize) -> Self {
        Self {
            segment_size,
            header_size: header.header_size(),
            syn: header.syn(),
            ack: header.ack(),
            eack: header.eack(),
            rst: header.rst(),
            nul: header.nul(),
            busy: header.busy(),
            sequence: header.sequence(),
            acknowledge: header.acknowledge(),
            checksum: header.checksum(),
            checksum_ok: header.verify(),
            eacks: if header.eack() {
                header.eacks()
            } else {
                Vec::new()
            },
            syn_params: if header.syn() {
                header.syn_params().ok()
            } else {
                None
            },
        }
    }
}

impl Report for HeaderReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("segment_size", self.segment_size.to_string()),
            ("header_size", self.header_size.to_string()),
            ("syn", self.syn.to_string()),
            ("ack", self.ack.to_string()),
            ("eack", self.eack.to_string()),
            ("rst", self.rst.to_string()),
            ("nul", self.nul.to_string()),
            ("busy", self.busy.to_string()),
            ("sequence", self.sequence.to_string()),
            ("acknowledge", self.acknowledge.to_string()),
            ("checksum", format!("{:#06x}", self.checksum)),
            ("checksum_ok", self.checksum_ok.to_string()),
        ];
        if !self.eacks.is_empty() {
            let list: Vec<String> = self.eacks.iter().map(u16::to_string).collect();
            rows.push(("eacks", list.join(",")));
        }
        if let Some(params) = &self.syn_params {
            rows.push(("max_outstanding", params.max_outstanding.to_string()));
            rows.push(("max_segment_size", params.max_segment_size.to_string()));
            rows.push(("retransmit_timeout_ms", params.retransmit_timeout_ms.to_string()));
            rows.push(("connection_id", params.connection_id.to_string()));
        }
        rows
    }
}

pub fn run(args: DecodeRssiArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = parse_hex(&args.hex)?;
    let header = Header::new(Frame::from_slice(&bytes))
        .map_err(|err| rssi_error("not an RSSI segment", err))?;

    match format {
        OutputFormat::Pretty => print!("{}", header.dump()),
        _ => print_report(&HeaderReport::from_header(&header, bytes.len()), format),
    }
    Ok(if header.verify() { SUCCESS } else { DATA_INVALID })
}
