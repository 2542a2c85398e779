use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fwlink::rssi::{CloseReason, ConnectionEvent};
use fwlink::{Stack, StackConfig, StackStats};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{parse_address, ServeArgs};
use crate::exit::{io_error, stack_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

const POLL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct SessionReport {
    peer: String,
    served: u64,
    close_reason: Option<CloseReason>,
    stats: StackStats,
}

impl Report for SessionReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("peer", self.peer.clone()),
            ("served", self.served.to_string()),
            (
                "close_reason",
                self.close_reason
                    .map(|reason| reason.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            ("rx_segments", self.stats.rssi.rx_segments.to_string()),
            ("tx_segments", self.stats.rssi.tx_segments.to_string()),
            ("retransmits", self.stats.rssi.retransmits.to_string()),
            ("crc_drops", self.stats.packetizer.crc_drops.to_string()),
        ]
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let base = parse_address(&args.base)?;
    let config = args.stack.config()?;
    let listener = TcpListener::bind(&args.addr)
        .map_err(|err| io_error(&format!("bind {} failed", args.addr), err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error("listener setup failed", err))?;
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, base, size = args.size, version = %config.bridge.version, "serving");
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL);
                continue;
            }
            Err(err) => return Err(io_error("accept failed", err)),
        };

        let report = serve_session(stream, peer, &config, base, args.size, &running)?;
        print_report(&report, format);
        if args.once {
            break;
        }
    }

    Ok(SUCCESS)
}

fn serve_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: &StackConfig,
    base: u64,
    size: usize,
    running: &AtomicBool,
) -> CliResult<SessionReport> {
    stream
        .set_nonblocking(false)
        .map_err(|err| io_error("connection setup failed", err))?;
    let _ = stream.set_nodelay(true);
    info!(%peer, "connection accepted");

    let device = Stack::device(stream, config, base, size)
        .map_err(|err| stack_error("device setup failed", err))?;
    let events = device.transport().events();
    let accepted = Instant::now();

    let mut opened = false;
    let mut close_reason = None;
    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(POLL) {
            Ok(ConnectionEvent::Opened) => {
                opened = true;
                info!(%peer, "host connected");
            }
            Ok(ConnectionEvent::Closed(reason)) => {
                close_reason = Some(reason);
                break;
            }
            Err(err) if err.is_timeout() => {}
            Err(_) => {
                warn!(%peer, "connection event queue closed");
                break;
            }
        }
        if !device.link_open() {
            close_reason = events.try_iter().find_map(|event| match event {
                ConnectionEvent::Closed(reason) => Some(reason),
                ConnectionEvent::Opened => None,
            });
            info!(%peer, "peer hung up");
            break;
        }
        if !opened && accepted.elapsed() >= config.open_timeout {
            warn!(%peer, timeout = ?config.open_timeout, "no handshake from peer");
            break;
        }
    }

    let report = SessionReport {
        peer: peer.to_string(),
        served: device.emulator().served(),
        close_reason,
        stats: device.stats(),
    };
    device.close();
    info!(%peer, served = report.served, "session ended");
    Ok(report)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
