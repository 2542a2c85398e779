//! Host and device endpoints assembled from every layer.
//!
//! ```text
//!   Bridge / MemoryEmulator        register protocol
//!   rssi::Application + Controller reliable transport
//!   packetizer::Application        one channel
//!   packetizer::Controller         segmentation and CRC
//!   StreamLink                     byte stream
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use fwlink_packetizer::{self as packetizer, PacketizerConfig, PacketizerError, PacketizerSnapshot};
use fwlink_rssi::{self as rssi, RssiConfig, RssiError, State, StatsSnapshot};
use fwlink_srp::{Bridge, BridgeConfig, MemoryEmulator, SrpError};
use fwlink_stream::{FrameRx, FrameTx, LinkConfig, LinkStream, StreamError, StreamLink};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Longest `close` waits for the RST and queued packets to leave.
const CLOSE_LINGER: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Packetizer(#[from] PacketizerError),
    #[error(transparent)]
    Rssi(#[from] RssiError),
    #[error(transparent)]
    Srp(#[from] SrpError),
}

pub type Result<T> = std::result::Result<T, StackError>;

/// Tuning for every layer of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub link: LinkConfig,
    pub packetizer: PacketizerConfig,
    /// The `server` flag is set by the constructor.
    pub rssi: RssiConfig,
    pub bridge: BridgeConfig,
    /// Packetizer channel carrying the reliable stream.
    pub channel: u8,
    /// How long a host waits for the handshake.
    pub open_timeout: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            packetizer: PacketizerConfig::default(),
            rssi: RssiConfig::default(),
            bridge: BridgeConfig::default(),
            channel: packetizer::REGISTER,
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters from the layers that keep them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StackStats {
    pub packetizer: PacketizerSnapshot,
    pub rssi: StatsSnapshot,
}

/// One endpoint: `E` on top of the reliable transport, over link `S`.
pub struct Stack<S: LinkStream, E: FrameRx + 'static> {
    endpoint: Arc<E>,
    rssi: Arc<rssi::Application>,
    transport: Arc<rssi::Controller>,
    channel: Arc<packetizer::Application>,
    packetizer: Arc<packetizer::Controller>,
    link: Arc<StreamLink<S>>,
}

pub type HostStack<S> = Stack<S, Bridge>;
pub type DeviceStack<S> = Stack<S, MemoryEmulator>;

impl<S: LinkStream> Stack<S, Bridge> {
    /// Open a host endpoint and wait for the connection.
    pub fn host(stream: S, config: &StackConfig) -> Result<Self> {
        let stack = assemble(stream, config, false, |lower| {
            Ok(Bridge::new(lower, config.bridge.clone()))
        })?;
        stack.wait_open(config.open_timeout)?;
        info!(
            channel = config.channel,
            version = %config.bridge.version,
            "host connected"
        );
        Ok(stack)
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.endpoint
    }
}

impl<S: LinkStream> Stack<S, MemoryEmulator> {
    /// Start a device endpoint serving `size` bytes at `base`; the host opens the connection.
    pub fn device(stream: S, config: &StackConfig, base: u64, size: usize) -> Result<Self> {
        let version = config.bridge.version;
        assemble(stream, config, true, |lower| {
            Ok(MemoryEmulator::new(lower, version, base, size)?)
        })
    }

    pub fn emulator(&self) -> &Arc<MemoryEmulator> {
        &self.endpoint
    }
}

impl<S: LinkStream, E: FrameRx + 'static> Stack<S, E> {
    pub fn endpoint(&self) -> &Arc<E> {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<rssi::Controller> {
        &self.transport
    }

    pub fn packetizer(&self) -> &Arc<packetizer::Controller> {
        &self.packetizer
    }

    pub fn wait_open(&self, timeout: Duration) -> Result<()> {
        self.transport.wait_open(timeout)?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open() && self.transport.is_open()
    }

    /// Whether the byte stream underneath is still being read.
    pub fn link_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn stats(&self) -> StackStats {
        StackStats {
            packetizer: self.packetizer.stats().snapshot(),
            rssi: self.transport.stats().snapshot(),
        }
    }

    /// Close the connection and stop every worker. Idempotent.
    pub fn close(&self) {
        self.transport.close();
        let deadline = Instant::now() + CLOSE_LINGER;
        while Instant::now() < deadline
            && (self.transport.state() == State::Closing || self.channel.queued() > 0)
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.rssi.stop();
        self.channel.stop();
        self.link.close();
        debug!(state = ?self.transport.state(), "stack closed");
    }
}

fn assemble<S, E, F>(stream: S, config: &StackConfig, server: bool, make: F) -> Result<Stack<S, E>>
where
    S: LinkStream,
    E: FrameRx + 'static,
    F: FnOnce(Arc<dyn FrameTx>) -> Result<Arc<E>>,
{
    let link = StreamLink::with_config(stream, config.link.clone())?;
    let packetizer = packetizer::Controller::new(link.clone(), config.packetizer.clone());
    link.set_slave(&packetizer);

    let channel = packetizer::Application::new(&packetizer, config.channel)?;
    let transport = rssi::Controller::new(RssiConfig {
        server,
        ..config.rssi.clone()
    });
    channel.set_slave(&transport);
    let rssi = rssi::Application::new(&transport, channel.clone())?;

    let endpoint = make(rssi.clone())?;
    rssi.set_slave(&endpoint);
    transport.open()?;

    Ok(Stack {
        endpoint,
        rssi,
        transport,
        channel,
        packetizer,
        link,
    })
}

impl<S: LinkStream, E: FrameRx + 'static> Drop for Stack<S, E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: LinkStream, E: FrameRx + 'static> std::fmt::Debug for Stack<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("channel", &self.channel.channel())
            .field("state", &self.transport.state())
            .field("link_open", &self.link.is_open())
            .finish()
    }
}
