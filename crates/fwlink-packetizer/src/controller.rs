use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use fwlink_stream::{pool, Frame, FrameRx, FrameTx};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::application::Application;
use crate::config::PacketizerConfig;
use crate::error::{PacketizerError, Result};
use crate::packet::{decode_packet, encode_packet, Packet, PacketHeader};

/// Counters describing packetizer traffic.
#[derive(Debug, Default)]
pub struct PacketizerStats {
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    rx_frames: AtomicU64,
    crc_drops: AtomicU64,
    gap_drops: AtomicU64,
    orphan_drops: AtomicU64,
}

/// Point-in-time copy of [`PacketizerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacketizerSnapshot {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub rx_frames: u64,
    pub crc_drops: u64,
    pub gap_drops: u64,
    pub orphan_drops: u64,
}

impl PacketizerStats {
    pub fn snapshot(&self) -> PacketizerSnapshot {
        PacketizerSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            crc_drops: self.crc_drops.load(Ordering::Relaxed),
            gap_drops: self.gap_drops.load(Ordering::Relaxed),
            orphan_drops: self.orphan_drops.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-progress inbound frame on one channel.
#[derive(Debug, Default)]
struct Reassembly {
    /// Sequence number the next packet must carry.
    expected: Option<u16>,
    parts: BytesMut,
    active: bool,
}

impl Reassembly {
    fn reset(&mut self) {
        self.parts.clear();
        self.active = false;
    }
}

/// Splits outbound frames into tagged packets and reassembles inbound packets
/// per channel.
///
/// The controller sits directly above the physical link: it pushes packets into
/// `lower` and receives packets through its [`FrameRx`] face.
pub struct Controller {
    config: PacketizerConfig,
    lower: Arc<dyn FrameTx>,
    /// Next outbound sequence per channel. Held across all packets of one frame.
    tx_sequence: Mutex<[u16; 256]>,
    rx: Mutex<HashMap<u8, Reassembly>>,
    apps: RwLock<HashMap<u8, Weak<Application>>>,
    stats: PacketizerStats,
}

impl Controller {
    pub fn new(lower: Arc<dyn FrameTx>, config: PacketizerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            lower,
            tx_sequence: Mutex::new([0; 256]),
            rx: Mutex::new(HashMap::new()),
            apps: RwLock::new(HashMap::new()),
            stats: PacketizerStats::default(),
        })
    }

    pub fn config(&self) -> &PacketizerConfig {
        &self.config
    }

    pub fn stats(&self) -> &PacketizerStats {
        &self.stats
    }

    /// Allocate a frame for an application to fill.
    pub fn req_frame(&self, size: usize) -> Frame {
        pool::req_frame(size, 0)
    }

    /// Segment an outbound frame into packets on `channel` and forward them.
    pub fn application_rx(&self, frame: Frame, channel: u8) -> Result<()> {
        let data = frame.to_bytes();
        let max = self.config.max_packet_payload.max(1);
        let count = data.len().div_ceil(max).max(1);

        let mut sequences = self.tx_sequence.lock();
        for index in 0..count {
            let start = index * max;
            let end = (start + max).min(data.len());
            let header = PacketHeader {
                channel,
                sequence: sequences[channel as usize],
                sof: index == 0,
                eof: index + 1 == count,
            };
            let packet = encode_packet(&header, &data[start..end])?;
            self.lower.push_frame(packet)?;
            sequences[channel as usize] = header.sequence.wrapping_add(1);
            PacketizerStats::bump(&self.stats.tx_packets);
        }
        trace!(channel, size = data.len(), packets = count, "frame packetized");
        Ok(())
    }

    pub(crate) fn register(&self, channel: u8, app: &Arc<Application>) -> Result<()> {
        let mut apps = self.apps.write();
        if apps
            .get(&channel)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            return Err(PacketizerError::ChannelInUse(channel));
        }
        apps.insert(channel, Arc::downgrade(app));
        debug!(channel, "application attached");
        Ok(())
    }

    pub(crate) fn unregister(&self, channel: u8) {
        let mut apps = self.apps.write();
        if apps
            .get(&channel)
            .is_some_and(|existing| existing.strong_count() == 0)
        {
            apps.remove(&channel);
            self.rx.lock().remove(&channel);
            debug!(channel, "application detached");
        }
    }

    /// Feed one inbound packet. Returns the reassembled frame when it completes one.
    fn reassemble(&self, packet: Packet) -> Option<Frame> {
        let header = packet.header;
        let mut rx = self.rx.lock();
        let state = rx.entry(header.channel).or_default();

        if state.active && !header.sof && state.expected != Some(header.sequence) {
            warn!(
                channel = header.channel,
                expected = ?state.expected,
                got = header.sequence,
                dropped = state.parts.len(),
                "packet sequence gap, dropping partial frame"
            );
            PacketizerStats::bump(&self.stats.gap_drops);
            state.reset();
        }

        if header.sof {
            if state.active {
                warn!(
                    channel = header.channel,
                    dropped = state.parts.len(),
                    "start of frame before end of previous, dropping partial frame"
                );
                PacketizerStats::bump(&self.stats.gap_drops);
            }
            state.reset();
            state.active = true;
        } else if !state.active {
            trace!(
                channel = header.channel,
                sequence = header.sequence,
                "packet outside a frame, waiting for start of frame"
            );
            state.expected = Some(header.sequence.wrapping_add(1));
            return None;
        }

        state.expected = Some(header.sequence.wrapping_add(1));
        state.parts.extend_from_slice(&packet.payload);

        if !header.eof {
            return None;
        }

        let data = state.parts.split().freeze();
        state.active = false;
        Some(Frame::from_slice(&data))
    }
}

impl FrameRx for Controller {
    fn accept_frame(&self, frame: Frame) {
        let packet = match decode_packet(&frame) {
            Ok(packet) => packet,
            Err(PacketizerError::CrcMismatch {
                channel,
                stored,
                computed,
            }) => {
                // The channel byte is untrusted. The gap check on the real
                // channel drops its partial frame.
                warn!(channel, stored, computed, "packet CRC mismatch, dropping");
                PacketizerStats::bump(&self.stats.crc_drops);
                return;
            }
            Err(err) => {
                warn!(error = %err, "malformed packet, dropping");
                return;
            }
        };
        PacketizerStats::bump(&self.stats.rx_packets);

        let channel = packet.header.channel;
        let Some(frame) = self.reassemble(packet) else {
            return;
        };

        let app = self.apps.read().get(&channel).and_then(Weak::upgrade);
        match app {
            Some(app) => {
                PacketizerStats::bump(&self.stats.rx_frames);
                app.accept_frame(frame);
            }
            None => {
                PacketizerStats::bump(&self.stats.orphan_drops);
                let err = PacketizerError::UnknownChannel(channel);
                debug!(size = frame.payload(), error = %err, "dropping reassembled frame");
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("channels", &self.apps.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use fwlink_stream::Master;

    use super::*;

    fn packet(channel: u8, sequence: u16, sof: bool, eof: bool, payload: &[u8]) -> Frame {
        encode_packet(
            &PacketHeader {
                channel,
                sequence,
                sof,
                eof,
            },
            payload,
        )
        .unwrap()
    }

    fn controller() -> Arc<Controller> {
        Controller::new(Arc::new(Master::new()), PacketizerConfig::default())
    }

    #[test]
    fn in_order_packets_reassemble() {
        let ctrl = controller();
        let feed = |f: Frame| ctrl.reassemble(decode_packet(&f).unwrap());
        assert!(feed(packet(1, 10, true, false, b"ab")).is_none());
        assert!(feed(packet(1, 11, false, false, b"cd")).is_none());
        let frame = feed(packet(1, 12, false, true, b"ef")).unwrap();
        assert_eq!(frame.to_bytes().as_ref(), b"abcdef");
    }

    #[test]
    fn gap_drops_only_its_channel() {
        let ctrl = controller();
        let feed = |f: Frame| ctrl.reassemble(decode_packet(&f).unwrap());

        assert!(feed(packet(1, 0, true, false, b"one-")).is_none());
        assert!(feed(packet(2, 0, true, false, b"two-")).is_none());
        // Channel 1 loses sequence 1.
        assert!(feed(packet(1, 2, false, true, b"lost")).is_none());
        let two = feed(packet(2, 1, false, true, b"done")).unwrap();
        assert_eq!(two.to_bytes().as_ref(), b"two-done");
        assert_eq!(ctrl.stats().snapshot().gap_drops, 1);

        // Channel 1 recovers at the next start of frame.
        assert!(feed(packet(1, 3, true, false, b"next")).is_none());
        let one = feed(packet(1, 4, false, true, b"-ok")).unwrap();
        assert_eq!(one.to_bytes().as_ref(), b"next-ok");
    }

    #[test]
    fn sequence_wraps() {
        let ctrl = controller();
        assert!(ctrl
            .reassemble(decode_packet(&packet(3, u16::MAX, true, false, b"x")).unwrap())
            .is_none());
        let frame = ctrl
            .reassemble(decode_packet(&packet(3, 0, false, true, b"y")).unwrap())
            .unwrap();
        assert_eq!(frame.to_bytes().as_ref(), b"xy");
    }

    #[test]
    fn crc_error_discards_partial_frame() {
        let ctrl = controller();
        ctrl.accept_frame(packet(4, 0, true, false, b"head"));

        let mut corrupt = packet(4, 1, false, false, b"body").to_bytes().to_vec();
        corrupt[10] ^= 0xFF;
        ctrl.accept_frame(Frame::from_slice(&corrupt));

        // The tail follows a hole, so the frame is dropped.
        assert!(ctrl
            .reassemble(decode_packet(&packet(4, 2, false, true, b"tail")).unwrap())
            .is_none());
        let stats = ctrl.stats().snapshot();
        assert_eq!(stats.crc_drops, 1);
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.gap_drops, 1);
    }

    #[test]
    fn corrupt_channel_byte_spares_other_channels() {
        let ctrl = controller();
        ctrl.accept_frame(packet(1, 0, true, false, b"one-"));
        ctrl.accept_frame(packet(2, 0, true, false, b"two-"));

        // A channel 1 packet damaged so that it claims channel 2.
        let mut corrupt = packet(1, 1, false, false, b"body").to_bytes().to_vec();
        corrupt[1] = 2;
        ctrl.accept_frame(Frame::from_slice(&corrupt));

        let two = ctrl
            .reassemble(decode_packet(&packet(2, 1, false, true, b"done")).unwrap())
            .unwrap();
        assert_eq!(two.to_bytes().as_ref(), b"two-done");

        // Channel 1 loses the frame at its next packet.
        assert!(ctrl
            .reassemble(decode_packet(&packet(1, 2, false, true, b"tail")).unwrap())
            .is_none());
        let stats = ctrl.stats().snapshot();
        assert_eq!(stats.crc_drops, 1);
        assert_eq!(stats.gap_drops, 1);
    }

    #[test]
    fn orphan_frames_counted() {
        let ctrl = controller();
        ctrl.accept_frame(packet(200, 0, true, true, b"nobody"));
        assert_eq!(ctrl.stats().snapshot().orphan_drops, 1);
    }

    #[test]
    fn segmentation_respects_packet_size() {
        struct Capture(Mutex<Vec<Frame>>);
        impl FrameTx for Capture {
            fn accept_req(&self, size: usize, _zero_copy: bool) -> fwlink_stream::Result<Frame> {
                Ok(pool::req_frame(size, 0))
            }
            fn push_frame(&self, frame: Frame) -> fwlink_stream::Result<()> {
                self.0.lock().push(frame);
                Ok(())
            }
        }

        let lower = Arc::new(Capture(Mutex::new(Vec::new())));
        let config = PacketizerConfig {
            max_packet_payload: 4,
            ..PacketizerConfig::default()
        };
        let ctrl = Controller::new(lower.clone(), config);

        ctrl.application_rx(Frame::from_slice(b"0123456789"), 6).unwrap();
        ctrl.application_rx(Frame::new(), 6).unwrap();

        let packets: Vec<Packet> = lower
            .0
            .lock()
            .iter()
            .map(|f| decode_packet(f).unwrap())
            .collect();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].payload.as_ref(), b"0123");
        assert_eq!(packets[2].payload.as_ref(), b"89");
        assert!(packets[0].header.sof && !packets[0].header.eof);
        assert!(!packets[1].header.sof && !packets[1].header.eof);
        assert!(packets[2].header.eof);
        // Empty frame travels as a single SOF|EOF packet.
        assert!(packets[3].header.sof && packets[3].header.eof);
        let sequences: Vec<u16> = packets.iter().map(|p| p.header.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }
}
