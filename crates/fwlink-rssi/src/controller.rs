use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use fwlink_stream::{pool, CancelToken, Frame, FrameRx, Master};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::RssiConfig;
use crate::data::Data;
use crate::error::{CloseReason, Result, RssiError};
use crate::header::{eack_header_size, Header, HEADER_SIZE, MAX_EACKS, SYN_HEADER_SIZE};

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
    Reset,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            State::Closed => "closed",
            State::SynSent => "syn-sent",
            State::SynReceived => "syn-received",
            State::Established => "established",
            State::Closing => "closing",
            State::Reset => "reset",
        };
        f.write_str(text)
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed(CloseReason),
}

/// Counters describing one connection endpoint.
#[derive(Debug, Default)]
pub struct ControllerStats {
    tx_segments: AtomicU64,
    rx_segments: AtomicU64,
    retransmits: AtomicU64,
    bad_checksum: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    eacks_sent: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tx_segments: u64,
    pub rx_segments: u64,
    pub retransmits: u64,
    pub bad_checksum: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub eacks_sent: u64,
    pub delivered: u64,
}

impl ControllerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_segments: self.tx_segments.load(Ordering::Relaxed),
            rx_segments: self.rx_segments.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            bad_checksum: self.bad_checksum.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            eacks_sent: self.eacks_sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// `a` precedes `b` in modulo-2^16 sequence space.
fn seq_lt(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

fn seq_le(a: u16, b: u16) -> bool {
    a == b || seq_lt(a, b)
}

fn backoff(base: Duration, retries: u8, cap: Duration) -> Duration {
    let factor = 1u32 << u32::from(retries).min(16);
    base.saturating_mul(factor).min(cap.max(base))
}

/// A sent segment awaiting acknowledgment.
struct Segment {
    seq: u16,
    wire: Bytes,
    deadline: Instant,
    retries: u8,
    syn: bool,
}

struct Inner {
    state: State,
    /// Negotiated parameters for the current connection.
    params: RssiConfig,
    next_seq: u16,
    /// Last in-order sequence received from the peer.
    rx_last: u16,
    /// Sequence of the peer's SYN that opened the current connection.
    peer_syn: Option<u16>,
    ack_pending: u8,
    ack_deadline: Option<Instant>,
    ack_now: bool,
    eack_now: bool,
    /// Sequenced segments received ahead of `rx_last + 1`. NUL segments hold `None`.
    out_of_order: HashMap<u16, Option<Frame>>,
    unacked: VecDeque<Segment>,
    outbound: VecDeque<Frame>,
    peer_busy: bool,
    local_busy: bool,
    last_rx: Instant,
    last_tx: Instant,
    close_reason: Option<CloseReason>,
}

impl Inner {
    fn new(config: &RssiConfig) -> Self {
        let now = Instant::now();
        Self {
            state: State::Closed,
            params: config.clone(),
            next_seq: config.initial_sequence,
            rx_last: 0,
            peer_syn: None,
            ack_pending: 0,
            ack_deadline: None,
            ack_now: false,
            eack_now: false,
            out_of_order: HashMap::new(),
            unacked: VecDeque::new(),
            outbound: VecDeque::new(),
            peer_busy: false,
            local_busy: false,
            last_rx: now,
            last_tx: now,
            close_reason: None,
        }
    }

    /// A SYN at or behind the receive point of the live connection is a replay.
    fn is_stale_syn(&self, seq: u16) -> bool {
        self.peer_syn == Some(seq) || seq_le(seq, self.rx_last)
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            State::SynSent | State::SynReceived | State::Established
        )
    }

    /// Write acknowledgment and busy fields shared by every outbound segment.
    fn stamp(&self, header: &mut Header) {
        if matches!(self.state, State::SynReceived | State::Established) {
            header.set_ack(true);
            header.set_acknowledge(self.rx_last);
        }
        header.set_busy(self.local_busy);
    }

    fn clear_ack(&mut self) {
        self.ack_pending = 0;
        self.ack_deadline = None;
        self.ack_now = false;
    }

    fn track(&mut self, seq: u16, frame: &Frame, syn: bool, now: Instant) {
        self.unacked.push_back(Segment {
            seq,
            wire: frame.to_bytes(),
            deadline: now + self.params.retransmit_timeout,
            retries: 0,
            syn,
        });
    }

    fn build_syn(&mut self, announce: &RssiConfig, now: Instant) -> Result<Frame> {
        let mut header = Header::reserve(pool::req_frame(0, SYN_HEADER_SIZE), SYN_HEADER_SIZE)?;
        header.init();
        header.set_syn(true);
        header.set_sequence(self.next_seq);
        header.set_syn_params(&announce.syn_params())?;
        self.stamp(&mut header);
        header.update();

        let frame = header.into_frame();
        let seq = self.next_seq;
        self.track(seq, &frame, true, now);
        self.next_seq = seq.wrapping_add(1);
        Ok(frame)
    }

    fn build_ack(&mut self) -> Result<Frame> {
        let mut header = Header::reserve(pool::req_frame(0, HEADER_SIZE), HEADER_SIZE)?;
        header.init();
        header.set_sequence(self.next_seq);
        self.stamp(&mut header);
        header.update();
        self.clear_ack();
        Ok(header.into_frame())
    }

    fn build_eack(&mut self) -> Result<Frame> {
        let base = self.rx_last;
        let mut seqs: Vec<u16> = self.out_of_order.keys().copied().collect();
        seqs.sort_by_key(|seq| seq.wrapping_sub(base));
        seqs.truncate(MAX_EACKS);

        let size = eack_header_size(seqs.len());
        let mut header = Header::reserve(pool::req_frame(0, size), size)?;
        header.init();
        header.set_eack(true);
        header.set_sequence(self.next_seq);
        self.stamp(&mut header);
        header.set_eacks(&seqs)?;
        header.update();
        self.clear_ack();
        self.eack_now = false;
        Ok(header.into_frame())
    }

    fn build_nul(&mut self, now: Instant) -> Result<Frame> {
        let mut header = Header::reserve(pool::req_frame(0, HEADER_SIZE), HEADER_SIZE)?;
        header.init();
        header.set_nul(true);
        header.set_sequence(self.next_seq);
        self.stamp(&mut header);
        header.update();
        self.clear_ack();

        let frame = header.into_frame();
        let seq = self.next_seq;
        self.track(seq, &frame, false, now);
        self.next_seq = seq.wrapping_add(1);
        Ok(frame)
    }

    fn build_rst(&mut self) -> Result<Frame> {
        let mut header = Header::reserve(pool::req_frame(0, HEADER_SIZE), HEADER_SIZE)?;
        header.init();
        header.set_rst(true);
        header.set_sequence(self.next_seq);
        self.stamp(&mut header);
        header.update();
        Ok(header.into_frame())
    }

    fn build_data(&mut self, frame: Frame, now: Instant) -> Result<Frame> {
        let has_room = frame
            .single("Controller::application_rx")
            .is_ok_and(|buffer| buffer.head_room() >= HEADER_SIZE);
        let frame = if has_room {
            frame
        } else {
            let mut copy = pool::req_frame(frame.payload(), HEADER_SIZE);
            copy.write(&frame.to_bytes())?;
            copy
        };

        let mut data = Data::reserve(frame)?;
        data.init();
        data.set_sequence(self.next_seq);
        self.stamp(&mut data);
        data.update();
        self.clear_ack();

        let frame = data.into_header().into_frame();
        let seq = self.next_seq;
        self.track(seq, &frame, false, now);
        self.next_seq = seq.wrapping_add(1);
        Ok(frame)
    }

    /// Earliest instant at which a timer needs servicing.
    fn next_deadline(&self, server: bool) -> Option<Instant> {
        let mut next = self.unacked.front().map(|segment| segment.deadline);
        let mut consider = |at: Instant| {
            next = Some(next.map_or(at, |current| current.min(at)));
        };
        if self.ack_pending > 0 {
            if let Some(at) = self.ack_deadline {
                consider(at);
            }
        }
        if self.state == State::Established {
            consider(self.last_rx + self.params.null_timeout * 3);
            if !server {
                consider(self.last_tx + self.params.null_timeout);
            }
        }
        next
    }
}

/// Reliable-transport connection endpoint.
///
/// Outbound data enters through [`application_rx`], which blocks while the send
/// window is full or the peer is busy. Every segment leaves through
/// [`application_tx`], which a single worker drains. Inbound segments arrive
/// through the [`FrameRx`] face; in-order data goes to the attached upper stage.
///
/// [`application_rx`]: Controller::application_rx
/// [`application_tx`]: Controller::application_tx
pub struct Controller {
    config: RssiConfig,
    inner: Mutex<Inner>,
    cond: Condvar,
    master: Master,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    stats: ControllerStats,
}

impl Controller {
    pub fn new(config: RssiConfig) -> Arc<Self> {
        let (events_tx, events_rx) = channel::unbounded();
        Arc::new(Self {
            inner: Mutex::new(Inner::new(&config)),
            config,
            cond: Condvar::new(),
            master: Master::new(),
            events_tx,
            events_rx,
            stats: ControllerStats::default(),
        })
    }

    /// Local configuration.
    pub fn config(&self) -> &RssiConfig {
        &self.config
    }

    /// Parameters in force for the current connection.
    pub fn negotiated(&self) -> RssiConfig {
        self.inner.lock().params.clone()
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Established
    }

    /// Why the connection last closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    /// Lifecycle events. Clones share one queue.
    pub fn events(&self) -> Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Attach the stage that receives in-order data.
    pub fn set_slave<R: FrameRx + 'static>(&self, slave: &Arc<R>) {
        self.master.set_slave(slave);
    }

    /// Allocate a frame with head room for a data header.
    pub fn req_frame(&self, size: usize) -> Frame {
        pool::req_frame(size, HEADER_SIZE)
    }

    /// Start the connection. A client sends SYN; a server waits for one.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.config.server || inner.is_connected() {
            return Ok(());
        }

        let next_seq = inner.next_seq;
        *inner = Inner::new(&self.config);
        inner.next_seq = next_seq;
        let now = Instant::now();
        let syn = inner.build_syn(&self.config, now)?;
        inner.outbound.push_back(syn);
        inner.state = State::SynSent;
        debug!(connection_id = self.config.connection_id, "sending SYN");
        self.cond.notify_all();
        Ok(())
    }

    /// Block until the connection is established.
    pub fn wait_open(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match (inner.state, inner.close_reason) {
                (State::Established, _) => return Ok(()),
                (State::Closed | State::Reset, Some(reason)) => {
                    return Err(RssiError::Closed(reason))
                }
                _ => {}
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return Err(RssiError::Timeout(timeout));
            }
        }
    }

    /// Close the connection, telling the peer with RST.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.is_connected() {
            self.shutdown(&mut inner, CloseReason::LocalClose, true);
        }
    }

    /// Announce (or withdraw) local congestion to the peer.
    pub fn set_local_busy(&self, busy: bool) {
        let mut inner = self.inner.lock();
        if inner.local_busy != busy {
            inner.local_busy = busy;
            inner.ack_now = true;
            self.cond.notify_all();
        }
    }

    /// Wake the transmit worker so it can observe cancellation.
    pub fn wake(&self) {
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    /// Queue one outbound data frame, waiting for window space.
    pub fn application_rx(&self, frame: Frame) -> Result<()> {
        let size = frame.payload();
        let deadline = Instant::now() + self.config.tx_timeout;
        let mut inner = self.inner.lock();

        let max = inner.params.max_segment_size as usize;
        if size > max {
            return Err(RssiError::SegmentTooLarge { size, max });
        }

        loop {
            match inner.state {
                State::Established => {
                    if inner.unacked.len() < inner.params.max_outstanding as usize
                        && !inner.peer_busy
                    {
                        break;
                    }
                }
                State::SynSent | State::SynReceived => {}
                State::Closed | State::Reset | State::Closing => {
                    return Err(inner
                        .close_reason
                        .map_or(RssiError::NotConnected, RssiError::Closed));
                }
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return Err(RssiError::Timeout(self.config.tx_timeout));
            }
        }

        let segment = inner.build_data(frame, Instant::now())?;
        inner.outbound.push_back(segment);
        self.cond.notify_all();
        Ok(())
    }

    /// Next segment to hand to the lower stage.
    ///
    /// Blocks until new data, an acknowledgment, a keepalive or a retransmission
    /// is due. Returns `None` once `token` is cancelled.
    pub fn application_tx(&self, token: &CancelToken) -> Option<Frame> {
        let mut inner = self.inner.lock();
        loop {
            if token.is_cancelled() {
                return None;
            }

            let now = Instant::now();
            self.service_timers(&mut inner, now);

            if let Some(frame) = inner.outbound.pop_front() {
                inner.last_tx = now;
                if inner.state == State::Closing && inner.outbound.is_empty() {
                    inner.state = State::Closed;
                    self.emit(ConnectionEvent::Closed(CloseReason::LocalClose));
                    self.cond.notify_all();
                }
                bump(&self.stats.tx_segments);
                return Some(frame);
            }

            match inner.next_deadline(self.config.server) {
                Some(at) => {
                    self.cond.wait_until(&mut inner, at);
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    fn service_timers(&self, inner: &mut Inner, now: Instant) {
        if matches!(inner.state, State::SynReceived | State::Established) {
            if inner.eack_now && !inner.out_of_order.is_empty() {
                match inner.build_eack() {
                    Ok(frame) => {
                        inner.outbound.push_back(frame);
                        bump(&self.stats.eacks_sent);
                    }
                    Err(err) => warn!(error = %err, "failed to build EACK"),
                }
            }
            let ack_due = inner.ack_pending > 0 && inner.ack_deadline.is_some_and(|at| at <= now);
            if inner.ack_now || ack_due {
                match inner.build_ack() {
                    Ok(frame) => inner.outbound.push_back(frame),
                    Err(err) => warn!(error = %err, "failed to build ACK"),
                }
            }
        }

        if let Some(front) = inner.unacked.front_mut() {
            if front.deadline <= now {
                if front.retries >= inner.params.max_retransmissions {
                    let reason = if front.syn {
                        CloseReason::HandshakeTimeout
                    } else {
                        CloseReason::RetransmitExhausted
                    };
                    warn!(
                        seq = front.seq,
                        retries = front.retries,
                        %reason,
                        "giving up on segment"
                    );
                    self.shutdown(inner, reason, true);
                    return;
                }
                front.retries += 1;
                front.deadline = now
                    + backoff(
                        inner.params.retransmit_timeout,
                        front.retries,
                        inner.params.max_backoff,
                    );
                debug!(seq = front.seq, retries = front.retries, "retransmitting segment");
                let copy = Frame::from_slice(&front.wire);
                inner.outbound.push_back(copy);
                bump(&self.stats.retransmits);
            }
        }

        if inner.state == State::Established {
            if now.duration_since(inner.last_rx) >= inner.params.null_timeout * 3 {
                warn!(silent = ?now.duration_since(inner.last_rx), "peer went silent");
                self.shutdown(inner, CloseReason::PeerTimeout, true);
                return;
            }
            let idle = now.duration_since(inner.last_tx) >= inner.params.null_timeout;
            if !self.config.server
                && idle
                && inner.outbound.is_empty()
                && inner.unacked.len() < inner.params.max_outstanding as usize
            {
                match inner.build_nul(now) {
                    Ok(frame) => {
                        trace!("sending NUL keepalive");
                        inner.outbound.push_back(frame);
                    }
                    Err(err) => warn!(error = %err, "failed to build NUL"),
                }
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn establish(&self, inner: &mut Inner) {
        inner.state = State::Established;
        inner.close_reason = None;
        inner.last_rx = Instant::now();
        info!(
            connection_id = inner.params.connection_id,
            server = self.config.server,
            "connection established"
        );
        self.emit(ConnectionEvent::Opened);
        self.cond.notify_all();
    }

    fn shutdown(&self, inner: &mut Inner, reason: CloseReason, notify_peer: bool) {
        if notify_peer && inner.is_connected() {
            match inner.build_rst() {
                Ok(frame) => inner.outbound.push_back(frame),
                Err(err) => warn!(error = %err, "failed to build RST"),
            }
        }
        inner.unacked.clear();
        inner.out_of_order.clear();
        inner.clear_ack();
        inner.eack_now = false;
        inner.peer_busy = false;
        inner.close_reason = Some(reason);
        inner.state = match reason {
            CloseReason::Reset => State::Reset,
            CloseReason::LocalClose if !inner.outbound.is_empty() => State::Closing,
            _ => State::Closed,
        };
        if inner.state != State::Closing {
            self.emit(ConnectionEvent::Closed(reason));
        }
        info!(%reason, state = %inner.state, "connection closed");
        self.cond.notify_all();
    }

    /// Process one inbound segment.
    pub fn transport_rx(&self, frame: Frame) {
        let segment = match Data::new(frame) {
            Ok(segment) => segment,
            Err(err) => {
                warn!(error = %err, "malformed segment, dropping");
                return;
            }
        };
        if !segment.verify() {
            warn!(
                seq = segment.sequence(),
                "{}, dropping segment",
                RssiError::BadChecksum
            );
            bump(&self.stats.bad_checksum);
            return;
        }
        bump(&self.stats.rx_segments);

        let mut deliver = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.last_rx = Instant::now();
            self.handle_segment(&mut inner, segment, &mut deliver);
        }

        for frame in deliver {
            bump(&self.stats.delivered);
            self.master.send_frame(frame);
        }
    }

    fn handle_segment(&self, inner: &mut Inner, segment: Data, deliver: &mut Vec<Frame>) {
        if segment.rst() {
            if inner.is_connected() {
                self.shutdown(inner, CloseReason::Reset, false);
            }
            return;
        }
        if segment.syn() {
            self.handle_syn(inner, &segment);
            return;
        }
        if !matches!(inner.state, State::SynReceived | State::Established) {
            trace!(state = %inner.state, seq = segment.sequence(), "segment outside a connection");
            return;
        }

        if segment.busy() != inner.peer_busy {
            inner.peer_busy = segment.busy();
            debug!(busy = inner.peer_busy, "peer busy changed");
            self.cond.notify_all();
        }
        if segment.ack() {
            self.process_ack(inner, segment.acknowledge());
        }
        if segment.eack() {
            let seqs = segment.eacks();
            let before = inner.unacked.len();
            inner.unacked.retain(|pending| !seqs.contains(&pending.seq));
            if inner.unacked.len() != before {
                self.cond.notify_all();
            }
        }
        if inner.state == State::SynReceived && !inner.unacked.iter().any(|pending| pending.syn) {
            self.establish(inner);
        }
        if inner.state != State::Established {
            return;
        }

        if !segment.nul() && segment.data_size() == 0 {
            return;
        }

        let seq = segment.sequence();
        let expected = inner.rx_last.wrapping_add(1);
        if seq == expected {
            inner.rx_last = seq;
            if segment.data_size() > 0 {
                match segment.into_payload() {
                    Ok(frame) => deliver.push(frame),
                    Err(err) => warn!(seq, error = %err, "failed to strip header"),
                }
            }
            loop {
                let next = inner.rx_last.wrapping_add(1);
                match inner.out_of_order.remove(&next) {
                    Some(held) => {
                        inner.rx_last = next;
                        deliver.extend(held);
                    }
                    None => break,
                }
            }
            self.schedule_ack(inner);
            if !inner.out_of_order.is_empty() {
                inner.eack_now = true;
            }
        } else if seq_lt(seq, expected) {
            trace!(seq, expected, "duplicate segment");
            bump(&self.stats.duplicates);
            inner.ack_now = true;
        } else {
            let distance = seq.wrapping_sub(expected);
            if distance >= inner.params.max_outstanding {
                debug!(seq, expected, "segment beyond receive window, dropping");
                return;
            }
            if !inner.out_of_order.contains_key(&seq) {
                let held = if segment.data_size() > 0 {
                    match segment.into_payload() {
                        Ok(frame) => Some(frame),
                        Err(err) => {
                            warn!(seq, error = %err, "failed to strip header");
                            return;
                        }
                    }
                } else {
                    None
                };
                inner.out_of_order.insert(seq, held);
                bump(&self.stats.out_of_order);
                trace!(seq, expected, "buffered out-of-order segment");
            }
            inner.eack_now = true;
        }
        self.cond.notify_all();
    }

    fn handle_syn(&self, inner: &mut Inner, segment: &Data) {
        let params = match segment.syn_params() {
            Ok(params) => params,
            Err(err) => {
                warn!(error = %err, "SYN without parameters, dropping");
                return;
            }
        };
        if params.version != self.config.version {
            warn!(
                local = self.config.version,
                peer = params.version,
                "protocol version mismatch"
            );
            if inner.is_connected() {
                self.shutdown(inner, CloseReason::VersionMismatch, true);
            } else if let Ok(rst) = inner.build_rst() {
                inner.outbound.push_back(rst);
                self.cond.notify_all();
            }
            return;
        }

        let now = Instant::now();
        if self.config.server {
            if inner.is_connected() {
                if inner.is_stale_syn(segment.sequence()) {
                    trace!(seq = segment.sequence(), rx_last = inner.rx_last, "stale SYN");
                    inner.ack_now = true;
                    self.cond.notify_all();
                    return;
                }
                info!("peer reopened the connection");
                self.emit(ConnectionEvent::Closed(CloseReason::Reset));
            }

            let next_seq = inner.next_seq;
            *inner = Inner::new(&self.config);
            inner.next_seq = next_seq;
            inner.params = self.config.adopt(&params);
            inner.rx_last = segment.sequence();
            inner.peer_syn = Some(segment.sequence());
            inner.state = State::SynReceived;
            let announce = inner.params.clone();
            match inner.build_syn(&announce, now) {
                Ok(frame) => inner.outbound.push_back(frame),
                Err(err) => {
                    warn!(error = %err, "failed to build SYN+ACK");
                    return;
                }
            }
            debug!(connection_id = params.connection_id, "SYN received, answering");
            self.cond.notify_all();
            return;
        }

        match inner.state {
            State::SynSent => {
                let syn_seq = inner
                    .unacked
                    .front()
                    .filter(|pending| pending.syn)
                    .map(|pending| pending.seq);
                if !segment.ack() || Some(segment.acknowledge()) != syn_seq {
                    debug!("SYN does not acknowledge ours, ignoring");
                    return;
                }
                inner.params = self.config.adopt(&params);
                inner.rx_last = segment.sequence();
                inner.peer_syn = Some(segment.sequence());
                self.process_ack(inner, segment.acknowledge());
                self.establish(inner);
                inner.ack_now = true;
            }
            State::Established if inner.is_stale_syn(segment.sequence()) => {
                inner.ack_now = true;
                self.cond.notify_all();
            }
            _ => trace!(state = %inner.state, "unexpected SYN"),
        }
    }

    fn process_ack(&self, inner: &mut Inner, ack: u16) {
        let before = inner.unacked.len();
        inner.unacked.retain(|pending| !seq_le(pending.seq, ack));
        if inner.unacked.len() != before {
            trace!(ack, released = before - inner.unacked.len(), "segments acknowledged");
            self.cond.notify_all();
        }
    }

    fn schedule_ack(&self, inner: &mut Inner) {
        inner.ack_pending = inner.ack_pending.saturating_add(1);
        if inner.ack_pending >= inner.params.max_cumulative_ack {
            inner.ack_now = true;
        } else if inner.ack_deadline.is_none() {
            inner.ack_deadline = Some(Instant::now() + inner.params.cumulative_ack_timeout);
        }
    }

    #[cfg(test)]
    fn unacked(&self) -> Vec<u16> {
        self.inner.lock().unacked.iter().map(|pending| pending.seq).collect()
    }
}

impl FrameRx for Controller {
    fn accept_frame(&self, frame: Frame) {
        self.transport_rx(frame);
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("server", &self.config.server)
            .field("state", &self.state())
            .finish()
    }
}
