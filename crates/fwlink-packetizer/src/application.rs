use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use fwlink_stream::{CancelToken, Frame, FrameRx, FrameTx, Master, StreamError, Worker};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::error::Result;

/// Per-channel endpoint of the packetizer.
///
/// Frames pushed from above wait in a bounded queue until the endpoint's
/// worker hands them to the controller; `push_frame` blocks while the queue is
/// full. Reassembled inbound frames are forwarded to the attached upper stage.
pub struct Application {
    channel: u8,
    controller: Arc<Controller>,
    queue: Sender<Frame>,
    token: CancelToken,
    worker: Mutex<Option<Worker>>,
    master: Master,
}

impl Application {
    /// Attach a new endpoint for `channel` to `controller` and start its worker.
    pub fn new(controller: &Arc<Controller>, channel: u8) -> Result<Arc<Self>> {
        let depth = controller.config().queue_depth.max(1);
        let (queue, pending) = channel::bounded(depth);

        let worker_controller = Arc::clone(controller);
        let worker = Worker::spawn(format!("fwlink-pack-{channel}"), move |token| {
            drain_queue(&worker_controller, &pending, channel, &token);
        })?;

        let app = Arc::new(Self {
            channel,
            controller: Arc::clone(controller),
            queue,
            token: worker.token().clone(),
            worker: Mutex::new(Some(worker)),
            master: Master::new(),
        });
        controller.register(channel, &app)?;
        Ok(app)
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Attach the stage that receives reassembled frames.
    pub fn set_slave<R: FrameRx + 'static>(&self, slave: &Arc<R>) {
        self.master.set_slave(slave);
    }

    /// Frames currently waiting for the worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop the worker. Frames still queued are discarded.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }
}

fn drain_queue(
    controller: &Controller,
    pending: &Receiver<Frame>,
    channel: u8,
    token: &CancelToken,
) {
    loop {
        crossbeam::select! {
            recv(pending) -> frame => match frame {
                Ok(frame) => {
                    if let Err(err) = controller.application_rx(frame, channel) {
                        warn!(channel, error = %err, "failed to forward frame");
                    }
                }
                Err(_) => return,
            },
            recv(token.signal()) -> _ => return,
        }
        if token.is_cancelled() {
            return;
        }
    }
}

impl FrameTx for Application {
    fn accept_req(&self, size: usize, _zero_copy: bool) -> fwlink_stream::Result<Frame> {
        Ok(self.controller.req_frame(size))
    }

    fn push_frame(&self, frame: Frame) -> fwlink_stream::Result<()> {
        if self.token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        crossbeam::select! {
            send(self.queue, frame) -> sent => sent.map_err(|_| StreamError::ConnectionClosed),
            recv(self.token.signal()) -> _ => Err(StreamError::Cancelled),
        }
    }
}

impl FrameRx for Application {
    fn accept_frame(&self, frame: Frame) {
        if !self.master.send_frame(frame) {
            debug!(channel = self.channel, "no upper stage attached, frame dropped");
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.stop();
        self.controller.unregister(self.channel);
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("channel", &self.channel)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use fwlink_stream::pool;

    use super::*;
    use crate::config::PacketizerConfig;
    use crate::error::PacketizerError;

    struct Collector {
        tx: Sender<Frame>,
    }

    impl FrameRx for Collector {
        fn accept_frame(&self, frame: Frame) {
            let _ = self.tx.send(frame);
        }
    }

    /// Lower stage that blocks every push until released.
    struct Gate {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl FrameTx for Gate {
        fn accept_req(&self, size: usize, _zero_copy: bool) -> fwlink_stream::Result<Frame> {
            Ok(pool::req_frame(size, 0))
        }

        fn push_frame(&self, _frame: Frame) -> fwlink_stream::Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }
    }

    #[test]
    fn frames_cross_between_controllers() {
        let wire = Arc::new(Master::new());
        let sender = Controller::new(wire.clone(), PacketizerConfig {
            max_packet_payload: 16,
            ..PacketizerConfig::default()
        });
        let receiver = Controller::new(Arc::new(Master::new()), PacketizerConfig::default());
        wire.set_slave(&receiver);

        let tx_app = Application::new(&sender, 3).unwrap();
        let rx_app = Application::new(&receiver, 3).unwrap();
        let (tx, rx) = channel::unbounded();
        let collector = Arc::new(Collector { tx });
        rx_app.set_slave(&collector);

        let payload: Vec<u8> = (0..100u8).collect();
        let mut frame = tx_app.accept_req(payload.len(), false).unwrap();
        frame.write(&payload).unwrap();
        tx_app.push_frame(frame).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.to_bytes().as_ref(), payload.as_slice());
        assert_eq!(sender.stats().snapshot().tx_packets, 7);
    }

    #[test]
    fn ninth_push_blocks_until_worker_drains() {
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let gate = Arc::new(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        let ctrl = Controller::new(gate, PacketizerConfig::default());
        let app = Application::new(&ctrl, 0).unwrap();

        // The worker takes the first frame and parks inside the lower stage.
        app.push_frame(Frame::from_slice(b"f0")).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        for i in 1..=8u8 {
            app.push_frame(Frame::from_slice(&[i])).unwrap();
        }
        assert_eq!(app.queued(), 8);

        let done = Arc::new(AtomicBool::new(false));
        let pusher = {
            let app = Arc::clone(&app);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                app.push_frame(Frame::from_slice(b"f9")).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        pusher.join().unwrap();
        assert!(done.load(Ordering::SeqCst));

        drop(release_tx);
        app.stop();
    }

    #[test]
    fn push_after_stop_is_cancelled() {
        let ctrl = Controller::new(Arc::new(Master::new()), PacketizerConfig::default());
        let app = Application::new(&ctrl, 1).unwrap();
        app.stop();
        assert!(matches!(
            app.push_frame(Frame::from_slice(b"late")),
            Err(StreamError::Cancelled)
        ));
    }

    #[test]
    fn channel_owned_by_one_application() {
        let ctrl = Controller::new(Arc::new(Master::new()), PacketizerConfig::default());
        let first = Application::new(&ctrl, 5).unwrap();
        assert!(matches!(
            Application::new(&ctrl, 5),
            Err(PacketizerError::ChannelInUse(5))
        ));

        drop(first);
        assert!(Application::new(&ctrl, 5).is_ok());
    }
}
