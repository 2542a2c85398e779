use std::sync::Arc;

use fwlink_stream::{Frame, FrameRx, FrameTx, Master, Worker};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::error::Result;

/// Per-connection endpoint of the reliable transport.
///
/// A worker pulls ready segments from the controller and pushes them into the
/// lower stage. The worker is stopped and joined before the endpoint releases
/// its controller.
pub struct Application {
    controller: Arc<Controller>,
    worker: Mutex<Option<Worker>>,
    master: Master,
}

impl Application {
    /// Wire `controller` above `lower` and start the transmit worker.
    pub fn new(controller: &Arc<Controller>, lower: Arc<dyn FrameTx>) -> Result<Arc<Self>> {
        let worker_controller = Arc::clone(controller);
        let worker = Worker::spawn("fwlink-rssi-tx", move |token| {
            while let Some(segment) = worker_controller.application_tx(&token) {
                if let Err(err) = lower.push_frame(segment) {
                    warn!(error = %err, "lower stage rejected segment");
                }
            }
        })?;

        let app = Arc::new(Self {
            controller: Arc::clone(controller),
            worker: Mutex::new(Some(worker)),
            master: Master::new(),
        });
        controller.set_slave(&app);
        Ok(app)
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Attach the stage that receives in-order data.
    pub fn set_slave<R: FrameRx + 'static>(&self, slave: &Arc<R>) {
        self.master.set_slave(slave);
    }

    /// Stop the transmit worker.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.token().cancel();
            self.controller.wake();
            worker.stop();
        }
    }
}

impl FrameTx for Application {
    fn accept_req(&self, size: usize, _zero_copy: bool) -> fwlink_stream::Result<Frame> {
        Ok(self.controller.req_frame(size))
    }

    fn push_frame(&self, frame: Frame) -> fwlink_stream::Result<()> {
        self.controller.application_rx(frame)?;
        Ok(())
    }
}

impl FrameRx for Application {
    fn accept_frame(&self, frame: Frame) {
        if !self.master.send_frame(frame) {
            debug!("no upper stage attached, frame dropped");
        }
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("controller", &self.controller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crossbeam::channel::{self, Sender};

    use super::*;
    use crate::config::RssiConfig;
    use crate::controller::{ConnectionEvent, State};
    use crate::error::CloseReason;

    struct Collector {
        tx: Sender<Frame>,
    }

    impl FrameRx for Collector {
        fn accept_frame(&self, frame: Frame) {
            let _ = self.tx.send(frame);
        }
    }

    /// Client and server controllers joined back to back through in-memory stages.
    fn connected() -> (Arc<Application>, Arc<Application>, Arc<Master>, Arc<Master>) {
        let to_server = Arc::new(Master::new());
        let to_client = Arc::new(Master::new());

        let client_ctrl = Controller::new(RssiConfig::default());
        let server_ctrl = Controller::new(RssiConfig {
            server: true,
            ..RssiConfig::default()
        });
        to_server.set_slave(&server_ctrl);
        to_client.set_slave(&client_ctrl);

        let client = Application::new(&client_ctrl, to_server.clone()).unwrap();
        let server = Application::new(&server_ctrl, to_client.clone()).unwrap();
        client_ctrl.open().unwrap();
        client_ctrl.wait_open(Duration::from_secs(2)).unwrap();
        server_ctrl.wait_open(Duration::from_secs(2)).unwrap();
        (client, server, to_server, to_client)
    }

    #[test]
    fn frames_flow_both_ways() {
        let (client, server, _a, _b) = connected();
        let (tx, from_client) = channel::unbounded();
        let server_sink = Arc::new(Collector { tx });
        server.set_slave(&server_sink);
        let (tx, from_server) = channel::unbounded();
        let client_sink = Arc::new(Collector { tx });
        client.set_slave(&client_sink);

        for i in 0..20u8 {
            let mut frame = client.accept_req(4, false).unwrap();
            frame.write(&[i; 4]).unwrap();
            client.push_frame(frame).unwrap();
        }
        server.push_frame(Frame::from_slice(b"reply")).unwrap();

        for i in 0..20u8 {
            let frame = from_client.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(frame.to_bytes().as_ref(), &[i; 4]);
        }
        let reply = from_server.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.to_bytes().as_ref(), b"reply");
    }

    #[test]
    fn drop_joins_worker_promptly() {
        let (client, server, _a, _b) = connected();
        let start = Instant::now();
        drop(client);
        drop(server);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn close_reaches_the_peer() {
        let (client, server, _a, _b) = connected();
        let events = server.controller().events();
        assert_eq!(events.recv().unwrap(), ConnectionEvent::Opened);

        client.controller().close();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, ConnectionEvent::Closed(CloseReason::Reset));
        assert_eq!(server.controller().state(), State::Reset);
        assert!(server.push_frame(Frame::from_slice(b"x")).is_err());
    }
}
