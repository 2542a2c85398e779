use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::Result;
use crate::frame::Frame;
use crate::pool;

/// The downward face of a stage: where the stage above requests and pushes
/// outbound frames.
pub trait FrameTx: Send + Sync {
    /// Request a frame able to carry `size` payload bytes through this stage.
    fn accept_req(&self, size: usize, zero_copy: bool) -> Result<Frame>;

    /// Hand an outbound frame to this stage. May block for backpressure.
    fn push_frame(&self, frame: Frame) -> Result<()>;
}

/// The upward face of a stage: where the stage below delivers inbound frames.
pub trait FrameRx: Send + Sync {
    /// Accept an inbound frame. Failures are scoped to the frame and logged.
    fn accept_frame(&self, frame: Frame);
}

/// Outlet that forwards inbound frames to an attached upper stage.
///
/// The outlet only holds a weak reference so stacks never form reference
/// cycles; whoever assembles the stack keeps every stage alive.
#[derive(Default)]
pub struct Master {
    slave: RwLock<Option<Weak<dyn FrameRx>>>,
}

impl Master {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the stage that receives frames from this outlet.
    pub fn set_slave<S: FrameRx + 'static>(&self, slave: &Arc<S>) {
        let slave: Arc<dyn FrameRx> = slave.clone();
        *self.slave.write() = Some(Arc::downgrade(&slave));
    }

    /// Whether a live stage is attached.
    pub fn has_slave(&self) -> bool {
        self.slave
            .read()
            .as_ref()
            .is_some_and(|slave| slave.strong_count() > 0)
    }

    /// Deliver a frame to the attached stage. Returns `false` when nothing is
    /// attached and the frame was dropped.
    pub fn send_frame(&self, frame: Frame) -> bool {
        let slave = self.slave.read().as_ref().and_then(Weak::upgrade);
        match slave {
            Some(slave) => {
                slave.accept_frame(frame);
                true
            }
            None => {
                trace!(size = frame.payload(), "no slave attached, dropping frame");
                false
            }
        }
    }
}

/// A bare outlet doubles as an in-memory crossover: frames pushed into it are
/// delivered straight to the attached stage.
impl FrameTx for Master {
    fn accept_req(&self, size: usize, _zero_copy: bool) -> Result<Frame> {
        Ok(pool::req_frame(size, 0))
    }

    fn push_frame(&self, frame: Frame) -> Result<()> {
        self.send_frame(frame);
        Ok(())
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("attached", &self.has_slave())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Frame>>,
    }

    impl FrameRx for Collector {
        fn accept_frame(&self, frame: Frame) {
            self.frames.lock().push(frame);
        }
    }

    #[test]
    fn send_without_slave_drops() {
        let master = Master::new();
        assert!(!master.has_slave());
        assert!(!master.send_frame(Frame::from_slice(b"x")));
    }

    #[test]
    fn send_reaches_attached_slave() {
        let master = Master::new();
        let collector = Arc::new(Collector::default());
        master.set_slave(&collector);

        assert!(master.has_slave());
        assert!(master.send_frame(Frame::from_slice(b"abc")));

        let frames = collector.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_bytes().as_ref(), b"abc");
    }

    #[test]
    fn dropped_slave_is_detached() {
        let master = Master::new();
        let collector = Arc::new(Collector::default());
        master.set_slave(&collector);
        drop(collector);

        assert!(!master.has_slave());
        assert!(!master.send_frame(Frame::from_slice(b"abc")));
    }

    #[test]
    fn crossover_push_delivers() {
        let master = Master::new();
        let collector = Arc::new(Collector::default());
        master.set_slave(&collector);

        let mut frame = master.accept_req(4, false).unwrap();
        frame.write(b"ping").unwrap();
        master.push_frame(frame).unwrap();

        assert_eq!(collector.frames.lock()[0].to_bytes().as_ref(), b"ping");
    }
}
