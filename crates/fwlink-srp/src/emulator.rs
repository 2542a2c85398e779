use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use fwlink_stream::{CancelToken, Frame, FrameRx, FrameTx, Worker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{Request, Version, STATUS_ADDRESS_ERROR, STATUS_OK};
use crate::error::Result;

/// Device side of the register protocol backed by an in-memory address space.
///
/// Requests are served on the emulator's own worker so that replies never
/// block the thread delivering inbound frames.
pub struct MemoryEmulator {
    version: Version,
    space: Arc<Space>,
    requests: Sender<Bytes>,
    worker: Mutex<Option<Worker>>,
}

struct Space {
    base: u64,
    memory: Mutex<Vec<u8>>,
    served: AtomicU64,
}

impl Space {
    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.memory.lock().len()).then_some(start..end)
    }

    /// Apply `request` and return the read data and status.
    ///
    /// A failed access replies with no data whatever size was asked for.
    fn execute(&self, request: &Request) -> (Vec<u8>, u32) {
        let Some(range) = self.range(request.address, request.size) else {
            return (Vec::new(), STATUS_ADDRESS_ERROR);
        };
        let mut memory = self.memory.lock();
        if request.opcode.is_write() {
            memory[range].copy_from_slice(&request.data);
            (Vec::new(), STATUS_OK)
        } else {
            (memory[range].to_vec(), STATUS_OK)
        }
    }
}

impl MemoryEmulator {
    /// Serve `size` bytes of zeroed memory starting at `base`, replying through `lower`.
    pub fn new(
        lower: Arc<dyn FrameTx>,
        version: Version,
        base: u64,
        size: usize,
    ) -> Result<Arc<Self>> {
        let space = Arc::new(Space {
            base,
            memory: Mutex::new(vec![0; size]),
            served: AtomicU64::new(0),
        });
        let (requests, pending) = channel::unbounded();

        let worker_space = Arc::clone(&space);
        let worker = Worker::spawn("fwlink-srp-emu", move |token| {
            serve(&worker_space, version, lower.as_ref(), &pending, &token);
        })?;

        Ok(Arc::new(Self {
            version,
            space,
            requests,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Requests answered so far, posted writes included.
    pub fn served(&self) -> u64 {
        self.space.served.load(Ordering::Relaxed)
    }

    /// Copy of `len` bytes at `address`, or `None` outside the emulated range.
    pub fn peek(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let range = self.space.range(address, len)?;
        Some(self.space.memory.lock()[range].to_vec())
    }

    /// Overwrite memory at `address`; returns false outside the emulated range.
    pub fn poke(&self, address: u64, data: &[u8]) -> bool {
        match self.space.range(address, data.len()) {
            Some(range) => {
                self.space.memory.lock()[range].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }
}

fn serve(
    space: &Space,
    version: Version,
    lower: &dyn FrameTx,
    pending: &Receiver<Bytes>,
    token: &CancelToken,
) {
    loop {
        crossbeam::select! {
            recv(pending) -> msg => {
                let Ok(bytes) = msg else { return };
                if let Err(err) = answer(space, version, lower, &bytes) {
                    warn!(error = %err, "request not answered");
                }
            }
            recv(token.signal()) -> _ => return,
        }
    }
}

fn answer(space: &Space, version: Version, lower: &dyn FrameTx, bytes: &[u8]) -> Result<()> {
    let request = version.decode_request(bytes)?;
    let (data, status) = space.execute(&request);
    space.served.fetch_add(1, Ordering::Relaxed);
    trace!(
        tid = request.tid,
        opcode = ?request.opcode,
        address = request.address,
        size = request.size,
        status,
        "request executed"
    );
    if !request.opcode.expects_reply() {
        return Ok(());
    }

    let reply = version.encode_reply(&request, &data, status);
    let mut frame = lower.accept_req(reply.len(), true)?;
    frame.write(&reply)?;
    lower.push_frame(frame)?;
    Ok(())
}

impl FrameRx for MemoryEmulator {
    fn accept_frame(&self, frame: Frame) {
        if self.requests.send(frame.to_bytes()).is_err() {
            debug!("emulator stopped, request dropped");
        }
    }
}

impl Drop for MemoryEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MemoryEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEmulator")
            .field("version", &self.version)
            .field("base", &format_args!("{:#x}", self.space.base))
            .field("served", &self.served())
            .finish()
    }
}
