use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Result, SrpError};

/// Where the most recent transaction on a block stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "status")]
pub enum Completion {
    Idle,
    Pending,
    Complete,
    Failed(u32),
    TimedOut,
}

/// A register range on the device and the host copy of its contents.
///
/// The block index doubles as the transaction id, so a block has at most one
/// transaction in flight.
pub struct Block {
    index: u32,
    address: u64,
    size: usize,
    inner: Mutex<Inner>,
    changed: Condvar,
}

struct Inner {
    data: Vec<u8>,
    completion: Completion,
}

impl Block {
    pub fn new(index: u32, address: u64, size: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            address,
            size,
            inner: Mutex::new(Inner {
                data: vec![0; size],
                completion: Completion::Idle,
            }),
            changed: Condvar::new(),
        })
    }

    /// A block pre-loaded with the bytes a write should send.
    pub fn with_data(index: u32, address: u64, data: &[u8]) -> Arc<Self> {
        let block = Self::new(index, address, data.len());
        block.inner.lock().data.copy_from_slice(data);
        block
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.size {
            return Err(SrpError::SizeMismatch {
                expected: self.size,
                actual: data.len(),
            });
        }
        self.inner.lock().data.copy_from_slice(data);
        Ok(())
    }

    pub fn completion(&self) -> Completion {
        self.inner.lock().completion
    }

    pub(crate) fn set_completion(&self, completion: Completion) {
        self.inner.lock().completion = completion;
        self.changed.notify_all();
    }

    pub(crate) fn complete_read(&self, data: &[u8]) {
        {
            let mut inner = self.inner.lock();
            inner.data.copy_from_slice(data);
            inner.completion = Completion::Complete;
        }
        self.changed.notify_all();
    }

    /// Wait until the pending transaction resolves.
    ///
    /// Returns `Timeout` if it is still pending after `timeout`; the caller is
    /// responsible for retiring it.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.completion == Completion::Pending {
            if self.changed.wait_until(&mut inner, deadline).timed_out()
                && inner.completion == Completion::Pending
            {
                return Err(SrpError::Timeout(timeout));
            }
        }
        match inner.completion {
            Completion::Failed(status) => Err(SrpError::Status(status)),
            Completion::TimedOut => Err(SrpError::Timeout(timeout)),
            Completion::Idle | Completion::Pending | Completion::Complete => Ok(()),
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("completion", &self.completion())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn wait_returns_once_completed_elsewhere() {
        let block = Block::new(1, 0x10, 4);
        block.set_completion(Completion::Pending);

        let remote = Arc::clone(&block);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.complete_read(&[1, 2, 3, 4]);
        });

        block.wait(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(block.data(), vec![1, 2, 3, 4]);
        assert_eq!(block.completion(), Completion::Complete);
    }

    #[test]
    fn wait_times_out_while_pending() {
        let block = Block::new(2, 0, 4);
        block.set_completion(Completion::Pending);
        assert!(matches!(
            block.wait(Duration::from_millis(20)),
            Err(SrpError::Timeout(_))
        ));
    }

    #[test]
    fn failure_status_surfaces() {
        let block = Block::new(3, 0, 4);
        block.set_completion(Completion::Failed(7));
        assert!(matches!(block.wait(Duration::from_millis(5)), Err(SrpError::Status(7))));
    }

    #[test]
    fn set_data_checks_length() {
        let block = Block::with_data(4, 0, &[0xAA; 8]);
        assert!(block.set_data(&[0; 4]).is_err());
        assert_eq!(block.data(), vec![0xAA; 8]);
    }
}
