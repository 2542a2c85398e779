use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fwlink_stream::{Frame, FrameRx, FrameTx};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::{Block, Completion};
use crate::codec::{Opcode, Version};
use crate::error::{Result, SrpError};
use crate::transaction::Transaction;

/// Host-side bridge tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub version: Version,
    /// How long `transact` waits for a reply.
    pub timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: Version::Default,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Issues register requests into a lower stage and matches replies back to
/// their transactions by id.
pub struct Bridge {
    config: BridgeConfig,
    lower: Arc<dyn FrameTx>,
    table: Mutex<HashMap<u32, Transaction>>,
    next_index: AtomicU32,
}

impl Bridge {
    pub fn new(lower: Arc<dyn FrameTx>, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            lower,
            table: Mutex::new(HashMap::new()),
            next_index: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn version(&self) -> Version {
        self.config.version
    }

    /// Ids of the transactions still waiting for a reply, ascending.
    pub fn outstanding(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Start a transaction on `block` without waiting for the reply.
    ///
    /// A block already in flight has its transaction reused. Posted writes are
    /// retired as soon as they are handed to the lower stage.
    pub fn do_transaction(&self, write: bool, posted: bool, block: &Arc<Block>) -> Result<()> {
        let posted = write && posted;
        let id = block.index();

        let (frame, retired) = {
            let mut table = self.table.lock();
            let transaction = table
                .entry(id)
                .or_insert_with(|| Transaction::new(self.config.version, Arc::clone(block)));
            transaction.rebind(block);

            let prepared = transaction.init(write, posted).and_then(|size| {
                let mut frame = self.lower.accept_req(size, true)?;
                transaction.gen_frame(&mut frame)?;
                Ok(frame)
            });
            match prepared {
                Ok(frame) => {
                    let retired = if posted { table.remove(&id) } else { None };
                    (frame, retired)
                }
                Err(err) => {
                    if let Some(mut stale) = table.remove(&id) {
                        stale.expire();
                    }
                    block.set_completion(Completion::Idle);
                    return Err(err);
                }
            }
        };

        debug!(tid = id, write, posted, size = frame.payload(), "sending request");
        if let Err(err) = self.lower.push_frame(frame) {
            if let Some(mut stale) = retired.or_else(|| self.table.lock().remove(&id)) {
                stale.expire();
            }
            block.set_completion(Completion::Idle);
            return Err(err.into());
        }
        if let Some(mut sent) = retired {
            sent.retire_posted();
        }
        Ok(())
    }

    /// Issue a transaction and wait for its reply.
    ///
    /// On timeout the transaction is removed from the table; a late reply is
    /// then discarded as unknown.
    pub fn transact(&self, write: bool, posted: bool, block: &Arc<Block>) -> Result<()> {
        self.do_transaction(write, posted, block)?;
        if !Opcode::from_flags(write, posted).expects_reply() {
            return Ok(());
        }
        match block.wait(self.config.timeout) {
            Err(SrpError::Timeout(after)) => {
                if let Some(mut expired) = self.table.lock().remove(&block.index()) {
                    expired.expire();
                }
                warn!(tid = block.index(), address = block.address(), "transaction timed out");
                Err(SrpError::Timeout(after))
            }
            other => other,
        }
    }

    /// Read `size` bytes at `address` through a fresh block.
    pub fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let block = Block::new(self.allocate_index(), address, size);
        self.transact(false, false, &block)?;
        Ok(block.data())
    }

    /// Write `data` at `address`; with `posted` no reply is awaited.
    pub fn write(&self, address: u64, data: &[u8], posted: bool) -> Result<()> {
        let block = Block::with_data(self.allocate_index(), address, data);
        self.transact(true, posted, &block)
    }

    fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }
}

impl FrameRx for Bridge {
    fn accept_frame(&self, frame: Frame) {
        let bytes = frame.to_bytes();
        let Some(tid) = self.config.version.extract_tid(&bytes) else {
            warn!(size = bytes.len(), "reply too short to carry a transaction id");
            return;
        };

        let transaction = self.table.lock().remove(&tid);
        let Some(mut transaction) = transaction else {
            warn!(tid, "reply for unknown transaction discarded");
            return;
        };
        if let Err(err) = transaction.recv_frame(&frame) {
            warn!(tid, error = %err, "transaction failed");
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("version", &self.config.version)
            .field("outstanding", &self.table.lock().len())
            .finish()
    }
}
