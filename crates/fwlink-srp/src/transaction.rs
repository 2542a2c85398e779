use std::sync::Arc;

use bytes::Bytes;
use fwlink_stream::Frame;
use tracing::trace;

use crate::block::{Block, Completion};
use crate::codec::{Opcode, Request, Version, STATUS_OK};
use crate::error::{Result, SrpError};

/// One register request in flight, keyed by its block's index.
#[derive(Debug)]
pub struct Transaction {
    version: Version,
    block: Arc<Block>,
    opcode: Opcode,
    state: Completion,
}

impl Transaction {
    pub fn new(version: Version, block: Arc<Block>) -> Self {
        Self {
            version,
            block,
            opcode: Opcode::Read,
            state: Completion::Idle,
        }
    }

    pub fn id(&self) -> u32 {
        self.block.index()
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn state(&self) -> Completion {
        self.state
    }

    /// Point a reused transaction at the caller's block.
    pub(crate) fn rebind(&mut self, block: &Arc<Block>) {
        if !Arc::ptr_eq(&self.block, block) {
            self.block = Arc::clone(block);
        }
    }

    /// Prepare a new request and return the size of its wire form.
    pub fn init(&mut self, write: bool, posted: bool) -> Result<usize> {
        self.version.validate(self.block.address(), self.block.size())?;
        self.opcode = Opcode::from_flags(write, posted);
        self.state = Completion::Pending;
        self.block.set_completion(Completion::Pending);
        Ok(self.version.request_size(self.opcode, self.block.size()))
    }

    /// Serialize the request into `frame`.
    pub fn gen_frame(&self, frame: &mut Frame) -> Result<()> {
        let data = if self.opcode.is_write() {
            Bytes::from(self.block.data())
        } else {
            Bytes::new()
        };
        let request = Request {
            tid: self.id(),
            opcode: self.opcode,
            address: self.block.address(),
            size: self.block.size(),
            data,
        };
        let mut wire = Vec::with_capacity(self.version.request_size(self.opcode, request.size));
        self.version.encode_request(&request, &mut wire);
        frame.write(&wire)?;
        Ok(())
    }

    /// Complete the transaction from a reply frame.
    pub fn recv_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes();
        let reply = match self.version.decode_reply(&bytes) {
            Ok(reply) => reply,
            Err(err) => return Err(self.fail(err)),
        };
        if reply.status != STATUS_OK {
            return Err(self.fail(SrpError::Status(reply.status)));
        }
        // Default write replies carry no data; every other reply carries the block.
        let carries_data = self.opcode == Opcode::Read || self.version != Version::Default;
        if carries_data && reply.data.len() != self.block.size() {
            return Err(self.fail(SrpError::SizeMismatch {
                expected: self.block.size(),
                actual: reply.data.len(),
            }));
        }

        trace!(tid = self.id(), opcode = ?self.opcode, "transaction complete");
        self.state = Completion::Complete;
        if self.opcode.is_write() {
            self.block.set_completion(Completion::Complete);
        } else {
            self.block.complete_read(&reply.data);
        }
        Ok(())
    }

    /// Mark the transaction abandoned without a reply.
    pub fn expire(&mut self) {
        self.state = Completion::TimedOut;
        self.block.set_completion(Completion::TimedOut);
    }

    /// Mark a send that needs no reply as done.
    pub(crate) fn retire_posted(&mut self) {
        self.state = Completion::Complete;
        self.block.set_completion(Completion::Complete);
    }

    fn fail(&mut self, err: SrpError) -> SrpError {
        let status = match err {
            SrpError::Status(status) => status,
            _ => u32::MAX,
        };
        self.state = Completion::Failed(status);
        self.block.set_completion(Completion::Failed(status));
        err
    }
}

#[cfg(test)]
mod tests {
    use fwlink_stream::pool;

    use super::*;
    use crate::codec::STATUS_ADDRESS_ERROR;

    fn issue(transaction: &mut Transaction, write: bool) -> (Frame, Request) {
        let size = transaction.init(write, false).unwrap();
        let mut frame = pool::req_frame(size, 0);
        transaction.gen_frame(&mut frame).unwrap();
        assert_eq!(frame.payload(), size);
        let request = transaction
            .version
            .decode_request(&frame.to_bytes())
            .unwrap();
        (frame, request)
    }

    #[test]
    fn read_reply_fills_block() {
        let block = Block::new(9, 0x80, 4);
        let mut transaction = Transaction::new(Version::V3, Arc::clone(&block));
        let (_, request) = issue(&mut transaction, false);
        assert_eq!(block.completion(), Completion::Pending);

        let reply = Version::V3.encode_reply(&request, &[4, 3, 2, 1], STATUS_OK);
        transaction.recv_frame(&Frame::from_slice(&reply)).unwrap();
        assert_eq!(transaction.state(), Completion::Complete);
        assert_eq!(block.data(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn error_status_fails_block() {
        let block = Block::with_data(1, 0x0, &[0; 4]);
        let mut transaction = Transaction::new(Version::Default, Arc::clone(&block));
        let (_, request) = issue(&mut transaction, true);
        assert_eq!(request.opcode, Opcode::Write);

        let reply = Version::Default.encode_reply(&request, &[], STATUS_ADDRESS_ERROR);
        let err = transaction.recv_frame(&Frame::from_slice(&reply)).unwrap_err();
        assert!(matches!(err, SrpError::Status(STATUS_ADDRESS_ERROR)));
        assert_eq!(block.completion(), Completion::Failed(STATUS_ADDRESS_ERROR));
    }

    #[test]
    fn short_read_reply_is_a_size_mismatch() {
        let block = Block::new(2, 0x0, 8);
        let mut transaction = Transaction::new(Version::V0, Arc::clone(&block));
        let (_, request) = issue(&mut transaction, false);

        let reply = Version::V0.encode_reply(&request, &[0; 4], STATUS_OK);
        assert!(matches!(
            transaction.recv_frame(&Frame::from_slice(&reply)),
            Err(SrpError::SizeMismatch { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn misaligned_block_is_refused_before_sending() {
        let block = Block::new(3, 0x2, 4);
        let mut transaction = Transaction::new(Version::V0, block);
        assert!(matches!(
            transaction.init(false, false),
            Err(SrpError::UnsupportedAlignment { .. })
        ));
        assert_eq!(transaction.state(), Completion::Idle);
    }
}
