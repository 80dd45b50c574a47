//! Write and read sessions held by a worker

use std::time::{Duration, Instant};
use tierio_common::{BlockId, Error, Result, SessionId, WriteRequest};
use tierio_storage::{BlockReader, BlockWriter};

/// Lifecycle of a block write on this worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Allocating,
    Streaming,
    Committing,
    Committed,
    Aborted,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Allocating => "allocating",
            Self::Streaming => "streaming",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    const fn can_move_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Opened, Self::Allocating)
            | (Self::Allocating, Self::Streaming)
            | (Self::Streaming, Self::Committing)
            | (Self::Committing, Self::Committed) => true,
            (from, Self::Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One client writing one block
#[derive(Debug)]
pub struct WriteSession {
    id: SessionId,
    block_id: BlockId,
    request: WriteRequest,
    state: SessionState,
    writer: Option<BlockWriter>,
    deadline: Instant,
}

impl WriteSession {
    #[must_use]
    pub fn new(id: SessionId, block_id: BlockId, request: WriteRequest, deadline: Instant) -> Self {
        Self {
            id,
            block_id,
            request,
            state: SessionState::Opened,
            writer: None,
            deadline,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub const fn request(&self) -> &WriteRequest {
        &self.request
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes accepted so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.writer.as_ref().map_or(0, BlockWriter::written)
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(Error::InvalidSessionState {
                session: self.id,
                state: self.state.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Fail unless the session is in `expected`
    pub fn expect(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidSessionState {
                session: self.id,
                state: self.state.as_str(),
            })
        }
    }

    pub fn attach(&mut self, writer: BlockWriter) {
        self.writer = Some(writer);
    }

    pub fn writer_mut(&mut self) -> Result<&mut BlockWriter> {
        let (id, state) = (self.id, self.state.as_str());
        self.writer
            .as_mut()
            .ok_or(Error::InvalidSessionState { session: id, state })
    }

    pub fn take_writer(&mut self) -> Option<BlockWriter> {
        self.writer.take()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now >= self.deadline
    }

    pub fn extend(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}

/// An open read handle; holds the block pinned until dropped
#[derive(Debug)]
pub struct ReadSession {
    pub(crate) reader: BlockReader,
    pub(crate) position: u64,
    deadline: Instant,
}

impl ReadSession {
    #[must_use]
    pub const fn new(reader: BlockReader, position: u64, deadline: Instant) -> Self {
        Self {
            reader,
            position,
            deadline,
        }
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.reader.block_id()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn extend(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}
