use std::time::Duration;

/// Parameter validation failures. None of these mutate the tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("no segment handle was supplied")]
    NullHandle,

    #[error("start {start:?} is after stop {stop:?}")]
    InvalidInterval { start: Duration, stop: Duration },

    #[error("segment belongs to a different transaction")]
    WrongTransaction,

    #[error("segment {0} does not exist in this transaction")]
    UnknownSegment(usize),

    #[error("segment has already ended")]
    AlreadyEnded,

    #[error("reparenting would introduce a cycle into the segment tree")]
    Cycle,

    #[error("the root segment cannot be discarded")]
    RootSegment,

    #[error("transaction is no longer recording")]
    NotRecording,
}

pub type SegmentResult<T> = Result<T, SegmentError>;
