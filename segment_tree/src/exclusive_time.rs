use std::time::Duration;

use crate::{SegmentError, SegmentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TransitionKind {
    // Declaration order is the tie-break order: starts sort before stops.
    ChildStart,
    ChildStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Transition {
    time: Duration,
    kind: TransitionKind,
}

/// Computes a segment's self time: its duration minus the union of the time its
/// children were running.
///
/// Children may start before or run past their parent, and may overlap each
/// other. Only the portion of the union that falls inside the parent's window
/// is subtracted.
#[derive(Debug)]
pub struct ExclusiveTime {
    start: Duration,
    stop: Duration,
    transitions: Vec<Transition>,
}

impl ExclusiveTime {
    pub fn new(start: Duration, stop: Duration) -> SegmentResult<Self> {
        if start > stop {
            return Err(SegmentError::InvalidInterval { start, stop });
        }
        Ok(Self {
            start,
            stop,
            transitions: Vec::new(),
        })
    }

    pub fn add_child(&mut self, start: Duration, stop: Duration) -> SegmentResult<()> {
        if start > stop {
            log::trace!("cannot have child start {start:?} > stop {stop:?}");
            return Err(SegmentError::InvalidInterval { start, stop });
        }

        // Children entirely outside the parent's window cannot affect it.
        if stop < self.start || start > self.stop {
            return Ok(());
        }

        self.transitions.push(Transition {
            time: start,
            kind: TransitionKind::ChildStart,
        });
        self.transitions.push(Transition {
            time: stop,
            kind: TransitionKind::ChildStop,
        });
        Ok(())
    }

    pub fn calculate(mut self) -> Duration {
        self.transitions.sort_unstable();

        let mut exclusive_time = self.stop - self.start;
        let mut active_children: usize = 0;
        let mut last_start = self.start;

        for transition in &self.transitions {
            match transition.kind {
                TransitionKind::ChildStart => {
                    if active_children == 0 {
                        last_start = transition.time.max(self.start);
                    }
                    active_children += 1;
                }
                TransitionKind::ChildStop => {
                    if active_children == 0 {
                        log::warn!("child stopped, but no children were thought to be active");
                        continue;
                    }
                    if active_children == 1 {
                        let covered = transition.time.min(self.stop).saturating_sub(last_start);
                        if covered > exclusive_time {
                            log::debug!(
                                "attempted to subtract {covered:?} from exclusive time of {exclusive_time:?}"
                            );
                            exclusive_time = Duration::ZERO;
                            break;
                        }
                        exclusive_time -= covered;

                        // Sorted, so nothing after this can land inside the parent.
                        if transition.time > self.stop {
                            break;
                        }
                    }
                    active_children -= 1;
                }
            }
        }

        exclusive_time
    }
}
