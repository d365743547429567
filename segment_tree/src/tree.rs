use std::{ops::Index, time::Duration};

use crate::{Segment, SegmentError, SegmentId, SegmentResult};

/// One event of a depth first walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Enter(SegmentId),
    Exit(SegmentId),
}

/// Arena of every segment a transaction has started. Parent and child links
/// are arena indices, and nothing is freed until the whole tree is dropped.
#[derive(Debug, Clone)]
pub struct SegmentTree {
    segments: Vec<Segment>,
    root: SegmentId,
    discarded: usize,
}

impl SegmentTree {
    pub fn new(root: Segment) -> Self {
        Self {
            segments: vec![root],
            root: SegmentId(0),
            discarded: 0,
        }
    }

    pub fn root(&self) -> SegmentId {
        self.root
    }

    /// Segments that are part of the tree (started and not discarded).
    pub fn segment_count(&self) -> usize {
        self.segments.len() - self.discarded
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0).filter(|segment| !segment.discarded)
    }

    pub(crate) fn get_mut(&mut self, id: SegmentId) -> SegmentResult<&mut Segment> {
        self.segments
            .get_mut(id.0)
            .filter(|segment| !segment.discarded)
            .ok_or(SegmentError::UnknownSegment(id.0))
    }

    pub(crate) fn contains(&self, id: SegmentId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn insert(&mut self, mut segment: Segment, parent: SegmentId) -> SegmentId {
        let id = SegmentId(self.segments.len());
        segment.parent = Some(parent);
        self.segments.push(segment);
        self.segments[parent.0].children.add(id);
        id
    }

    /// True when `ancestor` is `id` itself or sits somewhere above it.
    pub fn is_ancestor_or_self(&self, ancestor: SegmentId, id: SegmentId) -> bool {
        let mut current = Some(id);
        // Bounded so a corrupted parent chain cannot spin forever.
        for _ in 0..=self.segments.len() {
            match current {
                Some(candidate) if candidate == ancestor => return true,
                Some(candidate) => current = self.get(candidate).and_then(Segment::parent),
                None => return false,
            }
        }
        false
    }

    /// Moves `id` under `new_parent`, at the end of its children.
    pub(crate) fn set_parent(&mut self, id: SegmentId, new_parent: SegmentId) -> SegmentResult<()> {
        if !self.contains(new_parent) {
            return Err(SegmentError::UnknownSegment(new_parent.0));
        }
        let old_parent = self.get_mut(id)?.parent;
        if old_parent == Some(new_parent) {
            return Ok(());
        }
        if self.is_ancestor_or_self(id, new_parent) {
            log::warn!("cannot set parent because it would introduce a cycle into the segment tree");
            return Err(SegmentError::Cycle);
        }

        if let Some(old_parent) = old_parent {
            self.segments[old_parent.0].children.remove(id);
        }
        self.segments[new_parent.0].children.add(id);
        self.segments[id.0].parent = Some(new_parent);
        Ok(())
    }

    /// Removes a non-root segment from the tree, handing its children to its
    /// parent.
    pub(crate) fn discard(&mut self, id: SegmentId) -> SegmentResult<()> {
        let parent = self.get_mut(id)?.parent.ok_or(SegmentError::RootSegment)?;

        let orphans: Vec<SegmentId> = self.segments[id.0].children.iter().collect();
        for orphan in orphans {
            self.set_parent(orphan, parent)?;
        }

        self.segments[parent.0].children.remove(id);
        let segment = &mut self.segments[id.0];
        segment.discarded = true;
        segment.parent = None;
        self.discarded += 1;
        Ok(())
    }

    /// Ends every segment that is still running, stopping the open ones at `now`.
    /// Returns how many had to be stopped.
    pub(crate) fn end_all(&mut self, now: Duration) -> usize {
        let mut stopped = 0;
        for segment in self.segments.iter_mut().filter(|segment| !segment.discarded) {
            if segment.stop.is_none() {
                segment.stop = Some(now.max(segment.start));
                stopped += 1;
            }
            segment.ended = true;
        }
        stopped
    }

    /// Depth first walk from the root, reporting each segment on the way down
    /// and again on the way back up. Every segment is entered at most once, so
    /// the walk terminates even if the links are malformed.
    pub fn walk(&self, mut visit: impl FnMut(Step)) {
        let mut visited = vec![false; self.segments.len()];
        let mut stack: Vec<(SegmentId, usize)> = Vec::with_capacity(16);

        visited[self.root.0] = true;
        visit(Step::Enter(self.root));
        stack.push((self.root, 0));

        while let Some((id, next_child)) = stack.last_mut() {
            let id = *id;
            match self.segments[id.0].children.get(*next_child) {
                Some(child) => {
                    *next_child += 1;
                    if child.0 < visited.len() && !visited[child.0] && self.contains(child) {
                        visited[child.0] = true;
                        visit(Step::Enter(child));
                        stack.push((child, 0));
                    }
                }
                None => {
                    stack.pop();
                    visit(Step::Exit(id));
                }
            }
        }
    }
}

impl Index<SegmentId> for SegmentTree {
    type Output = Segment;

    fn index(&self, id: SegmentId) -> &Self::Output {
        &self.segments[id.0]
    }
}
