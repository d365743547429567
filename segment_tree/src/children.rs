use crate::SegmentId;

/// How many children a segment can hold before it spills onto the heap.
pub const INLINE_CHILDREN: usize = 8;

/// Child storage for a segment.
///
/// Most segments have only a handful of children, so the first
/// [`INLINE_CHILDREN`] live inside the segment itself. The first add past that
/// moves everything into a `Vec`, and the container stays there for the rest of
/// its life even if children are later removed.
#[derive(Debug, Clone)]
pub enum SegmentChildren {
    Inline {
        elements: [SegmentId; INLINE_CHILDREN],
        len: usize,
    },
    Heap(Vec<SegmentId>),
}

impl Default for SegmentChildren {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentChildren {
    pub fn new() -> Self {
        Self::Inline {
            elements: [SegmentId::default(); INLINE_CHILDREN],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Inline { len, .. } => *len,
            Self::Heap(elements) => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }

    pub fn get(&self, index: usize) -> Option<SegmentId> {
        self.as_slice().get(index).copied()
    }

    pub fn as_slice(&self) -> &[SegmentId] {
        match self {
            Self::Inline { elements, len } => &elements[..*len],
            Self::Heap(elements) => elements.as_slice(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.as_slice().iter().copied()
    }

    pub fn add(&mut self, child: SegmentId) {
        match self {
            Self::Inline { elements, len } if *len < INLINE_CHILDREN => {
                elements[*len] = child;
                *len += 1;
            }
            Self::Inline { elements, len } => {
                log::trace!("segment children spilling to the heap at {len} entries");
                let mut spilled = Vec::with_capacity(INLINE_CHILDREN * 2);
                spilled.extend_from_slice(&elements[..*len]);
                spilled.push(child);
                *self = Self::Heap(spilled);
            }
            Self::Heap(elements) => elements.push(child),
        }
    }

    /// Removes `child`, keeping the remaining children in order. Returns false
    /// when `child` was not present.
    pub fn remove(&mut self, child: SegmentId) -> bool {
        match self {
            Self::Inline { elements, len } => {
                let Some(position) = elements[..*len].iter().position(|c| *c == child) else {
                    return false;
                };
                elements.copy_within(position + 1..*len, position);
                *len -= 1;
                true
            }
            Self::Heap(elements) => match elements.iter().position(|c| *c == child) {
                Some(position) => {
                    elements.remove(position);
                    true
                }
                None => false,
            },
        }
    }
}
