/// Default cap on segments in a transaction trace.
pub const DEFAULT_TRACE_LIMIT: usize = 2000;
/// Default cap on span events per transaction.
pub const DEFAULT_SPAN_LIMIT: usize = 1000;

/// Output caps applied when a transaction is finalized. A limit of 0 turns that
/// output off entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingLimits {
    pub trace_limit: usize,
    pub span_limit: usize,
}

impl Default for SamplingLimits {
    fn default() -> Self {
        Self {
            trace_limit: DEFAULT_TRACE_LIMIT,
            span_limit: DEFAULT_SPAN_LIMIT,
        }
    }
}

impl SamplingLimits {
    pub fn new(trace_limit: usize, span_limit: usize) -> Self {
        Self {
            trace_limit,
            span_limit,
        }
    }

    pub fn with_trace_limit(mut self, trace_limit: usize) -> Self {
        self.trace_limit = trace_limit;
        self
    }

    pub fn with_span_limit(mut self, span_limit: usize) -> Self {
        self.span_limit = span_limit;
        self
    }

    pub fn traces_enabled(&self) -> bool {
        0 < self.trace_limit
    }

    pub fn spans_enabled(&self) -> bool {
        0 < self.span_limit
    }
}

#[cfg(test)]
mod test {
    use super::SamplingLimits;

    #[test]
    fn defaults_and_setters() {
        let limits = SamplingLimits::default();
        assert_eq!(SamplingLimits::new(2000, 1000), limits);
        assert!(limits.traces_enabled() && limits.spans_enabled());

        let spans_off = limits.with_span_limit(0).with_trace_limit(5);
        assert_eq!(5, spans_off.trace_limit);
        assert!(spans_off.traces_enabled());
        assert!(!spans_off.spans_enabled());
    }
}
