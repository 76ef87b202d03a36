/// What the relay loop should do with the source side's reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Stop reading from the source until the destination drains
    PauseReads,
    /// Resume reading from the source
    ResumeReads,
    /// No edge crossed; keep doing whatever was happening
    Continue,
}

/// Hysteresis gate for one direction of a pairing.
///
/// Reads on the source pause once the destination's outbound buffer
/// reaches `max_pending` and resume only after it drains to
/// `min_pending` (0.8 × max). Both edges fire exactly once per
/// excursion; levels strictly between the thresholds never toggle
/// anything.
#[derive(Debug)]
pub struct Governor {
    max_pending: usize,
    min_pending: usize,
    paused: bool,
}

impl Governor {
    /// Create a governor with the configured high-water mark
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            min_pending: max_pending * 4 / 5,
            paused: false,
        }
    }

    /// High-water mark at which source reads pause
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Low-water mark at which source reads resume
    pub fn min_pending(&self) -> usize {
        self.min_pending
    }

    /// Whether source reads are currently paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Account a chunk landing in the destination buffer
    pub fn on_buffered(&mut self, pending: usize) -> Directive {
        if pending >= self.max_pending && !self.paused {
            self.paused = true;
            return Directive::PauseReads;
        }
        Directive::Continue
    }

    /// Account a completed write draining the destination buffer.
    ///
    /// A destination that is already closing never resumes its source;
    /// the pairing is tearing down and the reader has nowhere to go.
    pub fn on_drained(&mut self, pending: usize, closing: bool) -> Directive {
        if self.paused && !closing && pending <= self.min_pending {
            self.paused = false;
            return Directive::ResumeReads;
        }
        Directive::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_fires_once_at_high_water() {
        let mut governor = Governor::new(100);

        assert_eq!(governor.on_buffered(99), Directive::Continue);
        assert_eq!(governor.on_buffered(100), Directive::PauseReads);
        assert!(governor.is_paused());

        // Repeated over-threshold writes are idempotent
        assert_eq!(governor.on_buffered(150), Directive::Continue);
        assert_eq!(governor.on_buffered(100), Directive::Continue);
    }

    #[test]
    fn test_resume_only_at_or_below_low_water() {
        let mut governor = Governor::new(100);
        governor.on_buffered(100);

        // 80 is the low-water mark; anything strictly between stays paused
        assert_eq!(governor.on_drained(99, false), Directive::Continue);
        assert_eq!(governor.on_drained(81, false), Directive::Continue);
        assert!(governor.is_paused());

        assert_eq!(governor.on_drained(80, false), Directive::ResumeReads);
        assert!(!governor.is_paused());
        assert_eq!(governor.on_drained(0, false), Directive::Continue);
    }

    #[test]
    fn test_closing_destination_never_resumes() {
        let mut governor = Governor::new(50);
        governor.on_buffered(50);

        assert_eq!(governor.on_drained(0, true), Directive::Continue);
        assert!(governor.is_paused());
    }

    #[test]
    fn test_drain_without_pause_is_inert() {
        let mut governor = Governor::new(50);
        assert_eq!(governor.on_drained(0, false), Directive::Continue);
        assert!(!governor.is_paused());
    }

    #[test]
    fn test_full_excursion_cycle() {
        let mut governor = Governor::new(10);

        assert_eq!(governor.on_buffered(10), Directive::PauseReads);
        assert_eq!(governor.on_drained(8, false), Directive::ResumeReads);
        assert_eq!(governor.on_buffered(12), Directive::PauseReads);
        assert_eq!(governor.on_drained(7, false), Directive::ResumeReads);
    }
}
