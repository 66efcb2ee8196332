/// Retransmit trigger for a flow writer: fires with exponentially growing
/// spacing while acknowledgments fail to arrive, and reports exhaustion after
/// [`MAX_CYCLES`] raises so the writer can give up on the peer.
///
/// The trigger is tick-counted, not wall-clock based: one tick per `manage`
/// call of the owning writer.

pub const MAX_CYCLES: u8 = 8;

const INITIAL_THRESHOLD: u32 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerOutcome {
    /// nothing to do this tick
    Idle,
    /// retransmit the repeatable backlog
    Raise,
    /// all cycles elapsed without ack progress
    Exhausted,
}

#[derive(Debug)]
pub struct RepeatTrigger {
    running: bool,
    tick: u32,
    threshold: u32,
    cycle: u8,
}

impl RepeatTrigger {
    pub fn new() -> RepeatTrigger {
        RepeatTrigger {
            running: false,
            tick: 0,
            threshold: INITIAL_THRESHOLD,
            cycle: 0,
        }
    }

    /// Arm the trigger if it is not running yet. Does not disturb the backoff
    /// of an already-running trigger.
    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            self.reset();
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Restart the backoff after ack progress, keeping the trigger armed.
    pub fn reset(&mut self) {
        self.tick = 0;
        self.threshold = INITIAL_THRESHOLD;
        self.cycle = 0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn cycle(&self) -> u8 {
        self.cycle
    }

    #[must_use]
    pub fn on_tick(&mut self) -> TriggerOutcome {
        if !self.running {
            return TriggerOutcome::Idle;
        }

        self.tick += 1;
        if self.tick < self.threshold {
            return TriggerOutcome::Idle;
        }

        self.tick = 0;
        self.threshold *= 2;
        self.cycle += 1;
        if self.cycle > MAX_CYCLES {
            self.running = false;
            return TriggerOutcome::Exhausted;
        }
        TriggerOutcome::Raise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_when_stopped() {
        let mut trigger = RepeatTrigger::new();
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
    }

    #[test]
    fn test_raises_with_doubling_spacing_then_exhausts() {
        let mut trigger = RepeatTrigger::new();
        trigger.start();

        let mut outcomes = Vec::new();
        for _ in 0..2000 {
            let outcome = trigger.on_tick();
            if outcome != TriggerOutcome::Idle {
                outcomes.push(outcome);
            }
            if outcome == TriggerOutcome::Exhausted {
                break;
            }
        }

        assert_eq!(outcomes.len(), MAX_CYCLES as usize + 1);
        assert!(outcomes[..MAX_CYCLES as usize]
            .iter()
            .all(|o| *o == TriggerOutcome::Raise));
        assert_eq!(*outcomes.last().unwrap(), TriggerOutcome::Exhausted);
        assert!(!trigger.is_running());
    }

    #[test]
    fn test_reset_restores_backoff() {
        let mut trigger = RepeatTrigger::new();
        trigger.start();

        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Raise);
        assert_eq!(trigger.cycle(), 1);

        trigger.reset();
        assert_eq!(trigger.cycle(), 0);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Raise);
    }

    #[test]
    fn test_start_does_not_disturb_running_backoff() {
        let mut trigger = RepeatTrigger::new();
        trigger.start();
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Raise);

        trigger.start();
        // the second cycle waits four ticks, the re-start must not reset it
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Idle);
        assert_eq!(trigger.on_tick(), TriggerOutcome::Raise);
    }
}
