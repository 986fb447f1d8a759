use anyhow::Result;
use log::info;

use crate::producer::Producer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    Suspended,
    Resumed,
    Unchanged,
}

/// Single-threshold suspend/resume control over the producer. Suspends above
/// the threshold, resumes at or below it; there is no hysteresis band.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    enabled: bool,
    threshold: usize,
    suspended: bool,
}

impl BackpressureController {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self {
            enabled,
            threshold,
            suspended: false,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn update(
        &mut self,
        pending: usize,
        producer: &mut dyn Producer,
    ) -> Result<BackpressureAction> {
        if !self.enabled {
            return Ok(BackpressureAction::Unchanged);
        }

        if pending > self.threshold && !self.suspended {
            producer.suspend()?;
            self.suspended = true;
            info!(
                "[autoenc] {pending} frames pending (threshold {}); suspending producer",
                self.threshold
            );
            return Ok(BackpressureAction::Suspended);
        }

        if pending <= self.threshold && self.suspended {
            producer.resume()?;
            self.suspended = false;
            info!(
                "[autoenc] {pending} frames pending (threshold {}); resuming producer",
                self.threshold
            );
            return Ok(BackpressureAction::Resumed);
        }

        Ok(BackpressureAction::Unchanged)
    }

    /// Resumes a suspended producer regardless of pending count. Used when the
    /// loop stops so the producer is never left stopped.
    pub fn release(&mut self, producer: &mut dyn Producer) -> Result<()> {
        if self.suspended {
            producer.resume()?;
            self.suspended = false;
            info!("[autoenc] resuming producer before exit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BackpressureAction, BackpressureController};
    use crate::producer::Producer;
    use anyhow::Result;

    #[derive(Default)]
    struct CountingProducer {
        suspends: usize,
        resumes: usize,
    }

    impl Producer for CountingProducer {
        fn has_exited(&mut self) -> Result<bool> {
            Ok(false)
        }

        fn last_frame(&mut self) -> Result<Option<u64>> {
            Ok(None)
        }

        fn suspend(&mut self) -> Result<()> {
            self.suspends += 1;
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            self.resumes += 1;
            Ok(())
        }
    }

    #[test]
    fn suspends_once_above_and_resumes_once_at_threshold() {
        let mut producer = CountingProducer::default();
        let mut controller = BackpressureController::new(true, 315);

        let action = controller.update(316, &mut producer).expect("update");
        assert_eq!(action, BackpressureAction::Suspended);
        assert!(controller.is_suspended());
        assert_eq!(
            controller.update(400, &mut producer).expect("update"),
            BackpressureAction::Unchanged
        );
        assert_eq!(producer.suspends, 1);

        let action = controller.update(315, &mut producer).expect("update");
        assert_eq!(action, BackpressureAction::Resumed);
        for _ in 0..5 {
            assert_eq!(
                controller.update(315, &mut producer).expect("update"),
                BackpressureAction::Unchanged
            );
        }
        assert_eq!(producer.suspends, 1);
        assert_eq!(producer.resumes, 1);
        assert!(!controller.is_suspended());
    }

    #[test]
    fn disabled_controller_never_touches_producer() {
        let mut producer = CountingProducer::default();
        let mut controller = BackpressureController::new(false, 10);
        controller.update(1000, &mut producer).expect("update");
        controller.release(&mut producer).expect("release");
        assert_eq!(producer.suspends, 0);
        assert_eq!(producer.resumes, 0);
    }

    #[test]
    fn release_resumes_only_when_suspended() {
        let mut producer = CountingProducer::default();
        let mut controller = BackpressureController::new(true, 10);
        controller.release(&mut producer).expect("release");
        assert_eq!(producer.resumes, 0);

        controller.update(11, &mut producer).expect("update");
        controller.release(&mut producer).expect("release");
        assert_eq!(producer.resumes, 1);
        assert!(!controller.is_suspended());
    }
}
