use tokio::time::Instant;

/// Elapsed connected time of the current call.
///
/// Runs from the first transition into Connected until the call returns to
/// idle. Hold does not pause it.
#[derive(Debug, Default)]
pub struct DurationClock {
    started_at: Option<Instant>,
}

impl DurationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting a running clock keeps the original start.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Whole seconds since start, 0 when stopped.
    pub fn elapsed(&self) -> u64 {
        self.started_at
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0)
    }
}

/// Renders seconds as MM:SS; minutes keep counting past 59.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_counts_whole_seconds() {
        let mut clock = DurationClock::new();
        assert_eq!(clock.elapsed(), 0);
        clock.start();
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(clock.elapsed(), 2);

        // restart while running is ignored
        clock.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(clock.elapsed(), 3);

        clock.stop();
        assert!(!clock.is_running());
        assert_eq!(clock.elapsed(), 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3600), "60:00");
    }
}
