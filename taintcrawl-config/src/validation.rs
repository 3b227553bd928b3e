//! Guard rails for crawler settings.

use crate::error::ConfigGuardRailError;
use crate::models::CrawlerConfig;

/// Non-fatal findings surfaced by [`CrawlerConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings {
    pub items: Vec<String>,
}

impl ConfigWarnings {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, message: impl Into<String>) {
        self.items.push(message.into());
    }
}

impl CrawlerConfig {
    /// Reject settings that break scheduling and collect the questionable
    /// ones as warnings.
    pub fn validate(&self) -> Result<ConfigWarnings, ConfigGuardRailError> {
        if self.scheduler.batch_limit == 0 {
            return Err(ConfigGuardRailError::ZeroBatchLimit);
        }
        for (field, value) in [
            ("session_secs", self.max_time.session_secs),
            ("domain_secs", self.max_time.domain_secs),
            ("subject_secs", self.max_time.subject_secs),
        ] {
            if value == 0 {
                return Err(ConfigGuardRailError::ZeroBudget { field });
            }
        }

        let mut warnings = ConfigWarnings::default();
        let grace = self.capture_grace_secs();
        if grace >= self.max_time.session_secs {
            warnings.push(format!(
                "screenshot_end_threshold_secs ({grace}) covers the whole session budget; \
                 sessions will only ever serve SCREENSHOT subjects"
            ));
        }
        if grace >= self.max_time.domain_secs {
            warnings.push(format!(
                "screenshot_end_threshold_secs ({grace}) covers the whole domain budget"
            ));
        }
        if self.sessions.screenshot_max_depth < 0
            && (self.sessions.screenshot_before
                || self.sessions.screenshot_afterwards)
        {
            warnings.push(
                "screenshot capture enabled but screenshot_max_depth < 0; no captures will be scheduled",
            );
        }
        if self.links.maximum.page == Some(0) {
            warnings.push("links.maximum.page = 0 disables link discovery");
        }
        if self.scheduler.forever && self.scheduler.poll_interval_secs.is_none()
        {
            warnings.push(
                "scheduler.forever has no effect without scheduler.poll_interval_secs",
            );
        }
        Ok(warnings)
    }
}
