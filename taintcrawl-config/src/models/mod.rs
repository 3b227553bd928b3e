//! Crawler configuration surface.
//!
//! Every section deserialises with `#[serde(default)]`, so a config file only
//! needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Top-level worker settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Caps on link discovery.
    pub links: LinkSettings,
    /// Timeouts handed to the execution layer.
    pub timeouts: TimeoutSettings,
    /// Wall-clock budgets enforced by the scheduler and the runtime.
    pub max_time: MaxTimeSettings,
    /// Screenshot capture scheduling.
    pub sessions: CaptureSettings,
    /// Grace window (seconds) reserved at the end of a session or domain
    /// budget for screenshot captures. While inside it only SCREENSHOT
    /// subjects are handed out. Default: 1800.
    pub screenshot_end_threshold_secs: u64,
    /// Dequeue batching, crash recovery and polling.
    pub scheduler: SchedulerSettings,
    /// External subject executor.
    pub executor: ExecutorSettings,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            links: LinkSettings::default(),
            timeouts: TimeoutSettings::default(),
            max_time: MaxTimeSettings::default(),
            sessions: CaptureSettings::default(),
            screenshot_end_threshold_secs: 1_800,
            scheduler: SchedulerSettings::default(),
            executor: ExecutorSettings::default(),
        }
    }
}

impl CrawlerConfig {
    /// Grace window applied before the session/domain budget when
    /// screenshot-after-visit is enabled; zero otherwise.
    pub fn capture_grace_secs(&self) -> u64 {
        if self.sessions.screenshot_afterwards {
            self.screenshot_end_threshold_secs
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkSettings {
    pub maximum: LinkMaximum,
}

/// Link caps. `None` disables the respective cap.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkMaximum {
    /// Urls admitted per domain before further urls are created as IGNORE.
    /// Default: 500.
    pub domain: Option<u32>,
    /// Links followed per visited page. Default: 500.
    pub page: Option<u32>,
    /// Deepest depth at which discovered links are still followed.
    /// Default: 1.
    pub depth: Option<u32>,
}

impl Default for LinkMaximum {
    fn default() -> Self {
        Self {
            domain: Some(500),
            page: Some(500),
            depth: Some(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Delay before a crashed browser is restarted. Default: 120.
    pub restart_secs: u64,
    /// Pause between two visits on the same site at depth > 0. Default: 2000.
    pub same_site_ms: u64,
    /// Budget for a single analysis module. Default: 10000.
    pub module_exec_ms: u64,
    /// Page navigation timeout. Default: 30000.
    pub navigation_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            restart_secs: 120,
            same_site_ms: 2_000,
            module_exec_ms: 10_000,
            navigation_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MaxTimeSettings {
    /// Lifetime of a session before its work is force-skipped.
    /// Default: 86400.
    pub session_secs: u64,
    /// Time since a domain's first visit before its work is force-skipped.
    /// Default: 86400.
    pub domain_secs: u64,
    /// Per-url budget passed to the execution layer. Default: 86400.
    pub url_secs: u64,
    /// Hard limit for executing one subject; the executor is killed after
    /// it. Default: 1200.
    pub subject_secs: u64,
}

impl Default for MaxTimeSettings {
    fn default() -> Self {
        Self {
            session_secs: 86_400,
            domain_secs: 86_400,
            url_secs: 86_400,
            subject_secs: 1_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Deepest url depth that still receives screenshot captures.
    /// Default: 0.
    pub screenshot_max_depth: i32,
    /// Capture a page before its first visit. Default: true.
    pub screenshot_before: bool,
    /// Capture a page once it and its children are complete. Default: true.
    pub screenshot_afterwards: bool,
    /// Also capture the login form of authenticated sessions. Default: true.
    pub include_loginpages: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            screenshot_max_depth: 0,
            screenshot_before: true,
            screenshot_afterwards: true,
            include_loginpages: true,
        }
    }
}

/// What happens to a worker's subject affinity when it is deregistered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashResetPolicy {
    /// Reset subjects lose their owner and the worker's pending affinity is
    /// released, so the global fallback hands them to anyone.
    #[default]
    ClearAffinity,
    /// Reset subjects keep pointing at the deregistered worker.
    RetainAffinity,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Subjects reserved per store round-trip. Default: 1.
    pub batch_limit: usize,
    /// Affinity handling on deregistration. Default: clear_affinity.
    pub crash_reset: CrashResetPolicy,
    /// Seconds to sleep before polling again when no work is available.
    /// `None` terminates the worker on the first empty poll. Default: None.
    pub poll_interval_secs: Option<u64>,
    /// Empty polls tolerated before terminating. Default: 1000.
    pub poll_max: u32,
    /// Keep polling indefinitely. Default: false.
    pub forever: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_limit: 1,
            crash_reset: CrashResetPolicy::default(),
            poll_interval_secs: None,
            poll_max: 1_000,
            forever: false,
        }
    }
}

/// External program that executes one subject per invocation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Executable path. Required to run a worker.
    pub program: Option<String>,
    /// Extra arguments passed before the subject payload.
    pub args: Vec<String>,
    /// Analysis module the executor should load.
    pub module: Option<String>,
}
