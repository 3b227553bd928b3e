//! Link discovery callback: filter the hrefs found on a visited page and
//! feed the survivors back through [`SubjectFactory`].

use std::collections::HashSet;
use std::sync::LazyLock;

use rand::seq::SliceRandom;
use regex::Regex;
use taintcrawl_config::LinkMaximum;
use taintcrawl_model::{SessionId, SubjectInfo, UrlId, WorkerId};
use tracing::{debug, warn};
use url::Url;

use super::{DiscoveryOutcome, SubjectFactory, UrlCandidate};
use crate::error::Result;

/// Links that would end the session they are visited with.
static LOGOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)log.?out|sign.?out|log.?off|sign.?off|exit|quit|invalidate|ab.?melden|aus.?loggen|ab.?meldung|verlassen|aus.?treten|annullieren",
    )
    .expect("logout pattern is valid")
});

/// Where a batch of links was found.
#[derive(Debug, Clone)]
pub struct LinkOrigin<'a> {
    /// Final address of the visited page; relative hrefs resolve against it.
    pub page_url: &'a str,
    /// Depth the new links get (parent depth + 1).
    pub depth: i32,
    pub parent: UrlId,
    pub worker: Option<WorkerId>,
    pub session: Option<SessionId>,
}

#[derive(Debug, Clone)]
pub struct LinkCollector {
    factory: SubjectFactory,
    maximum: LinkMaximum,
}

impl LinkCollector {
    pub fn new(factory: SubjectFactory, maximum: LinkMaximum) -> Self {
        Self { factory, maximum }
    }

    /// Admit the followable subset of `hrefs`. Returns how many of them
    /// produced new work. Addresses that fail to admit are logged and
    /// skipped; store failures abort the batch.
    pub async fn collect(
        &self,
        hrefs: &[String],
        origin: &LinkOrigin<'_>,
    ) -> Result<usize> {
        let links =
            select_links(hrefs, origin.page_url, origin.depth, &self.maximum);
        let mut scheduled = 0;
        for href in links {
            let candidate = UrlCandidate {
                href,
                depth: origin.depth,
                parent: Some(origin.parent),
                worker: origin.worker,
                session: origin.session,
                info: SubjectInfo::new(),
            };
            match self.factory.create(&candidate).await {
                Ok(outcome) => {
                    if outcome.scheduled_work() {
                        scheduled += 1;
                    }
                    if let DiscoveryOutcome::Ignored { url } = &outcome {
                        debug!(url = %url.id, "link beyond domain cap");
                    }
                }
                Err(err) if err.is_store_failure() && !err.is_transient() => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(href = %candidate.href, error = %err, "link not admitted");
                }
            }
        }
        Ok(scheduled)
    }
}

/// Pure selection step: depth cap, resolution, same-host filter, logout
/// filter, de-duplication, shuffle, per-page cap.
pub fn select_links(
    hrefs: &[String],
    page_url: &str,
    depth: i32,
    maximum: &LinkMaximum,
) -> Vec<String> {
    if let Some(max_depth) = maximum.depth
        && i64::from(depth) > i64::from(max_depth)
    {
        return Vec::new();
    }
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links: Vec<String> = hrefs
        .iter()
        .filter_map(|href| resolve_internal(href, &base))
        .filter(|link| !is_logout_link(link))
        .filter(|link| seen.insert(link.clone()))
        .collect();

    links.shuffle(&mut rand::rng());
    if let Some(page_cap) = maximum.page {
        links.truncate(page_cap as usize);
    }
    links
}

/// Resolve `href` against the page and keep it only if it is an http(s)
/// address on the page's host.
pub fn resolve_internal(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    if resolved.host_str() != base.host_str() {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

pub fn is_logout_link(href: &str) -> bool {
    LOGOUT_PATTERN.is_match(href)
}
