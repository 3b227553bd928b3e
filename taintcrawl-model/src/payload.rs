//! Typed views over the opaque JSON payloads carried by subjects and sessions.
//!
//! The store keeps `additional_information`, `session_information` and
//! `session_data` as free-form JSON objects owned by the execution layer.
//! Scheduling code only ever reads the handful of keys below, and every
//! accessor returns `None` (or an empty list) when a key is missing or has an
//! unexpected shape.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::error::{ModelError, Result};
use crate::ids::SubjectId;

const KEY_FORMURL: &str = "formurl";
const KEY_RELATED: &str = "related_subject";
const KEY_CAPTURE: &str = "type";
const KEY_PAGE_TYPE: &str = "page_type";
const KEY_MESSAGE: &str = "message";
const KEY_TIME: &str = "time";

/// When a screenshot capture is taken relative to the reconnaissance visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    /// Captured ahead of the first visit of a url.
    Before,
    /// Captured after the url and its children are complete.
    Afterwards,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Before => "screenshotBefore",
            CaptureKind::Afterwards => "screenshotAfterwards",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "screenshotBefore" => Some(CaptureKind::Before),
            "screenshotAfterwards" => Some(CaptureKind::Afterwards),
            _ => None,
        }
    }
}

/// Which page of a site a capture targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    LandingPage,
    LoginForm,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::LandingPage => "landing_page",
            PageType::LoginForm => "login_form",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "landing_page" => Some(PageType::LandingPage),
            // Older capture rows spelled the login page without separator.
            "login_form" | "loginform" => Some(PageType::LoginForm),
            _ => None,
        }
    }
}

/// Accessor over `Subject.additional_information`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct SubjectInfo(Map<String, Value>);

impl SubjectInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a stored payload. `null` is read as an empty object; any other
    /// non-object value is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(ModelError::InvalidPayload(format!(
                "additional_information must be an object, got {other}"
            ))),
        }
    }

    /// Same as [`SubjectInfo::from_value`] but degrades malformed payloads
    /// to an empty view instead of failing.
    pub fn from_value_lossy(value: Value) -> Self {
        Self::from_value(value).unwrap_or_default()
    }

    /// Payload describing a screenshot capture follow-up.
    pub fn capture(
        kind: CaptureKind,
        page_type: PageType,
        related: &[SubjectId],
    ) -> Self {
        let mut map = Map::new();
        map.insert(KEY_CAPTURE.into(), Value::from(kind.as_str()));
        map.insert(KEY_PAGE_TYPE.into(), Value::from(page_type.as_str()));
        map.insert(
            KEY_RELATED.into(),
            Value::Array(related.iter().map(|id| Value::from(id.0)).collect()),
        );
        Self(map)
    }

    /// Lookup fragment matched with JSON containment (`@>`) when checking
    /// whether a capture already exists.
    pub fn capture_probe(
        kind: CaptureKind,
        page_type: PageType,
        related: Option<SubjectId>,
    ) -> Value {
        let mut probe = json!({
            KEY_CAPTURE: kind.as_str(),
            KEY_PAGE_TYPE: page_type.as_str(),
        });
        if let (Some(id), Some(map)) = (related, probe.as_object_mut()) {
            map.insert(KEY_RELATED.into(), json!([id.0]));
        }
        probe
    }

    pub fn with_formurl(mut self, formurl: impl Into<String>) -> Self {
        self.0.insert(KEY_FORMURL.into(), Value::from(formurl.into()));
        self
    }

    /// Login-form address attached to the subject, if any.
    pub fn formurl(&self) -> Option<&str> {
        self.0
            .get(KEY_FORMURL)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Back-links to the subjects that spawned this one. Accepts a scalar id
    /// as well as an array; anything else reads as empty.
    pub fn related_subjects(&self) -> Vec<SubjectId> {
        match self.0.get(KEY_RELATED) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_i64)
                .map(SubjectId)
                .collect(),
            Some(Value::Number(n)) => {
                n.as_i64().map(SubjectId).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Append a back-link, normalising a scalar `related_subject` into an
    /// array. Duplicate ids are ignored.
    pub fn push_related(&mut self, id: SubjectId) {
        let mut related = self.related_subjects();
        if !related.contains(&id) {
            related.push(id);
        }
        self.0.insert(
            KEY_RELATED.into(),
            Value::Array(related.iter().map(|id| Value::from(id.0)).collect()),
        );
    }

    pub fn capture_kind(&self) -> Option<CaptureKind> {
        self.0
            .get(KEY_CAPTURE)
            .and_then(Value::as_str)
            .and_then(CaptureKind::parse)
    }

    pub fn page_type(&self) -> Option<PageType> {
        self.0
            .get(KEY_PAGE_TYPE)
            .and_then(Value::as_str)
            .and_then(PageType::parse)
    }

    /// Last recorded skip or failure reason.
    pub fn message(&self) -> Option<&str> {
        self.0.get(KEY_MESSAGE).and_then(Value::as_str)
    }

    /// Record a skip reason, keeping every other key.
    pub fn record_message(&mut self, message: &str, at: DateTime<Utc>) {
        self.0.insert(KEY_MESSAGE.into(), Value::from(message));
        self.0.insert(KEY_TIME.into(), Value::from(at.to_rfc3339()));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Accessor over `Session.session_information`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct SessionInformation(Value);

impl SessionInformation {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Landing page of the site the session is valid for.
    pub fn landing_page(&self) -> Option<&str> {
        self.lookup(&["landing_page", "landingpage"])
    }

    /// Address of the login form used to obtain the session.
    pub fn login_form(&self) -> Option<&str> {
        self.lookup(&["login_form", "loginform", "formurl"])
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn lookup(&self, keys: &[&str]) -> Option<&str> {
        let account = self.0.get("account").unwrap_or(&Value::Null);
        keys.iter()
            .find_map(|key| {
                self.0
                    .get(*key)
                    .or_else(|| account.get(*key))
                    .and_then(Value::as_str)
            })
            .filter(|s| !s.trim().is_empty())
    }
}
