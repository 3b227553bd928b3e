//! Crawl entity models shared by the taintcrawl crates.
#![allow(missing_docs)]

pub mod entities;
pub mod error;
pub mod ids;
pub mod payload;
pub mod status;

pub use entities::{CrawlUrl, Domain, Session, Subject, Task, Worker};
pub use error::ModelError;
pub use ids::{DomainId, SessionId, SubjectId, UrlId, WorkerId};
pub use payload::{CaptureKind, PageType, SessionInformation, SubjectInfo};
pub use status::{
    CrawlingStatus, SessionStatus, SubjectStatus, SubjectType, WorkerStatus,
    WorkerType,
};
