//! Status and type enumerations stored as native Postgres enums.

use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $pg:literal {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
        #[cfg_attr(
            feature = "sqlx",
            sqlx(type_name = $pg, rename_all = "SCREAMING_SNAKE_CASE")
        )]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Database label of the variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($label => Ok(Self::$variant),)+
                    _ => Err(ModelError::UnknownVariant {
                        kind: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

labelled_enum!(
    /// Crawl progress of a [`crate::CrawlUrl`]. `Ignore` is terminal and only
    /// assigned at creation when the domain cap is exhausted.
    CrawlingStatus, "crawling_status" {
        Inactive => "INACTIVE",
        Processing => "PROCESSING",
        Complete => "COMPLETE",
        Ignore => "IGNORE",
    }
);

labelled_enum!(
    /// Lifecycle of a [`crate::Subject`].
    SubjectStatus, "subject_status" {
        Unvisited => "UNVISITED",
        Processing => "PROCESSING",
        Visited => "VISITED",
        Skip => "SKIP",
    }
);

labelled_enum!(
    /// Kind of work a [`crate::Subject`] represents.
    SubjectType, "subject_type" {
        Reconnaissance => "RECONNAISSANCE",
        Verification => "VERIFICATION",
        CxssVerification => "CXSS_VERIFICATION",
        Screenshot => "SCREENSHOT",
    }
);

labelled_enum!(
    /// Whether new work may still be scheduled against a [`crate::Session`].
    SessionStatus, "session_status" {
        Active => "ACTIVE",
        Unlocked => "UNLOCKED",
    }
);

labelled_enum!(
    WorkerStatus, "worker_status" {
        Active => "ACTIVE",
        Finished => "FINISHED",
    }
);

labelled_enum!(
    /// What a worker process drives: a full browser or a plain URL fetcher.
    WorkerType, "worker_type" {
        Browser => "BROWSER",
        Url => "URL",
    }
);

impl SubjectStatus {
    /// `true` while the subject still counts as outstanding work.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, SubjectStatus::Unvisited | SubjectStatus::Processing)
    }
}

impl CrawlingStatus {
    /// `true` while the url still blocks completion of its parent.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, CrawlingStatus::Inactive | CrawlingStatus::Processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_case_insensitively() {
        assert_eq!(
            "cxss_verification".parse::<SubjectType>().unwrap(),
            SubjectType::CxssVerification
        );
        assert_eq!(
            "Unlocked".parse::<SessionStatus>().unwrap(),
            SessionStatus::Unlocked
        );
        assert!("bogus".parse::<WorkerType>().is_err());
    }

    #[test]
    fn outstanding_states() {
        assert!(SubjectStatus::Unvisited.is_outstanding());
        assert!(!SubjectStatus::Skip.is_outstanding());
        assert!(CrawlingStatus::Inactive.is_outstanding());
        assert!(!CrawlingStatus::Ignore.is_outstanding());
    }
}
