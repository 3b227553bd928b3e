//! Strongly typed row identifiers.
//!
//! Every entity table uses a `BIGSERIAL` key; the wrappers keep a subject id
//! from being passed where a url id is expected.

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "serde",
            derive(serde::Serialize, serde::Deserialize),
            serde(transparent)
        )]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
        pub struct $name(pub i64);

        impl $name {
            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Identifier of a [`crate::Domain`] row.
    DomainId
);
row_id!(
    /// Identifier of a [`crate::CrawlUrl`] row.
    UrlId
);
row_id!(
    /// Identifier of a [`crate::Session`] row.
    SessionId
);
row_id!(
    /// Identifier of a [`crate::Subject`] row.
    SubjectId
);
row_id!(
    /// Identifier of a registered [`crate::Worker`]; doubles as the
    /// scheduling affinity key stored on subjects.
    WorkerId
);
