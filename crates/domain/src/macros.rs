//! Macro for implementing string conversions on status enums
//!
//! Every status and kind enum in the domain is persisted as a lowercase string
//! column. This macro generates `as_str`, `Display` and `FromStr` from a single
//! variant table so the database mapping and the serde representation never
//! drift apart.
//!
//! # Example
//!
//! ```rust
//! use tillsync_domain::impl_status_strings;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum Phase {
//!     Draft,
//!     Live,
//! }
//!
//! impl_status_strings!(Phase {
//!     Draft => "draft",
//!     Live => "live",
//! });
//!
//! assert_eq!(Phase::Live.as_str(), "live");
//! assert_eq!("DRAFT".parse::<Phase>().unwrap(), Phase::Draft);
//! ```

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum.
///
/// Parsing is case-insensitive and surrounding whitespace is ignored. Unknown
/// values produce [`TillSyncError::InvalidInput`](crate::TillSyncError) naming
/// the enum.
#[macro_export]
macro_rules! impl_status_strings {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl $enum_name {
            /// Canonical lowercase representation.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = $crate::TillSyncError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err($crate::TillSyncError::InvalidInput(format!(
                        "invalid {}: {}",
                        stringify!($enum_name),
                        s
                    ))),
                }
            }
        }
    };
}
