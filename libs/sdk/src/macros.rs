//! Macros for defining typed numeric ID types.

/// Macro to define a typed ID backed by the job server's numeric identifier.
///
/// This generates a newtype wrapper around `i64` with:
/// - `new()` and `get()` accessors
/// - `is_unset()` for the zero sentinel the job server uses for "no record"
/// - `Display`, `From<i64>` and transparent serde support
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(JobId, "job");
///
/// let id = JobId::new(42);
/// assert_eq!(id.to_string(), "42");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        #[doc = concat!("Identifier of a ", $kind, " as assigned by the job server.")]
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Human-readable kind of resource this ID refers to.
            pub const KIND: &'static str = $kind;

            /// Wraps a raw identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw identifier.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }

            /// Returns true for the zero sentinel.
            #[must_use]
            pub const fn is_unset(&self) -> bool {
                self.0 == 0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}
