//! Macros for defining typed keys and ids.

/// Macro to define a typed, ULID-backed id with a specific prefix.
///
/// Used for identifiers the engine synthesizes itself (there is no natural
/// key to derive them from). This generates a newtype wrapper around ULID
/// with:
/// - A `PREFIX` constant
/// - `new()` to generate a fresh id
/// - `parse()` to parse from string
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_id!(CombinedQueryId, "cq");
///
/// let id = CombinedQueryId::new();
/// let parsed: CombinedQueryId = "cq_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed, ULID-backed id.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this id type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new id with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses an id from a string in the format `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::KeyError> {
                if s.is_empty() {
                    return Err($crate::KeyError::Empty);
                }

                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err($crate::KeyError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::KeyError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let ulid = ulid_str
                    .parse::<$crate::Ulid>()
                    .map_err(|e| $crate::KeyError::InvalidUlid(e.to_string()))?;

                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Macro to define a typed, namespaced operation key.
///
/// The generated type wraps a validated `/`-separated namespace and provides:
/// - A `KIND` constant naming the operation kind (used in logs)
/// - `new()` which validates the namespace
/// - `as_str()`, `segments()` and `matches()` against a [`crate::KeyPattern`]
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_key!(QueryId, "query");
///
/// let id = QueryId::new("users/42")?;
/// assert!(id.matches(&"users/*".parse()?));
/// ```
#[macro_export]
macro_rules! define_key {
    ($name:ident, $kind:literal) => {
        /// A typed, namespaced operation key.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The operation kind this key addresses.
            pub const KIND: &'static str = $kind;

            /// Creates a key after validating its namespace.
            pub fn new(namespace: impl Into<String>) -> Result<Self, $crate::KeyError> {
                let namespace = namespace.into();
                $crate::validate_key(&namespace)?;
                Ok(Self(namespace))
            }

            /// Returns the namespace string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Iterates over the `/`-separated segments.
            pub fn segments(&self) -> impl Iterator<Item = &str> {
                self.0.split('/')
            }

            /// Returns true if this key is matched by `pattern`.
            #[must_use]
            pub fn matches(&self, pattern: &$crate::KeyPattern) -> bool {
                pattern.matches(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}
