//! Explicit presence/absence container for operation data.

/// The data half of an operation state.
///
/// `Reply::None` means "nothing received yet"; it is distinct from a reply
/// whose value happens to be empty (`Reply::Some(vec![])`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Reply<T> {
    /// No data yet.
    #[default]
    None,
    /// Data received.
    Some(T),
}

impl<T> Reply<T> {
    /// Returns true if no data has been received.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns true if data has been received.
    pub fn is_some(&self) -> bool {
        matches!(self, Self::Some(_))
    }

    /// Borrows the value, if any.
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Some(value) => Some(value),
            Self::None => None,
        }
    }

    /// Converts `&Reply<T>` to `Reply<&T>`.
    pub fn as_ref(&self) -> Reply<&T> {
        match self {
            Self::Some(value) => Reply::Some(value),
            Self::None => Reply::None,
        }
    }

    /// Maps the contained value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Reply<U> {
        match self {
            Self::Some(value) => Reply::Some(f(value)),
            Self::None => Reply::None,
        }
    }

    /// Converts into an `Option`.
    pub fn into_option(self) -> Option<T> {
        self.into()
    }
}

impl<T> From<Option<T>> for Reply<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Some(v),
            None => Self::None,
        }
    }
}

impl<T> From<Reply<T>> for Option<T> {
    fn from(reply: Reply<T>) -> Self {
        match reply {
            Reply::Some(v) => Some(v),
            Reply::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_value_is_not_absence() {
        let fetched_empty: Reply<Vec<u8>> = Reply::Some(vec![]);
        let not_fetched: Reply<Vec<u8>> = Reply::None;
        assert!(fetched_empty.is_some());
        assert!(not_fetched.is_none());
        assert_ne!(fetched_empty, not_fetched);
    }

    #[test]
    fn test_map_and_get() {
        let reply = Reply::Some(2).map(|v| v * 10);
        assert_eq!(reply.get(), Some(&20));
        assert_eq!(Reply::<i32>::None.map(|v| v + 1), Reply::None);
    }

    #[test]
    fn test_option_conversions() {
        assert_eq!(Reply::from(Some(1)), Reply::Some(1));
        assert_eq!(Option::<i32>::from(Reply::None), None);
    }
}
