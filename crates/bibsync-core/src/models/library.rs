//! Library model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Kinds of locally owned libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomLibraryKind {
    MyLibrary,
}

/// Identifies a library: the user's own library or a shared group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryIdentifier {
    Custom(CustomLibraryKind),
    Group(i64),
}

impl LibraryIdentifier {
    /// The user's private library.
    pub const MY_LIBRARY: Self = Self::Custom(CustomLibraryKind::MyLibrary);

    /// Stable storage key (`u` for the custom library, `g<id>` for groups).
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Custom(CustomLibraryKind::MyLibrary) => "u".to_string(),
            Self::Group(id) => format!("g{id}"),
        }
    }

    #[must_use]
    pub const fn group_id(&self) -> Option<i64> {
        match self {
            Self::Group(id) => Some(*id),
            Self::Custom(_) => None,
        }
    }

    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }
}

impl fmt::Display for LibraryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

impl FromStr for LibraryIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "u" {
            return Ok(Self::MY_LIBRARY);
        }
        s.strip_prefix('g')
            .and_then(|id| id.parse::<i64>().ok())
            .map(Self::Group)
            .ok_or_else(|| Error::InvalidInput(format!("Invalid library identifier: {s}")))
    }
}

/// A library record with its access-control flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub identifier: LibraryIdentifier,
    pub name: String,
    /// Server version of the group record (0 for the custom library).
    pub version: i64,
    pub metadata_editable: bool,
    pub files_editable: bool,
}

impl Library {
    /// The always-editable custom library.
    #[must_use]
    pub fn my_library() -> Self {
        Self {
            identifier: LibraryIdentifier::MY_LIBRARY,
            name: "My Library".to_string(),
            version: 0,
            metadata_editable: true,
            files_editable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_identifier_key_roundtrip() {
        for identifier in [LibraryIdentifier::MY_LIBRARY, LibraryIdentifier::Group(42)] {
            let parsed: LibraryIdentifier = identifier.as_key().parse().unwrap();
            assert_eq!(parsed, identifier);
        }
    }

    #[test]
    fn library_identifier_rejects_garbage() {
        assert!("x12".parse::<LibraryIdentifier>().is_err());
        assert!("g".parse::<LibraryIdentifier>().is_err());
    }

    #[test]
    fn my_library_is_editable() {
        let library = Library::my_library();
        assert!(library.metadata_editable);
        assert!(library.files_editable);
        assert!(!library.identifier.is_group());
    }
}
