//! Ordered field-alias lookup over loosely shaped upstream JSON.
//!
//! Upstream services disagree on key names for the same datum. Each datum is
//! described by a [`FieldAliases`] table: candidate paths tried in priority
//! order, first present non-empty string wins.

use serde_json::Value;

/// One candidate location, as a list of object keys from the root.
pub type FieldPath = &'static [&'static str];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAliases {
    pub name: &'static str,
    pub candidates: &'static [FieldPath],
}

impl FieldAliases {
    pub const fn new(name: &'static str, candidates: &'static [FieldPath]) -> Self {
        Self { name, candidates }
    }

    /// First candidate that resolves to a non-empty string.
    pub fn first_str<'a>(&self, root: &'a Value) -> Option<&'a str> {
        self.candidates
            .iter()
            .find_map(|path| lookup(root, path).and_then(non_empty_str))
    }

    /// First candidate that resolves to any non-null value.
    pub fn first_value<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.candidates
            .iter()
            .find_map(|path| lookup(root, path).filter(|value| !value.is_null()))
    }

    /// Human-readable list of the candidate paths, for error messages.
    pub fn describe(&self) -> String {
        self.candidates
            .iter()
            .map(|path| path.join("."))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, key| current.get(*key))
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|text| !text.trim().is_empty())
}

/// Write URL of a signed-upload response.
pub const SIGNED_URL: FieldAliases = FieldAliases::new(
    "signed_url",
    &[
        &["signed_url"],
        &["upload_url"],
        &["signedUrl"],
        &["uploadUrl"],
        &["url"],
    ],
);

/// Read URL of a signed-upload response.
pub const FILE_URL: FieldAliases = FieldAliases::new(
    "file_url",
    &[
        &["resource_url"],
        &["file_url"],
        &["download_url"],
        &["fileUrl"],
        &["downloadUrl"],
        &["public_url"],
        &["publicUrl"],
    ],
);
