//! Shared domain enumerations aligned with persisted database enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "blog_status", rename_all = "snake_case")]
pub enum BlogStatus {
    Draft,
    Published,
    Archived,
}

/// Audience a single blog is shared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "blog_visibility", rename_all = "snake_case")]
pub enum BlogVisibility {
    Public,
    Private,
}

/// Visibility filter applied to list queries.
///
/// `Public` selects published, publicly visible blogs; `Private` selects
/// everything else; `All` applies no filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListVisibility {
    #[default]
    Public,
    Private,
    All,
}

impl ListVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            ListVisibility::Public => "public",
            ListVisibility::Private => "private",
            ListVisibility::All => "all",
        }
    }

    pub fn is_public(self) -> bool {
        matches!(self, ListVisibility::Public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortField {
    #[default]
    #[serde(rename = "createdAt")]
    CreatedAt,
    #[serde(rename = "updatedAt")]
    UpdatedAt,
    #[serde(rename = "title")]
    Title,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
            SortField::Title => "title",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

macro_rules! display_and_parse {
    ($ty:ty, $label:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = DomainError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value.trim()))
                    .ok_or_else(|| DomainError::validation(format!("unknown {} `{value}`", $label)))
            }
        }
    };
}

display_and_parse!(
    ListVisibility,
    "visibility",
    [ListVisibility::Public, ListVisibility::Private, ListVisibility::All]
);
display_and_parse!(
    SortField,
    "sort field",
    [SortField::CreatedAt, SortField::UpdatedAt, SortField::Title]
);
display_and_parse!(SortOrder, "sort order", [SortOrder::Asc, SortOrder::Desc]);
