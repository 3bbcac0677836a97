use std::collections::HashSet;

use serde::Deserialize;
use utoipa::ToSchema;

/// Required-permission expression: every `all_of` token must be held, and at
/// least one `one_of` token when the list is non-empty.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PermissionCheck {
    #[serde(default)]
    pub all_of: Vec<String>,
    #[serde(default)]
    pub one_of: Vec<String>,
}

impl PermissionCheck {
    pub fn all_of<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: tokens.into_iter().map(Into::into).collect(),
            one_of: Vec::new(),
        }
    }

    pub fn one_of<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: Vec::new(),
            one_of: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

/// Why a check failed. Holding no tokens at all is reported differently from
/// holding some but not the required ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    NoMembership,
    MissingRequired(String),
    MissingAnyOf(Vec<String>),
}

/// Decides allow/deny for a resolved permission set. Pure function of its
/// inputs.
pub fn evaluate(permissions: &HashSet<String>, check: &PermissionCheck) -> Result<(), Denial> {
    if permissions.is_empty() {
        return Err(Denial::NoMembership);
    }

    for token in &check.all_of {
        if !permissions.contains(token) {
            return Err(Denial::MissingRequired(token.clone()));
        }
    }

    if !check.one_of.is_empty() && !check.one_of.iter().any(|token| permissions.contains(token)) {
        return Err(Denial::MissingAnyOf(check.one_of.clone()));
    }

    Ok(())
}
