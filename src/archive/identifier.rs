use std::{collections::HashMap, fmt, str::FromStr};

use async_trait::async_trait;
use axum::extract::{FromRequest, Path, RequestParts};
use sanitize_filename::is_sanitized;

use crate::error::{archive as ArchiveError, Error};

/// Name of a subdirectory of the source directory, taken from the request path.
///
/// The value is untrusted: it is used both as a path component and as a bundler argument,
/// so anything that could escape the source directory or be read as an option is rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identifier(String);

impl Identifier {
    fn is_valid(s: &str) -> bool {
        !s.is_empty()
            && !s.starts_with('-')
            && !s.contains(&['/', '\\'][..])
            && !s.chars().any(char::is_control)
            && is_sanitized(s)
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ArchiveError::InvalidIdentifier)
        }
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Requires the path param to be set to ":identifier".
#[async_trait]
impl<B: Send> FromRequest<B> for Identifier {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        Path::<HashMap<String, String>>::from_request(req)
            .await
            .map_err(|_| ArchiveError::InvalidIdentifier)?
            .0
            .get("identifier")
            .ok_or(ArchiveError::IdentifierExtract)?
            .parse()
    }
}
