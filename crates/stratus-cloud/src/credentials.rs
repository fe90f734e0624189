//! API credentials and their stable identity

use std::fmt;

use aws_lc_rs::digest;

/// An API token used to authenticate against the cloud API
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap a raw API token. Surrounding whitespace is trimmed, since
    /// tokens read from secrets commonly carry a trailing newline.
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            token: token.as_ref().trim().to_string(),
        }
    }

    /// The raw token, for the Authorization header
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stable identity of these credentials: hex SHA-256 of the token.
    ///
    /// Used to key per-account state without holding the token itself.
    pub fn identity(&self) -> String {
        let hash = digest::digest(&digest::SHA256, self.token.as_bytes());
        hash.as_ref()
            .iter()
            .fold(String::with_capacity(64), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_ignores_whitespace() {
        let a = Credentials::new("abc123");
        let b = Credentials::new("abc123\n");
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity().len(), 64);
    }

    #[test]
    fn different_tokens_have_different_identities() {
        assert_ne!(
            Credentials::new("token-a").identity(),
            Credentials::new("token-b").identity()
        );
    }

    #[test]
    fn debug_output_never_contains_token() {
        let creds = Credentials::new("super-secret");
        assert!(!format!("{creds:?}").contains("super-secret"));
    }
}
