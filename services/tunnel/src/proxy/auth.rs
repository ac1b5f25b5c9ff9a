//! Shared-secret check on the `X-Pass` header.

use subtle::ConstantTimeEq;

use super::headers::RequestHead;
use crate::error::TunnelError;

/// Validates the optional shared secret.
///
/// An empty secret disables authentication.
#[derive(Clone, Default)]
pub struct Authenticator {
    secret: Vec<u8>,
}

impl Authenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Whether a secret is configured.
    pub fn is_enabled(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Check the request's `X-Pass` value.
    pub fn check(&self, head: &RequestHead) -> Result<(), TunnelError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let presented = head.pass();
        if presented.ct_eq(&self.secret).into() {
            Ok(())
        } else {
            Err(TunnelError::WrongPass)
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        RequestHead::new(raw.as_bytes().to_vec())
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let auth = Authenticator::default();
        assert!(!auth.is_enabled());
        assert!(auth.check(&head("GET / HTTP/1.1\r\n\r\n")).is_ok());
        assert!(auth.check(&head("X-Pass: anything\r\n\r\n")).is_ok());
    }

    #[test]
    fn test_matching_secret() {
        let auth = Authenticator::new("hunter2");
        assert!(auth.check(&head("X-Pass: hunter2\r\n\r\n")).is_ok());
    }

    #[test]
    fn test_wrong_or_missing_secret() {
        let auth = Authenticator::new("hunter2");
        for raw in [
            "X-Pass: hunter3\r\n\r\n",
            "X-Pass: hunter22\r\n\r\n",
            "X-Pass: \r\n\r\n",
            "GET / HTTP/1.1\r\n\r\n",
        ] {
            assert!(
                matches!(auth.check(&head(raw)), Err(TunnelError::WrongPass)),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", Authenticator::new("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
