/// Bearer-token authentication for the HTTP API.
///
/// When `API_KEY` is unset, auth is disabled and every request passes.
use crate::errors::DaemonError;
use hyper::{Body, Request};

pub struct AuthGate {
    api_key: Option<String>,
}

impl AuthGate {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }

    pub fn check(&self, req: &Request<Body>) -> Result<(), DaemonError> {
        let Some(expected) = &self.api_key else {
            return Ok(());
        };
        let provided = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_token);

        match provided {
            Some(token) if &token == expected => Ok(()),
            _ => Err(DaemonError::Unauthorized),
        }
    }
}

fn parse_bearer_token(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let scheme = parts.next()?.to_ascii_lowercase();
    if scheme != "bearer" {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_no_api_key_configured() {
        let gate = AuthGate::new(None);
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(gate.check(&req).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        let gate = AuthGate::new(Some("secret".to_string()));
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(gate.check(&req).is_err());

        let req = Request::builder()
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert!(gate.check(&req).is_err());
    }

    #[test]
    fn accepts_matching_bearer_token() {
        let gate = AuthGate::new(Some("secret".to_string()));
        let req = Request::builder()
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert!(gate.check(&req).is_ok());
    }
}
