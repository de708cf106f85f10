use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PARAM: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("invalid token: {0}")]
    Malformed(&'static str),
    #[error("token expired")]
    Expired,
    #[error("token not valid yet")]
    NotYetValid,
    #[error("token issuer mismatch")]
    Issuer,
    #[error("token audience mismatch")]
    Audience,
    #[error("claims missing subject")]
    MissingSubject,
    #[error("verification cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

pub trait IdentityVerifier: Send + Sync {
    fn validate(&self, cancel: &CancellationToken, raw_token: &str) -> Result<Identity, AuthError>;
}

/// HS256 verifier. Issuer and audience are only enforced when configured.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
    issuer: Option<String>,
    audience: Option<String>,
    leeway: Duration,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str, leeway: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            issuer: non_empty(issuer),
            audience: non_empty(audience),
            leeway,
        }
    }

    pub fn mint(&self, subject: &str, ttl: Duration) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("sub".to_owned(), json!(subject));
        claims.insert("iat".to_owned(), json!(now));
        claims.insert("exp".to_owned(), json!(now + ttl.as_secs() as i64));
        if let Some(issuer) = &self.issuer {
            claims.insert("iss".to_owned(), json!(issuer));
        }
        if let Some(audience) = &self.audience {
            claims.insert("aud".to_owned(), json!(audience));
        }

        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({
            "alg": "HS256",
            "typ": "JWT"
        }))?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Value::Object(claims))?);
        let signing_input = format!("{header}.{payload}");
        let signature = self
            .mac(&signing_input)
            .map_err(|err| anyhow::anyhow!("failed signing token: {err}"))?
            .finalize()
            .into_bytes();
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    fn mac(&self, signing_input: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| AuthError::Malformed("unusable secret"))?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }

    fn verify_claims(&self, claims: &Map<String, Value>) -> Result<Identity, AuthError> {
        let now = chrono::Utc::now().timestamp() as f64;
        let leeway = self.leeway.as_secs_f64();

        if let Some(exp) = numeric_claim(claims, "exp")? {
            if now > exp + leeway {
                return Err(AuthError::Expired);
            }
        }
        for claim in ["nbf", "iat"] {
            if let Some(not_before) = numeric_claim(claims, claim)? {
                if now + leeway < not_before {
                    return Err(AuthError::NotYetValid);
                }
            }
        }
        if let Some(expected) = &self.issuer {
            if claims.get("iss").and_then(Value::as_str) != Some(expected.as_str()) {
                return Err(AuthError::Issuer);
            }
        }
        if let Some(expected) = &self.audience {
            let matched = match claims.get("aud") {
                Some(Value::String(aud)) => aud == expected,
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(expected.as_str())),
                _ => false,
            };
            if !matched {
                return Err(AuthError::Audience);
            }
        }

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if subject.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(Identity {
            user_id: subject.to_owned(),
        })
    }
}

impl IdentityVerifier for JwtVerifier {
    fn validate(
        &self,
        cancel: &CancellationToken,
        raw_token: &str,
    ) -> Result<Identity, AuthError> {
        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        let raw_token = raw_token.trim();
        if raw_token.is_empty() {
            return Err(AuthError::Missing);
        }

        let mut parts = raw_token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments"));
        };

        let header: Value = decode_segment(header_b64)?;
        if header.get("alg").and_then(Value::as_str) != Some("HS256") {
            return Err(AuthError::Malformed("unsupported signing method"));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed("signature encoding"))?;
        self.mac(&format!("{header_b64}.{payload_b64}"))?
            .verify_slice(&signature)
            .map_err(|_| AuthError::Invalid)?;

        let claims: Value = decode_segment(payload_b64)?;
        let Value::Object(claims) = claims else {
            return Err(AuthError::Malformed("claims must be an object"));
        };
        self.verify_claims(&claims)
    }
}

/// Pulls the raw token from an upgrade request: Authorization header first,
/// then the `token` query parameter, then the `token` cookie.
pub fn extract_token(request: &Request) -> Result<String, AuthError> {
    if let Some(header) = request.headers().get(AUTHORIZATION) {
        let header = header.to_str().map_err(|_| AuthError::Invalid)?;
        if !header.is_empty() {
            return parse_bearer(header);
        }
    }

    if let Some(query) = request.uri().query() {
        let token = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, value)| key == TOKEN_PARAM && !value.trim().is_empty())
            .map(|(_, value)| value.trim().to_owned());
        if let Some(token) = token {
            return Ok(token);
        }
    }

    for header in request.headers().get_all(COOKIE) {
        let Ok(cookies) = header.to_str() else {
            continue;
        };
        if let Some(token) = parse_cookie_value(cookies, TOKEN_PARAM) {
            return Ok(token.to_owned());
        }
    }

    Err(AuthError::Missing)
}

fn parse_bearer(header: &str) -> Result<String, AuthError> {
    let Some((scheme, token)) = header.split_once(' ') else {
        return Err(AuthError::Invalid);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Invalid);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Invalid);
    }
    Ok(token.to_owned())
}

fn parse_cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        let value = value.trim();
        (key.trim() == name && !value.is_empty()).then_some(value)
    })
}

fn decode_segment(segment: &str) -> Result<Value, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed("segment encoding"))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed("segment json"))
}

fn numeric_claim(
    claims: &Map<String, Value>,
    name: &'static str,
) -> Result<Option<f64>, AuthError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or(AuthError::Malformed("numeric date claim")),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::handshake::server::Request;
    use tokio_util::sync::CancellationToken;

    use super::{extract_token, AuthError, IdentityVerifier, JwtVerifier};

    fn verifier() -> JwtVerifier {
        JwtVerifier::new("devsecret", "", "", Duration::from_secs(5))
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Result<Request> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Ok(builder.body(())?)
    }

    fn forge(
        header: serde_json::Value,
        claims: serde_json::Value,
        secret: &str,
    ) -> Result<String> {
        use hmac::Mac;
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let input = format!("{header}.{claims}");
        let mut mac = <super::HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        mac.update(input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{input}.{sig}"))
    }

    #[test]
    fn minted_token_round_trips_to_identity() -> Result<()> {
        let verifier = verifier();
        let token = verifier.mint("user-2", Duration::from_secs(3600))?;
        let identity = verifier.validate(&CancellationToken::new(), &token)?;
        assert_eq!(identity.user_id, "user-2");
        Ok(())
    }

    #[test]
    fn rejects_wrong_secret_and_tampered_claims() -> Result<()> {
        let token = JwtVerifier::new("othersecret", "", "", Duration::ZERO)
            .mint("user-2", Duration::from_secs(60))?;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &token),
            Err(AuthError::Invalid)
        );

        let good = verifier().mint("user-2", Duration::from_secs(60))?;
        let mut parts: Vec<&str> = good.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"sub":"admin"}"#);
        parts[1] = &forged_claims;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &parts.join(".")),
            Err(AuthError::Invalid)
        );
        Ok(())
    }

    #[test]
    fn enforces_expiry_with_leeway() -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let within_leeway = forge(
            json!({"alg": "HS256", "typ": "JWT"}),
            json!({"sub": "u1", "exp": now - 2}),
            "devsecret",
        )?;
        assert!(verifier()
            .validate(&CancellationToken::new(), &within_leeway)
            .is_ok());

        let expired = forge(
            json!({"alg": "HS256", "typ": "JWT"}),
            json!({"sub": "u1", "exp": now - 60}),
            "devsecret",
        )?;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &expired),
            Err(AuthError::Expired)
        );

        let early = forge(
            json!({"alg": "HS256"}),
            json!({"sub": "u1", "nbf": now + 600}),
            "devsecret",
        )?;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &early),
            Err(AuthError::NotYetValid)
        );
        Ok(())
    }

    #[test]
    fn rejects_other_algorithms_and_missing_subject() -> Result<()> {
        let none_alg = forge(json!({"alg": "none"}), json!({"sub": "u1"}), "devsecret")?;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &none_alg),
            Err(AuthError::Malformed("unsupported signing method"))
        );

        let anonymous = forge(
            json!({"alg": "HS256"}),
            json!({"exp": 4102444800u64}),
            "devsecret",
        )?;
        assert_eq!(
            verifier().validate(&CancellationToken::new(), &anonymous),
            Err(AuthError::MissingSubject)
        );
        assert_eq!(
            verifier().validate(&CancellationToken::new(), "  "),
            Err(AuthError::Missing)
        );
        assert_eq!(
            verifier().validate(&CancellationToken::new(), "a.b"),
            Err(AuthError::Malformed("expected three segments"))
        );
        Ok(())
    }

    #[test]
    fn checks_issuer_and_audience_when_configured() -> Result<()> {
        let strict = JwtVerifier::new("devsecret", "relay", "clients", Duration::ZERO);
        let token = strict.mint("u1", Duration::from_secs(60))?;
        assert!(strict.validate(&CancellationToken::new(), &token).is_ok());

        let array_aud = forge(
            json!({"alg": "HS256"}),
            json!({"sub": "u1", "iss": "relay", "aud": ["other", "clients"]}),
            "devsecret",
        )?;
        assert!(strict.validate(&CancellationToken::new(), &array_aud).is_ok());

        let plain = verifier().mint("u1", Duration::from_secs(60))?;
        assert_eq!(
            strict.validate(&CancellationToken::new(), &plain),
            Err(AuthError::Issuer)
        );

        let wrong_aud = forge(
            json!({"alg": "HS256"}),
            json!({"sub": "u1", "iss": "relay", "aud": "nobody"}),
            "devsecret",
        )?;
        assert_eq!(
            strict.validate(&CancellationToken::new(), &wrong_aud),
            Err(AuthError::Audience)
        );
        Ok(())
    }

    #[test]
    fn cancelled_context_short_circuits() -> Result<()> {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let token = verifier().mint("u1", Duration::from_secs(60))?;
        assert_eq!(verifier().validate(&cancel, &token), Err(AuthError::Cancelled));
        Ok(())
    }

    #[test]
    fn extract_token_prefers_header_then_query_then_cookie() -> Result<()> {
        let all = request(
            "/ws?token=from-query",
            &[
                ("Authorization", "Bearer from-header"),
                ("Cookie", "token=from-cookie"),
            ],
        )?;
        assert_eq!(extract_token(&all)?, "from-header");

        let query_and_cookie = request("/ws?x=1&token=from-query", &[("Cookie", "token=c")])?;
        assert_eq!(extract_token(&query_and_cookie)?, "from-query");

        let cookie_only = request("/ws", &[("Cookie", "session=abc; token=from-cookie")])?;
        assert_eq!(extract_token(&cookie_only)?, "from-cookie");

        let bare = request("/ws", &[])?;
        assert_eq!(extract_token(&bare), Err(AuthError::Missing));
        Ok(())
    }

    #[test]
    fn malformed_authorization_header_does_not_fall_through() -> Result<()> {
        let basic = request("/ws?token=q", &[("Authorization", "Basic abc")])?;
        assert_eq!(extract_token(&basic), Err(AuthError::Invalid));

        let empty_bearer = request("/ws", &[("Authorization", "Bearer   ")])?;
        assert_eq!(extract_token(&empty_bearer), Err(AuthError::Invalid));

        let lowercase = request("/ws", &[("Authorization", "bearer abc")])?;
        assert_eq!(extract_token(&lowercase)?, "abc");
        Ok(())
    }
}
