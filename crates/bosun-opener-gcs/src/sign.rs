//! Public, cookie-auth, and service-account-signed object URLs.

use std::time::Duration;

use anyhow::Result;
use base64::Engine as _;

use bosun_opener_core::{ObjectPath, OpenerError, SignedUrlOptions};

use crate::auth::ServiceAccountKey;

/// Public host serving GCS objects.
pub(crate) const PUBLIC_HOST: &str = "https://storage.googleapis.com";
/// Host serving objects behind browser cookie authentication.
pub(crate) const COOKIE_HOST: &str = "https://storage.cloud.google.com";

/// Build a URL for the object according to the options and available
/// credentials.
///
/// With `use_cookie_auth` the cookie-auth host is used. Without credentials
/// the plain public URL is returned. With a service-account key the legacy
/// query-string signature (`GoogleAccessId`/`Expires`/`Signature`) is
/// produced for a GET request; only `service_account` key material is
/// accepted for signing.
pub(crate) fn object_url(
    key: Option<&ServiceAccountKey>,
    path: &ObjectPath,
    opts: &SignedUrlOptions,
) -> Result<String> {
    if opts.use_cookie_auth {
        return Ok(format!("{COOKIE_HOST}/{}/{}", path.bucket, path.path));
    }
    let Some(key) = key else {
        return Ok(format!("{PUBLIC_HOST}/{}/{}", path.bucket, path.path));
    };
    signed_url(key, path, opts.expires)
}

fn signed_url(key: &ServiceAccountKey, path: &ObjectPath, expires: Duration) -> Result<String> {
    if key.key_type != "service_account" {
        return Err(OpenerError::Credentials(format!(
            "cannot sign URLs with {:?} key material, only service_account keys are supported",
            key.key_type
        ))
        .into());
    }

    let expires_at = chrono::Utc::now().timestamp() + expires.as_secs() as i64;
    let resource = format!("/{}/{}", path.bucket, path.path);
    let string_to_sign = format!("GET\n\n\n{expires_at}\n{resource}");

    let signature_b64url = jsonwebtoken::crypto::sign(
        string_to_sign.as_bytes(),
        &key.encoding_key()?,
        jsonwebtoken::Algorithm::RS256,
    )?;
    let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(signature_b64url)
        .map(|raw| base64::engine::general_purpose::STANDARD.encode(raw))?;

    Ok(format!(
        "{PUBLIC_HOST}{resource}?GoogleAccessId={}&Expires={expires_at}&Signature={}",
        percent_encode(&key.client_email),
        percent_encode(&signature),
    ))
}

/// Percent-encode a query value. Base64 `+` must not survive as a literal,
/// so the form-urlencoding `+`-for-space convention is not used here.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_covers_base64_alphabet() {
        assert_eq!(percent_encode("a+b/c=="), "a%2Bb%2Fc%3D%3D");
        assert_eq!(percent_encode("ci@example.com"), "ci%40example.com");
    }

    #[test]
    fn anonymous_and_cookie_urls() {
        let path = ObjectPath::parse("gs://b/p").unwrap();
        let url = object_url(None, &path, &SignedUrlOptions::default()).unwrap();
        assert_eq!(url, "https://storage.googleapis.com/b/p");

        let opts = SignedUrlOptions {
            use_cookie_auth: true,
            ..SignedUrlOptions::default()
        };
        let url = object_url(None, &path, &opts).unwrap();
        assert_eq!(url, "https://storage.cloud.google.com/b/p");
    }

    #[test]
    fn non_service_account_material_is_rejected() {
        let key = ServiceAccountKey {
            key_type: "authorized_user".to_owned(),
            client_email: "user@example.com".to_owned(),
            private_key: String::new(),
            token_uri: String::new(),
        };
        let path = ObjectPath::parse("gs://b/p").unwrap();
        let err = object_url(Some(&key), &path, &SignedUrlOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OpenerError>(),
            Some(OpenerError::Credentials(_))
        ));
    }
}
