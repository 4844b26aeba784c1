//! Typed detail payloads.
//!
//! The envelope leaves its detail payload as raw JSON. Once the router has
//! matched the event type it calls [`decode_detail`] with the shape that
//! type requires. Every field is a string on the wire and defaults to empty.
//! An explicit `null` payload decodes to the all-empty shape; an absent one
//! is an error.

use crate::event::{struct_json, DecodeError, StructJson};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::value::RawValue;

/// A detail structure that can be decoded from an envelope payload.
pub trait DetailShape: DeserializeOwned + Default {
    /// Name used in decode errors and logs
    const SHAPE: &'static str;
}

/// Details of a `LOGIN` client event.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoginDetails {
    pub auth_method: String,
    pub auth_type: String,
    /// Keycloak sends this as `response_type`, not `code`.
    pub response_type: String,
    pub redirect_uri: String,
    pub consent: String,
    pub code_id: String,
    pub username: String,
    pub response_mode: String,
}

/// Details of a `REGISTER` client event.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegisterDetails {
    pub auth_method: String,
    pub auth_type: String,
    pub register_method: String,
    pub first_name: String,
    pub last_name: String,
    pub redirect_uri: String,
    pub code_id: String,
    pub email: String,
    pub username: String,
}

/// Details of a `VERIFY_EMAIL` client event.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyEmailDetails {
    pub auth_method: String,
    pub token_id: String,
    pub action: String,
    pub response_type: String,
    pub redirect_uri: String,
    pub remember_me: String,
    pub consent: String,
    pub code_id: String,
    pub email: String,
    pub response_mode: String,
    pub username: String,
}

impl VerifyEmailDetails {
    /// The identity provider sends the flag as the string `"true"`.
    pub fn remember_me(&self) -> bool {
        self.remember_me.eq_ignore_ascii_case("true")
    }
}

/// Who performed an admin operation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub realm_id: String,
    pub client_id: String,
    pub user_id: String,
    pub ip_address: String,
}

impl DetailShape for LoginDetails {
    const SHAPE: &'static str = "login";
}

impl DetailShape for RegisterDetails {
    const SHAPE: &'static str = "register";
}

impl DetailShape for VerifyEmailDetails {
    const SHAPE: &'static str = "verify-email";
}

impl DetailShape for AuthDetails {
    const SHAPE: &'static str = "admin-auth";
}

/// A decoded detail payload, tagged by the event type that selected it.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailPayload {
    Login(LoginDetails),
    Register(RegisterDetails),
    VerifyEmail(VerifyEmailDetails),
    AdminAuth(AuthDetails),
}

impl DetailPayload {
    /// Shape name of the decoded payload, for logs
    pub fn shape(&self) -> &'static str {
        match self {
            DetailPayload::Login(_) => LoginDetails::SHAPE,
            DetailPayload::Register(_) => RegisterDetails::SHAPE,
            DetailPayload::VerifyEmail(_) => VerifyEmailDetails::SHAPE,
            DetailPayload::AdminAuth(_) => AuthDetails::SHAPE,
        }
    }
}

/// Decode a raw detail payload into the shape `T`.
///
/// `event_type` is only used to describe a missing payload. Anything other
/// than a JSON object or `null` is malformed.
pub fn decode_detail<T: DetailShape>(
    raw: Option<&RawValue>,
    event_type: &str,
) -> Result<T, DecodeError> {
    let raw = raw.ok_or_else(|| DecodeError::MissingDetail {
        event_type: event_type.to_string(),
    })?;

    let malformed = |source: serde_json::Error| DecodeError::Detail {
        shape: T::SHAPE,
        source,
    };

    match struct_json(raw.get().as_bytes()).map_err(malformed)? {
        StructJson::Null => Ok(T::default()),
        StructJson::Object => serde_json::from_str(raw.get()).map_err(malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn test_decode_register_details() {
        let payload = raw(
            r#"{"auth_method":"openid-connect","register_method":"form",
                "first_name":"Ada","last_name":"Lovelace",
                "email":"ada@example.com","username":"ada"}"#,
        );

        let details: RegisterDetails = decode_detail(Some(&payload), "REGISTER").unwrap();
        assert_eq!(details.first_name, "Ada");
        assert_eq!(details.last_name, "Lovelace");
        assert_eq!(details.email, "ada@example.com");
        assert_eq!(details.register_method, "form");
        assert!(details.code_id.is_empty());
    }

    #[test]
    fn test_decode_verify_email_details() {
        let payload = raw(r#"{"action":"verify-email","remember_me":"true","email":"a@b.com"}"#);
        let details: VerifyEmailDetails = decode_detail(Some(&payload), "VERIFY_EMAIL").unwrap();
        assert_eq!(details.action, "verify-email");
        assert!(details.remember_me());
    }

    #[test]
    fn test_decode_auth_details() {
        let payload = raw(r#"{"realmId":"master","clientId":"admin-cli","userId":"root","ipAddress":"127.0.0.1"}"#);
        let details: AuthDetails = decode_detail(Some(&payload), "DELETE").unwrap();
        assert_eq!(details.client_id, "admin-cli");
        assert_eq!(details.user_id, "root");
    }

    #[test]
    fn test_missing_detail() {
        let err = decode_detail::<LoginDetails>(None, "LOGIN").unwrap_err();
        assert!(matches!(err, DecodeError::MissingDetail { ref event_type } if event_type == "LOGIN"));
    }

    #[test]
    fn test_malformed_detail() {
        // Non-string value for a string field
        let payload = raw(r#"{"first_name": 12}"#);
        let err = decode_detail::<RegisterDetails>(Some(&payload), "REGISTER").unwrap_err();
        assert!(matches!(err, DecodeError::Detail { shape: "register", .. }));

        let payload = raw(r#""oops""#);
        let err = decode_detail::<VerifyEmailDetails>(Some(&payload), "VERIFY_EMAIL").unwrap_err();
        assert!(matches!(err, DecodeError::Detail { shape: "verify-email", .. }));
    }

    #[test]
    fn test_array_detail_is_malformed() {
        // Would otherwise fill auth_method, auth_type, ... by position
        let payload = raw(r#"["not", "an", "object"]"#);
        let err = decode_detail::<LoginDetails>(Some(&payload), "LOGIN").unwrap_err();
        assert!(matches!(err, DecodeError::Detail { shape: "login", .. }));

        let payload = raw(r#"["openid-connect", "form", "A", "B"]"#);
        let err = decode_detail::<RegisterDetails>(Some(&payload), "REGISTER").unwrap_err();
        assert!(matches!(err, DecodeError::Detail { shape: "register", .. }));

        let payload = raw("[]");
        let err = decode_detail::<AuthDetails>(Some(&payload), "DELETE").unwrap_err();
        assert!(matches!(err, DecodeError::Detail { shape: "admin-auth", .. }));
    }

    #[test]
    fn test_null_detail_is_zero_valued() {
        let payload = raw("null");
        let login: LoginDetails = decode_detail(Some(&payload), "LOGIN").unwrap();
        assert_eq!(login, LoginDetails::default());

        let auth: AuthDetails = decode_detail(Some(&payload), "DELETE").unwrap();
        assert!(auth.user_id.is_empty());
    }

    #[test]
    fn test_payload_shape() {
        assert_eq!(DetailPayload::Login(LoginDetails::default()).shape(), "login");
        assert_eq!(DetailPayload::AdminAuth(AuthDetails::default()).shape(), "admin-auth");
    }
}
