//! Outbound header construction for gateway calls.

use std::borrow::Cow;
use std::fmt::Write as _;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::PipeError;

pub const METADATA_HEADER: &str = "x-portkey-metadata";
pub const USER_NAME_HEADER: &str = "x-openwebui-user-name";
pub const USER_ID_HEADER: &str = "x-openwebui-user-id";
pub const USER_EMAIL_HEADER: &str = "x-openwebui-user-email";
pub const USER_ROLE_HEADER: &str = "x-openwebui-user-role";
pub const CHAT_ID_HEADER: &str = "x-openwebui-chat-id";

/// Sent as `User-Agent` on every gateway call.
pub const CLIENT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// One identity value exactly as the host supplied it.
///
/// Strings forward as-is; numbers and booleans keep their JSON type in the
/// metadata header and are stringified for the `X-OpenWebUI-*` headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserField(Value);

impl UserField {
    /// Text form used for plain header values.
    pub fn as_text(&self) -> Cow<'_, str> {
        match &self.0 {
            Value::String(s) => Cow::Borrowed(s),
            other => Cow::Owned(other.to_string()),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<String> for UserField {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl From<&str> for UserField {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<Value> for UserField {
    fn from(v: Value) -> Self {
        Self(v)
    }
}

/// Identity of the user on whose behalf a request is made.
///
/// Every field is optional; the host may supply any subset. Unknown keys
/// are ignored and `null` counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct UserInfo {
    #[serde(default)]
    pub name: Option<UserField>,
    #[serde(default)]
    pub id: Option<UserField>,
    #[serde(default)]
    pub email: Option<UserField>,
    #[serde(default)]
    pub role: Option<UserField>,
    #[serde(default)]
    pub chat_id: Option<UserField>,
}

impl UserInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.id.is_none()
            && self.email.is_none()
            && self.role.is_none()
            && self.chat_id.is_none()
    }
}

/// Body of the `x-portkey-metadata` header. Key order is fixed.
#[derive(Debug, Serialize)]
struct Metadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<&'a Value>,
}

impl<'a> From<&'a UserInfo> for Metadata<'a> {
    fn from(user: &'a UserInfo) -> Self {
        Self {
            name: user.name.as_ref().map(UserField::as_value),
            id: user.id.as_ref().map(UserField::as_value),
            email: user.email.as_ref().map(UserField::as_value),
            role: user.role.as_ref().map(UserField::as_value),
            chat_id: user.chat_id.as_ref().map(UserField::as_value),
        }
    }
}

/// Compact JSON metadata for the user, or `None` when no field is present.
///
/// Non-ASCII characters are written as `\uXXXX` escapes so the header is
/// plain ASCII on the wire.
pub fn user_metadata_json(user: Option<&UserInfo>) -> Option<String> {
    let user = user.filter(|u| !u.is_empty())?;
    serde_json::to_string(&Metadata::from(user))
        .ok()
        .map(|json| escape_non_ascii(&json))
}

/// Outside string literals JSON is ASCII, so escaping every non-ASCII
/// char as UTF-16 units keeps the document valid.
fn escape_non_ascii(json: &str) -> String {
    if json.is_ascii() {
        return json.to_string();
    }
    let mut out = String::with_capacity(json.len() + 16);
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        for unit in c.encode_utf16(&mut units) {
            let _ = write!(out, "\\u{unit:04x}");
        }
    }
    out
}

/// Build the header set for a gateway call.
///
/// Fails with [`PipeError::Config`] when no API key is configured; this
/// happens before any network activity.
pub fn build_headers(config: &Config, user: Option<&UserInfo>) -> Result<HeaderMap, PipeError> {
    let mut headers = base_headers(config)?;

    if config.forward_user_info_headers {
        if let Some(user) = user {
            let forwarded = [
                (USER_NAME_HEADER, &user.name),
                (USER_ID_HEADER, &user.id),
                (USER_EMAIL_HEADER, &user.email),
                (USER_ROLE_HEADER, &user.role),
                (CHAT_ID_HEADER, &user.chat_id),
            ];
            for (name, value) in forwarded {
                if let Some(value) = value {
                    insert(&mut headers, name, &value.as_text())?;
                }
            }
        }
    }

    if config.send_metadata_header {
        if let Some(meta) = user_metadata_json(user) {
            insert(&mut headers, METADATA_HEADER, &meta)?;
        }
    }

    Ok(headers)
}

/// Authorization, content type and user agent only.
pub fn base_headers(config: &Config) -> Result<HeaderMap, PipeError> {
    if config.api_key.trim().is_empty() {
        return Err(PipeError::Config(
            "PORTKEY_API_KEY is required. Paste your Portkey API key.".to_string(),
        ));
    }

    let mut headers = HeaderMap::new();
    let mut auth = header_value(AUTHORIZATION.as_str(), &format!("Bearer {}", config.api_key))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    Ok(headers)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), PipeError> {
    headers.insert(HeaderName::from_static(name), header_value(name, value)?);
    Ok(())
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, PipeError> {
    HeaderValue::from_str(value).map_err(|e| PipeError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
