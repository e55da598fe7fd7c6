#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    extract::Path,
    http::{header, Request, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use saml2idp::{
    session::{PendingRequest, SessionAuthenticator},
    web::{self, AppState},
    Config, UserIdentity, DATE_TIME_FORMAT,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use tower_sessions::{MemoryStore, Session};
use yaserde::YaSerialize;

pub const MESSAGING_ENTITY_ID: &str = "https://messaging.example.com/saml/metadata";
pub const MESSAGING_ACS: &str = "https://messaging.example.com/saml/acs";
pub const SSO_URL: &str = "https://idp.example.com/idp/login/";

pub const CONFIG: &str = r#"
server:
  base_path: /idp
  login_url: /accounts/login/
idp:
  entity_id: https://idp.example.com/idp/metadata/
  base_url: https://idp.example.com/idp
  certificate_file: tests/fixtures/idp.crt
  private_key_file: tests/fixtures/idp.key
service_providers:
  - name: messaging
    entity_id: https://messaging.example.com/saml/metadata
    display_name: Messaging
    acs_url: https://messaging.example.com/saml/acs
    sign_response: true
    attributes:
      - name: mail
        source: email
    links:
      inbox: https://messaging.example.com/inbox
"#;

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: Option<String>,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: Option<bool>,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: Option<bool>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

/// What a service provider would send.
pub struct AuthnRequestBuilder {
    pub id: String,
    issuer: String,
    destination: Option<String>,
    consumer_url: Option<String>,
    force_authn: Option<bool>,
    is_passive: Option<bool>,
}

impl AuthnRequestBuilder {
    pub fn new(issuer: &str) -> Self {
        AuthnRequestBuilder {
            id: format!("_sp{}", OffsetDateTime::now_utc().unix_timestamp_nanos()),
            issuer: issuer.into(),
            destination: Some(SSO_URL.into()),
            consumer_url: None,
            force_authn: None,
            is_passive: None,
        }
    }

    pub fn force_authn(self) -> Self {
        AuthnRequestBuilder {
            force_authn: Some(true),
            ..self
        }
    }

    pub fn passive(self) -> Self {
        AuthnRequestBuilder {
            is_passive: Some(true),
            ..self
        }
    }

    pub fn consumer_url(self, consumer_url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(consumer_url.into()),
            ..self
        }
    }

    pub fn build(&self) -> String {
        let request = AuthnRequest {
            id: self.id.clone(),
            version: "2.0".into(),
            issue_instant: OffsetDateTime::now_utc()
                .format(&DATE_TIME_FORMAT)
                .unwrap(),
            destination: self.destination.clone(),
            protocol_binding: "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST".into(),
            assertion_consumer_service_url: self.consumer_url.clone(),
            force_authn: self.force_authn,
            is_passive: self.is_passive,
            issuer: Issuer {
                content: self.issuer.clone(),
            },
            name_id_policy: NameIdPolicy {
                format: saml2idp::NAME_ID_FORMAT_EMAIL_ADDRESS.into(),
                allow_create: true,
            },
        };
        yaserde::ser::to_string(&request).unwrap()
    }

    /// HTTP-Redirect encoding: DEFLATE then base64.
    pub fn encode_redirect(&self) -> String {
        BASE64_STANDARD.encode(deflate_bytes(self.build().as_bytes()))
    }

    /// HTTP-POST encoding: base64 only.
    pub fn encode_post(&self) -> String {
        BASE64_STANDARD.encode(self.build())
    }
}

pub fn logout_request(issuer: &str) -> String {
    let xml = format!(
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_logout1" Version="2.0" IssueInstant="2026-10-16T10:00:00Z"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID>fred@example.com</saml:NameID></samlp:LogoutRequest>"#
    );
    BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes()))
}

pub fn config() -> Config {
    Config::from_yaml(CONFIG).unwrap()
}

pub fn state() -> AppState {
    AppState::from_config(&config()).unwrap()
}

pub fn fred() -> UserIdentity {
    UserIdentity::new("fred")
        .email("fred@example.com")
        .name("Fred", "Flintstone")
}

/// Routes standing in for the external login system.
fn test_routes() -> Router<AppState> {
    Router::new()
        .route("/test/login/{username}/", get(test_login))
        .route("/test/session/", get(test_session))
}

async fn test_login(session: Session, Path(username): Path<String>) -> StatusCode {
    let user = UserIdentity::new(&username).email(&format!("{username}@example.com"));
    SessionAuthenticator::login(&session, &user).await.unwrap();
    StatusCode::NO_CONTENT
}

async fn test_session(session: Session) -> Json<Value> {
    let pending = PendingRequest::load(&session).await.unwrap();
    let user: Option<UserIdentity> = session
        .get(saml2idp::session::AUTH_USER_KEY)
        .await
        .unwrap();
    Json(json!({
        "saml_request": pending.as_ref().map(|p| p.saml_request.clone()),
        "relay_state": pending.as_ref().and_then(|p| p.relay_state.clone()),
        "binding": pending.as_ref().map(|p| p.binding.to_string()),
        "user": user.map(|u| u.username),
    }))
}

pub fn app() -> Router {
    web::mount(
        web::routes().merge(test_routes()),
        state(),
        MemoryStore::default(),
    )
}

/// Browser stand-in that keeps the session cookie between requests.
pub struct Browser {
    app: Router,
    cookie: Option<String>,
}

impl Browser {
    pub fn new() -> Self {
        Browser {
            app: app(),
            cookie: None,
        }
    }

    pub fn with_app(app: Router) -> Self {
        Browser { app, cookie: None }
    }

    pub async fn get(&mut self, uri: &str) -> Response {
        let request = self.request("GET", uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    pub async fn post_form(&mut self, uri: &str, form: &[(&str, &str)]) -> Response {
        let body: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        let request = self
            .request("POST", uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    pub async fn post_empty(&mut self, uri: &str) -> Response {
        let request = self.request("POST", uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    pub async fn login(&mut self, username: &str) {
        let response = self.get(&format!("/idp/test/login/{username}/")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    pub async fn session(&mut self) -> Value {
        let response = self.get("/idp/test/session/").await;
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn request(&self, method: &str, uri: &str) -> axum::http::request::Builder {
        let builder = Request::builder().method(method).uri(uri);
        match &self.cookie {
            Some(cookie) => builder.header(header::COOKIE, cookie),
            None => builder,
        }
    }

    async fn send(&mut self, request: Request<Body>) -> Response {
        let response = self.app.clone().oneshot(request).await.unwrap();
        for set_cookie in response.headers().get_all(header::SET_COOKIE) {
            let set_cookie = set_cookie.to_str().unwrap();
            if set_cookie.contains("Max-Age=0") {
                self.cookie = None;
            } else if let Some(pair) = set_cookie.split(';').next() {
                self.cookie = Some(pair.to_string());
            }
        }
        response
    }
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn location(response: &Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
}

/// Undo the HTML escaping applied by the page templates.
pub fn html_unescape(html: &str) -> String {
    html.replace("&#x3D;", "=")
        .replace("&#x2F;", "/")
        .replace("&#x27;", "'")
        .replace("&#x60;", "`")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Value of a hidden form input.
pub fn form_value(html: &str, name: &str) -> Option<String> {
    let html = html_unescape(html);
    let marker = format!(r#"name="{name}" value=""#);
    let start = html.find(&marker)? + marker.len();
    let end = html[start..].find('"')?;
    Some(html[start..start + end].to_string())
}

pub fn decode_response(html: &str) -> String {
    let encoded = form_value(html, "SAMLResponse").unwrap();
    String::from_utf8(BASE64_STANDARD.decode(encoded).unwrap()).unwrap()
}

pub fn idp_certificate_der() -> Vec<u8> {
    let state = state();
    state.idp.credentials.certificate_der().to_vec()
}

pub fn query(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
