//! HTTP endpoints of the IdP.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        OriginalUri, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tower_sessions::{Session, SessionManagerLayer, SessionStore};

use crate::{
    authn_request::{AuthnRequest, Binding, LogoutRequest},
    config::Config,
    error::{SamlError, SamlResult},
    identity::IdpIdentity,
    idp_metadata::render_metadata,
    processor::{Delivery, Processor},
    registry::ProcessorRegistry,
    session::{Authenticator, PendingRequest, SessionAuthenticator},
    templates::{Templates, ERROR_PAGE, LOGGED_OUT_PAGE, LOGIN_PAGE},
    utils::validate_redirect_target,
};

#[derive(Clone)]
pub struct AppState {
    pub idp: Arc<IdpIdentity>,
    pub registry: Arc<ProcessorRegistry>,
    pub templates: Arc<Templates>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Path prefix the routes are mounted under, without trailing slash.
    pub base_path: String,
    pub login_url: String,
}

impl AppState {
    pub fn from_config(config: &Config) -> SamlResult<Self> {
        let registry = ProcessorRegistry::new(config.service_providers.clone())?;
        let templates = Templates::load(&config.templates, registry.names())?;
        Ok(AppState {
            idp: Arc::new(IdpIdentity::from_config(&config.idp)?),
            registry: Arc::new(registry),
            templates: Arc::new(templates),
            authenticator: Arc::new(SessionAuthenticator),
            base_path: config.server.base_path.trim_end_matches('/').to_string(),
            login_url: config.server.login_url.clone(),
        })
    }

    pub fn with_authenticator(self, authenticator: Arc<dyn Authenticator>) -> Self {
        AppState {
            authenticator,
            ..self
        }
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.base_path)
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login/", get(login_begin_get).post(login_begin_post))
        .route("/login/process/", get(login_process))
        .route("/logout/", get(logout))
        .route("/metadata/", get(metadata))
        .route("/slo/", get(slo_get).post(slo_post))
        .route("/init/{processor}/", get(login_init))
        .route("/init/{processor}/{link}/", get(login_init_link))
}

/// The IdP routes under the configured base path, with sessions and
/// request tracing.
pub fn app<S>(state: AppState, store: S) -> Router
where
    S: SessionStore + Clone,
{
    mount(routes(), state, store)
}

pub fn mount<S>(routes: Router<AppState>, state: AppState, store: S) -> Router
where
    S: SessionStore + Clone,
{
    let secure = state.idp.base_url().starts_with("https://");
    let router = if state.base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&state.base_path, routes)
    };
    router
        .layer(SessionManagerLayer::new(store).with_secure(secure))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct SamlParams {
    #[serde(rename = "SAMLRequest")]
    saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
}

impl SamlParams {
    fn saml_request(&self) -> Option<&str> {
        self.saml_request
            .as_deref()
            .filter(|request| !request.trim().is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogoutParams {
    redirect_to: Option<String>,
}

#[derive(Serialize)]
struct DeliveryPage<'a> {
    display_name: Option<&'a str>,
    acs_url: &'a str,
    saml_response: &'a str,
    relay_state: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorPage {
    status: u16,
    code: &'static str,
    message: &'static str,
}

#[derive(Serialize)]
struct EmptyPage {}

async fn login_begin_get(
    State(state): State<AppState>,
    session: Session,
    params: Result<Query<SamlParams>, QueryRejection>,
) -> Response {
    let params = params.map(|Query(params)| params).unwrap_or_default();
    login_begin(&state, &session, params, Binding::Redirect).await
}

async fn login_begin_post(
    State(state): State<AppState>,
    session: Session,
    params: Result<Form<SamlParams>, FormRejection>,
) -> Response {
    let params = params.map(|Form(params)| params).unwrap_or_default();
    login_begin(&state, &session, params, Binding::Post).await
}

/// Park the request in the session and continue at `/login/process/`.
async fn login_begin(
    state: &AppState,
    session: &Session,
    params: SamlParams,
    binding: Binding,
) -> Response {
    let Some(saml_request) = params.saml_request().map(str::to_string) else {
        return error_page(
            state,
            SamlError::MalformedRequest("missing SAMLRequest parameter".into()),
        );
    };
    let pending = PendingRequest::new(saml_request, params.relay_state, binding);
    if let Err(error) = pending.store(session).await {
        return error_page(state, error);
    }
    tracing::debug!(%binding, "stored pending SAML request");
    found(&state.path("/login/process/"))
}

async fn login_process(State(state): State<AppState>, session: Session) -> Response {
    match process_pending(&state, &session).await {
        Ok(response) => response,
        Err(SamlError::NotAuthenticated) => {
            redirect_to_login(&state, &state.path("/login/process/"))
        }
        Err(error) => error_page(&state, error),
    }
}

async fn process_pending(state: &AppState, session: &Session) -> SamlResult<Response> {
    let pending = PendingRequest::load(session)
        .await?
        .ok_or_else(|| SamlError::MalformedRequest("no pending SAML request".into()))?;
    let user = state.authenticator.current_user(session).await?;
    let request = match (decode_pending(&pending), &user) {
        (Ok(request), _) => request,
        // anonymous users log in before learning anything about the request
        (Err(_), None) => return Err(SamlError::NotAuthenticated),
        (Err(error), Some(_)) => return Err(error),
    };
    tracing::info!(
        issuer = %request.issuer,
        request_id = %request.id,
        binding = %pending.binding,
        force_authn = request.force_authn,
        is_passive = request.is_passive,
        "received AuthnRequest"
    );

    let fresh = match &user {
        Some(_) if request.force_authn => {
            logged_in_since(state, session, pending.received_at).await?
        }
        Some(_) => true,
        None => false,
    };
    let user = match user {
        Some(user) if fresh => user,
        _ if request.is_passive => {
            return Err(SamlError::NoPassive(format!(
                "request {} needs a login",
                request.id
            )))
        }
        _ => return Err(SamlError::NotAuthenticated),
    };

    let config = state.registry.select(&request.issuer)?;
    let delivery = Processor::new(&state.idp, config, request).process(Some(&user))?;
    PendingRequest::clear(session).await?;
    delivery_page(state, &delivery)
}

/// A pending request no processor can read is refused like one from an
/// unknown SP.
fn decode_pending(pending: &PendingRequest) -> SamlResult<AuthnRequest> {
    AuthnRequest::decode(&pending.saml_request, pending.binding)
        .map(|request| request.with_relay_state(pending.relay_state.clone()))
        .map_err(|error| {
            tracing::warn!(%error, binding = %pending.binding, "undecodable pending request");
            SamlError::CannotHandleAssertion("undecodable AuthnRequest".into())
        })
}

async fn logged_in_since(
    state: &AppState,
    session: &Session,
    instant: OffsetDateTime,
) -> SamlResult<bool> {
    Ok(state
        .authenticator
        .authenticated_at(session)
        .await?
        .is_some_and(|authenticated_at| authenticated_at >= instant))
}

async fn login_init(
    State(state): State<AppState>,
    session: Session,
    OriginalUri(uri): OriginalUri,
    Path(processor): Path<String>,
    params: Result<Query<SamlParams>, QueryRejection>,
) -> Response {
    let params = params.map(|Query(params)| params).unwrap_or_default();
    idp_initiated(&state, &session, &uri.to_string(), &processor, None, params.relay_state).await
}

async fn login_init_link(
    State(state): State<AppState>,
    session: Session,
    OriginalUri(uri): OriginalUri,
    Path((processor, link)): Path<(String, String)>,
) -> Response {
    idp_initiated(&state, &session, &uri.to_string(), &processor, Some(&link), None).await
}

async fn idp_initiated(
    state: &AppState,
    session: &Session,
    return_to: &str,
    processor: &str,
    link: Option<&str>,
    relay_state: Option<String>,
) -> Response {
    match unsolicited_response(state, session, processor, link, relay_state).await {
        Ok(response) => response,
        Err(SamlError::NotAuthenticated) => redirect_to_login(state, return_to),
        Err(error) => error_page(state, error),
    }
}

async fn unsolicited_response(
    state: &AppState,
    session: &Session,
    processor: &str,
    link: Option<&str>,
    relay_state: Option<String>,
) -> SamlResult<Response> {
    let user = state
        .authenticator
        .current_user(session)
        .await?
        .ok_or(SamlError::NotAuthenticated)?;
    let config = state.registry.by_name(processor)?;
    let relay_state = match link {
        Some(link) => Some(config.links.get(link).cloned().ok_or_else(|| {
            SamlError::CannotHandleAssertion(format!("{} has no link named {link}", config.name))
        })?),
        None => relay_state,
    };

    let delivery = Processor::unsolicited(&state.idp, config, relay_state).process(Some(&user))?;
    delivery_page(state, &delivery)
}

async fn logout(
    State(state): State<AppState>,
    session: Session,
    params: Result<Query<LogoutParams>, QueryRejection>,
) -> Response {
    if let Err(error) = state.authenticator.logout(&session).await {
        return error_page(&state, error);
    }

    let params = params.map(|Query(params)| params).unwrap_or_default();
    if let Some(target) = params.redirect_to.filter(|target| !target.is_empty()) {
        match validate_redirect_target(&target) {
            Ok(_) => return found(&target),
            Err(error) => tracing::warn!(%error, "ignoring logout redirect target"),
        }
    }
    logged_out_page(&state, None)
}

async fn slo_get(
    State(state): State<AppState>,
    session: Session,
    params: Result<Query<SamlParams>, QueryRejection>,
) -> Response {
    let params = params.map(|Query(params)| params).unwrap_or_default();
    single_logout(&state, &session, params, Binding::Redirect).await
}

async fn slo_post(
    State(state): State<AppState>,
    session: Session,
    params: Result<Form<SamlParams>, FormRejection>,
) -> Response {
    let params = params.map(|Form(params)| params).unwrap_or_default();
    single_logout(&state, &session, params, Binding::Post).await
}

/// SP-initiated logout: end the local session and confirm.
async fn single_logout(
    state: &AppState,
    session: &Session,
    params: SamlParams,
    binding: Binding,
) -> Response {
    let request = params
        .saml_request()
        .ok_or_else(|| SamlError::MalformedRequest("missing SAMLRequest parameter".into()))
        .and_then(|raw| LogoutRequest::decode(raw, binding));
    let request = match request {
        Ok(request) => request,
        Err(error) => return error_page(state, error),
    };

    let processor = state
        .registry
        .select(&request.issuer)
        .ok()
        .map(|config| config.name.clone());
    tracing::info!(
        issuer = %request.issuer,
        request_id = %request.id,
        name_id = ?request.name_id,
        session_index = ?request.session_index,
        known = processor.is_some(),
        "received LogoutRequest"
    );

    if let Err(error) = state.authenticator.logout(session).await {
        return error_page(state, error);
    }
    logged_out_page(state, processor.as_deref())
}

async fn metadata(State(state): State<AppState>) -> Response {
    match render_metadata(&state.idp) {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(error) => error_page(&state, error),
    }
}

fn delivery_page(state: &AppState, delivery: &Delivery) -> SamlResult<Response> {
    let display_name = state
        .registry
        .by_name(&delivery.processor)
        .ok()
        .and_then(|config| config.display_name.as_deref());
    let html = state.templates.render(
        LOGIN_PAGE,
        Some(&delivery.processor),
        &DeliveryPage {
            display_name,
            acs_url: &delivery.acs_url,
            saml_response: &delivery.saml_response,
            relay_state: delivery.relay_state.as_deref(),
        },
    )?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Html(html)).into_response())
}

fn logged_out_page(state: &AppState, processor: Option<&str>) -> Response {
    match state.templates.render(LOGGED_OUT_PAGE, processor, &EmptyPage {}) {
        Ok(html) => Html(html).into_response(),
        Err(error) => error_page(state, error),
    }
}

fn redirect_to_login(state: &AppState, next: &str) -> Response {
    let separator = if state.login_url.contains('?') { '&' } else { '?' };
    let next: String = url::form_urlencoded::byte_serialize(next.as_bytes()).collect();
    found(&format!("{}{separator}next={next}", state.login_url))
}

/// `302 Found`, as browsers and SAML SPs expect.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Generic error page. Details go to the log only.
fn error_page(state: &AppState, error: SamlError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let page = ErrorPage {
        status: status.as_u16(),
        code: error.code(),
        message: error.public_message(),
    };
    match state.templates.render(ERROR_PAGE, None, &page) {
        Ok(html) => {
            log_error(&error);
            (status, Html(html)).into_response()
        }
        Err(render_error) => {
            tracing::error!(error = %render_error, "failed to render error page");
            error.into_response()
        }
    }
}

fn log_error(error: &SamlError) {
    if error.http_status() >= 500 {
        tracing::error!(code = error.code(), %error, "request failed");
    } else {
        tracing::warn!(code = error.code(), %error, "request rejected");
    }
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        log_error(&self);
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.public_message()).into_response()
    }
}
