use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures::stream::{self, Stream};
use intel_platform_api::{
    begin_chat_turn, dashboard_error, finish_chat_turn, logout, CyberAnalyticsPage,
    CyberAnalyticsRequest, DashboardApi, IncidentAction, ItTicketsPage, ItTicketsRequest,
    MutationOutcome, TicketAction, API_CONTRACT_VERSION, DEFAULT_DB_PATH,
};
use intel_platform_assistant::{
    AssistantArgs, CancelHandle, ChatAssistant, ChatEvent, STREAM_CHANNEL_CAPACITY,
};
use intel_platform_core::{DashboardError, NewTicket, SessionContext, LOGIN_PAGE};
use intel_platform_store_sqlite::StoreStatus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const SESSION_HEADER: &str = "x-session-id";
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Clone)]
struct ServiceState {
    api: DashboardApi,
    assistant: ChatAssistant,
    sessions: Arc<Mutex<SessionTable>>,
}

#[derive(Debug)]
struct SessionEntry {
    context: SessionContext,
    last_seen: Instant,
}

/// In-memory sessions keyed by id.
///
/// Entries idle for `ttl` are swept on every access. Inserting past `capacity`
/// evicts the least recently seen entry.
#[derive(Debug)]
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    ttl: Duration,
    capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialsRequest {
    username: String,
    password: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RegisterResponse {
    id: i64,
    username: String,
}

#[derive(Debug, Clone, Serialize)]
struct LoginResponse {
    session_id: String,
    username: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LogoutResponse {
    logged_out: bool,
    redirect: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct TicketActionRequest {
    action: TicketAction,
    ticket: NewTicket,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatRequest {
    prompt: String,
}

#[derive(Debug, Parser)]
#[command(name = "intel-platform-service")]
#[command(about = "HTTP service for the intelligence platform dashboard")]
struct Args {
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8501")]
    bind: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS)]
    session_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
    #[command(flatten)]
    assistant: AssistantArgs,
}

/// Cancels the upstream chat stream once the SSE body is dropped.
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            redirect: None,
        }
    }
}

impl From<DashboardError> for ServiceError {
    fn from(err: DashboardError) -> Self {
        match err {
            DashboardError::NotLoggedIn { redirect } => Self {
                redirect: Some(redirect),
                ..Self::new(StatusCode::UNAUTHORIZED, err.to_string())
            },
            DashboardError::InvalidCredentials => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            DashboardError::Validation(_) | DashboardError::UnknownColumn { .. } => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match dashboard_error(&err) {
            Some(dashboard) => dashboard.clone().into(),
            None => Self::new(StatusCode::BAD_REQUEST, format!("{err:#}")),
        }
    }
}

impl SessionTable {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: HashMap::new(), ttl, capacity: capacity.max(1) }
    }

    fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            tracing::debug!(expired, remaining = self.entries.len(), "expired idle sessions");
        }
    }

    /// Live session for `id`, marked as seen now.
    fn get_mut(&mut self, id: &str) -> Option<&mut SessionContext> {
        let now = Instant::now();
        self.sweep(now);
        let entry = self.entries.get_mut(id)?;
        entry.last_seen = now;
        Some(&mut entry.context)
    }

    fn insert(&mut self, id: String, context: SessionContext) {
        let now = Instant::now();
        self.sweep(now);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(id, SessionEntry { context, last_seen: now });
    }

    fn remove(&mut self, id: &str) -> Option<SessionContext> {
        self.entries.remove(id).map(|entry| entry.context)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl ServiceState {
    fn new(api: DashboardApi, assistant: ChatAssistant, sessions: SessionTable) -> Self {
        Self { api, assistant, sessions: Arc::new(Mutex::new(sessions)) }
    }

    fn session(&self, session_id: Option<&str>) -> SessionContext {
        session_id
            .and_then(|id| self.sessions.lock().get_mut(id).cloned())
            .unwrap_or_default()
    }
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/status", get(db_status))
        .route("/v1/auth/register", post(auth_register))
        .route("/v1/auth/login", post(auth_login))
        .route("/v1/auth/logout", post(auth_logout))
        .route("/v1/session", get(session_show))
        .route("/v1/pages/cyber-analytics", post(cyber_analytics_page))
        .route("/v1/pages/it-tickets", post(it_tickets_page))
        .route("/v1/incidents/action", post(incident_action))
        .route("/v1/tickets/action", post(ticket_action))
        .route("/v1/assistant/chat", post(assistant_chat))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = DashboardApi::new(args.db);
    let status = api.init_schema()?;
    tracing::info!(db = %api.db_path().display(), tables = status.tables.len(), "schema ready");

    let assistant = ChatAssistant::new(args.assistant.into_config())
        .map_err(|err| anyhow!("failed to configure chat assistant: {err}"))?;
    if !assistant.has_api_key() {
        tracing::warn!("OPENAI_API_KEY is not set; the IT expert chat is disabled");
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "dashboard service listening");
    let sessions = SessionTable::new(Duration::from_secs(args.session_ttl_secs), args.max_sessions);
    axum::serve(listener, app(ServiceState::new(api, assistant, sessions))).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StoreStatus>>, ServiceError> {
    Ok(Json(envelope(state.api.status()?)))
}

async fn auth_register(
    State(state): State<ServiceState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RegisterResponse>>, ServiceError> {
    let Json(request) = payload?;
    let id = state.api.register_user(&request.username, &request.password, request.role.as_deref())?;
    Ok(Json(envelope(RegisterResponse { id, username: request.username.trim().to_string() })))
}

async fn auth_login(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<LoginResponse>>, ServiceError> {
    let Json(request) = payload?;
    let mut session = SessionContext::default();
    state.api.login(&mut session, &request.username, &request.password)?;

    let fresh_id = ulid::Ulid::new().to_string();
    let response = LoginResponse {
        session_id: fresh_id.clone(),
        username: session.username.clone(),
        role: session.role.clone(),
    };
    let mut sessions = state.sessions.lock();
    if let Some(previous) = session_id(&headers) {
        sessions.remove(previous);
    }
    sessions.insert(fresh_id, session);
    Ok(Json(envelope(response)))
}

async fn auth_logout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Json<ServiceEnvelope<LogoutResponse>> {
    let removed = session_id(&headers).and_then(|id| state.sessions.lock().remove(id));
    let logged_out = match removed {
        Some(mut session) => {
            logout(&mut session);
            true
        }
        None => false,
    };
    Json(envelope(LogoutResponse { logged_out, redirect: LOGIN_PAGE }))
}

async fn session_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Json<ServiceEnvelope<SessionContext>> {
    Json(envelope(state.session(session_id(&headers))))
}

async fn cyber_analytics_page(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CyberAnalyticsRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CyberAnalyticsPage>>, ServiceError> {
    let Json(request) = payload?;
    let session = state.session(session_id(&headers));
    let page = state.api.cyber_analytics_page(&session, &request)?;
    Ok(Json(envelope(page)))
}

async fn it_tickets_page(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ItTicketsRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ItTicketsPage>>, ServiceError> {
    let Json(request) = payload?;
    let session = state.session(session_id(&headers));
    let page = state.api.it_tickets_page(&session, &request)?;
    Ok(Json(envelope(page)))
}

async fn incident_action(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<IncidentAction>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MutationOutcome>>, ServiceError> {
    let Json(action) = payload?;
    let session = state.session(session_id(&headers));
    let outcome = state.api.incident_action(&session, &action)?;
    Ok(Json(envelope(outcome)))
}

async fn ticket_action(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<TicketActionRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MutationOutcome>>, ServiceError> {
    let Json(request) = payload?;
    let session = state.session(session_id(&headers));
    let outcome = state.api.ticket_action(&session, request.action, &request.ticket)?;
    Ok(Json(envelope(outcome)))
}

async fn assistant_chat(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServiceError> {
    let Json(request) = payload?;
    let session_id = session_id(&headers)
        .map(str::to_string)
        .ok_or(DashboardError::NotLoggedIn { redirect: LOGIN_PAGE })?;
    state.session(Some(&session_id)).require_login()?;
    if !state.assistant.has_api_key() {
        return Err(ServiceError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "the IT expert chat is not configured",
        ));
    }

    let history = {
        let mut sessions = state.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(DashboardError::NotLoggedIn { redirect: LOGIN_PAGE })?;
        begin_chat_turn(session, &request.prompt)?
    };

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let cancel = CancelHandle::new();
    let task_cancel = cancel.clone();
    let assistant = state.assistant.clone();
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        tracing::info!(session_id = %session_id, "assistant stream started");
        match assistant.stream_reply(&history, tx.clone(), &task_cancel).await {
            Ok(reply) => {
                if let Some(session) = sessions.lock().get_mut(&session_id) {
                    if session.logged_in {
                        finish_chat_turn(session, reply);
                    }
                }
                tracing::info!(session_id = %session_id, "assistant stream finished");
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "assistant stream ended without a reply");
            }
        }
        drop(tx);
    });

    let events = stream::unfold((rx, CancelOnDrop(cancel)), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((sse_event(event), (rx, guard)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: ChatEvent) -> Result<Event, axum::Error> {
    match event {
        ChatEvent::Delta(content) => {
            Event::default().event("delta").json_data(serde_json::json!({ "content": content }))
        }
        ChatEvent::Done { reply } => {
            Event::default().event("done").json_data(serde_json::json!({ "reply": reply }))
        }
        ChatEvent::Error(message) => {
            Event::default().event("error").json_data(serde_json::json!({ "error": message }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use futures::StreamExt;
    use http::Request;
    use intel_platform_assistant::AssistantConfig;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    const UPSTREAM_BODY: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Power-cycle \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"the printer.\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("intel-platform-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf, config: AssistantConfig) -> ServiceState {
        let sessions =
            SessionTable::new(Duration::from_secs(DEFAULT_SESSION_TTL_SECS), DEFAULT_MAX_SESSIONS);
        test_state_with_sessions(db_path, config, sessions)
    }

    fn test_state_with_sessions(
        db_path: PathBuf,
        config: AssistantConfig,
        sessions: SessionTable,
    ) -> ServiceState {
        let api = DashboardApi::new(db_path);
        if let Err(err) = api.init_schema() {
            panic!("failed to initialise schema: {err:#}");
        }
        let assistant = match ChatAssistant::new(config) {
            Ok(assistant) => assistant,
            Err(err) => panic!("failed to build assistant: {err}"),
        };
        ServiceState::new(api, assistant, sessions)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        session: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn credentials() -> serde_json::Value {
        serde_json::json!({ "username": "analyst", "password": "correct horse" })
    }

    async fn register_and_login(router: &Router) -> String {
        let response = send(router, "POST", "/v1/auth/register", None, Some(credentials())).await;
        assert_eq!(response.status(), StatusCode::OK);
        login(router, None).await
    }

    async fn login(router: &Router, presented_session: Option<&str>) -> String {
        let response =
            send(router, "POST", "/v1/auth/login", presented_session, Some(credentials())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        value
            .get("data")
            .and_then(|data| data.get("session_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.session_id in response: {value}"))
            .to_string()
    }

    async fn spawn_upstream() -> String {
        async fn completions() -> Response {
            ([(http::header::CONTENT_TYPE, "text/event-stream")], UPSTREAM_BODY).into_response()
        }

        serve_upstream(Router::new().route("/v1/chat/completions", post(completions))).await
    }

    /// Reports on drop whether the upstream body ran to `[DONE]`.
    struct UpstreamWatch {
        finished: bool,
        report: Option<oneshot::Sender<bool>>,
    }

    impl Drop for UpstreamWatch {
        fn drop(&mut self) {
            if let Some(report) = self.report.take() {
                let _ = report.send(self.finished);
            }
        }
    }

    type UpstreamReport = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

    /// Upstream that sends one delta, keeps the connection warm with comments for about a
    /// second, then completes the reply.
    async fn spawn_slow_upstream() -> (String, oneshot::Receiver<bool>) {
        async fn completions(State(report): State<UpstreamReport>) -> Response {
            let watch = UpstreamWatch { finished: false, report: report.lock().take() };
            let chunks = stream::unfold((0_u32, watch), |(step, mut watch)| async move {
                let chunk = match step {
                    0 => "data: {\"choices\":[{\"delta\":{\"content\":\"Power-cycle \"}}]}\n\n",
                    1..=20 => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ": ping\n\n"
                    }
                    21 => {
                        watch.finished = true;
                        "data: {\"choices\":[{\"delta\":{\"content\":\"the printer.\"}}]}\n\ndata: [DONE]\n\n"
                    }
                    _ => return None,
                };
                Some((Ok::<_, std::convert::Infallible>(chunk), (step + 1, watch)))
            });
            ([(http::header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(chunks))
                .into_response()
        }

        let (report, closed) = oneshot::channel();
        let report: UpstreamReport = Arc::new(Mutex::new(Some(report)));
        let upstream =
            Router::new().route("/v1/chat/completions", post(completions)).with_state(report);
        (serve_upstream(upstream).await, closed)
    }

    async fn serve_upstream(upstream: Router) -> String {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind mock upstream: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => panic!("mock upstream has no address: {err}"),
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, upstream).await;
        });
        format!("http://{addr}/v1")
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));

        let response = send(&router, "GET", "/v1/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn pages_without_login_are_unauthorized_with_redirect() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));

        for uri in ["/v1/pages/cyber-analytics", "/v1/pages/it-tickets"] {
            let response = send(&router, "POST", uri, Some("unknown"), Some(serde_json::json!({}))).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let value = response_json(response).await;
            assert_eq!(value.get("redirect").and_then(serde_json::Value::as_str), Some(LOGIN_PAGE));
        }

        let response =
            send(&router, "POST", "/v1/assistant/chat", None, Some(serde_json::json!({ "prompt": "hi" })))
                .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn login_ticket_action_and_page_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));
        let session = register_and_login(&router).await;

        let bad_login = send(
            &router,
            "POST",
            "/v1/auth/login",
            None,
            Some(serde_json::json!({ "username": "analyst", "password": "nope" })),
        )
        .await;
        assert_eq!(bad_login.status(), StatusCode::UNAUTHORIZED);

        let ticket = serde_json::json!({
            "action": "create",
            "ticket": {
                "ticket_id": "T-900",
                "priority": "urgent",
                "status": "open",
                "category": "Network",
                "subject": "VPN connection issue",
                "created_date": "2024-05-01"
            }
        });
        let response = send(&router, "POST", "/v1/tickets/action", Some(&session), Some(ticket)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["success"], serde_json::Value::Bool(true));

        let page_request = serde_json::json!({ "priorities": ["urgent"], "chart_column": "status" });
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&session), Some(page_request)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["row_count"], serde_json::json!(1));
        assert_eq!(value["data"]["chart"]["title"], "IT Tickets by Status");
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);

        let response = send(&router, "POST", "/v1/auth/logout", Some(&session), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&session), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_chart_column_is_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));
        let session = register_and_login(&router).await;

        let request = serde_json::json!({ "chart_column": "password_hash" });
        let response =
            send(&router, "POST", "/v1/pages/cyber-analytics", Some(&session), Some(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        let error = value["error"].as_str().unwrap_or_default();
        assert!(error.contains("unknown column `password_hash`"), "{value}");

        let request = serde_json::json!({ "chart_column": "status", "statuses": "open" });
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&session), Some(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert!(value["error"].is_string(), "{value}");

        let request = Request::builder()
            .uri("/v1/auth/login")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("not json"))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn chat_without_api_key_is_unavailable() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));
        let session = register_and_login(&router).await;

        let response = send(
            &router,
            "POST",
            "/v1/assistant/chat",
            Some(&session),
            Some(serde_json::json!({ "prompt": "Printer is jammed" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = send(&router, "GET", "/v1/session", Some(&session), None).await;
        let value = response_json(response).await;
        assert_eq!(value["data"]["conversation"], serde_json::json!([]));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn chat_streams_sse_and_records_the_reply() {
        let db_path = unique_temp_db_path();
        let config = AssistantConfig {
            api_key: Some("test-key".to_string()),
            base_url: spawn_upstream().await,
            ..AssistantConfig::default()
        };
        let router = app(test_state(db_path.clone(), config));
        let session = register_and_login(&router).await;

        let response = send(
            &router,
            "POST",
            "/v1/assistant/chat",
            Some(&session),
            Some(serde_json::json!({ "prompt": "Printer is offline" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_text(response).await;
        assert!(body.contains("event: delta"), "{body}");
        assert!(body.contains("event: done"), "{body}");
        assert!(body.contains("Power-cycle the printer."), "{body}");

        let response = send(&router, "GET", "/v1/session", Some(&session), None).await;
        let value = response_json(response).await;
        assert_eq!(
            value["data"]["conversation"],
            serde_json::json!([
                { "role": "user", "content": "Printer is offline" },
                { "role": "assistant", "content": "Power-cycle the printer." }
            ])
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn login_mints_a_fresh_session_id() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), AssistantConfig::default()));
        let first = register_and_login(&router).await;

        let planted = "01HZZZZZZZZZZZZZZZZZZZZZZZ";
        let session = login(&router, Some(planted)).await;
        assert_ne!(session, planted);
        assert!(ulid::Ulid::from_string(&session).is_ok(), "{session}");

        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(planted), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&session), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let relogin = login(&router, Some(&first)).await;
        assert_ne!(relogin, first);
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&first), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn idle_sessions_expire() {
        let db_path = unique_temp_db_path();
        let sessions = SessionTable::new(Duration::ZERO, DEFAULT_MAX_SESSIONS);
        let state = test_state_with_sessions(db_path.clone(), AssistantConfig::default(), sessions);
        let router = app(state.clone());
        let session = register_and_login(&router).await;

        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&session), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(state.sessions.lock().len(), 0);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn repeated_logins_stay_within_the_session_cap() {
        let db_path = unique_temp_db_path();
        let sessions = SessionTable::new(Duration::from_secs(DEFAULT_SESSION_TTL_SECS), 3);
        let state = test_state_with_sessions(db_path.clone(), AssistantConfig::default(), sessions);
        let router = app(state.clone());

        let mut issued = vec![register_and_login(&router).await];
        for _ in 0..9 {
            issued.push(login(&router, None).await);
        }
        assert_eq!(state.sessions.lock().len(), 3);

        let newest = issued.last().cloned().unwrap_or_default();
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&newest), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response =
            send(&router, "POST", "/v1/pages/it-tickets", Some(&issued[0]), Some(serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-010
    #[test]
    fn full_table_evicts_the_least_recently_seen_session() {
        let mut table = SessionTable::new(Duration::from_secs(60), 2);
        table.insert("a".to_string(), SessionContext::default());
        std::thread::sleep(Duration::from_millis(5));
        table.insert("b".to_string(), SessionContext::default());
        std::thread::sleep(Duration::from_millis(5));
        assert!(table.get_mut("a").is_some());
        std::thread::sleep(Duration::from_millis(5));

        table.insert("c".to_string(), SessionContext::default());
        assert_eq!(table.len(), 2);
        assert!(table.get_mut("b").is_none());
        assert!(table.get_mut("a").is_some());
        assert!(table.get_mut("c").is_some());
        assert!(table.remove("c").is_some());
        assert_eq!(table.len(), 1);
    }

    // Test IDs: TSVC-011
    #[tokio::test]
    async fn dropping_the_chat_stream_stops_the_upstream_and_skips_the_reply() {
        let db_path = unique_temp_db_path();
        let (base_url, upstream_closed) = spawn_slow_upstream().await;
        let config = AssistantConfig {
            api_key: Some("test-key".to_string()),
            base_url,
            ..AssistantConfig::default()
        };
        let router = app(test_state(db_path.clone(), config));
        let session = register_and_login(&router).await;

        let response = send(
            &router,
            "POST",
            "/v1/assistant/chat",
            Some(&session),
            Some(serde_json::json!({ "prompt": "Printer is offline" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = match body.next().await {
            Some(Ok(frame)) => String::from_utf8_lossy(&frame).into_owned(),
            Some(Err(err)) => panic!("failed to read SSE frame: {err}"),
            None => panic!("SSE body ended before the first delta"),
        };
        assert!(first.contains("event: delta"), "{first}");
        assert!(first.contains("Power-cycle"), "{first}");
        drop(body);

        let finished = match tokio::time::timeout(Duration::from_secs(5), upstream_closed).await {
            Ok(Ok(finished)) => finished,
            Ok(Err(err)) => panic!("upstream report channel closed: {err}"),
            Err(_) => panic!("upstream stream was still open five seconds after the client left"),
        };
        assert!(!finished, "upstream ran to completion after the client disconnected");

        let response = send(&router, "GET", "/v1/session", Some(&session), None).await;
        let value = response_json(response).await;
        assert_eq!(
            value["data"]["conversation"],
            serde_json::json!([{ "role": "user", "content": "Printer is offline" }])
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
