use crate::backends::Backends;
use crate::collectors::{build_snapshot, open_session};
use crate::metrics::{Metrics, LOGIN_OUTCOME_SUCCESS};
use crate::model::{CombinedSnapshot, Credential};
use crate::render::{render_dashboard, render_login};
use crate::session::{Session, SessionStore, SESSION_COOKIE};
use axum::body::Body;
use axum::extract::State;
use axum::http::{
    header::{CONTENT_TYPE, LOCATION},
    HeaderValue, StatusCode,
};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Clone)]
pub struct HttpAppState {
    pub backends: Arc<Backends>,
    pub sessions: Arc<dyn SessionStore>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub domain: String,
    pub username: String,
    pub password: String,
}

/// Dashboard routes. Everything else, including other methods on these paths, is 404.
pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/", get(index).fallback(not_found))
        .route("/login", post(login).fallback(not_found))
        .route("/get_data", get(get_data).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Operational routes for the separate metrics listener.
pub fn build_metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn current_session(state: &HttpAppState, jar: &CookieJar) -> Option<Arc<Session>> {
    let cookie = jar.get(SESSION_COOKIE)?;
    state.sessions.get(cookie.value()).await
}

async fn refresh(state: &HttpAppState, session: &Session) -> CombinedSnapshot {
    let started = Instant::now();
    let snapshot = build_snapshot(&state.backends, session).await;
    state.metrics.observe_refresh(&snapshot, started.elapsed());
    snapshot
}

async fn index(State(state): State<HttpAppState>, jar: CookieJar) -> Html<String> {
    match current_session(&state, &jar).await {
        Some(session) => Html(render_dashboard(&refresh(&state, &session).await)),
        None => Html(render_login(None)),
    }
}

async fn login(
    State(state): State<HttpAppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let credential = Credential::new(form.domain, form.username, form.password);
    let user = credential.qualified_username();

    match open_session(state.backends.clone(), state.sessions.clone(), credential).await {
        Ok(session) => {
            state.metrics.inc_login(LOGIN_OUTCOME_SUCCESS);
            state.metrics.set_active_sessions(state.sessions.len().await);
            info!(user = %user, "вход выполнен");
            debug!(token_prefix = %&session.token[..8], "сессия создана");

            let cookie = Cookie::build((SESSION_COOKIE, session.token.clone()))
                .http_only(true)
                .path("/")
                .build();
            (StatusCode::FOUND, jar.add(cookie), [(LOCATION, "/")]).into_response()
        }
        Err(failure) => {
            state.metrics.inc_login(failure.outcome());
            info!(user = %user, outcome = failure.outcome(), "вход отклонен");
            Html(render_login(Some(&failure.message()))).into_response()
        }
    }
}

async fn get_data(State(state): State<HttpAppState>, jar: CookieJar) -> Response {
    match current_session(&state, &jar).await {
        Some(session) => Json(refresh(&state, &session).await).into_response(),
        None => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    metrics.inc_scrape_count();
    metrics.update_uptime();
    match metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fakes::{host_stats, FakeBroker, FakeClusterManager};
    use crate::backends::{BackendError, BrokerBackend, ClusterBackend};
    use crate::session::InMemorySessionStore;
    use axum::body::to_bytes;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_state(cluster_down: bool) -> HttpAppState {
        let broker = FakeBroker::new("https://b1", "pw")
            .with_pools(&[("p1", "Finance"), ("p2", "TestPool")])
            .with_machines(&[("p1", "AVAILABLE"), ("p1", "ERROR")]);
        let vc1 = FakeClusterManager::new("vcenter1", "CLS1", "pw")
            .with_host("CLS1", "esx1", host_stats(10, 20))
            .with_host("CLS1", "esx2", host_stats(5, 20));
        let mut vc2 = FakeClusterManager::new("vcenter2", "CLS2", "pw")
            .with_host("CLS2", "esx3", host_stats(1, 4));
        if cluster_down {
            vc2.connect_error = Some(BackendError::Unavailable("connection refused".to_string()));
        }
        HttpAppState {
            backends: Arc::new(Backends {
                brokers: vec![Arc::new(broker) as Arc<dyn BrokerBackend>],
                clusters: vec![
                    Arc::new(vc1) as Arc<dyn ClusterBackend>,
                    Arc::new(vc2) as Arc<dyn ClusterBackend>,
                ],
            }),
            sessions: Arc::new(InMemorySessionStore::new(None)),
            metrics: Metrics::new().expect("инициализация метрик"),
        }
    }

    fn login_request(password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!(
                "domain=CORP&username=alice&password={password}"
            )))
            .unwrap()
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn log_in(state: &HttpAppState) -> String {
        let response = build_router(state.clone())
            .oneshot(login_request("pw"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn get_data_without_session_is_unauthorized() {
        let response = build_router(app_state(false))
            .oneshot(get("/get_data", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(response).await, "Unauthorized");
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = build_router(app_state(false));
        let response = app.clone().oneshot(get("/favicon.ico", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app.oneshot(get("/login", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn root_without_session_shows_login_form() {
        let response = build_router(app_state(false))
            .oneshot(get("/", Some("session_id=stale")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains("action=\"/login\""));
        assert!(!html.contains("class=\"error\""));
    }

    #[tokio::test]
    async fn successful_login_sets_session_cookie() {
        let state = app_state(false);
        let response = build_router(state.clone())
            .oneshot(login_request("pw"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/");
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("session_id="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert_eq!(state.sessions.len().await, 1);
        assert_eq!(
            state
                .metrics
                .vmdash_logins_total
                .with_label_values(&["success"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn cluster_failure_rejects_login_without_session() {
        let state = app_state(true);
        let response = build_router(state.clone())
            .oneshot(login_request("pw"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_none());
        let html = body_text(response).await;
        assert!(html.contains("cluster manager login failed"));
        assert!(!html.contains("desktop broker login failed"));
        assert_eq!(state.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn wrong_password_names_both_sides() {
        let state = app_state(false);
        let response = build_router(state.clone())
            .oneshot(login_request("nope"))
            .await
            .unwrap();
        let html = body_text(response).await;
        assert!(html.contains("cluster manager login failed"));
        assert!(html.contains("desktop broker login failed"));
        assert_eq!(state.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn get_data_returns_combined_snapshot() {
        let state = app_state(false);
        let cookie = log_in(&state).await;
        let response = build_router(state)
            .oneshot(get("/get_data", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        let pools = json["server_data"]["https://b1"].as_array().unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0]["pool_name"], "Finance");
        assert_eq!(pools[0]["state_counts"]["AVAILABLE"], 1);
        assert_eq!(pools[0]["state_counts"]["ERROR"], 1);
        assert_eq!(json["vcenter_data"]["vcenter1"]["memory_load_percentage"], 37.5);
        assert_eq!(json["vcenter_data"]["vcenter2"]["cluster_name"], "CLS2");
        assert!(json["fetch_time"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn root_with_session_renders_dashboard() {
        let state = app_state(false);
        let cookie = log_in(&state).await;
        let response = build_router(state)
            .oneshot(get("/", Some(&cookie)))
            .await
            .unwrap();
        let html = body_text(response).await;
        assert!(html.contains("Finance"));
        assert!(!html.contains("TestPool"));
        assert!(html.contains("fetch('/get_data')"));
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let response = build_metrics_router(metrics)
            .oneshot(get("/healthz", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let response = build_metrics_router(metrics.clone())
            .oneshot(get("/metrics", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("vmdash_uptime_seconds"));
        assert_eq!(metrics.vmdash_scrape_count_total.get(), 1.0);
    }
}
