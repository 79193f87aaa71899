use crate::backends::{
    BackendError, BrokerBackend, BrokerConnection, MachineDescriptor, PoolDescriptor,
};
use crate::model::Credential;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const LOGIN_PATH: &str = "/rest/login";
const LOGOUT_PATH: &str = "/rest/logout";
const DESKTOP_POOLS_PATH: &str = "/rest/inventory/v2/desktop-pools";
const MACHINES_PATH: &str = "/rest/inventory/v1/machines";

/// Desktop broker reached over its REST API with bearer tokens.
pub struct RestBroker {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    domain: &'a str,
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct LogoutRequest<'a> {
    refresh_token: &'a str,
}

impl RestBroker {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        conn: &BrokerConnection,
        path: &str,
    ) -> Result<T, BackendError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&conn.access_token)
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        let resp = check_status(resp)?;
        resp.json::<T>().await.map_err(BackendError::from_body)
    }
}

fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BackendError::Auth(format!("status {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
        });
    }
    Ok(resp)
}

#[async_trait]
impl BrokerBackend for RestBroker {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<BrokerConnection, BackendError> {
        let body = LoginRequest {
            domain: &credential.domain,
            username: &credential.username,
            password: &credential.password,
        };
        let resp = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from_transport)?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(BackendError::Auth(format!("status {}", status.as_u16())));
        }
        let resp = check_status(resp)?;
        let login: LoginResponse = resp.json().await.map_err(BackendError::from_body)?;

        let access_token = login
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BackendError::Protocol("в ответе нет access_token".to_string()))?;

        debug!(broker = %self.base_url, "вход на брокер выполнен");
        Ok(BrokerConnection {
            base_url: self.base_url.clone(),
            access_token,
            refresh_token: login.refresh_token,
        })
    }

    async fn list_pools(
        &self,
        conn: &BrokerConnection,
    ) -> Result<Vec<PoolDescriptor>, BackendError> {
        self.get_json(conn, DESKTOP_POOLS_PATH).await
    }

    async fn list_machines(
        &self,
        conn: &BrokerConnection,
    ) -> Result<Vec<MachineDescriptor>, BackendError> {
        self.get_json(conn, MACHINES_PATH).await
    }

    async fn logout(&self, conn: &BrokerConnection) -> Result<(), BackendError> {
        let Some(refresh_token) = conn.refresh_token.as_deref() else {
            return Ok(());
        };
        let resp = self
            .client
            .post(self.url(LOGOUT_PATH))
            .bearer_auth(&conn.access_token)
            .json(&LogoutRequest { refresh_token })
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        check_status(resp).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct FakeBrokerState {
        pools_status: Option<u16>,
        slow_machines: bool,
        logouts: Arc<AtomicUsize>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Bearer tok-123")
            .unwrap_or(false)
    }

    async fn login(Json(body): Json<Value>) -> AxumResponse {
        if body["domain"] == "CORP" && body["username"] == "alice" && body["password"] == "pw" {
            Json(json!({"access_token": "tok-123", "refresh_token": "ref-456"})).into_response()
        } else if body["password"] == "no-token" {
            Json(json!({"refresh_token": "ref-456"})).into_response()
        } else {
            (AxumStatus::BAD_REQUEST, "bad credentials").into_response()
        }
    }

    async fn logout(State(state): State<FakeBrokerState>, Json(body): Json<Value>) -> AxumStatus {
        if body["refresh_token"] == "ref-456" {
            state.logouts.fetch_add(1, Ordering::SeqCst);
        }
        AxumStatus::OK
    }

    async fn pools(State(state): State<FakeBrokerState>, headers: HeaderMap) -> AxumResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        if let Some(code) = state.pools_status {
            let status = AxumStatus::from_u16(code).unwrap_or(AxumStatus::INTERNAL_SERVER_ERROR);
            return status.into_response();
        }
        Json(json!([
            {"id": "p1", "name": "Finance", "type": "AUTOMATED"},
            {"id": "p2"}
        ]))
        .into_response()
    }

    async fn machines(State(state): State<FakeBrokerState>, headers: HeaderMap) -> AxumResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        if state.slow_machines {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Json(json!([
            {"id": "m1", "desktop_pool_id": "p1", "state": "AVAILABLE"},
            {"id": "m2", "state": "ERROR"}
        ]))
        .into_response()
    }

    async fn spawn_fake(state: FakeBrokerState) -> String {
        let app = Router::new()
            .route("/rest/login", post(login))
            .route("/rest/logout", post(logout))
            .route("/rest/inventory/v2/desktop-pools", get(pools))
            .route("/rest/inventory/v1/machines", get(machines))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    fn alice() -> Credential {
        Credential::new("CORP", "alice", "pw")
    }

    #[tokio::test]
    async fn login_and_list_inventory() {
        let state = FakeBrokerState::default();
        let logouts = state.logouts.clone();
        let base = spawn_fake(state).await;
        let broker = RestBroker::new(client(), &base);
        assert!(!broker.base_url().ends_with('/'));

        let conn = broker.authenticate(&alice()).await.unwrap();
        let pools = broker.list_pools(&conn).await.unwrap();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "Finance");
        assert_eq!(pools[1].name, "N/A");

        let machines = broker.list_machines(&conn).await.unwrap();
        assert_eq!(machines[0].desktop_pool_id.as_deref(), Some("p1"));
        assert_eq!(machines[1].desktop_pool_id, None);

        broker.logout(&conn).await.unwrap();
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_are_auth_errors() {
        let base = spawn_fake(FakeBrokerState::default()).await;
        let broker = RestBroker::new(client(), &base);
        let err = broker
            .authenticate(&Credential::new("CORP", "alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Auth(_)));
    }

    #[tokio::test]
    async fn missing_token_is_protocol_error() {
        let base = spawn_fake(FakeBrokerState::default()).await;
        let broker = RestBroker::new(client(), &base);
        let err = broker
            .authenticate(&Credential::new("CORP", "alice", "no-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[tokio::test]
    async fn non_success_listing_keeps_status() {
        let base = spawn_fake(FakeBrokerState {
            pools_status: Some(503),
            ..FakeBrokerState::default()
        })
        .await;
        let broker = RestBroker::new(client(), &base);
        let conn = broker.authenticate(&alice()).await.unwrap();
        let err = broker.list_pools(&conn).await.unwrap_err();
        assert_eq!(err, BackendError::Http { status: 503 });
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_unavailable() {
        let base = spawn_fake(FakeBrokerState {
            slow_machines: true,
            ..FakeBrokerState::default()
        })
        .await;
        let broker = RestBroker::new(client(), &base);
        let conn = broker.authenticate(&alice()).await.unwrap();
        let err = broker.list_machines(&conn).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_broker_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let broker = RestBroker::new(client(), &format!("http://{addr}"));
        let err = broker.authenticate(&alice()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err:?}");
    }
}
