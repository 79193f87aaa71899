use crate::backends::{
    BackendError, ClusterBackend, ClusterConnection, ClusterDescriptor, HostDescriptor, HostStats,
};
use crate::config::ClusterManagerConfig;
use crate::model::Credential;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";
const CLUSTER_TYPE: &str = "ClusterComputeResource";

/// Managed object reference as the VI/JSON protocol spells it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoRef {
    #[serde(rename = "_typeName", default = "moref_type_name")]
    pub type_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

fn moref_type_name() -> String {
    "ManagedObjectReference".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    root_folder: MoRef,
    view_manager: MoRef,
    session_manager: MoRef,
    about: AboutInfo,
}

#[derive(Deserialize)]
struct AboutInfo {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_name: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ContainerViewRequest<'a> {
    container: &'a MoRef,
    #[serde(rename = "type")]
    kinds: [&'a str; 1],
    recursive: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostListSummary {
    #[serde(default)]
    config: Option<HostConfigSummary>,
    #[serde(default)]
    hardware: Option<HostHardwareSummary>,
    #[serde(default)]
    quick_stats: Option<HostQuickStats>,
}

#[derive(Deserialize)]
struct HostConfigSummary {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostHardwareSummary {
    memory_size: u64,
    cpu_mhz: u64,
    num_cpu_cores: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostQuickStats {
    #[serde(default)]
    overall_cpu_usage: Option<u64>,
    #[serde(default)]
    overall_memory_usage: Option<u64>,
}

/// Cluster manager reached over the VI/JSON API (`/sdk/vim25/{release}`).
pub struct ViJsonClusterManager {
    client: Client,
    id: String,
    host: String,
    cluster: String,
    endpoint: String,
}

impl ViJsonClusterManager {
    pub fn new(
        client: Client,
        id: impl Into<String>,
        host: impl Into<String>,
        cluster: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            id: id.into(),
            host: host.into(),
            cluster: cluster.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(client: Client, cfg: &ClusterManagerConfig, release: &str) -> Self {
        let endpoint = format!("https://{}:{}/sdk/vim25/{}", cfg.host, cfg.port, release);
        Self::new(client, &cfg.id, &cfg.host, &cfg.cluster, endpoint)
    }

    fn url(&self, object: &MoRef, member: &str) -> String {
        format!("{}/{}/{}/{}", self.endpoint, object.kind, object.value, member)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        let resp = req.send().await.map_err(BackendError::from_transport)?;
        let resp = check_response(resp).await?;
        resp.json::<T>().await.map_err(BackendError::from_body)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        conn: &ClusterConnection,
        object: &MoRef,
        member: &str,
    ) -> Result<T, BackendError> {
        let req = self
            .client
            .get(self.url(object, member))
            .header(SESSION_HEADER, &conn.session_key);
        self.send(req).await
    }

    async fn invoke(
        &self,
        conn: &ClusterConnection,
        object: &MoRef,
        method: &str,
    ) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.url(object, method))
            .header(SESSION_HEADER, &conn.session_key)
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        check_response(resp).await.map(|_| ())
    }

    async fn find_cluster(
        &self,
        conn: &ClusterConnection,
        cluster_name: &str,
    ) -> Result<Option<MoRef>, BackendError> {
        let body = ContainerViewRequest {
            container: &conn.root_folder,
            kinds: [CLUSTER_TYPE],
            recursive: true,
        };
        let req = self
            .client
            .post(self.url(&conn.view_manager, "CreateContainerView"))
            .header(SESSION_HEADER, &conn.session_key)
            .json(&body);
        let view: MoRef = self.send(req).await?;

        let found = self.match_cluster(conn, &view, cluster_name).await;

        if let Err(err) = self.invoke(conn, &view, "DestroyView").await {
            debug!(manager = %self.id, error = %err, "не удалось удалить container view");
        }
        found
    }

    async fn match_cluster(
        &self,
        conn: &ClusterConnection,
        view: &MoRef,
        cluster_name: &str,
    ) -> Result<Option<MoRef>, BackendError> {
        let clusters: Vec<MoRef> = self.get(conn, view, "view").await?;
        for cluster in clusters {
            let name: String = self.get(conn, &cluster, "name").await?;
            if name == cluster_name {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    async fn read_host(&self, conn: &ClusterConnection, host: &MoRef) -> HostDescriptor {
        match self.get::<HostListSummary>(conn, host, "summary").await {
            Ok(summary) => {
                let name = summary
                    .config
                    .as_ref()
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| host.value.clone());
                HostDescriptor {
                    name,
                    stats: host_stats(&summary),
                }
            }
            Err(err) => {
                warn!(manager = %self.id, host = %host.value, error = %err, "не удалось прочитать сводку хоста");
                HostDescriptor {
                    name: host.value.clone(),
                    stats: Err(err),
                }
            }
        }
    }
}

fn host_stats(summary: &HostListSummary) -> Result<HostStats, BackendError> {
    let hardware = summary
        .hardware
        .as_ref()
        .ok_or_else(|| BackendError::Protocol("нет hardware в summary".to_string()))?;
    let quick = summary
        .quick_stats
        .as_ref()
        .ok_or_else(|| BackendError::Protocol("нет quickStats в summary".to_string()))?;
    match (quick.overall_memory_usage, quick.overall_cpu_usage) {
        (Some(memory_used_mb), Some(cpu_used_mhz)) => Ok(HostStats {
            memory_used_mb,
            memory_size_bytes: hardware.memory_size,
            cpu_used_mhz,
            cpu_mhz: hardware.cpu_mhz,
            cpu_cores: hardware.num_cpu_cores,
        }),
        _ => Err(BackendError::Protocol(
            "quickStats без счетчиков CPU/памяти".to_string(),
        )),
    }
}

/// Maps error statuses and VI faults onto the backend error taxonomy.
async fn check_response(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BackendError::Auth(format!("status {}", status.as_u16())));
    }
    let fault = resp
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("_typeName").and_then(Value::as_str).map(str::to_string));
    match fault.as_deref() {
        Some(name @ ("InvalidLogin" | "NotAuthenticated" | "NoPermission")) => {
            Err(BackendError::Auth(name.to_string()))
        }
        _ => Err(BackendError::Http {
            status: status.as_u16(),
        }),
    }
}

#[async_trait]
impl ClusterBackend for ViJsonClusterManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster_name(&self) -> &str {
        &self.cluster
    }

    async fn authenticate(
        &self,
        credential: &Credential,
    ) -> Result<ClusterConnection, BackendError> {
        let content_url = format!("{}/ServiceInstance/ServiceInstance/content", self.endpoint);
        let content: ServiceContent = self.send(self.client.get(content_url)).await?;

        let user_name = credential.qualified_username();
        let resp = self
            .client
            .post(self.url(&content.session_manager, "Login"))
            .json(&LoginRequest {
                user_name: &user_name,
                password: &credential.password,
            })
            .send()
            .await
            .map_err(BackendError::from_transport)?;
        let resp = check_response(resp).await?;

        let session_key = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BackendError::Protocol(format!("в ответе Login нет заголовка {SESSION_HEADER}"))
            })?;

        debug!(manager = %self.id, host = %self.host, "вход в менеджер кластера выполнен");
        Ok(ClusterConnection {
            manager_id: self.id.clone(),
            host: self.host.clone(),
            product_name: content.about.name,
            session_key,
            root_folder: content.root_folder,
            view_manager: content.view_manager,
            session_manager: content.session_manager,
        })
    }

    async fn fetch_cluster_inventory(
        &self,
        conn: &ClusterConnection,
        cluster_name: &str,
    ) -> Result<ClusterDescriptor, BackendError> {
        let cluster = self
            .find_cluster(conn, cluster_name)
            .await?
            .ok_or_else(|| BackendError::NotFound(cluster_name.to_string()))?;

        let host_refs: Vec<MoRef> = self.get(conn, &cluster, "host").await?;
        let mut hosts = Vec::with_capacity(host_refs.len());
        for host in &host_refs {
            hosts.push(self.read_host(conn, host).await);
        }

        Ok(ClusterDescriptor {
            backend_fqdn: conn.host.clone(),
            backend_name: conn.product_name.clone(),
            cluster_name: cluster_name.to_string(),
            hosts,
        })
    }

    async fn logout(&self, conn: &ClusterConnection) -> Result<(), BackendError> {
        self.invoke(conn, &conn.session_manager, "Logout").await
    }
}
