//! reqwest-backed implementation of [`CloudClient`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::client::{CloudClient, CloudConnector, CloudResult};
use crate::credentials::Credentials;
use crate::error::CloudError;
use crate::limiter::{LimiterObserver, LimiterRegistry};
use crate::types::*;

/// Default base URL of the cloud API
pub const DEFAULT_API_URL: &str = "https://api.stratus.cloud/v4";

/// Path of the instance collection; POSTs here are admission limited
pub const INSTANCES_PATH: &str = "instances";

/// Wait applied to a 429 without a usable Retry-After header
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(10);

const PAGE_SIZE: u32 = 500;

/// Hook invoked with the headers of every API response, before the
/// status is checked. Lets callers track server-side state such as rate
/// limit windows without the client knowing about them.
pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, method: &Method, path: &str, headers: &HeaderMap);
}

/// Cloud API client authenticated with one API token
pub struct HttpCloudClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    observer: Option<Arc<dyn ResponseObserver>>,
}

impl HttpCloudClient {
    pub fn new(http: reqwest::Client, base_url: &str, credentials: Credentials) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        filter: Option<Value>,
    ) -> CloudResult<Response> {
        trace!(%method, path, "cloud API request");
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(self.credentials.token());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        if let Some(filter) = filter {
            request = request.header("X-Filter", filter.to_string());
        }

        let response = request.send().await?;
        if let Some(observer) = &self.observer {
            observer.on_response(&method, path, response.headers());
        }
        check_status(path, response).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> CloudResult<T> {
        let response = self.send(method, path, &[], body, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }

    async fn request_empty(&self, method: Method, path: &str, body: Option<Value>) -> CloudResult<()> {
        self.send(method, path, &[], body, None).await?;
        Ok(())
    }

    /// Fetch every page of a collection
    async fn list<T: DeserializeOwned>(&self, path: &str, filter: Option<Value>) -> CloudResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let query = [("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())];
            let response = self
                .send(Method::GET, path, &query, None, filter.clone())
                .await?;
            let body: Page<T> = response
                .json()
                .await
                .map_err(|e| CloudError::Decode(e.to_string()))?;
            items.extend(body.data);
            if body.page >= body.pages {
                break;
            }
            page = body.page + 1;
        }
        Ok(items)
    }

    async fn find_by_label<T: DeserializeOwned>(&self, path: &str, label: &str) -> CloudResult<Option<T>> {
        let mut found: Vec<T> = self.list(path, Some(json!({ "label": label }))).await?;
        Ok(found.pop())
    }
}

fn to_body(value: &impl Serialize) -> CloudResult<Value> {
    serde_json::to_value(value).map_err(|e| CloudError::Decode(e.to_string()))
}

async fn check_status(path: &str, response: Response) -> CloudResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(CloudError::not_found(path)),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = retry_after_header(response.headers());
            debug!(path, retry_after_secs = retry_after.as_secs(), "cloud API rate limited");
            Err(CloudError::RateLimited { retry_after })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::api(status.as_u16(), error_message(&body)))
        }
    }
}

fn retry_after_header(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF)
}

#[derive(Deserialize)]
struct ApiErrors {
    errors: Vec<ApiErrorReason>,
}

#[derive(Deserialize)]
struct ApiErrorReason {
    reason: String,
    #[serde(default)]
    field: Option<String>,
}

/// Flatten the API's `{"errors": [{reason, field}]}` body into one line
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrors>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .iter()
            .map(|e| match &e.field {
                Some(field) => format!("[{}] {}", field, e.reason),
                None => e.reason.clone(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ if body.trim().is_empty() => "no error details".to_string(),
        _ => body.trim().to_string(),
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> CloudResult<Instance> {
        self.request(Method::POST, INSTANCES_PATH, Some(to_body(request)?))
            .await
    }

    async fn get_instance(&self, id: CloudId) -> CloudResult<Instance> {
        self.request(Method::GET, &format!("instances/{id}"), None).await
    }

    async fn find_instance(&self, label: &str) -> CloudResult<Option<Instance>> {
        self.find_by_label(INSTANCES_PATH, label).await
    }

    async fn boot_instance(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::POST, &format!("instances/{id}/boot"), None)
            .await
    }

    async fn delete_instance(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::DELETE, &format!("instances/{id}"), None)
            .await
    }

    async fn list_instance_disks(&self, id: CloudId) -> CloudResult<Vec<Disk>> {
        self.list(&format!("instances/{id}/disks"), None).await
    }

    async fn resize_disk(&self, instance: CloudId, disk: CloudId, size_mb: u64) -> CloudResult<()> {
        self.request_empty(
            Method::POST,
            &format!("instances/{instance}/disks/{disk}/resize"),
            Some(json!({ "size": size_mb })),
        )
        .await
    }

    async fn create_disk(&self, instance: CloudId, request: &CreateDiskRequest) -> CloudResult<Disk> {
        self.request(
            Method::POST,
            &format!("instances/{instance}/disks"),
            Some(to_body(request)?),
        )
        .await
    }

    async fn get_instance_ips(&self, id: CloudId) -> CloudResult<InstanceIps> {
        self.request(Method::GET, &format!("instances/{id}/ips"), None)
            .await
    }

    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> CloudResult<LoadBalancer> {
        self.request(Method::POST, "load-balancers", Some(to_body(request)?))
            .await
    }

    async fn get_load_balancer(&self, id: CloudId) -> CloudResult<LoadBalancer> {
        self.request(Method::GET, &format!("load-balancers/{id}"), None)
            .await
    }

    async fn find_load_balancer(&self, label: &str) -> CloudResult<Option<LoadBalancer>> {
        self.find_by_label("load-balancers", label).await
    }

    async fn delete_load_balancer(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::DELETE, &format!("load-balancers/{id}"), None)
            .await
    }

    async fn list_load_balancer_configs(&self, id: CloudId) -> CloudResult<Vec<LoadBalancerConfig>> {
        self.list(&format!("load-balancers/{id}/configs"), None).await
    }

    async fn create_load_balancer_config(
        &self,
        id: CloudId,
        request: &CreateLoadBalancerConfigRequest,
    ) -> CloudResult<LoadBalancerConfig> {
        self.request(
            Method::POST,
            &format!("load-balancers/{id}/configs"),
            Some(to_body(request)?),
        )
        .await
    }

    async fn list_load_balancer_nodes(
        &self,
        id: CloudId,
        config: CloudId,
    ) -> CloudResult<Vec<LoadBalancerNode>> {
        self.list(&format!("load-balancers/{id}/configs/{config}/nodes"), None)
            .await
    }

    async fn create_load_balancer_node(
        &self,
        id: CloudId,
        config: CloudId,
        request: &CreateLoadBalancerNodeRequest,
    ) -> CloudResult<LoadBalancerNode> {
        self.request(
            Method::POST,
            &format!("load-balancers/{id}/configs/{config}/nodes"),
            Some(to_body(request)?),
        )
        .await
    }

    async fn delete_load_balancer_node(
        &self,
        id: CloudId,
        config: CloudId,
        node: CloudId,
    ) -> CloudResult<()> {
        self.request_empty(
            Method::DELETE,
            &format!("load-balancers/{id}/configs/{config}/nodes/{node}"),
            None,
        )
        .await
    }

    async fn create_vpc(&self, request: &CreateVpcRequest) -> CloudResult<Vpc> {
        self.request(Method::POST, "vpcs", Some(to_body(request)?)).await
    }

    async fn get_vpc(&self, id: CloudId) -> CloudResult<Vpc> {
        self.request(Method::GET, &format!("vpcs/{id}"), None).await
    }

    async fn find_vpc(&self, label: &str) -> CloudResult<Option<Vpc>> {
        self.find_by_label("vpcs", label).await
    }

    async fn delete_vpc(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::DELETE, &format!("vpcs/{id}"), None)
            .await
    }

    async fn create_subnet(&self, vpc: CloudId, request: &CreateSubnetRequest) -> CloudResult<Subnet> {
        self.request(
            Method::POST,
            &format!("vpcs/{vpc}/subnets"),
            Some(to_body(request)?),
        )
        .await
    }

    async fn create_firewall(&self, request: &CreateFirewallRequest) -> CloudResult<Firewall> {
        self.request(Method::POST, "firewalls", Some(to_body(request)?))
            .await
    }

    async fn get_firewall(&self, id: CloudId) -> CloudResult<Firewall> {
        self.request(Method::GET, &format!("firewalls/{id}"), None).await
    }

    async fn find_firewall(&self, label: &str) -> CloudResult<Option<Firewall>> {
        self.find_by_label("firewalls", label).await
    }

    async fn set_firewall_status(&self, id: CloudId, enabled: bool) -> CloudResult<()> {
        let status = if enabled { "enabled" } else { "disabled" };
        self.request_empty(
            Method::PUT,
            &format!("firewalls/{id}"),
            Some(json!({ "status": status })),
        )
        .await
    }

    async fn get_firewall_rules(&self, id: CloudId) -> CloudResult<FirewallRules> {
        self.request(Method::GET, &format!("firewalls/{id}/rules"), None)
            .await
    }

    async fn update_firewall_rules(&self, id: CloudId, rules: &FirewallRules) -> CloudResult<()> {
        self.request_empty(
            Method::PUT,
            &format!("firewalls/{id}/rules"),
            Some(to_body(rules)?),
        )
        .await
    }

    async fn delete_firewall(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::DELETE, &format!("firewalls/{id}"), None)
            .await
    }

    async fn create_bucket(&self, request: &CreateBucketRequest) -> CloudResult<Bucket> {
        self.request(
            Method::POST,
            "object-storage/buckets",
            Some(to_body(request)?),
        )
        .await
    }

    async fn get_bucket(&self, region: &str, label: &str) -> CloudResult<Bucket> {
        self.request(
            Method::GET,
            &format!("object-storage/buckets/{region}/{label}"),
            None,
        )
        .await
    }

    async fn get_bucket_access(&self, region: &str, label: &str) -> CloudResult<BucketAccess> {
        self.request(
            Method::GET,
            &format!("object-storage/buckets/{region}/{label}/access"),
            None,
        )
        .await
    }

    async fn update_bucket_access(
        &self,
        region: &str,
        label: &str,
        access: &BucketAccess,
    ) -> CloudResult<()> {
        self.request_empty(
            Method::PUT,
            &format!("object-storage/buckets/{region}/{label}/access"),
            Some(to_body(access)?),
        )
        .await
    }

    async fn delete_bucket(&self, region: &str, label: &str) -> CloudResult<()> {
        self.request_empty(
            Method::DELETE,
            &format!("object-storage/buckets/{region}/{label}"),
            None,
        )
        .await
    }

    async fn create_key(&self, request: &CreateKeyRequest) -> CloudResult<ObjectKey> {
        self.request(Method::POST, "object-storage/keys", Some(to_body(request)?))
            .await
    }

    async fn get_key(&self, id: CloudId) -> CloudResult<ObjectKey> {
        self.request(Method::GET, &format!("object-storage/keys/{id}"), None)
            .await
    }

    async fn delete_key(&self, id: CloudId) -> CloudResult<()> {
        self.request_empty(Method::DELETE, &format!("object-storage/keys/{id}"), None)
            .await
    }
}

/// Connects clients that share one HTTP pool and one limiter registry
pub struct HttpConnector {
    http: reqwest::Client,
    base_url: String,
    limiters: Arc<LimiterRegistry>,
}

impl HttpConnector {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        limiters: Arc<LimiterRegistry>,
    ) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stratus-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            limiters,
        })
    }
}

impl CloudConnector for HttpConnector {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn CloudClient> {
        let observer = LimiterObserver::new(self.limiters.limiter_for(credentials));
        Arc::new(
            HttpCloudClient::new(self.http.clone(), &self.base_url, credentials.clone())
                .with_observer(Arc::new(observer)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn api_error_reasons_are_joined_with_fields() {
        let body = r#"{"errors":[{"reason":"label must be unique","field":"label"},{"reason":"region unavailable"}]}"#;
        assert_eq!(
            error_message(body),
            "[label] label must be unique; region unavailable"
        );
    }

    #[test]
    fn unstructured_error_body_is_kept_verbatim() {
        assert_eq!(error_message("  upstream exploded \n"), "upstream exploded");
        assert_eq!(error_message(""), "no error details");
        assert_eq!(error_message(r#"{"errors":[]}"#), r#"{"errors":[]}"#);
    }

    #[test]
    fn retry_after_falls_back_when_missing_or_malformed() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_header(&headers), DEFAULT_RATE_LIMIT_BACKOFF);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after_header(&headers), DEFAULT_RATE_LIMIT_BACKOFF);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(retry_after_header(&headers), Duration::from_secs(17));
    }

    #[test]
    fn urls_are_joined_without_double_slashes() {
        let client = HttpCloudClient::new(
            reqwest::Client::new(),
            "https://api.example.test/v4/",
            Credentials::new("t"),
        );
        assert_eq!(
            client.url("/instances/3"),
            "https://api.example.test/v4/instances/3"
        );
    }

    #[test]
    fn connector_registers_a_limiter_per_account() {
        let registry = Arc::new(LimiterRegistry::default());
        let connector =
            HttpConnector::new(DEFAULT_API_URL, Duration::from_secs(30), registry.clone()).unwrap();
        let _a = connector.connect(&Credentials::new("a"));
        let _a2 = connector.connect(&Credentials::new("a"));
        let _b = connector.connect(&Credentials::new("b"));
        assert_eq!(registry.len(), 2);
    }
}
