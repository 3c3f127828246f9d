pub mod services;

use futures::future::join_all;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use services::{builtin_services, params_for, Delivery, DeliveryBody, NotificationService};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid notification config {path}: {message}")]
    Config { path: String, message: String },
    #[error("notification delivery failed: {}", .0.join("; "))]
    Delivery(Vec<String>),
}

fn serialize_nanos<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
}

/// Body of every notification, also posted verbatim to webhooks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub range_id: String,
    pub test: bool,
    #[serde(serialize_with = "serialize_nanos")]
    pub duration: Duration,
    pub date: String,
    pub subject: String,
    pub success: bool,
    pub message: String,
}

impl NotificationPayload {
    /// Build the payload for a finished deployment; `faults` only matter on failure
    pub fn new(
        success: bool,
        range_id: &str,
        host: Option<String>,
        faults: &[String],
        test: bool,
        duration: Duration,
    ) -> Self {
        let host = host.filter(|h| !h.is_empty());
        let host_label = host.as_deref().unwrap_or_default();
        let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let subject = if success {
            format!("Deployment succeeded for range {} on host {}", range_id, host_label)
        } else {
            format!("Error while deploying range {} on host {}", range_id, host_label)
        };

        let mut parts = Vec::new();
        if test {
            parts.push("TEST NOTIFICATION:".to_string());
        }
        if success {
            parts.push(format!("Successfully deployed range: {}", range_id));
        } else {
            parts.push(format!("Error while deploying range: {}", range_id));
            if !faults.is_empty() {
                parts.push("Fatal errors:".to_string());
                for (i, fault) in faults.iter().enumerate() {
                    parts.push(format!("Error {}:\n{}\n", i + 1, fault));
                }
            }
        }
        if let Some(host) = &host {
            parts.push(format!("Host: {}", host));
        }
        parts.push(format!("Duration: {}", format_duration(duration)));
        parts.push(String::new());
        parts.push(format!("Date: {}", date));

        Self {
            host,
            range_id: range_id.to_string(),
            test,
            duration,
            date,
            subject,
            success,
            message: parts.join("\n"),
        }
    }
}

/// Rounded to whole seconds, e.g. `0s`, `42s`, `3m5s`, `1h0m12s`
fn format_duration(duration: Duration) -> String {
    let total = (duration.as_millis() + 500) / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[derive(Debug, Default, Deserialize)]
struct NotifyConfig {
    #[serde(default)]
    notify: NotifySection,
}

#[derive(Debug, Default, Deserialize)]
struct NotifySection {
    #[serde(default)]
    urls: Vec<String>,
}

/// Fans a payload out to every URL listed under `notify.urls` in a YAML file
pub struct NotificationDispatcher {
    client: reqwest::Client,
    services: HashMap<&'static str, Box<dyn NotificationService>>,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl NotificationDispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        let mut dispatcher = Self {
            client,
            services: HashMap::new(),
        };
        for service in builtin_services() {
            dispatcher.register(service);
        }
        dispatcher
    }

    pub fn register(&mut self, service: Box<dyn NotificationService>) {
        self.services.insert(service.scheme(), service);
    }

    /// Deliver `payload` to every configured destination concurrently.
    ///
    /// A missing config file or an empty URL list sends nothing.
    pub async fn send(
        &self,
        config_path: &Path,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let urls = match tokio::fs::read_to_string(config_path).await {
            Ok(contents) => {
                let config: NotifyConfig =
                    serde_yaml::from_str(&contents).map_err(|e| NotifyError::Config {
                        path: config_path.display().to_string(),
                        message: e.to_string(),
                    })?;
                config.notify.urls
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No notification config at {}", config_path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(NotifyError::Config {
                    path: config_path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        if urls.is_empty() {
            return Ok(());
        }

        let deliveries = urls.iter().map(|url| async move {
            if url.starts_with("http://") || url.starts_with("https://") {
                self.send_webhook(url, payload).await
            } else {
                self.send_service(url, payload).await
            }
        });

        let errors: Vec<String> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Delivery(errors))
        }
    }

    async fn send_webhook(&self, url: &str, payload: &NotificationPayload) -> Result<(), String> {
        tracing::info!("Sending webhook to {}", url);
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("webhook {}: {}", url, e))?;
        if !response.status().is_success() {
            return Err(format!("webhook {}: HTTP {}", url, response.status()));
        }
        Ok(())
    }

    async fn send_service(&self, raw: &str, payload: &NotificationPayload) -> Result<(), String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid notification URL: {}", e))?;
        let scheme = url.scheme();
        let service = self
            .services
            .get(scheme)
            .ok_or_else(|| format!("unsupported notification service '{}'", scheme))?;

        let params = params_for(scheme, &payload.subject);
        let delivery = service
            .prepare(&url, &payload.message, &params)
            .map_err(|e| format!("{}: {}", scheme, e))?;
        self.deliver(scheme, delivery).await
    }

    async fn deliver(&self, scheme: &str, delivery: Delivery) -> Result<(), String> {
        let mut request = self.client.post(&delivery.url);
        for (name, value) in &delivery.headers {
            request = request.header(name, value);
        }
        if let Some((user, password)) = &delivery.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        request = match delivery.body {
            DeliveryBody::Json(body) => request.json(&body),
            DeliveryBody::Text(body) => request.body(body),
        };

        let response = request
            .send()
            .await
            .map_err(|e| format!("{}: {}", scheme, e))?;
        if !response.status().is_success() {
            return Err(format!("{}: HTTP {}", scheme, response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Received {
        json: Arc<Mutex<Vec<serde_json::Value>>>,
        text: Arc<Mutex<Vec<(Option<String>, String)>>>,
    }

    async fn hook(State(received): State<Received>, Json(body): Json<serde_json::Value>) {
        received.json.lock().unwrap().push(body);
    }

    async fn topic(State(received): State<Received>, headers: HeaderMap, body: String) {
        let title = headers
            .get("title")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        received.text.lock().unwrap().push((title, body));
    }

    async fn broken() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn spawn_receiver() -> (String, Received) {
        let received = Received::default();
        let app = Router::new()
            .route("/hook", post(hook))
            .route("/broken", post(broken))
            .route("/alerts", post(topic))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), received)
    }

    fn payload(success: bool) -> NotificationPayload {
        NotificationPayload::new(
            success,
            "JD",
            Some("pve1".to_string()),
            &["fatal: [vm]: boom".to_string()],
            false,
            Duration::from_millis(65_400),
        )
    }

    fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("range-config.yml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_success_payload() {
        let payload = payload(true);
        assert_eq!(payload.subject, "Deployment succeeded for range JD on host pve1");
        assert!(payload.message.starts_with("Successfully deployed range: JD\nHost: pve1\nDuration: 1m5s\n\nDate: "));
        assert!(!payload.message.contains("Fatal errors"));
    }

    #[test]
    fn test_failure_payload_lists_faults() {
        let payload = payload(false);
        assert_eq!(payload.subject, "Error while deploying range JD on host pve1");
        assert!(payload
            .message
            .contains("Fatal errors:\nError 1:\nfatal: [vm]: boom\n"));
    }

    #[test]
    fn test_test_payload_is_prefixed() {
        let payload = NotificationPayload::new(true, "JD", None, &[], true, Duration::ZERO);
        assert!(payload.message.starts_with("TEST NOTIFICATION:\n"));
        assert!(!payload.message.contains("Host:"));
        assert!(payload.message.contains("Duration: 0s"));
    }

    #[test]
    fn test_payload_json_shape() {
        let value = serde_json::to_value(payload(true)).unwrap();
        assert_eq!(value["duration"], 65_400_000_000u64);
        assert_eq!(value["host"], "pve1");
        assert_eq!(value["range_id"], "JD");
        assert_eq!(value["success"], true);

        let no_host = NotificationPayload::new(true, "JD", None, &[], false, Duration::ZERO);
        assert!(serde_json::to_value(no_host).unwrap().get("host").is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(400)), "0s");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "2s");
        assert_eq!(format_duration(Duration::from_secs(3_612)), "1h0m12s");
    }

    #[tokio::test]
    async fn test_missing_config_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let dispatcher = NotificationDispatcher::default();
        dispatcher
            .send(&dir.path().join("range-config.yml"), &payload(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_config_without_urls_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "ludus:\n  - vm_name: dc01\n");
        NotificationDispatcher::default()
            .send(&path, &payload(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "notify: [unclosed\n");
        let err = NotificationDispatcher::default()
            .send(&path, &payload(true))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Config { .. }));
    }

    #[tokio::test]
    async fn test_webhook_and_service_delivery() {
        let (addr, received) = spawn_receiver().await;
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "notify:\n  urls:\n    - http://{addr}/hook\n    - ntfy://{addr}/alerts?scheme=http\n"
            ),
        );

        NotificationDispatcher::default()
            .send(&path, &payload(true))
            .await
            .unwrap();

        let json = received.json.lock().unwrap().clone();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["range_id"], "JD");
        assert_eq!(json[0]["success"], true);

        let text = received.text.lock().unwrap().clone();
        assert_eq!(text.len(), 1);
        assert_eq!(
            text[0].0.as_deref(),
            Some("Deployment succeeded for range JD on host pve1")
        );
        assert!(text[0].1.starts_with("Successfully deployed range: JD"));
    }

    #[tokio::test]
    async fn test_errors_are_aggregated_and_do_not_block_others() {
        let (addr, received) = spawn_receiver().await;
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "notify:\n  urls:\n    - http://{addr}/broken\n    - carrierpigeon://coop/1\n    - http://{addr}/hook\n"
            ),
        );

        let err = NotificationDispatcher::default()
            .send(&path, &payload(false))
            .await
            .unwrap_err();

        match err {
            NotifyError::Delivery(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().any(|e| e.contains("HTTP 500")));
                assert!(errors.iter().any(|e| e.contains("carrierpigeon")));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(received.json.lock().unwrap().len(), 1);
    }
}
