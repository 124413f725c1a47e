use crate::app::GatewayConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

/// Answer to a create-instance request.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    Created { instance_name: String, qr_code: Option<String> },
    Rejected { error: String },
}

/// Answer to a send-message request.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent { message_id: Option<String> },
    Rejected { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Connecting,
    Closed,
    Unknown(String),
}

impl ConnectionState {
    fn parse(raw: &str) -> Self {
        match raw {
            "open" => ConnectionState::Open,
            "connecting" => ConnectionState::Connecting,
            "close" | "closed" => ConnectionState::Closed,
            other => ConnectionState::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub phone: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub state: ConnectionState,
    pub qr_code: Option<String>,
    pub profile: Option<Profile>,
}

/// The messaging gateway as the rest of the crate sees it.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Fails with [`Error::Config`] when credentials are missing.
    fn ensure_configured(&self) -> Result<()>;

    async fn create_instance(&self, instance_name: &str, display_name: &str) -> Result<InstanceOutcome>;

    async fn send_message(&self, instance_name: &str, recipient: &str, text: &str) -> Result<SendOutcome>;

    async fn fetch_status(&self, instance_name: &str) -> Result<InstanceStatus>;
}

/// Evolution API client.
pub struct EvolutionClient {
    http: HttpClient,
    endpoint: Option<String>,
    api_key: String,
    handshake_delay: Duration,
}

impl EvolutionClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {e}")))?;
        let endpoint = if config.endpoint.trim().is_empty() {
            None
        } else {
            let normalized = crate::utils::normalize_url(&config.endpoint);
            Url::parse(&normalized)
                .map_err(|e| Error::Config(format!("invalid gateway endpoint '{}': {e}", config.endpoint)))?;
            Some(normalized)
        };
        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.trim().to_string(),
            handshake_delay: Duration::from_millis(config.handshake_delay_ms),
        })
    }

    fn base(&self) -> Result<&str> {
        match self.endpoint.as_deref() {
            Some(base) if !self.api_key.is_empty() => Ok(base),
            _ => Err(Error::Config(
                "Evolution API credentials not configured; set EVOLUTION_API_ENDPOINT and EVOLUTION_API_KEY".into(),
            )),
        }
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
    }

    async fn read_json(resp: reqwest::Response) -> Value {
        resp.json::<Value>().await.unwrap_or(Value::Null)
    }

    /// `GET /instance/connect/{name}`. Failures here only mean "no QR yet".
    async fn connect_qr(&self, base: &str, instance_name: &str) -> Option<String> {
        let endpoint = format!("{}/instance/connect/{}", base, instance_name);
        match self.with_auth(self.http.get(&endpoint)).send().await {
            Ok(resp) if resp.status().is_success() => qr_from(&Self::read_json(resp).await),
            Ok(resp) => {
                log::debug!("QR request for {instance_name} answered HTTP {}", resp.status());
                None
            }
            Err(e) => {
                log::debug!("QR request for {instance_name} failed: {e}");
                None
            }
        }
    }

    async fn profile(&self, base: &str, instance_name: &str) -> Option<Profile> {
        let endpoint = format!("{}/chat/whatsappProfile/{}", base, instance_name);
        match self.with_auth(self.http.get(&endpoint)).send().await {
            Ok(resp) if resp.status().is_success() => profile_from(&Self::read_json(resp).await),
            Ok(resp) => {
                log::debug!("profile request for {instance_name} answered HTTP {}", resp.status());
                None
            }
            Err(e) => {
                log::debug!("profile request for {instance_name} failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl MessageGateway for EvolutionClient {
    fn ensure_configured(&self) -> Result<()> {
        self.base().map(|_| ())
    }

    async fn create_instance(&self, instance_name: &str, display_name: &str) -> Result<InstanceOutcome> {
        let base = self.base()?;
        if instance_name.is_empty() || display_name.trim().is_empty() {
            return Err(Error::Validation("instanceName and connectionName are required".into()));
        }
        log::info!("creating gateway instance {instance_name} for {display_name}");
        let body = json!({
            "instanceName": instance_name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        let resp = self
            .with_auth(self.http.post(format!("{}/instance/create", base)))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::remote("gateway create-instance", e))?;
        let status = resp.status();
        let json = Self::read_json(resp).await;
        if !status.is_success() {
            log::warn!("gateway refused instance {instance_name}: {json}");
            return Ok(InstanceOutcome::Rejected {
                error: error_message(&json, status.as_u16(), "Failed to create instance"),
            });
        }

        // The instance needs a moment before it can hand out a QR code.
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        let qr_code = match qr_from(&json) {
            Some(qr) => Some(qr),
            None => self.connect_qr(base, instance_name).await,
        };
        Ok(InstanceOutcome::Created {
            instance_name: instance_name.to_string(),
            qr_code,
        })
    }

    async fn send_message(&self, instance_name: &str, recipient: &str, text: &str) -> Result<SendOutcome> {
        let base = self.base()?;
        if instance_name.is_empty() || recipient.is_empty() || text.is_empty() {
            return Err(Error::Validation("instanceName, to, and message are required".into()));
        }
        let endpoint = format!("{}/message/sendText/{}", base, instance_name);
        let resp = self
            .with_auth(self.http.post(&endpoint))
            .json(&json!({ "number": recipient, "text": text }))
            .send()
            .await
            .map_err(|e| Error::remote("gateway send-message", e))?;
        let status = resp.status();
        let json = Self::read_json(resp).await;
        if !status.is_success() {
            return Ok(SendOutcome::Rejected {
                error: error_message(&json, status.as_u16(), "Failed to send message"),
            });
        }
        let message_id = json
            .get("key")
            .and_then(|k| k.get("id"))
            .or_else(|| json.get("messageId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(SendOutcome::Sent { message_id })
    }

    async fn fetch_status(&self, instance_name: &str) -> Result<InstanceStatus> {
        let base = self.base()?;
        let endpoint = format!("{}/instance/fetchInstances", base);
        let resp = self
            .with_auth(self.http.get(&endpoint))
            .query(&[("instanceName", instance_name)])
            .send()
            .await
            .map_err(|e| Error::remote("gateway fetch-status", e))?;
        if !resp.status().is_success() {
            return Err(Error::Remote(format!(
                "gateway instance fetch failed: HTTP {}",
                resp.status()
            )));
        }
        let json = Self::read_json(resp).await;
        let (state, mut qr_code) = instance_state_from(&json)
            .ok_or_else(|| Error::Remote(format!("gateway instance {instance_name} not found")))?;

        let mut profile = None;
        if state == ConnectionState::Open {
            profile = self.profile(base, instance_name).await;
        } else if qr_code.is_none() {
            qr_code = self.connect_qr(base, instance_name).await;
        }
        Ok(InstanceStatus { state, qr_code, profile })
    }
}

/// Gateways answer errors in a few shapes: a plain `message`, a nested
/// `response.message` (string or list), or just `error`.
fn error_message(json: &Value, status: u16, fallback: &str) -> String {
    fn text(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(text).collect();
                if parts.is_empty() { None } else { Some(parts.join("; ")) }
            }
            _ => None,
        }
    }
    json.get("message")
        .and_then(text)
        .or_else(|| json.get("response").and_then(|r| r.get("message")).and_then(text))
        .or_else(|| json.get("error").and_then(text))
        .unwrap_or_else(|| format!("{fallback} (HTTP {status})"))
}

fn qr_from(json: &Value) -> Option<String> {
    let direct = json
        .get("base64")
        .or_else(|| json.get("qrcode").filter(|v| v.is_string()))
        .and_then(|v| v.as_str());
    let nested = || {
        json.get("qrcode")
            .and_then(|q| q.get("base64").or_else(|| q.get("code")))
            .and_then(|v| v.as_str())
    };
    direct.or_else(nested).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Reads the first entry of a `fetchInstances` answer. Older gateways nest it
/// under `instance` with `state`; newer ones are flat with `connectionStatus`.
fn instance_state_from(json: &Value) -> Option<(ConnectionState, Option<String>)> {
    let first = json.as_array().and_then(|items| items.first()).or_else(|| {
        if json.is_object() && (json.get("instance").is_some() || json.get("connectionStatus").is_some()) {
            Some(json)
        } else {
            None
        }
    })?;
    let inner = first.get("instance").unwrap_or(first);
    let state = inner
        .get("state")
        .or_else(|| inner.get("connectionStatus"))
        .or_else(|| first.get("connectionStatus"))
        .and_then(|v| v.as_str())
        .map(ConnectionState::parse)
        .unwrap_or_else(|| ConnectionState::Unknown(String::new()));
    Some((state, qr_from(inner)))
}

fn profile_from(json: &Value) -> Option<Profile> {
    if !json.is_object() {
        return None;
    }
    let phone = json
        .get("wuid")
        .and_then(|v| v.as_str())
        .map(|w| w.trim_end_matches("@s.whatsapp.net").to_string());
    let display_name = json.get("name").and_then(|v| v.as_str()).map(str::to_string);
    Some(Profile { phone, display_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> EvolutionClient {
        EvolutionClient::new(&GatewayConfig {
            endpoint: server.uri(),
            api_key: "evo-key".into(),
            handshake_delay_ms: 0,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn missing_credentials_is_a_config_error() {
        let c = EvolutionClient::new(&GatewayConfig::default()).unwrap();
        assert!(matches!(c.ensure_configured(), Err(Error::Config(_))));

        let c = EvolutionClient::new(&GatewayConfig {
            endpoint: "evo.example.com".into(),
            ..GatewayConfig::default()
        })
        .unwrap();
        assert!(matches!(c.ensure_configured(), Err(Error::Config(_))));
    }

    #[test]
    fn error_messages_from_every_shape() {
        assert_eq!(error_message(&json!({"message": "nope"}), 400, "x"), "nope");
        assert_eq!(
            error_message(&json!({"response": {"message": ["a", "b"]}}), 403, "x"),
            "a; b"
        );
        assert_eq!(error_message(&json!({"error": "Bad"}), 400, "x"), "Bad");
        assert_eq!(error_message(&Value::Null, 500, "Failed"), "Failed (HTTP 500)");
    }

    #[test]
    fn instance_state_reads_old_and_new_shapes() {
        let old = json!([{"instance": {"instanceName": "a", "state": "open"}}]);
        assert_eq!(instance_state_from(&old), Some((ConnectionState::Open, None)));

        let new = json!([{"name": "a", "connectionStatus": "connecting", "qrcode": {"base64": "data:image/png;base64,AAA"}}]);
        assert_eq!(
            instance_state_from(&new),
            Some((ConnectionState::Connecting, Some("data:image/png;base64,AAA".into())))
        );

        assert_eq!(instance_state_from(&json!([])), None);
    }

    #[tokio::test]
    async fn create_instance_fetches_qr_after_creation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instance/create"))
            .and(header("apikey", "evo-key"))
            .and(body_partial_json(json!({"instanceName": "chip_a", "qrcode": true})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"instance": {"instanceName": "chip_a"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instance/connect/chip_a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"base64": "QR-DATA"})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server).create_instance("chip_a", "Chip A").await.unwrap();
        assert_eq!(
            outcome,
            InstanceOutcome::Created { instance_name: "chip_a".into(), qr_code: Some("QR-DATA".into()) }
        );
    }

    #[tokio::test]
    async fn create_instance_rejection_is_tagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instance/create"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(json!({"response": {"message": ["This name \"chip_a\" is already in use."]}})),
            )
            .mount(&server)
            .await;

        let outcome = client(&server).create_instance("chip_a", "Chip A").await.unwrap();
        assert_eq!(
            outcome,
            InstanceOutcome::Rejected { error: "This name \"chip_a\" is already in use.".into() }
        );
    }

    #[tokio::test]
    async fn send_message_posts_number_and_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/chip_a"))
            .and(body_partial_json(json!({"number": "+5511000", "text": "oi"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"key": {"id": "MSG1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server).send_message("chip_a", "+5511000", "oi").await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent { message_id: Some("MSG1".into()) });
    }

    #[tokio::test]
    async fn send_message_failure_is_rejected_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/chip_a"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "number not on whatsapp"})))
            .mount(&server)
            .await;

        let outcome = client(&server).send_message("chip_a", "+1", "oi").await.unwrap();
        assert_eq!(outcome, SendOutcome::Rejected { error: "number not on whatsapp".into() });
    }

    #[tokio::test]
    async fn fetch_status_reads_profile_when_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/fetchInstances"))
            .and(query_param("instanceName", "chip_a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"instance": {"state": "open"}}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/chat/whatsappProfile/chip_a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "wuid": "5511999990000@s.whatsapp.net",
                "name": "Chip A",
                "picture": "https://pics/a.png"
            })))
            .mount(&server)
            .await;

        let status = client(&server).fetch_status("chip_a").await.unwrap();
        assert_eq!(status.state, ConnectionState::Open);
        let profile = status.profile.unwrap();
        assert_eq!(profile.phone.as_deref(), Some("5511999990000"));
        assert_eq!(profile.display_name.as_deref(), Some("Chip A"));
    }

    #[tokio::test]
    async fn fetch_status_asks_for_qr_when_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/fetchInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"instance": {"state": "close"}}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instance/connect/chip_a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"qrcode": "2@abc"})))
            .expect(1)
            .mount(&server)
            .await;

        let status = client(&server).fetch_status("chip_a").await.unwrap();
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.qr_code.as_deref(), Some("2@abc"));
        assert!(status.profile.is_none());
    }

    #[tokio::test]
    async fn fetch_status_unknown_instance_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/fetchInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let err = client(&server).fetch_status("ghost").await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }
}
