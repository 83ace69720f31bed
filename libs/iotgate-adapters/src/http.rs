//! HTTP polling adapter
//!
//! A ticker-driven loop requests every configured endpoint, extracts a value
//! with the endpoint's JSON path and updates cache and store. A bad response
//! is recorded and the loop keeps running; a transport failure (refused
//! connection, timeout, broken stream) marks the adapter disconnected and
//! ends the loop so the supervisor can reconnect it.

use std::sync::Arc;

use async_trait::async_trait;
use errors::{protocol_error, GatewayError, GatewayResult};
use iotgate_model::{Device, Value, Variable};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::base::{write_envelope, AdapterBase, BackgroundTask, ConnectionState};
use crate::config::{default_string_id, HttpAuth, HttpConfig, HttpEndpoint};
use crate::traits::ProtocolAdapter;

pub const PROTOCOL: &str = "http";

struct HttpShared {
    base: AdapterBase,
    config: HttpConfig,
    cache: RwLock<FxHashMap<u64, Variable>>,
}

impl HttpShared {
    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match &self.config.auth {
            HttpAuth::None => request,
            HttpAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            HttpAuth::Bearer { token } => request.bearer_auth(token),
        }
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(format!("{} after {}", url, humantime::format_duration(self.config.timeout)))
        } else if e.is_connect() {
            GatewayError::connection(url, e.to_string())
        } else {
            GatewayError::HttpClient(e)
        }
    }

    async fn poll_endpoint(&self, client: &Client, endpoint: &HttpEndpoint) -> GatewayResult<Variable> {
        let url = self.config.url_for(endpoint);
        let method = Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| GatewayError::invalid_config("method", e.to_string()))?;

        let mut request = client.request(method, &url);
        if !endpoint.query_params.is_empty() {
            request = request.query(&endpoint.query_params);
        }
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(protocol_error!(PROTOCOL, format!("{} returned HTTP {}", url, status)));
        }
        let body = response.bytes().await?;
        debug!("HTTP {} -> {} bytes", url, body.len());

        let value = iotgate_transform::transform(&body, &endpoint.json_path, endpoint.data_type)?;
        let device_id = self.base.device_id();
        let string_id = endpoint
            .string_id
            .clone()
            .unwrap_or_else(|| default_string_id(&device_id, endpoint.variable_id));
        Ok(Variable::new(endpoint.variable_id, string_id, endpoint.data_type)
            .with_device(device_id)
            .with_value(value))
    }

    /// One pass over every endpoint; returns the first transport failure
    async fn poll_all(&self, client: &Client) -> Option<String> {
        for endpoint in &self.config.endpoints {
            match self.poll_endpoint(client, endpoint).await {
                Ok(variable) => {
                    self.cache.write().insert(variable.id, variable.clone());
                    self.base.record_read(true);
                    self.base.sink().deliver(&variable);
                },
                Err(e) if e.is_retryable() => {
                    self.base.record_read(false);
                    return Some(format!("poll {}: {}", endpoint.path, e));
                },
                Err(e) => {
                    self.base.record_read(false);
                    self.base.set_last_error(&format!("poll {}: {}", endpoint.path, e));
                },
            }
        }
        None
    }
}

async fn run_poll_loop(shared: Arc<HttpShared>, client: Client, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let link_lost = tokio::select! {
                    _ = cancel.cancelled() => break,
                    link_lost = shared.poll_all(&client) => link_lost,
                };
                if let Some(reason) = link_lost {
                    shared.base.mark_disconnected(reason);
                    break;
                }
            }
        }
    }
    debug!("HTTP polling stopped for {}", shared.base.device_id());
}

struct HttpSession {
    client: Client,
    task: BackgroundTask,
}

pub struct HttpAdapter {
    shared: Arc<HttpShared>,
    session: tokio::sync::Mutex<Option<HttpSession>>,
}

impl HttpAdapter {
    pub fn new(device: &Device, config: HttpConfig) -> Self {
        Self::from_parts(AdapterBase::new(PROTOCOL, device.clone()), config)
    }

    pub fn from_device(device: &Device) -> GatewayResult<Self> {
        Ok(Self::new(device, HttpConfig::from_device(device)?))
    }

    pub fn from_parts(base: AdapterBase, config: HttpConfig) -> Self {
        Self {
            shared: Arc::new(HttpShared {
                base,
                config,
                cache: RwLock::new(FxHashMap::default()),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.shared.config
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn base(&self) -> &AdapterBase {
        &self.shared.base
    }

    async fn connect(&self, device: &Device) -> GatewayResult<()> {
        let mut session = self.session.lock().await;
        if self.shared.base.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.task.stop().await;
        }

        let base = &self.shared.base;
        base.set_device(device);
        base.set_state(ConnectionState::Connecting);

        let client = match Client::builder()
            .timeout(self.shared.config.timeout)
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                let err = GatewayError::HttpClient(e);
                base.mark_disconnected(&err);
                return Err(err);
            },
        };

        let shared = Arc::clone(&self.shared);
        let poll_client = client.clone();
        let task = BackgroundTask::spawn(move |cancel| run_poll_loop(shared, poll_client, cancel));

        base.mark_connected();
        info!(
            "HTTP polling {} every {} for device {}",
            self.shared.config.base_url,
            humantime::format_duration(self.shared.config.poll_interval),
            device.id
        );
        *session = Some(HttpSession { client, task });
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        let mut session = self.session.lock().await;
        if let Some(HttpSession { client, task }) = session.take() {
            task.stop().await;
            // Dropping the last client handle closes its idle connections
            drop(client);
            info!("HTTP polling stopped: {}", self.shared.base.device_id());
        }
        self.shared.base.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Last polled value for `id`
    async fn read_variable(&self, id: u64) -> GatewayResult<Variable> {
        self.shared.base.ensure_connected()?;
        self.shared
            .cache
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("variable {} has not been polled yet", id)))
    }

    async fn write_variable(&self, id: u64, value: Value) -> GatewayResult<()> {
        let shared = &self.shared;
        shared.base.ensure_connected()?;
        let endpoint = shared
            .config
            .endpoint_for(id)
            .ok_or_else(|| GatewayError::not_found(format!("endpoint for variable {}", id)))?;
        let client = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| GatewayError::NotConnected(format!("http device {}", shared.base.device_id())))?;

        let url = shared.config.url_for(endpoint);
        let request = client.post(&url).json(&write_envelope(id, &value));
        let outcome = match shared.authorize(request).send().await {
            Ok(response) if response.status() == StatusCode::OK => Ok(()),
            Ok(response) => Err(protocol_error!(
                PROTOCOL,
                format!("{} returned HTTP {}", url, response.status())
            )),
            Err(e) => Err(shared.map_send_error(&url, e)),
        };

        match &outcome {
            Ok(()) => {
                shared.base.record_write(true);
                debug!("HTTP wrote var {} to {}", id, url);
            },
            Err(e) => {
                shared.base.record_write(false);
                shared.base.set_last_error(e);
            },
        }
        outcome
    }
}
