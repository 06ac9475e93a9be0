use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use futures::{Stream, StreamExt};
use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{
    ERR_INVALID_ARGUMENT, ERR_NOT_FOUND, HEARTBEAT_INTERVAL_SECS, PATH_HEALTH, PATH_HEARTBEAT,
    PATH_REGISTER, PATH_UNREGISTER,
};
use shared::types::{Attrs, ErrorResponse, InstanceRequest, RegisterRequest, ServiceUpdate};
use crate::error::{ClientError, Result};
use crate::service_set::ServiceSet;
use crate::sse::decode_updates;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat interval matching the agent's default registration TTL
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);

/// Beats go out twice per interval, so a registration whose TTL equals the
/// interval is refreshed well before its deadline.
fn heartbeat_period(interval: Duration) -> Duration {
    (interval / 2).max(Duration::from_millis(1))
}

/// Connection to a discoverd agent
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

type UpdateStream = Pin<Box<dyn Stream<Item = Result<ServiceUpdate>> + Send>>;

/// Raw update stream of one service.
///
/// Yields the enumeration, `SyncComplete`, then live diffs. Dropping it
/// disconnects, which releases the agent-side watch.
pub struct Subscription {
    updates: UpdateStream,
}

impl Subscription {
    /// Next update, `None` once the agent ends the stream
    pub async fn next(&mut self) -> Option<Result<ServiceUpdate>> {
        self.updates.next().await
    }
}

impl Stream for Subscription {
    type Item = Result<ServiceUpdate>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.as_mut().poll_next(cx)
    }
}

/// Parse `host:port`, `:port` or a full `http://` URL.
///
/// The client is built without TLS, so other schemes are rejected here
/// rather than failing later in the transport.
fn parse_base(addr: &str) -> Result<Url> {
    let url = if addr.contains("://") {
        addr.to_string()
    } else if let Some(port) = addr.strip_prefix(':') {
        format!("http://127.0.0.1:{}", port)
    } else {
        format!("http://{}", addr)
    };

    let url = Url::parse(&url).map_err(|_| ClientError::InvalidAddress(addr.to_string()))?;
    if url.scheme() != "http" || url.cannot_be_a_base() || url.host().is_none() {
        return Err(ClientError::InvalidAddress(addr.to_string()));
    }
    Ok(url)
}

/// Map a non-success response to the matching error
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.json::<ErrorResponse>().await.ok();
    Err(match body {
        Some(body) if body.code == ERR_NOT_FOUND => ClientError::NotFound(body.message),
        Some(body) if body.code == ERR_INVALID_ARGUMENT => {
            ClientError::InvalidArgument(body.message)
        }
        Some(body) => ClientError::Remote {
            status: status.as_u16(),
            message: body.message,
        },
        None => ClientError::Remote {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        },
    })
}

impl Client {
    /// Connect to the agent at `addr` and check that it answers
    pub async fn connect(addr: &str) -> Result<Self> {
        let base = parse_base(addr)?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let client = Self { http, base };

        let response = client
            .http
            .get(client.url(PATH_HEALTH))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;

        tracing::debug!("Connected to discovery agent at {}", client.base);
        Ok(client)
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let response = self
            .http
            .post(self.url(path))
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Register `addr` under `name`, or refresh an existing registration
    pub async fn register(&self, name: &str, addr: &str, attrs: Attrs) -> Result<()> {
        let request = RegisterRequest {
            name: name.to_string(),
            addr: addr.to_string(),
            attrs,
        };
        self.post(PATH_REGISTER, &request).await
    }

    pub async fn unregister(&self, name: &str, addr: &str) -> Result<()> {
        let request = InstanceRequest {
            name: name.to_string(),
            addr: addr.to_string(),
        };
        self.post(PATH_UNREGISTER, &request).await
    }

    /// Extend a registration's TTL; `NotFound` once it has expired
    pub async fn heartbeat(&self, name: &str, addr: &str) -> Result<()> {
        let request = InstanceRequest {
            name: name.to_string(),
            addr: addr.to_string(),
        };
        self.post(PATH_HEARTBEAT, &request).await
    }

    /// Register and keep the registration alive for as long as the returned
    /// `Registration` lives.
    ///
    /// `interval` is the longest the agent may go without a heartbeat,
    /// normally `DEFAULT_HEARTBEAT_INTERVAL`; beats are sent at half of it. A
    /// heartbeat that finds the registration expired registers it again.
    pub async fn register_with_heartbeat(
        &self,
        name: &str,
        addr: &str,
        attrs: Attrs,
        interval: Duration,
    ) -> Result<Registration> {
        self.register(name, addr, attrs.clone()).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(
            self.clone(),
            name.to_string(),
            addr.to_string(),
            attrs,
            interval,
            cancel.clone(),
        ));

        Ok(Registration {
            client: self.clone(),
            name: name.to_string(),
            addr: addr.to_string(),
            cancel,
            task: Some(task),
        })
    }

    /// Open the raw update stream of `name`
    pub async fn subscribe(&self, name: &str) -> Result<Subscription> {
        // An empty name would collapse the path and never reach the handler
        if name.is_empty() {
            return Err(ClientError::InvalidArgument("service name is empty".into()));
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidAddress(self.base.to_string()))?
            .clear()
            .extend(["v1", "services", name, "subscribe"]);

        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check(response).await?;

        Ok(Subscription {
            updates: Box::pin(decode_updates(Box::pin(response.bytes_stream()))),
        })
    }

    /// Subscribe to `name` and keep a `ServiceSet` in sync with it.
    ///
    /// Returns as soon as the subscription is open; use
    /// `ServiceSet::wait_synced` to wait for the initial enumeration.
    pub async fn query_services(&self, name: &str) -> Result<ServiceSet> {
        let mut updates = self.subscribe(name).await?;
        let set = ServiceSet::new(name);

        let weak = set.downgrade();
        let cancel = set.cancel_token();
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = updates.next() => next,
                };

                let Some(set) = weak.upgrade() else {
                    break;
                };
                match next {
                    Some(Ok(update)) => set.apply(update),
                    Some(Err(e)) => {
                        tracing::warn!(service = %name, "Update stream failed: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!(service = %name, "Update stream ended");
                        break;
                    }
                }
            }

            if let Some(set) = weak.upgrade() {
                set.mark_closed();
            }
        });

        Ok(set)
    }
}

/// A registration kept alive by a background heartbeat
pub struct Registration {
    client: Client,
    name: String,
    addr: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop heartbeating and remove the registration
    pub async fn unregister(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.client.unregister(&self.name, &self.addr).await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // The registration itself is left to expire
        self.cancel.cancel();
    }
}

async fn run_heartbeat(
    client: Client,
    name: String,
    addr: String,
    attrs: Attrs,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(heartbeat_period(interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the registration is fresh
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match client.heartbeat(&name, &addr).await {
            Ok(()) => {}
            Err(ClientError::NotFound(_)) => {
                tracing::warn!(
                    service = %name,
                    addr = %addr,
                    "Registration expired, registering again"
                );
                if let Err(e) = client.register(&name, &addr, attrs.clone()).await {
                    tracing::warn!(service = %name, addr = %addr, "Re-register failed: {}", e);
                }
            }
            Err(e) => tracing::warn!(service = %name, addr = %addr, "Heartbeat failed: {}", e),
        }
    }
}
