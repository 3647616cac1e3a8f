use anyhow::Context;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::config::Config;

/// Channel state in which a peer channel can carry HTLCs.
pub const CHANNEL_NORMAL: &str = "CHANNELD_NORMAL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: String,
}

/// One direction of a channel as seen in gossip.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GossipChannel {
    pub source: String,
    pub destination: String,
    pub short_channel_id: String,
    pub amount_msat: u64,
    pub active: bool,
    pub base_fee_millisatoshi: u64,
    pub fee_per_millionth: u64,
    pub delay: u32,
    #[serde(default)]
    pub htlc_minimum_msat: u64,
    #[serde(default)]
    pub htlc_maximum_msat: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GossipNode {
    pub nodeid: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Routing policy one side of a channel advertises.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdate {
    #[serde(default)]
    pub htlc_minimum_msat: u64,
    #[serde(default)]
    pub htlc_maximum_msat: u64,
    #[serde(default)]
    pub cltv_expiry_delta: u32,
    #[serde(default)]
    pub fee_base_msat: u64,
    #[serde(default)]
    pub fee_proportional_millionths: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdates {
    pub local: Option<ChannelUpdate>,
    pub remote: Option<ChannelUpdate>,
}

/// One of the local node's own channels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerChannel {
    pub peer_id: String,
    pub peer_connected: bool,
    pub state: String,
    #[serde(default)]
    pub short_channel_id: Option<String>,
    #[serde(default)]
    pub total_msat: u64,
    #[serde(default)]
    pub to_us_msat: u64,
    #[serde(default)]
    pub spendable_msat: u64,
    #[serde(default)]
    pub receivable_msat: u64,
    #[serde(default)]
    pub updates: Option<ChannelUpdates>,
}

impl PeerChannel {
    pub fn is_normal(&self) -> bool {
        self.state == CHANNEL_NORMAL
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub payment_hash: String,
    pub payment_secret: String,
}

/// A hop as `sendpay` expects it: `id` is the node the hop delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendPayHop {
    pub id: String,
    pub channel: String,
    pub direction: u8,
    pub amount_msat: u64,
    pub delay: u32,
}

/// Error object returned by the node's JSON-RPC layer.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.message)
    }
}

/// `waitsendpay` codes.
const WAITSENDPAY_TIMEOUT: i64 = 200;
const PAY_UNPARSEABLE_ONION: i64 = 202;
const PAY_TRY_OTHER_ROUTE: i64 = 204;
/// `delinvoice`: the invoice is not in the requested status.
const INVOICE_STATUS_UNEXPECTED: i64 = 905;

/// A typed payment failure with the erring channel, if the node knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentFailure {
    pub code: i64,
    pub message: String,
    pub failcodename: Option<String>,
    pub erring_node: Option<String>,
    pub erring_channel: Option<String>,
    pub erring_direction: Option<u8>,
}

impl PaymentFailure {
    pub fn from_rpc_error(err: &RpcError) -> Self {
        let data = err.data.as_ref();
        let field = |name: &str| {
            data.and_then(|d| d.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        Self {
            code: err.code,
            message: err.message.clone(),
            failcodename: field("failcodename"),
            erring_node: field("erring_node"),
            erring_channel: field("erring_channel"),
            erring_direction: data
                .and_then(|d| d.get("erring_direction"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u8),
        }
    }

    /// Whether another route could succeed where this one failed.
    pub fn is_temporary(&self) -> bool {
        self.code == PAY_TRY_OTHER_ROUTE || self.code == PAY_UNPARSEABLE_ONION
    }

    pub fn reason(&self) -> String {
        match (&self.failcodename, &self.erring_channel) {
            (Some(name), Some(scid)) => format!("{} at {}", name, scid),
            (Some(name), None) => name.clone(),
            _ => self.message.clone(),
        }
    }
}

/// How a `waitsendpay` resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Complete {
        amount_msat: u64,
        amount_sent_msat: u64,
    },
    Failed(PaymentFailure),
    TimedOut,
}

/// How removing an unpaid self-invoice went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceCancel {
    /// Gone; a late HTLC for it is rejected by the node.
    Deleted,
    /// It settled before it could be removed.
    AlreadyPaid,
}

/// Whether a `delinvoice` refusal means the invoice was paid in the meantime.
fn invoice_was_paid(err: &RpcError) -> bool {
    if err.code != INVOICE_STATUS_UNEXPECTED {
        return false;
    }
    let status = err
        .data
        .as_ref()
        .and_then(|d| d.get("status"))
        .and_then(|v| v.as_str());
    status == Some("paid") || err.message.contains("status is paid")
}

/// Trait abstracting the node RPC surface the engine consumes.
///
/// This enables mock-based testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<GossipChannel>>;
    async fn list_nodes(&self) -> anyhow::Result<Vec<GossipNode>>;
    async fn list_peer_channels(&self) -> anyhow::Result<Vec<PeerChannel>>;
    async fn create_invoice(
        &self,
        amount_msat: u64,
        label: &str,
        description: &str,
    ) -> anyhow::Result<Invoice>;
    async fn send_pay(
        &self,
        route: &[SendPayHop],
        payment_hash: &str,
        payment_secret: &str,
    ) -> anyhow::Result<()>;
    async fn wait_send_pay(
        &self,
        payment_hash: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<PaymentOutcome>;
    /// Remove the invoice under `label` if it is still unpaid.
    async fn delete_invoice(&self, label: &str) -> anyhow::Result<InvoiceCancel>;
}

enum CallError {
    Rpc(RpcError),
    Transport(anyhow::Error),
}

#[derive(Deserialize)]
struct ListChannelsResponse {
    channels: Vec<GossipChannel>,
}

#[derive(Deserialize)]
struct ListNodesResponse {
    nodes: Vec<GossipNode>,
}

#[derive(Deserialize)]
struct ListPeerChannelsResponse {
    channels: Vec<PeerChannel>,
}

#[derive(Deserialize)]
struct WaitSendPayResponse {
    amount_msat: u64,
    amount_sent_msat: u64,
}

/// Rate-limited, retrying client for Core Lightning's REST interface.
pub struct ClnRestClient {
    http: reqwest::Client,
    base_url: String,
    rune: String,
    /// Semaphore for rate limiting (1 concurrent read)
    rate_limiter: Arc<Semaphore>,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 50;
const REQUEST_TIMEOUT_SECS: u64 = 60;
const INVOICE_EXPIRY_SECS: u64 = 600;

impl ClnRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.server.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.server.tls_cert_path.display()
            )
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .context("Failed to parse TLS certificate")?;

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.server.base_url.trim_end_matches('/').to_string(),
            rune: config.server.rune.clone(),
            rate_limiter: Arc::new(Semaphore::new(1)),
        })
    }

    async fn rate_limit(&self) -> anyhow::Result<()> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
        sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T, CallError> {
        let resp = self
            .http
            .post(format!("{}/v1/{}", self.base_url, method))
            .header("Rune", &self.rune)
            .json(params)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| {
                CallError::Transport(anyhow::anyhow!("{}: malformed response: {}", method, e))
            });
        }

        match serde_json::from_slice::<RpcError>(&body) {
            Ok(err) => Err(CallError::Rpc(err)),
            Err(_) => Err(CallError::Transport(anyhow::anyhow!(
                "{}: HTTP {}: {}",
                method,
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    /// Idempotent reads: retried with exponential backoff on transport errors.
    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CallError>>,
    {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            self.rate_limit().await?;
            match f().await {
                Ok(resp) => {
                    debug!("{}: success", name);
                    return Ok(resp);
                }
                Err(CallError::Rpc(e)) => {
                    return Err(anyhow::anyhow!("{}: {}", name, e));
                }
                Err(CallError::Transport(e)) => {
                    if attempt < MAX_RETRIES - 1 {
                        let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                        warn!(
                            "{}: attempt {} failed ({:#}), retrying in {}ms",
                            name,
                            attempt + 1,
                            e,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(anyhow::anyhow!(
            "{}: all {} attempts failed: {:#}",
            name,
            MAX_RETRIES,
            last_error.unwrap_or_else(|| anyhow::anyhow!("no attempt made"))
        ))
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}

#[async_trait::async_trait]
impl NodeClient for ClnRestClient {
    async fn get_info(&self) -> anyhow::Result<NodeInfo> {
        let params = json!({});
        self.with_retry("GetInfo", || {
            self.call("getinfo", &params, Self::default_timeout())
        })
        .await
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<GossipChannel>> {
        let params = json!({});
        let resp: ListChannelsResponse = self
            .with_retry("ListChannels", || {
                self.call("listchannels", &params, Self::default_timeout())
            })
            .await?;
        Ok(resp.channels)
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<GossipNode>> {
        let params = json!({});
        let resp: ListNodesResponse = self
            .with_retry("ListNodes", || {
                self.call("listnodes", &params, Self::default_timeout())
            })
            .await?;
        Ok(resp.nodes)
    }

    async fn list_peer_channels(&self) -> anyhow::Result<Vec<PeerChannel>> {
        let params = json!({});
        let resp: ListPeerChannelsResponse = self
            .with_retry("ListPeerChannels", || {
                self.call("listpeerchannels", &params, Self::default_timeout())
            })
            .await?;
        Ok(resp.channels)
    }

    async fn create_invoice(
        &self,
        amount_msat: u64,
        label: &str,
        description: &str,
    ) -> anyhow::Result<Invoice> {
        self.rate_limit().await?;
        let params = json!({
            "amount_msat": amount_msat,
            "label": label,
            "description": description,
            "expiry": INVOICE_EXPIRY_SECS,
        });
        match self.call("invoice", &params, Self::default_timeout()).await {
            Ok(invoice) => Ok(invoice),
            Err(CallError::Rpc(e)) => Err(anyhow::anyhow!("Invoice: {}", e)),
            Err(CallError::Transport(e)) => Err(e.context("Invoice")),
        }
    }

    // Not retried: a resubmitted onion is rejected as a duplicate at best.
    async fn send_pay(
        &self,
        route: &[SendPayHop],
        payment_hash: &str,
        payment_secret: &str,
    ) -> anyhow::Result<()> {
        let amount_msat = route.last().map(|h| h.amount_msat).unwrap_or(0);
        let params = json!({
            "route": route,
            "payment_hash": payment_hash,
            "payment_secret": payment_secret,
            "amount_msat": amount_msat,
        });
        match self
            .call::<serde_json::Value>("sendpay", &params, Self::default_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(CallError::Rpc(e)) => Err(anyhow::anyhow!("SendPay: {}", e)),
            Err(CallError::Transport(e)) => Err(e.context("SendPay")),
        }
    }

    async fn wait_send_pay(
        &self,
        payment_hash: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<PaymentOutcome> {
        let params = json!({
            "payment_hash": payment_hash,
            "timeout": timeout_secs,
        });
        // Leave the node room to answer with its own timeout code first.
        let http_timeout = Duration::from_secs(timeout_secs + 10);
        match self
            .call::<WaitSendPayResponse>("waitsendpay", &params, http_timeout)
            .await
        {
            Ok(resp) => Ok(PaymentOutcome::Complete {
                amount_msat: resp.amount_msat,
                amount_sent_msat: resp.amount_sent_msat,
            }),
            Err(CallError::Rpc(e)) if e.code == WAITSENDPAY_TIMEOUT => Ok(PaymentOutcome::TimedOut),
            Err(CallError::Rpc(e)) => Ok(PaymentOutcome::Failed(PaymentFailure::from_rpc_error(&e))),
            Err(CallError::Transport(e)) => Err(e.context("WaitSendPay")),
        }
    }

    async fn delete_invoice(&self, label: &str) -> anyhow::Result<InvoiceCancel> {
        let params = json!({
            "label": label,
            "status": "unpaid",
        });
        let params = &params;
        self.with_retry("DelInvoice", move || async move {
                match self
                    .call::<serde_json::Value>("delinvoice", params, Self::default_timeout())
                    .await
                {
                    Ok(_) => Ok(InvoiceCancel::Deleted),
                    Err(CallError::Rpc(e)) if invoice_was_paid(&e) => Ok(InvoiceCancel::AlreadyPaid),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Mock client for testing
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_failure_from_rpc_error() {
        let err: RpcError = serde_json::from_str(
            r#"{
                "code": 204,
                "message": "failed: WIRE_TEMPORARY_CHANNEL_FAILURE (reply from remote)",
                "data": {
                    "erring_index": 1,
                    "failcode": 4103,
                    "failcodename": "WIRE_TEMPORARY_CHANNEL_FAILURE",
                    "erring_node": "02bb",
                    "erring_channel": "102x1x0",
                    "erring_direction": 1
                }
            }"#,
        )
        .unwrap();

        let failure = PaymentFailure::from_rpc_error(&err);
        assert!(failure.is_temporary());
        assert_eq!(failure.erring_channel.as_deref(), Some("102x1x0"));
        assert_eq!(failure.erring_direction, Some(1));
        assert_eq!(
            failure.reason(),
            "WIRE_TEMPORARY_CHANNEL_FAILURE at 102x1x0"
        );
    }

    #[test]
    fn test_payment_failure_without_data() {
        let err = RpcError {
            code: 203,
            message: "final node rejected".to_string(),
            data: None,
        };
        let failure = PaymentFailure::from_rpc_error(&err);
        assert!(!failure.is_temporary());
        assert_eq!(failure.reason(), "final node rejected");
        assert_eq!(err.to_string(), "203:final node rejected");
    }

    #[test]
    fn test_delinvoice_refusal_for_paid_invoice() {
        let paid: RpcError = serde_json::from_str(
            r#"{
                "code": 905,
                "message": "Invoice status is paid not unpaid",
                "data": {"label": "circular-r-0-1", "status": "paid"}
            }"#,
        )
        .unwrap();
        assert!(invoice_was_paid(&paid));

        let expired = RpcError {
            code: 905,
            message: "Invoice status is expired not unpaid".to_string(),
            data: None,
        };
        assert!(!invoice_was_paid(&expired));

        let missing = RpcError {
            code: 905,
            message: "Unknown invoice".to_string(),
            data: None,
        };
        assert!(!invoice_was_paid(&missing));
    }

    #[test]
    fn test_peer_channel_deserialize_defaults() {
        let ch: PeerChannel = serde_json::from_str(
            r#"{"peer_id": "02aa", "peer_connected": false, "state": "OPENINGD"}"#,
        )
        .unwrap();
        assert!(!ch.is_normal());
        assert!(ch.short_channel_id.is_none());
        assert_eq!(ch.to_us_msat, 0);
    }

    #[test]
    fn test_sendpay_hop_serializes_as_rpc_expects() {
        let hop = SendPayHop {
            id: "02bb".to_string(),
            channel: "101x1x0".to_string(),
            direction: 0,
            amount_msat: 25_000_000,
            delay: 24,
        };
        let value = serde_json::to_value(&hop).unwrap();
        assert_eq!(value["channel"], "101x1x0");
        assert_eq!(value["amount_msat"], 25_000_000);
        assert_eq!(value["delay"], 24);
    }
}
