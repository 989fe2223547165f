//! Binance USDT-M futures REST client.

use crate::config::BinanceConfig;
use crate::exchange::error::ConnectorError;
use crate::exchange::types::*;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance error code for "Unknown order sent" (already filled or cancelled).
const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Binance error code for request-weight bans.
const CODE_TOO_MANY_REQUESTS: i64 = -1003;
/// Binance error codes for credential problems.
const CODE_INVALID_API_KEY: i64 = -2014;
const CODE_INVALID_SIGNATURE: i64 = -2015;

/// Binance futures API client.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self, ConnectorError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let base_url = if config.testnet {
            FUTURES_TESTNET_URL.to_string()
        } else {
            FUTURES_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// Check a response for HTTP/API errors and deserialize the body.
    async fn parse<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ConnectorError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ConnectorError::Malformed(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1);

        let body = response.text().await.unwrap_or_default();
        let api_error: Option<ApiError> = serde_json::from_str(&body).ok();

        match (&api_error, status) {
            (_, StatusCode::TOO_MANY_REQUESTS) => Err(ConnectorError::RateLimited {
                retry_after_secs: retry_after,
            }),
            (Some(err), _) if err.code == CODE_TOO_MANY_REQUESTS => {
                Err(ConnectorError::RateLimited {
                    retry_after_secs: retry_after,
                })
            }
            (Some(err), _)
                if err.code == CODE_INVALID_API_KEY || err.code == CODE_INVALID_SIGNATURE =>
            {
                Err(ConnectorError::AuthFailure(err.message.clone()))
            }
            (_, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(ConnectorError::AuthFailure(body))
            }
            (Some(err), _) => Err(ConnectorError::Rejected {
                code: err.code,
                reason: err.message.clone(),
            }),
            (None, _) => Err(ConnectorError::Rejected {
                code: status.as_u16() as i64,
                reason: body,
            }),
        }
    }

    // ==================== Market Data (Public) ====================

    /// Get exchange information including symbol filters.
    #[instrument(skip(self))]
    pub async fn get_exchange_info(&self) -> Result<FuturesExchangeInfo, ConnectorError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    /// Get the premium index (funding rate, mark price, next funding time)
    /// for all perpetual contracts.
    #[instrument(skip(self))]
    pub async fn get_premium_index(&self) -> Result<Vec<PremiumIndex>, ConnectorError> {
        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    /// Get best bid/ask for a single symbol.
    #[instrument(skip(self))]
    pub async fn get_book_ticker(&self, symbol: &str) -> Result<BookTicker, ConnectorError> {
        let url = format!(
            "{}/fapi/v1/ticker/bookTicker?symbol={}",
            self.base_url, symbol
        );
        let response = self.http.get(&url).send().await?;
        Self::parse(response).await
    }

    // ==================== Account (Authenticated) ====================

    /// Get account balance information.
    #[instrument(skip(self))]
    pub async fn get_account_balance(&self) -> Result<Vec<AccountBalance>, ConnectorError> {
        let query = format!("timestamp={}", Self::timestamp());
        let signature = self.sign(&query);

        let url = format!(
            "{}/fapi/v2/balance?{}&signature={}",
            self.base_url, query, signature
        );

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::parse(response).await
    }

    // ==================== Orders (Authenticated) ====================

    /// Place a new futures order.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, side = %order.side))]
    pub async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse, ConnectorError> {
        let mut params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), order.side.to_string()),
            (
                "type".to_string(),
                format!("{:?}", order.order_type).to_uppercase(),
            ),
            ("quantity".to_string(), order.quantity.to_string()),
            (
                "newClientOrderId".to_string(),
                order.new_client_order_id.clone(),
            ),
            ("timestamp".to_string(), Self::timestamp().to_string()),
        ];

        if let Some(price) = &order.price {
            params.push(("price".to_string(), price.to_string()));
        }

        if let Some(tif) = &order.time_in_force {
            params.push(("timeInForce".to_string(), format!("{:?}", tif).to_uppercase()));
        }

        if let Some(reduce_only) = order.reduce_only {
            params.push(("reduceOnly".to_string(), reduce_only.to_string()));
        }

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        let url = format!(
            "{}/fapi/v1/order?{}&signature={}",
            self.base_url, query_string, signature
        );

        debug!(client_order_id = %order.new_client_order_id, "Placing order");

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::parse(response).await
    }

    /// Cancel an order by its client order id.
    ///
    /// Cancelling an order that is already filled or already cancelled is
    /// treated as success, so this call is safe to repeat.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderResponse>, ConnectorError> {
        let query = format!(
            "symbol={}&origClientOrderId={}&timestamp={}",
            symbol,
            client_order_id,
            Self::timestamp()
        );
        let signature = self.sign(&query);

        let url = format!(
            "{}/fapi/v1/order?{}&signature={}",
            self.base_url, query, signature
        );

        let response = self
            .http
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        match Self::parse(response).await {
            Ok(order) => Ok(Some(order)),
            Err(ConnectorError::Rejected { code, .. }) if code == CODE_UNKNOWN_ORDER => {
                warn!(client_order_id, "Cancel target no longer open, treating as done");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Query the current state of an order by its client order id.
    #[instrument(skip(self))]
    pub async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderResponse, ConnectorError> {
        let query = format!(
            "symbol={}&origClientOrderId={}&timestamp={}",
            symbol,
            client_order_id,
            Self::timestamp()
        );
        let signature = self.sign(&query);

        let url = format!(
            "{}/fapi/v1/order?{}&signature={}",
            self.base_url, query, signature
        );

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::parse(response).await
    }

    // ==================== User Data Stream ====================

    /// Create a listen key for the user data stream.
    #[instrument(skip(self))]
    pub async fn create_listen_key(&self) -> Result<String, ConnectorError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let key: ListenKey = Self::parse(response).await?;
        Ok(key.listen_key)
    }

    /// Extend the validity of the current listen key (must be called at
    /// least every 60 minutes).
    #[instrument(skip(self))]
    pub async fn keepalive_listen_key(&self) -> Result<(), ConnectorError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let response = self
            .http
            .put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ConnectorError::Rejected {
                code: status.as_u16() as i64,
                reason: body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> BinanceClient {
        BinanceClient {
            http: Client::new(),
            api_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            base_url: base_url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_premium_index_fetch() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "symbol": "BTCUSDT",
                    "markPrice": "50000.00",
                    "lastFundingRate": "0.00012",
                    "nextFundingTime": 1735689600000i64
                }
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let rates = client.get_premium_index().await.unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].funding_rate, dec!(0.00012));
    }

    #[tokio::test]
    async fn test_rejection_maps_to_typed_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2019,
                "msg": "Margin is insufficient."
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let order = NewOrder {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.01),
            price: None,
            time_in_force: None,
            reduce_only: None,
            new_client_order_id: "farb-1-1".to_string(),
        };

        let err = client.place_order(&order).await.unwrap_err();
        match err {
            ConnectorError::Rejected { code, .. } => assert_eq!(code, -2019),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_order_is_idempotent() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2011,
                "msg": "Unknown order sent."
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let result = client.cancel_order("BTCUSDT", "farb-1-1").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_retryable_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(serde_json::json!({
                        "code": -1003,
                        "msg": "Too many requests."
                    })),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_premium_index().await.unwrap_err();
        match err {
            ConnectorError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 7),
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = test_client("http://localhost");
        let sig1 = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        let sig2 = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64); // hex-encoded SHA-256
    }
}
