use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::models::{Credentials, Exchange};

type HmacSha256 = Hmac<Sha256>;

const BINANCE_RECV_WINDOW: &str = "5000";
const BYBIT_RECV_WINDOW: &str = "5000";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HMAC computation failed: {0}")]
    HmacError(String),

    #[error("{0} requires an API passphrase")]
    MissingPassphrase(Exchange),

    #[error("request body serialization failed: {0}")]
    Body(#[from] serde_json::Error),
}

fn hmac_sha256(secret: &str, message: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::HmacError(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Render a parameter value the way exchanges expect it in a query string.
fn param_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// URL-encode parameters in the given order.
pub fn encode_query(params: &[(&str, Value)]) -> String {
    let pairs: Vec<(&str, String)> = params.iter().map(|(k, v)| (*k, param_str(v))).collect();
    serde_urlencoded::to_string(pairs).unwrap_or_default()
}

fn json_body(params: &[(&str, Value)]) -> Result<String, AuthError> {
    let map: serde_json::Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Everything needed to send one authenticated request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    /// Query string without the leading `?` (may be empty).
    pub query: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl SignedRequest {
    pub fn url(&self, base_url: &str, path: &str) -> String {
        if self.query.is_empty() {
            format!("{base_url}{path}")
        } else {
            format!("{base_url}{path}?{}", self.query)
        }
    }
}

/// Per-exchange request signing strategy.
#[derive(Debug, Clone)]
pub enum ExchangeSigner {
    /// Binance USDⓈ-M: hex HMAC over the query string, key in `X-MBX-APIKEY`.
    Binance(Credentials),
    /// Bybit v5: hex HMAC over `timestamp + key + recvWindow + payload`.
    Bybit(Credentials),
    /// BingX: hex HMAC over the sorted query string, key in `X-BX-APIKEY`.
    Bingx(Credentials),
    /// OKX v5: base64 HMAC over `timestamp + METHOD + path + body`.
    Okx {
        credentials: Credentials,
        passphrase: String,
    },
}

impl ExchangeSigner {
    pub fn new(exchange: Exchange, credentials: Credentials) -> Result<Self, AuthError> {
        Ok(match exchange {
            Exchange::Binance => ExchangeSigner::Binance(credentials),
            Exchange::Bybit => ExchangeSigner::Bybit(credentials),
            Exchange::Bingx => ExchangeSigner::Bingx(credentials),
            Exchange::Okx => {
                let passphrase = credentials
                    .passphrase
                    .clone()
                    .ok_or(AuthError::MissingPassphrase(Exchange::Okx))?;
                ExchangeSigner::Okx {
                    credentials,
                    passphrase,
                }
            }
        })
    }

    pub fn credentials(&self) -> &Credentials {
        match self {
            ExchangeSigner::Binance(c) | ExchangeSigner::Bybit(c) | ExchangeSigner::Bingx(c) => c,
            ExchangeSigner::Okx { credentials, .. } => credentials,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.credentials().api_key
    }

    /// Sign a request. `params` are sent as query for GET/DELETE, and as
    /// query (Binance, BingX) or JSON body (Bybit, OKX) otherwise.
    pub fn sign(
        &self,
        method: &Method,
        path: &str,
        params: &[(&str, Value)],
        now: DateTime<Utc>,
    ) -> Result<SignedRequest, AuthError> {
        let timestamp_ms = now.timestamp_millis().to_string();
        let in_body = !(*method == Method::GET || *method == Method::DELETE);

        match self {
            ExchangeSigner::Binance(creds) => {
                let mut all: Vec<(&str, Value)> = params.to_vec();
                all.push(("recvWindow", Value::from(BINANCE_RECV_WINDOW)));
                all.push(("timestamp", Value::from(timestamp_ms)));
                let query = encode_query(&all);
                let signature = hex::encode(hmac_sha256(&creds.api_secret, &query)?);
                Ok(SignedRequest {
                    query: format!("{query}&signature={signature}"),
                    headers: vec![("X-MBX-APIKEY", creds.api_key.clone())],
                    body: None,
                })
            }
            ExchangeSigner::Bingx(creds) => {
                let mut all: Vec<(&str, Value)> = params.to_vec();
                all.push(("timestamp", Value::from(timestamp_ms)));
                all.sort_by(|a, b| a.0.cmp(b.0));
                let query = encode_query(&all);
                let signature = hex::encode(hmac_sha256(&creds.api_secret, &query)?);
                Ok(SignedRequest {
                    query: format!("{query}&signature={signature}"),
                    headers: vec![("X-BX-APIKEY", creds.api_key.clone())],
                    body: None,
                })
            }
            ExchangeSigner::Bybit(creds) => {
                let (query, body) = if in_body {
                    (String::new(), Some(json_body(params)?))
                } else {
                    (encode_query(params), None)
                };
                let payload = body.as_deref().unwrap_or(&query);
                let prehash = format!(
                    "{timestamp_ms}{}{BYBIT_RECV_WINDOW}{payload}",
                    creds.api_key
                );
                let signature = hex::encode(hmac_sha256(&creds.api_secret, &prehash)?);
                Ok(SignedRequest {
                    query,
                    headers: vec![
                        ("X-BAPI-API-KEY", creds.api_key.clone()),
                        ("X-BAPI-SIGN", signature),
                        ("X-BAPI-TIMESTAMP", timestamp_ms),
                        ("X-BAPI-RECV-WINDOW", BYBIT_RECV_WINDOW.into()),
                        ("Content-Type", "application/json".into()),
                    ],
                    body,
                })
            }
            ExchangeSigner::Okx {
                credentials,
                passphrase,
            } => {
                let (query, body) = if in_body {
                    (String::new(), Some(json_body(params)?))
                } else {
                    (encode_query(params), None)
                };
                let request_path = if query.is_empty() {
                    path.to_string()
                } else {
                    format!("{path}?{query}")
                };
                let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
                let signature = okx_signature(
                    &credentials.api_secret,
                    &timestamp,
                    method.as_str(),
                    &request_path,
                    body.as_deref().unwrap_or(""),
                )?;
                Ok(SignedRequest {
                    query,
                    headers: vec![
                        ("OK-ACCESS-KEY", credentials.api_key.clone()),
                        ("OK-ACCESS-SIGN", signature),
                        ("OK-ACCESS-TIMESTAMP", timestamp),
                        ("OK-ACCESS-PASSPHRASE", passphrase.clone()),
                        ("Content-Type", "application/json".into()),
                    ],
                    body,
                })
            }
        }
    }
}

/// OKX signature: base64(HMAC-SHA256(secret, timestamp + method + path + body)).
pub fn okx_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String, AuthError> {
    let message = format!("{timestamp}{method}{request_path}{body}");
    Ok(BASE64.encode(hmac_sha256(secret, &message)?))
}

/// Bybit private websocket login arguments: `[api_key, expires, signature]`.
pub fn bybit_ws_auth_args(
    credentials: &Credentials,
    expires_ms: i64,
) -> Result<[String; 3], AuthError> {
    let signature = hex::encode(hmac_sha256(
        &credentials.api_secret,
        &format!("GET/realtime{expires_ms}"),
    )?);
    Ok([credentials.api_key.clone(), expires_ms.to_string(), signature])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> Credentials {
        Credentials::new("test-key-123".into(), "test-secret".into(), Some("pass".into()))
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn binance_appends_hex_signature() {
        let signer = ExchangeSigner::new(Exchange::Binance, creds()).unwrap();
        let signed = signer
            .sign(
                &Method::POST,
                "/fapi/v1/order",
                &[("symbol", "BTCUSDT".into()), ("quantity", "0.1".into())],
                fixed_now(),
            )
            .unwrap();

        assert!(signed
            .query
            .starts_with("symbol=BTCUSDT&quantity=0.1&recvWindow=5000&timestamp=1700000000000"));
        let signature = signed.query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(signed.headers[0].0, "X-MBX-APIKEY");
        assert!(signed.body.is_none());
    }

    #[test]
    fn bingx_sorts_parameters() {
        let signer = ExchangeSigner::new(Exchange::Bingx, creds()).unwrap();
        let signed = signer
            .sign(
                &Method::POST,
                "/openApi/swap/v2/trade/order",
                &[("type", "MARKET".into()), ("symbol", "BTC-USDT".into())],
                fixed_now(),
            )
            .unwrap();

        assert!(signed
            .query
            .starts_with("symbol=BTC-USDT&timestamp=1700000000000&type=MARKET&signature="));
    }

    #[test]
    fn bybit_signs_json_body_for_post() {
        let signer = ExchangeSigner::new(Exchange::Bybit, creds()).unwrap();
        let signed = signer
            .sign(
                &Method::POST,
                "/v5/order/create",
                &[("symbol", "BTCUSDT".into()), ("reduceOnly", true.into())],
                fixed_now(),
            )
            .unwrap();

        assert!(signed.query.is_empty());
        assert_eq!(
            signed.body.as_deref(),
            Some(r#"{"reduceOnly":true,"symbol":"BTCUSDT"}"#)
        );
        let sign = signed
            .headers
            .iter()
            .find(|(k, _)| *k == "X-BAPI-SIGN")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(sign.len(), 64);
    }

    #[test]
    fn okx_requires_passphrase() {
        let no_pass = Credentials::new("k".into(), "s".into(), None);
        assert!(matches!(
            ExchangeSigner::new(Exchange::Okx, no_pass),
            Err(AuthError::MissingPassphrase(Exchange::Okx))
        ));
    }

    #[test]
    fn okx_signature_is_base64() {
        let signer = ExchangeSigner::new(Exchange::Okx, creds()).unwrap();
        let signed = signer
            .sign(
                &Method::GET,
                "/api/v5/account/balance",
                &[("ccy", "USDT".into())],
                fixed_now(),
            )
            .unwrap();

        assert_eq!(signed.query, "ccy=USDT");
        let (_, ts) = signed
            .headers
            .iter()
            .find(|(k, _)| *k == "OK-ACCESS-TIMESTAMP")
            .unwrap();
        assert_eq!(ts, "2023-11-14T22:13:20.000Z");
        let (_, sig) = signed
            .headers
            .iter()
            .find(|(k, _)| *k == "OK-ACCESS-SIGN")
            .unwrap();
        assert!(BASE64.decode(sig).is_ok());
        // 32 bytes base64-encoded
        assert_eq!(sig.len(), 44);
    }

    #[test]
    fn bybit_ws_login() {
        let [key, expires, signature] = bybit_ws_auth_args(&creds(), 1_700_000_010_000).unwrap();
        assert_eq!(key, "test-key-123");
        assert_eq!(expires, "1700000010000");
        assert_eq!(signature.len(), 64);
    }
}
