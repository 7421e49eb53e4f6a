use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::auth::{AuthError, ExchangeSigner};
use super::types::*;
use crate::models::{dashed_symbol, Credentials, Exchange, OrderAck, ReplicaOrder, Side};

pub const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
pub const BYBIT_API_BASE: &str = "https://api.bybit.com";
pub const BINGX_API_BASE: &str = "https://open-api.bingx.com";
pub const OKX_API_BASE: &str = "https://www.okx.com";

/// Network timeout applied to every exchange REST call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("{exchange} rejected request: {code} {message}")]
    Rejected {
        exchange: Exchange,
        code: String,
        message: String,
    },

    #[error("unknown instrument {0}")]
    UnknownSymbol(String),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Order placement and account queries on behalf of one account.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Place a market order for `order.quantity` of `order.symbol`.
    async fn place_order(&self, order: &ReplicaOrder) -> Result<OrderAck, ClientError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ClientError>;

    /// Available quote-currency (USDT) balance.
    async fn get_balance(&self) -> Result<Decimal, ClientError>;

    /// Minimum order quantity increment for `symbol`.
    async fn quantity_step(&self, symbol: &str) -> Result<Decimal, ClientError>;
}

/// Builds command clients for follower accounts from decrypted credentials.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        exchange: Exchange,
        credentials: Credentials,
    ) -> Result<Arc<dyn ExchangeClient>, ClientError>;
}

/// Shared HTTP client with the exchange timeout applied.
pub fn http_client() -> Client {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Factory producing [`RestExchangeClient`]s that share one connection pool.
#[derive(Debug, Clone)]
pub struct RestClientFactory {
    http: Client,
}

impl RestClientFactory {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl ClientFactory for RestClientFactory {
    fn build(
        &self,
        exchange: Exchange,
        credentials: Credentials,
    ) -> Result<Arc<dyn ExchangeClient>, ClientError> {
        Ok(Arc::new(RestExchangeClient::new(
            self.http.clone(),
            exchange,
            credentials,
        )?))
    }
}

/// REST command client for one account on one exchange.
#[derive(Debug, Clone)]
pub struct RestExchangeClient {
    http: Client,
    exchange: Exchange,
    signer: ExchangeSigner,
    base_url: String,
}

impl RestExchangeClient {
    pub fn new(http: Client, exchange: Exchange, credentials: Credentials) -> Result<Self, ClientError> {
        let base_url = match exchange {
            Exchange::Binance => BINANCE_FUTURES_BASE,
            Exchange::Bybit => BYBIT_API_BASE,
            Exchange::Bingx => BINGX_API_BASE,
            Exchange::Okx => OKX_API_BASE,
        };
        Ok(Self {
            http,
            exchange,
            signer: ExchangeSigner::new(exchange, credentials)?,
            base_url: base_url.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn signer(&self) -> &ExchangeSigner {
        &self.signer
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a signed request and return the raw status + body.
    pub async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, Value)],
    ) -> Result<(reqwest::StatusCode, String), ClientError> {
        let signed = self.signer.sign(&method, path, params, Utc::now())?;
        let mut req = self
            .http
            .request(method, signed.url(&self.base_url, path));
        for (name, value) in &signed.headers {
            req = req.header(*name, value);
        }
        if let Some(body) = signed.body {
            req = req.body(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        Ok((status, text))
    }

    /// Send a signed request and decode a JSON response.
    pub async fn signed_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, Value)],
    ) -> Result<T, ClientError> {
        let (status, text) = self.send_signed(method, path, params).await?;
        if !status.is_success() {
            return Err(self.rejection_from_body(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| ClientError::Unexpected(format!("{e}: {}", truncate(&text))))
    }

    async fn public_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Value)],
    ) -> Result<T, ClientError> {
        let query = super::auth::encode_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    fn rejection_from_body(&self, status: reqwest::StatusCode, text: &str) -> ClientError {
        if let Ok(err) = serde_json::from_str::<BinanceApiError>(text) {
            return ClientError::Rejected {
                exchange: self.exchange,
                code: err.code.to_string(),
                message: err.msg,
            };
        }
        ClientError::Rejected {
            exchange: self.exchange,
            code: status.as_u16().to_string(),
            message: truncate(text),
        }
    }

    fn rejected(&self, code: impl ToString, message: impl Into<String>) -> ClientError {
        ClientError::Rejected {
            exchange: self.exchange,
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn bybit_result<T>(&self, env: BybitEnvelope<T>) -> Result<T, ClientError> {
        if env.ret_code != 0 {
            return Err(self.rejected(env.ret_code, env.ret_msg));
        }
        env.result
            .ok_or_else(|| ClientError::Unexpected("bybit response without result".into()))
    }

    fn bingx_data<T>(&self, env: BingxEnvelope<T>) -> Result<T, ClientError> {
        if env.code != 0 {
            return Err(self.rejected(env.code, env.msg));
        }
        env.data
            .ok_or_else(|| ClientError::Unexpected("bingx response without data".into()))
    }

    fn okx_data<T>(&self, env: OkxEnvelope<T>) -> Result<Vec<T>, ClientError> {
        if env.code != "0" {
            return Err(self.rejected(env.code, env.msg));
        }
        Ok(env.data)
    }
}

/// Order parameters in each venue's native vocabulary.
pub fn order_params(exchange: Exchange, order: &ReplicaOrder) -> Vec<(&'static str, Value)> {
    let qty = order.quantity.normalize().to_string();
    match exchange {
        Exchange::Binance => {
            let mut params = vec![
                ("symbol", Value::from(order.symbol.clone())),
                ("side", Value::from(order.side.as_str())),
                ("type", Value::from("MARKET")),
                ("quantity", Value::from(qty)),
                ("newOrderRespType", Value::from("RESULT")),
            ];
            if order.reduce_only {
                params.push(("reduceOnly", Value::from("true")));
            }
            params
        }
        Exchange::Bybit => vec![
            ("category", Value::from("linear")),
            ("symbol", Value::from(order.symbol.clone())),
            (
                "side",
                Value::from(match order.side {
                    Side::Buy => "Buy",
                    Side::Sell => "Sell",
                }),
            ),
            ("orderType", Value::from("Market")),
            ("qty", Value::from(qty)),
            ("reduceOnly", Value::from(order.reduce_only)),
        ],
        Exchange::Bingx => {
            let mut params = vec![
                ("symbol", Value::from(dashed_symbol(&order.symbol))),
                ("side", Value::from(order.side.as_str())),
                ("positionSide", Value::from("BOTH")),
                ("type", Value::from("MARKET")),
                ("quantity", Value::from(qty)),
            ];
            if order.reduce_only {
                params.push(("reduceOnly", Value::from("true")));
            }
            params
        }
        Exchange::Okx => vec![
            ("instId", Value::from(dashed_symbol(&order.symbol))),
            ("tdMode", Value::from("cash")),
            ("side", Value::from(order.side.as_str().to_lowercase())),
            ("ordType", Value::from("market")),
            ("sz", Value::from(qty)),
            ("tgtCcy", Value::from("base_ccy")),
        ],
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(200).collect()
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn place_order(&self, order: &ReplicaOrder) -> Result<OrderAck, ClientError> {
        let params = order_params(self.exchange, order);
        match self.exchange {
            Exchange::Binance => {
                let resp: BinanceOrderResponse = self
                    .signed_json(Method::POST, "/fapi/v1/order", &params)
                    .await?;
                Ok(OrderAck {
                    order_id: resp.order_id,
                    avg_price: resp.avg_price.filter(|p| !p.is_zero()),
                })
            }
            Exchange::Bybit => {
                let env: BybitEnvelope<BybitOrderResult> = self
                    .signed_json(Method::POST, "/v5/order/create", &params)
                    .await?;
                let result = self.bybit_result(env)?;
                Ok(OrderAck {
                    order_id: result.order_id,
                    avg_price: None,
                })
            }
            Exchange::Bingx => {
                let env: BingxEnvelope<BingxOrderData> = self
                    .signed_json(Method::POST, "/openApi/swap/v2/trade/order", &params)
                    .await?;
                let data = self.bingx_data(env)?;
                Ok(OrderAck {
                    order_id: data.order.order_id,
                    avg_price: data.order.avg_price.filter(|p| !p.is_zero()),
                })
            }
            Exchange::Okx => {
                let env: OkxEnvelope<OkxOrderAck> = self
                    .signed_json(Method::POST, "/api/v5/trade/order", &params)
                    .await?;
                let ack = self
                    .okx_data(env)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ClientError::Unexpected("okx order ack missing".into()))?;
                if ack.s_code != "0" {
                    return Err(self.rejected(ack.s_code, ack.s_msg));
                }
                Ok(OrderAck {
                    order_id: ack.ord_id,
                    avg_price: None,
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ClientError> {
        match self.exchange {
            Exchange::Binance => {
                let _: Value = self
                    .signed_json(
                        Method::DELETE,
                        "/fapi/v1/order",
                        &[("symbol", symbol.into()), ("orderId", order_id.into())],
                    )
                    .await?;
            }
            Exchange::Bybit => {
                let env: BybitEnvelope<BybitOrderResult> = self
                    .signed_json(
                        Method::POST,
                        "/v5/order/cancel",
                        &[
                            ("category", "linear".into()),
                            ("symbol", symbol.into()),
                            ("orderId", order_id.into()),
                        ],
                    )
                    .await?;
                self.bybit_result(env)?;
            }
            Exchange::Bingx => {
                let env: BingxEnvelope<Value> = self
                    .signed_json(
                        Method::DELETE,
                        "/openApi/swap/v2/trade/order",
                        &[
                            ("symbol", dashed_symbol(symbol).into()),
                            ("orderId", order_id.into()),
                        ],
                    )
                    .await?;
                self.bingx_data(env)?;
            }
            Exchange::Okx => {
                let env: OkxEnvelope<OkxOrderAck> = self
                    .signed_json(
                        Method::POST,
                        "/api/v5/trade/cancel-order",
                        &[
                            ("instId", dashed_symbol(symbol).into()),
                            ("ordId", order_id.into()),
                        ],
                    )
                    .await?;
                self.okx_data(env)?;
            }
        }
        tracing::info!(exchange = %self.exchange, symbol, order_id, "Order cancelled");
        Ok(())
    }

    async fn get_balance(&self) -> Result<Decimal, ClientError> {
        let balance = match self.exchange {
            Exchange::Binance => {
                let balances: Vec<BinanceBalance> = self
                    .signed_json(Method::GET, "/fapi/v2/balance", &[])
                    .await?;
                balances
                    .into_iter()
                    .find(|b| b.asset == "USDT")
                    .and_then(|b| b.available_balance)
            }
            Exchange::Bybit => {
                let env: BybitEnvelope<BybitList<BybitWalletAccount>> = self
                    .signed_json(
                        Method::GET,
                        "/v5/account/wallet-balance",
                        &[("accountType", "UNIFIED".into()), ("coin", "USDT".into())],
                    )
                    .await?;
                self.bybit_result(env)?
                    .list
                    .into_iter()
                    .flat_map(|account| account.coin)
                    .find(|c| c.coin == "USDT")
                    .and_then(|c| c.wallet_balance)
            }
            Exchange::Bingx => {
                let env: BingxEnvelope<BingxBalanceData> = self
                    .signed_json(Method::GET, "/openApi/swap/v2/user/balance", &[])
                    .await?;
                self.bingx_data(env)?.balance.available_margin
            }
            Exchange::Okx => {
                let env: OkxEnvelope<OkxAccountBalance> = self
                    .signed_json(
                        Method::GET,
                        "/api/v5/account/balance",
                        &[("ccy", "USDT".into())],
                    )
                    .await?;
                self.okx_data(env)?
                    .into_iter()
                    .flat_map(|account| account.details)
                    .find(|d| d.ccy == "USDT")
                    .and_then(|d| d.avail_bal)
            }
        };
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    async fn quantity_step(&self, symbol: &str) -> Result<Decimal, ClientError> {
        let step = match self.exchange {
            Exchange::Binance => {
                let info: BinanceExchangeInfo =
                    self.public_json("/fapi/v1/exchangeInfo", &[]).await?;
                info.symbols
                    .into_iter()
                    .find(|s| s.symbol == symbol)
                    .and_then(|s| {
                        s.filters
                            .into_iter()
                            .find(|f| f.filter_type == "MARKET_LOT_SIZE" || f.filter_type == "LOT_SIZE")
                            .and_then(|f| f.step_size)
                    })
            }
            Exchange::Bybit => {
                let env: BybitEnvelope<BybitList<BybitInstrument>> = self
                    .public_json(
                        "/v5/market/instruments-info",
                        &[("category", "linear".into()), ("symbol", symbol.into())],
                    )
                    .await?;
                self.bybit_result(env)?
                    .list
                    .into_iter()
                    .find(|i| i.symbol == symbol)
                    .and_then(|i| i.lot_size_filter.qty_step)
            }
            Exchange::Bingx => {
                let env: BingxEnvelope<Vec<BingxContract>> = self
                    .public_json("/openApi/swap/v2/quote/contracts", &[])
                    .await?;
                let native = dashed_symbol(symbol);
                self.bingx_data(env)?
                    .into_iter()
                    .find(|c| c.symbol == native)
                    .and_then(|c| c.quantity_precision)
                    .map(|precision| Decimal::new(1, precision))
            }
            Exchange::Okx => {
                let native = dashed_symbol(symbol);
                let env: OkxEnvelope<OkxInstrument> = self
                    .public_json(
                        "/api/v5/public/instruments",
                        &[("instType", "SPOT".into()), ("instId", native.clone().into())],
                    )
                    .await?;
                self.okx_data(env)?
                    .into_iter()
                    .find(|i| i.inst_id == native)
                    .and_then(|i| i.lot_sz)
            }
        };
        step.filter(|s| *s > Decimal::ZERO)
            .ok_or_else(|| ClientError::UnknownSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(reduce_only: bool) -> ReplicaOrder {
        ReplicaOrder {
            follower_id: 7,
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            quantity: Decimal::new(1500, 4),
            reduce_only,
            reference_price: Decimal::from(60_000),
        }
    }

    fn param<'a>(params: &'a [(&'static str, Value)], key: &str) -> Option<&'a Value> {
        params.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    #[test]
    fn binance_reduce_only_market_order() {
        let params = order_params(Exchange::Binance, &order(true));
        assert_eq!(param(&params, "type"), Some(&Value::from("MARKET")));
        assert_eq!(param(&params, "quantity"), Some(&Value::from("0.15")));
        assert_eq!(param(&params, "reduceOnly"), Some(&Value::from("true")));
    }

    #[test]
    fn opening_orders_omit_reduce_only() {
        let params = order_params(Exchange::Binance, &order(false));
        assert!(param(&params, "reduceOnly").is_none());
    }

    #[test]
    fn venue_native_symbols_and_sides() {
        let bingx = order_params(Exchange::Bingx, &order(false));
        assert_eq!(param(&bingx, "symbol"), Some(&Value::from("BTC-USDT")));

        let bybit = order_params(Exchange::Bybit, &order(true));
        assert_eq!(param(&bybit, "side"), Some(&Value::from("Sell")));
        assert_eq!(param(&bybit, "reduceOnly"), Some(&Value::from(true)));

        let okx = order_params(Exchange::Okx, &order(false));
        assert_eq!(param(&okx, "instId"), Some(&Value::from("BTC-USDT")));
        assert_eq!(param(&okx, "side"), Some(&Value::from("sell")));
        assert_eq!(param(&okx, "tdMode"), Some(&Value::from("cash")));
    }

    #[test]
    fn factory_rejects_okx_without_passphrase() {
        let factory = RestClientFactory::new(http_client());
        let result = factory.build(
            Exchange::Okx,
            Credentials::new("key".into(), "secret".into(), None),
        );
        assert!(matches!(result, Err(ClientError::Auth(_))));
    }
}
