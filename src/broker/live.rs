use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{Broker, MarketData};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::models::{
    AccountSnapshot, Bar, BarSeries, Interval, Order, OrderStatus, OrderType, Position, Side,
};

const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(300);
const BARS_PAGE_LIMIT: usize = 10_000;
/// Error code the brokerage puts in a 404 body when the symbol has no position.
const POSITION_NOT_FOUND: u64 = 40_410_000;

#[derive(Debug, Deserialize)]
struct RawApiError {
    code: u64,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    cash: String,
    equity: String,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    #[serde(default)]
    current_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    symbol: String,
    side: String,
    qty: Option<String>,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    order_type: Option<String>,
    #[serde(default)]
    limit_price: Option<String>,
    status: String,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    qty: String,
    side: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<RawBar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: RawTrade,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    p: f64,
}

/// REST adapter for an Alpaca-style brokerage. Every transport failure,
/// non-2xx status or undecodable body comes back as a `BrokerError`.
pub struct LiveBroker {
    client: Client,
    trading_url: String,
    data_url: String,
    api_key: String,
    api_secret: String,
    last_request: Mutex<Option<Instant>>,
}

impl LiveBroker {
    pub fn new(cfg: &BrokerConfig) -> Self {
        Self {
            client: Client::new(),
            trading_url: cfg.trading_url.trim_end_matches('/').to_string(),
            data_url: cfg.data_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            last_request: Mutex::new(None),
        }
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    /// Send and return the body text of a 2xx response.
    async fn send(&self, req: RequestBuilder) -> Result<String, BrokerError> {
        self.rate_limit().await;
        let resp = req.send().await.map_err(|e| BrokerError::Transport {
            reason: e.to_string(),
        })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| BrokerError::Transport {
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, BrokerError> {
        let body = self.send(req).await?;
        decode(&body)
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, BrokerError> {
    serde_json::from_str(body).map_err(|e| BrokerError::Decode {
        reason: e.to_string(),
    })
}

/// A 404 only means "flat" when the brokerage says so. Any other 404 (a
/// wrong base URL, a proxy page) stays an error.
fn is_position_not_found(err: &BrokerError) -> bool {
    match err {
        BrokerError::Status { status: 404, body } => decode::<RawApiError>(body)
            .map(|e| e.code == POSITION_NOT_FOUND)
            .unwrap_or(false),
        _ => false,
    }
}

fn num(field: &str, raw: &str) -> Result<f64, BrokerError> {
    raw.parse::<f64>().map_err(|_| BrokerError::Decode {
        reason: format!("{} is not a number: {:?}", field, raw),
    })
}

fn opt_num(field: &str, raw: Option<&String>) -> Result<Option<f64>, BrokerError> {
    raw.map(|s| num(field, s)).transpose()
}

fn translate_position(raw: RawPosition) -> Result<Position, BrokerError> {
    let quantity = num("qty", &raw.qty)?;
    let avg_entry_price = num("avg_entry_price", &raw.avg_entry_price)?;
    let market_price = opt_num("current_price", raw.current_price.as_ref())?.unwrap_or(avg_entry_price);
    Ok(Position {
        symbol: raw.symbol,
        quantity,
        avg_entry_price,
        // not part of the position payload
        realized_pnl: 0.0,
        market_price,
        opened_at: None,
    })
}

fn translate_status(raw: &str) -> OrderStatus {
    match raw {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "expired" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn translate_order(raw: RawOrder) -> Result<Order, BrokerError> {
    let side = match raw.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return Err(BrokerError::Decode {
                reason: format!("unknown order side {:?}", other),
            })
        }
    };
    let requested = opt_num("qty", raw.qty.as_ref())?.unwrap_or(0.0);
    let filled = opt_num("filled_qty", raw.filled_qty.as_ref())?.unwrap_or(0.0);
    let fill_price = opt_num("filled_avg_price", raw.filled_avg_price.as_ref())?;
    let order_type = match (raw.order_type.as_deref(), raw.limit_price.as_ref()) {
        (Some("limit"), Some(p)) => OrderType::Limit {
            price: num("limit_price", p)?,
        },
        _ => OrderType::Market,
    };
    Ok(Order::from_parts(
        raw.id,
        &raw.symbol,
        side,
        requested,
        filled,
        order_type,
        fill_price,
        raw.filled_at,
        translate_status(&raw.status),
    ))
}

fn translate_bar(raw: RawBar) -> Bar {
    Bar {
        timestamp: raw.t,
        open: raw.o,
        high: raw.h,
        low: raw.l,
        close: raw.c,
        volume: raw.v,
    }
}

fn order_request(symbol: &str, side: Side, quantity: f64, order_type: OrderType) -> OrderRequest<'_> {
    let limit_price = match order_type {
        OrderType::Limit { price } => Some(format!("{}", price)),
        OrderType::Market => None,
    };
    OrderRequest {
        symbol,
        qty: format!("{}", quantity),
        side: side.as_str(),
        order_type: order_type.as_str(),
        time_in_force: "day",
        limit_price,
    }
}

#[async_trait]
impl MarketData for LiveBroker {
    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<BarSeries, BrokerError> {
        let url = format!("{}/v2/stocks/{}/bars", self.data_url, symbol);
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeframe", interval.api_timeframe().to_string()),
                ("start", start.to_rfc3339()),
                ("end", end.to_rfc3339()),
                ("limit", BARS_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let page: BarsResponse = self
                .get_json(self.request(Method::GET, url.clone()).query(&query))
                .await?;
            let n = page.bars.as_ref().map_or(0, |b| b.len());
            bars.extend(page.bars.unwrap_or_default().into_iter().map(translate_bar));
            debug!("Fetched {} {} bars for {} ({} total)", n, interval, symbol, bars.len());

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        Ok(BarSeries::new(bars))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol);
        let latest: LatestTradeResponse = self.get_json(self.request(Method::GET, url)).await?;
        if latest.trade.p.is_finite() && latest.trade.p > 0.0 {
            Ok(latest.trade.p)
        } else {
            Err(BrokerError::NoPrice {
                symbol: symbol.to_string(),
            })
        }
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn get_account(&mut self) -> Result<AccountSnapshot, BrokerError> {
        let acct: RawAccount = self
            .get_json(self.request(Method::GET, format!("{}/v2/account", self.trading_url)))
            .await?;
        let raw_positions: Vec<RawPosition> = self
            .get_json(self.request(Method::GET, format!("{}/v2/positions", self.trading_url)))
            .await?;
        let positions = raw_positions
            .into_iter()
            .map(translate_position)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AccountSnapshot {
            cash: num("cash", &acct.cash)?,
            equity: num("equity", &acct.equity)?,
            positions,
            taken_at: Utc::now(),
        })
    }

    async fn get_position(&mut self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        let url = format!("{}/v2/positions/{}", self.trading_url, symbol);
        match self.get_json::<RawPosition>(self.request(Method::GET, url)).await {
            Ok(raw) => translate_position(raw).map(Some),
            Err(e) if is_position_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn submit_order(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<Order, BrokerError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(BrokerError::InvalidOrder {
                reason: format!("quantity {} for {}", quantity, symbol),
            });
        }
        let body = order_request(symbol, side, quantity, order_type);
        let url = format!("{}/v2/orders", self.trading_url);
        let raw: RawOrder = self
            .get_json(self.request(Method::POST, url).json(&body))
            .await?;
        let order = translate_order(raw)?;
        info!(
            "[LIVE] {} {} {} -> {} ({:?})",
            side,
            quantity,
            symbol,
            order.id(),
            order.status()
        );
        Ok(order)
    }

    async fn close_position(&mut self, symbol: &str) -> Result<Option<Order>, BrokerError> {
        let url = format!("{}/v2/positions/{}", self.trading_url, symbol);
        match self.get_json::<RawOrder>(self.request(Method::DELETE, url)).await {
            Ok(raw) => translate_order(raw).map(Some),
            Err(e) if is_position_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
