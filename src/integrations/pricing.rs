//! 报价 / 目录 API 客户端

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::http::{CallError, ResilientClient};

use super::path_segment;

/// 单个 SKU 的报价
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub sku: String,
    pub unit_price: f64,
    pub currency: String,
    pub quantity: u32,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub lead_time_days: Option<u32>,
}

impl Quote {
    pub fn total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

pub struct PricingClient {
    http: ResilientClient,
}

impl PricingClient {
    pub fn new(http: ResilientClient) -> Self {
        Self { http }
    }

    /// `GET /v1/prices/{sku}?quantity=n`
    pub async fn quote(
        &self,
        sku: &str,
        quantity: u32,
        cancel: &CancellationToken,
    ) -> Result<Quote, CallError> {
        let path = format!("/v1/prices/{}?quantity={}", path_segment(sku)?, quantity.max(1));
        self.http.get_json(&path, cancel).await
    }
}
