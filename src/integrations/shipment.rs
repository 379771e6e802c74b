//! 物流状态 API 客户端

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::http::{CallError, ResilientClient};

use super::path_segment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentStatus {
    pub tracking_number: String,
    /// 如 in_transit / delivered / exception
    pub status: String,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub estimated_delivery: Option<String>,
    #[serde(default)]
    pub last_location: Option<String>,
}

pub struct ShipmentClient {
    http: ResilientClient,
}

impl ShipmentClient {
    pub fn new(http: ResilientClient) -> Self {
        Self { http }
    }

    /// `GET /v1/shipments/{tracking_number}`
    pub async fn status(
        &self,
        tracking_number: &str,
        cancel: &CancellationToken,
    ) -> Result<ShipmentStatus, CallError> {
        let path = format!("/v1/shipments/{}", path_segment(tracking_number)?);
        self.http.get_json(&path, cancel).await
    }
}
