//! 外部 HTTP 调用：所有出站集成（CRM / 报价 / 物流）共用的容错调用封装

mod resilient;

pub use resilient::{CallError, RefreshingToken, ResilientClient, StaticToken, TokenProvider};
