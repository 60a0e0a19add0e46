//! Payment gateway reached over JSON-RPC.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

use auction_engine::gateway::{DepositOrder, DepositOrderRequest};
use auction_engine::{GatewayError, PaymentGateway};

/// Gateway adapter speaking `gateway_*` methods over HTTP.
pub struct RpcPaymentGateway {
    client: HttpClient,
}

impl RpcPaymentGateway {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)?;
        Ok(Self { client })
    }
}

fn gateway_error(err: ClientError) -> GatewayError {
    match err {
        ClientError::Call(obj) => GatewayError::Rejected(obj.message().to_string()),
        ClientError::RequestTimeout => GatewayError::Timeout,
        other => GatewayError::Transport(other.to_string()),
    }
}

#[async_trait]
impl PaymentGateway for RpcPaymentGateway {
    async fn create_deposit_order(
        &self,
        request: &DepositOrderRequest,
    ) -> Result<DepositOrder, GatewayError> {
        self.client
            .request("gateway_createDepositOrder", rpc_params![request])
            .await
            .map_err(gateway_error)
    }

    async fn authorize_order(&self, order_id: &str) -> Result<String, GatewayError> {
        self.client
            .request("gateway_authorizeOrder", rpc_params![order_id])
            .await
            .map_err(gateway_error)
    }

    async fn void_hold(&self, hold_id: &str) -> Result<bool, GatewayError> {
        self.client
            .request("gateway_voidAuthorization", rpc_params![hold_id])
            .await
            .map_err(gateway_error)
    }
}
