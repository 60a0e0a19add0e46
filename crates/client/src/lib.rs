//! Client SDK for the property auction server.
//!
//! This crate provides a high-level API for:
//! - Building and placing bids
//! - Joining and leaving auctions, including the deposit approval step
//! - Querying auctions, bids and participants

use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use thiserror::Error;

pub mod bid;
pub mod query;

pub use bid::BidBuilder;
pub use query::MarketQuery;

/// Errors returned by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("RPC error: {0}")]
    Rpc(#[from] jsonrpsee::core::client::Error),

    #[error("Invalid bid: {0}")]
    InvalidBid(&'static str),
}

/// Connection to an auction server acting on behalf of one user.
pub struct MarketClient {
    client: HttpClient,
    user_id: String,
}

impl MarketClient {
    /// Connect to `url` as `user_id`.
    pub fn connect(url: &str, user_id: impl Into<String>) -> Result<Self, ClientError> {
        let client = HttpClientBuilder::default().build(url)?;
        Ok(Self {
            client,
            user_id: user_id.into(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn rpc(&self) -> &HttpClient {
        &self.client
    }
}
