//! JSON-RPC server for the property auction marketplace.
//!
//! Exposes the auction engine's client operations, the realtime channel
//! (as a websocket subscription plus request methods) and a few admin
//! methods, and runs the lifecycle sweeper in the background.

use anyhow::{Context, Result};
use clap::Parser;
use jsonrpsee::core::{async_trait, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{PendingSubscriptionSink, Server, SubscriptionMessage};
use jsonrpsee::types::ErrorObjectOwned;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use auction_engine::queries::{handle_query, DEFAULT_PAGE_SIZE};
use auction_engine::{
    AuctionEngine, AuctionError, AuctionQuery, AuctionQueryResponse, AuctionSummary,
    EngineConfig, EngineContext, ErrorClass, JoinOutcome, MemoryLedger, NotificationHub, ParticipationStatus,
    PaymentGateway, RealtimeChannel, RejectionCategory, SandboxGateway, SweepReport,
};
use auction_types::{
    Auction, AuctionId, Bid, Caller, DepositHold, Notification, Participant, Property,
};

mod gateway_client;
mod types;
use gateway_client::RpcPaymentGateway;
use types::*;

/// RPC API of the marketplace.
#[rpc(server)]
pub trait MarketApi {
    // ============ Realtime Methods ============

    /// Stream a user's notifications.
    #[subscription(name = "realtime_subscribe" => "realtime_notification", unsubscribe = "realtime_unsubscribe", item = Notification)]
    async fn realtime_subscribe(&self, user_id: String) -> SubscriptionResult;

    /// Place a bid. The bidder also gets an accept/reject notification.
    #[method(name = "realtime_placeBid")]
    async fn realtime_place_bid(&self, params: PlaceBidParams) -> Result<Bid, ErrorObjectOwned>;

    /// Join the broadcast group of an auction the sender participates in.
    #[method(name = "realtime_joinAuctionGroup")]
    async fn realtime_join_auction_group(
        &self,
        params: AuctionCallParams,
    ) -> Result<bool, ErrorObjectOwned>;

    /// Leave an auction and its broadcast group.
    #[method(name = "realtime_leaveAuctionGroup")]
    async fn realtime_leave_auction_group(
        &self,
        params: AuctionCallParams,
    ) -> Result<bool, ErrorObjectOwned>;

    // ============ Auction Methods ============

    /// Create an auction.
    #[method(name = "auction_create")]
    async fn auction_create(
        &self,
        params: CreateAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned>;

    /// Cancel a scheduled or active auction.
    #[method(name = "auction_cancel")]
    async fn auction_cancel(
        &self,
        params: CancelAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned>;

    /// Delete a scheduled auction.
    #[method(name = "auction_delete")]
    async fn auction_delete(&self, params: AuctionCallParams) -> Result<bool, ErrorObjectOwned>;

    /// Reopen an ended auction without bids.
    #[method(name = "auction_remake")]
    async fn auction_remake(
        &self,
        params: RemakeAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned>;

    // ============ Deposit Methods ============

    #[method(name = "deposit_initiateJoin")]
    async fn deposit_initiate_join(
        &self,
        params: AuctionCallParams,
    ) -> Result<JoinOutcome, ErrorObjectOwned>;

    #[method(name = "deposit_confirmJoin")]
    async fn deposit_confirm_join(
        &self,
        params: ConfirmJoinParams,
    ) -> Result<DepositHold, ErrorObjectOwned>;

    #[method(name = "deposit_leave")]
    async fn deposit_leave(&self, params: AuctionCallParams) -> Result<bool, ErrorObjectOwned>;

    #[method(name = "deposit_checkParticipation")]
    async fn deposit_check_participation(
        &self,
        params: AuctionCallParams,
    ) -> Result<ParticipationStatus, ErrorObjectOwned>;

    // ============ Query Methods ============

    /// Get auction by ID.
    #[method(name = "query_getAuction")]
    async fn query_get_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Option<AuctionSummary>, ErrorObjectOwned>;

    /// List auctions, optionally by status.
    #[method(name = "query_listAuctions")]
    async fn query_list_auctions(
        &self,
        params: Option<ListAuctionsParams>,
    ) -> Result<Vec<AuctionSummary>, ErrorObjectOwned>;

    /// Get all bids for an auction.
    #[method(name = "query_getAuctionBids")]
    async fn query_get_auction_bids(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Bid>, ErrorObjectOwned>;

    #[method(name = "query_getParticipants")]
    async fn query_get_participants(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Participant>, ErrorObjectOwned>;

    /// Deposit holds recorded for an auction, released ones included.
    #[method(name = "query_getHolds")]
    async fn query_get_holds(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<DepositHold>, ErrorObjectOwned>;

    // ============ Admin Methods ============

    /// Register a property for auction.
    #[method(name = "admin_registerProperty")]
    async fn admin_register_property(
        &self,
        params: RegisterPropertyParams,
    ) -> Result<Property, ErrorObjectOwned>;

    /// Run one sweeper tick now.
    #[method(name = "admin_sweep")]
    async fn admin_sweep(&self) -> Result<SweepReport, ErrorObjectOwned>;
}

/// Implementation of the marketplace RPC server.
struct MarketServer {
    engine: AuctionEngine,
    realtime: RealtimeChannel,
    admins: HashSet<String>,
}

impl MarketServer {
    fn new(engine: AuctionEngine, hub: Arc<NotificationHub>, admins: HashSet<String>) -> Self {
        let realtime = RealtimeChannel::new(engine.bids.clone(), engine.deposits.clone(), hub);
        Self {
            engine,
            realtime,
            admins,
        }
    }

    fn caller(&self, sender: &str) -> Caller {
        if self.admins.contains(sender) {
            Caller::admin(sender)
        } else {
            Caller::user(sender)
        }
    }

    async fn query(&self, query: AuctionQuery) -> Result<AuctionQueryResponse, ErrorObjectOwned> {
        handle_query(self.engine.context().store.as_ref(), query)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    fn rpc_error(err: &AuctionError) -> ErrorObjectOwned {
        match err.class() {
            ErrorClass::Consistency => error!(error = %err, "Request failed on inconsistent state"),
            ErrorClass::Gateway => warn!(error = %err, "Payment gateway call failed"),
            ErrorClass::Validation => {}
        }
        ErrorObjectOwned::owned(error_code(err.category()), err.to_string(), None::<()>)
    }

    fn unexpected(response: AuctionQueryResponse) -> ErrorObjectOwned {
        ErrorObjectOwned::owned(
            -32603,
            format!("Unexpected query response: {:?}", response),
            None::<()>,
        )
    }
}

/// JSON-RPC error code for each rejection category.
fn error_code(category: RejectionCategory) -> i32 {
    match category {
        RejectionCategory::NotFound => -32001,
        RejectionCategory::WrongState => -32002,
        RejectionCategory::NotAuthorized => -32003,
        RejectionCategory::InsufficientBid => -32004,
        RejectionCategory::PaymentProvider => -32005,
        RejectionCategory::InvalidRequest => -32010,
        RejectionCategory::Internal => -32603,
    }
}

#[async_trait]
impl MarketApiServer for MarketServer {
    async fn realtime_subscribe(
        &self,
        pending: PendingSubscriptionSink,
        user_id: String,
    ) -> SubscriptionResult {
        let sink = pending.accept().await?;
        let mut rx = self.realtime.connect(&user_id);
        info!(user_id = %user_id, "Realtime subscriber connected");

        loop {
            tokio::select! {
                _ = sink.closed() => break,
                received = rx.recv() => match received {
                    Ok(notification) => {
                        let msg = SubscriptionMessage::from_json(&notification)?;
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user_id = %user_id, skipped, "Subscriber lagging, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        drop(rx);
        self.realtime.hub().disconnect(&user_id);
        info!(user_id = %user_id, "Realtime subscriber disconnected");
        Ok(())
    }

    async fn realtime_place_bid(&self, params: PlaceBidParams) -> Result<Bid, ErrorObjectOwned> {
        self.realtime
            .place_bid(&params.sender, params.auction_id, params.amount)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn realtime_join_auction_group(
        &self,
        params: AuctionCallParams,
    ) -> Result<bool, ErrorObjectOwned> {
        self.realtime
            .join_group(&params.sender, params.auction_id)
            .await
            .map_err(|e| Self::rpc_error(&e))?;
        Ok(true)
    }

    async fn realtime_leave_auction_group(
        &self,
        params: AuctionCallParams,
    ) -> Result<bool, ErrorObjectOwned> {
        self.realtime
            .leave_group(&params.sender, params.auction_id)
            .await
            .map_err(|e| Self::rpc_error(&e))?;
        Ok(true)
    }

    async fn auction_create(
        &self,
        params: CreateAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned> {
        let caller = self.caller(&params.sender);
        self.engine
            .lifecycle
            .create(&caller, params.into())
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn auction_cancel(
        &self,
        params: CancelAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned> {
        let caller = self.caller(&params.sender);
        self.engine
            .lifecycle
            .cancel(&caller, params.auction_id, &params.reason)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn auction_delete(&self, params: AuctionCallParams) -> Result<bool, ErrorObjectOwned> {
        let caller = self.caller(&params.sender);
        self.engine
            .lifecycle
            .delete(&caller, params.auction_id)
            .await
            .map_err(|e| Self::rpc_error(&e))?;
        Ok(true)
    }

    async fn auction_remake(
        &self,
        params: RemakeAuctionParams,
    ) -> Result<Auction, ErrorObjectOwned> {
        let caller = self.caller(&params.sender);
        self.engine
            .lifecycle
            .remake(&caller, params.auction_id, params.start_time, params.end_time)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn deposit_initiate_join(
        &self,
        params: AuctionCallParams,
    ) -> Result<JoinOutcome, ErrorObjectOwned> {
        self.engine
            .deposits
            .initiate_join(params.auction_id, &params.sender)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn deposit_confirm_join(
        &self,
        params: ConfirmJoinParams,
    ) -> Result<DepositHold, ErrorObjectOwned> {
        self.engine
            .deposits
            .confirm_join(&params.order_id, &params.sender, params.auction_id)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn deposit_leave(&self, params: AuctionCallParams) -> Result<bool, ErrorObjectOwned> {
        self.engine
            .deposits
            .leave_auction(params.auction_id, &params.sender)
            .await
            .map_err(|e| Self::rpc_error(&e))?;
        Ok(true)
    }

    async fn deposit_check_participation(
        &self,
        params: AuctionCallParams,
    ) -> Result<ParticipationStatus, ErrorObjectOwned> {
        self.engine
            .deposits
            .check_participation(params.auction_id, &params.sender)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn query_get_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Option<AuctionSummary>, ErrorObjectOwned> {
        match self.query(AuctionQuery::GetAuction { auction_id }).await? {
            AuctionQueryResponse::Auction(summary) => Ok(summary),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn query_list_auctions(
        &self,
        params: Option<ListAuctionsParams>,
    ) -> Result<Vec<AuctionSummary>, ErrorObjectOwned> {
        let params = params.unwrap_or_default();
        let query = AuctionQuery::ListAuctions {
            status: params.status,
            offset: params.offset.unwrap_or(0),
            limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        };
        match self.query(query).await? {
            AuctionQueryResponse::AuctionList(list) => Ok(list),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn query_get_auction_bids(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Bid>, ErrorObjectOwned> {
        match self.query(AuctionQuery::GetAuctionBids { auction_id }).await? {
            AuctionQueryResponse::Bids(bids) => Ok(bids),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn query_get_participants(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Participant>, ErrorObjectOwned> {
        match self.query(AuctionQuery::GetParticipants { auction_id }).await? {
            AuctionQueryResponse::Participants(participants) => Ok(participants),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn query_get_holds(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<DepositHold>, ErrorObjectOwned> {
        match self.query(AuctionQuery::GetHolds { auction_id }).await? {
            AuctionQueryResponse::Holds(holds) => Ok(holds),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn admin_register_property(
        &self,
        params: RegisterPropertyParams,
    ) -> Result<Property, ErrorObjectOwned> {
        self.engine
            .lifecycle
            .register_property(params.owner, params.starting_price)
            .await
            .map_err(|e| Self::rpc_error(&e))
    }

    async fn admin_sweep(&self) -> Result<SweepReport, ErrorObjectOwned> {
        let report = self.engine.sweeper.tick().await;
        info!(?report, "Manual sweep finished");
        Ok(report)
    }
}

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "auction-server")]
#[command(about = "Property auction marketplace server")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9944")]
    listen: SocketAddr,

    /// JSON-RPC endpoint of the payment gateway. The sandbox gateway is used when unset.
    #[arg(long, env = "AUCTION_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(long, env = "AUCTION_CONFIG")]
    config: Option<PathBuf>,

    /// Users treated as administrators
    #[arg(long, value_delimiter = ',')]
    admins: Vec<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("auction_server=info".parse().unwrap())
                .add_directive("auction_engine=info".parse().unwrap())
                .add_directive("jsonrpsee=warn".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let gateway: Arc<dyn PaymentGateway> = match &cli.gateway_url {
        Some(url) => {
            info!("Using payment gateway at {}", url);
            Arc::new(RpcPaymentGateway::new(url, config.gateway_timeout())?)
        }
        None => {
            warn!("No gateway configured, using the sandbox gateway");
            Arc::new(SandboxGateway::default())
        }
    };

    let hub = Arc::new(NotificationHub::new(config.notification_buffer));
    let ctx = EngineContext::new(Arc::new(MemoryLedger::new()), gateway, hub.clone())
        .with_config(config);
    let engine = AuctionEngine::new(ctx);

    // Start sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = engine.spawn_sweeper(shutdown_rx);

    info!("Starting auction server on {}", cli.listen);

    let server = Server::builder().build(cli.listen).await?;
    let admins = cli.admins.into_iter().collect();
    let handle = server.start(MarketServer::new(engine, hub, admins).into_rpc());

    info!("Auction server running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    handle.stop()?;
    handle.stopped().await;
    sweeper.await?;

    Ok(())
}
