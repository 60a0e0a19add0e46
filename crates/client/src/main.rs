//! CLI for interacting with the property auction server.
//!
//! This binary provides commands for:
//! - Registering properties and managing auctions
//! - Joining auctions and placing bids
//! - Querying auction status
//! - Watching a user's live notifications

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::WsClientBuilder;
use tracing::info;

use auction_client::{BidBuilder, MarketClient, MarketQuery};
use auction_engine::{JoinOutcome, SweepReport};
use auction_types::{Amount, Auction, AuctionStatus, Notification, Property};

#[derive(Parser)]
#[command(name = "auction-cli")]
#[command(about = "CLI for the property auction marketplace")]
struct Cli {
    /// Auction server RPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:9944")]
    rpc: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a property for auction
    RegisterProperty {
        /// Owner user ID
        #[arg(long)]
        owner: String,

        /// Starting price
        #[arg(long)]
        starting_price: Amount,
    },

    /// Create a new auction
    CreateAuction {
        /// Sender user ID
        #[arg(long)]
        sender: String,

        #[arg(long)]
        property_id: u64,

        /// Start time (RFC 3339)
        #[arg(long)]
        start_time: DateTime<Utc>,

        /// End time (RFC 3339)
        #[arg(long)]
        end_time: DateTime<Utc>,

        /// Minimum increment over the current highest bid
        #[arg(long)]
        min_increment: Amount,

        /// Deposit each participant must place
        #[arg(long, default_value = "0")]
        deposit: Amount,
    },

    /// Cancel a scheduled or active auction
    Cancel {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,

        /// Why the auction is cancelled
        #[arg(long)]
        reason: String,
    },

    /// Delete a scheduled auction
    Delete {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,
    },

    /// Reopen an ended auction that received no bids
    Remake {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,

        #[arg(long)]
        start_time: DateTime<Utc>,

        #[arg(long)]
        end_time: DateTime<Utc>,
    },

    /// Join an auction
    Join {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,
    },

    /// Confirm a join after approving the deposit
    Confirm {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,

        /// Order ID returned by `join`
        #[arg(long)]
        order_id: String,
    },

    /// Leave an auction that has not started
    Leave {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,
    },

    /// Place a bid
    Bid {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,

        /// Bid amount. Omit to outbid the current highest bid by the minimum increment.
        #[arg(long)]
        amount: Option<Amount>,
    },

    /// Check whether a user participates in an auction
    Status {
        #[arg(long)]
        sender: String,

        #[arg(long)]
        auction_id: u64,
    },

    /// Get auction details
    GetAuction {
        #[arg(long)]
        auction_id: u64,
    },

    /// List auctions
    ListAuctions {
        /// Only auctions in this status
        #[arg(long)]
        status: Option<AuctionStatus>,
    },

    /// Get bids for an auction
    GetBids {
        #[arg(long)]
        auction_id: u64,
    },

    /// Get participants of an auction
    GetParticipants {
        #[arg(long)]
        auction_id: u64,
    },

    /// Get deposit holds of an auction
    GetHolds {
        #[arg(long)]
        auction_id: u64,
    },

    /// Run one sweeper pass now
    Sweep,

    /// Print a user's live notifications
    Watch {
        /// Websocket endpoint
        #[arg(long, default_value = "ws://127.0.0.1:9944")]
        ws: String,

        #[arg(long)]
        user: String,

        /// Also join these auction groups (comma-separated)
        #[arg(long, value_delimiter = ',')]
        auctions: Vec<u64>,
    },
}

fn print_auction(a: &Auction) {
    println!("Auction {}:", a.auction_id);
    println!("  Property: {}", a.property_id);
    println!("  Status: {}", a.status);
    println!("  Creator: {}", a.creator);
    println!("  Start: {}", a.start_time);
    println!("  End: {}", a.end_time);
    println!("  Min Increment: {}", a.min_increment);
    println!("  Deposit: {}", a.deposit_amount);
    if let Some(winner) = &a.winner {
        println!("  Winner: {}", winner);
    }
    if let Some(reason) = &a.cancellation_reason {
        println!("  Cancelled: {}", reason);
    }
}

async fn create_auction_cmd(client: &HttpClient, params: serde_json::Value) -> Result<()> {
    let auction: Auction = client.request("auction_create", rpc_params![params]).await?;
    info!("Created auction with ID: {}", auction.auction_id);
    print_auction(&auction);
    Ok(())
}

async fn join_cmd(market: &MarketClient, auction_id: u64) -> Result<()> {
    match market.join(auction_id).await? {
        JoinOutcome::Joined => println!("Joined auction {}", auction_id),
        JoinOutcome::ApprovalRequired {
            order_id,
            approval_url,
            expires_at,
        } => {
            println!("Deposit approval required for auction {}:", auction_id);
            println!("  Approve at: {}", approval_url);
            println!("  Order ID: {}", order_id);
            println!("  Expires: {}", expires_at);
            println!("Then run `confirm --order-id {}`", order_id);
        }
    }
    Ok(())
}

async fn bid_cmd(market: &MarketClient, auction_id: u64, amount: Option<Amount>) -> Result<()> {
    let builder = BidBuilder::new(auction_id);
    let builder = match amount {
        Some(amount) => builder.amount(amount),
        None => {
            let summary = market
                .get_auction(auction_id)
                .await?
                .ok_or_else(|| anyhow!("Auction not found"))?;
            builder.outbid(&summary)
        }
    };
    let bid = market.place_bid(&builder.build()?).await?;

    info!("Bid placed for auction {}", auction_id);
    println!("Bid accepted");
    println!("  Bid ID: {}", bid.bid_id);
    println!("  Auction ID: {}", bid.auction_id);
    println!("  Amount: {}", bid.amount);
    Ok(())
}

async fn get_auction_cmd(market: &MarketClient, auction_id: u64) -> Result<()> {
    match market.get_auction(auction_id).await? {
        Some(summary) => {
            print_auction(&summary.auction);
            println!("  Bids: {}", summary.num_bids);
            if let Some(highest) = summary.highest_bid {
                println!("  Highest Bid: {}", highest);
            }
        }
        None => {
            println!("Auction {} not found", auction_id);
        }
    }
    Ok(())
}

async fn list_auctions_cmd(market: &MarketClient, status: Option<AuctionStatus>) -> Result<()> {
    let auctions = market.list_auctions(status).await?;

    if auctions.is_empty() {
        println!("No auctions found");
    } else {
        println!("Auctions:");
        for s in auctions {
            let a = &s.auction;
            println!(
                "  [{}] property {} - {} ({}), {} bids",
                a.auction_id, a.property_id, a.status, a.creator, s.num_bids
            );
        }
    }
    Ok(())
}

async fn get_bids_cmd(market: &MarketClient, auction_id: u64) -> Result<()> {
    let bids = market.get_auction_bids(auction_id).await?;

    if bids.is_empty() {
        println!("No bids for auction {}", auction_id);
    } else {
        println!("Bids for auction {}:", auction_id);
        for bid in bids {
            println!("  [{}] {} bid {} at {}", bid.bid_id, bid.bidder, bid.amount, bid.placed_at);
        }
    }
    Ok(())
}

async fn watch_cmd(ws: &str, rpc: &str, user: String, auctions: Vec<u64>) -> Result<()> {
    let client = WsClientBuilder::default().build(ws).await?;
    let mut sub: Subscription<Notification> = client
        .subscribe(
            "realtime_subscribe",
            rpc_params![user.clone()],
            "realtime_unsubscribe",
        )
        .await?;

    let market = MarketClient::connect(rpc, user.clone())?;
    for auction_id in auctions {
        market.join_group(auction_id).await?;
    }

    println!("Watching notifications for {} (Ctrl+C to stop)", user);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = sub.next() => match next {
                Some(notification) => {
                    println!("{}", serde_json::to_string(&notification?)?);
                }
                None => {
                    println!("Server closed the subscription");
                    break;
                }
            },
        }
    }

    sub.unsubscribe().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("auction_cli=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let client = HttpClientBuilder::default().build(&cli.rpc)?;

    match cli.command {
        Commands::RegisterProperty {
            owner,
            starting_price,
        } => {
            let params = serde_json::json!({
                "owner": owner,
                "starting_price": starting_price
            });
            let property: Property = client
                .request("admin_registerProperty", rpc_params![params])
                .await?;
            println!("Property ID: {}", property.property_id);
        }

        Commands::CreateAuction {
            sender,
            property_id,
            start_time,
            end_time,
            min_increment,
            deposit,
        } => {
            let params = serde_json::json!({
                "sender": sender,
                "property_id": property_id,
                "start_time": start_time,
                "end_time": end_time,
                "min_increment": min_increment,
                "deposit_amount": deposit
            });
            create_auction_cmd(&client, params).await?;
        }

        Commands::Cancel {
            sender,
            auction_id,
            reason,
        } => {
            let params = serde_json::json!({
                "sender": sender,
                "auction_id": auction_id,
                "reason": reason
            });
            let auction: Auction = client.request("auction_cancel", rpc_params![params]).await?;
            print_auction(&auction);
        }

        Commands::Delete { sender, auction_id } => {
            let params = serde_json::json!({ "sender": sender, "auction_id": auction_id });
            let _: bool = client.request("auction_delete", rpc_params![params]).await?;
            println!("Auction {} deleted", auction_id);
        }

        Commands::Remake {
            sender,
            auction_id,
            start_time,
            end_time,
        } => {
            let params = serde_json::json!({
                "sender": sender,
                "auction_id": auction_id,
                "start_time": start_time,
                "end_time": end_time
            });
            let auction: Auction = client.request("auction_remake", rpc_params![params]).await?;
            print_auction(&auction);
        }

        Commands::Join { sender, auction_id } => {
            join_cmd(&MarketClient::connect(&cli.rpc, sender)?, auction_id).await?;
        }

        Commands::Confirm {
            sender,
            auction_id,
            order_id,
        } => {
            let market = MarketClient::connect(&cli.rpc, sender)?;
            let hold = market.confirm_join(auction_id, &order_id).await?;
            println!("Joined auction {}", auction_id);
            println!("  Hold ID: {}", hold.hold_id);
            println!("  Amount: {}", hold.amount);
            println!("  Expires: {}", hold.expires_at);
        }

        Commands::Leave { sender, auction_id } => {
            MarketClient::connect(&cli.rpc, sender)?
                .leave(auction_id)
                .await?;
            println!("Left auction {}", auction_id);
        }

        Commands::Bid {
            sender,
            auction_id,
            amount,
        } => {
            bid_cmd(&MarketClient::connect(&cli.rpc, sender)?, auction_id, amount).await?;
        }

        Commands::Status { sender, auction_id } => {
            let status = MarketClient::connect(&cli.rpc, sender)?
                .check_participation(auction_id)
                .await?;
            println!("{}", status.message);
        }

        Commands::GetAuction { auction_id } => {
            get_auction_cmd(&MarketClient::connect(&cli.rpc, "")?, auction_id).await?;
        }

        Commands::ListAuctions { status } => {
            list_auctions_cmd(&MarketClient::connect(&cli.rpc, "")?, status).await?;
        }

        Commands::GetBids { auction_id } => {
            get_bids_cmd(&MarketClient::connect(&cli.rpc, "")?, auction_id).await?;
        }

        Commands::GetParticipants { auction_id } => {
            let participants = MarketClient::connect(&cli.rpc, "")?
                .get_participants(auction_id)
                .await?;
            println!("Participants of auction {}:", auction_id);
            for p in participants {
                println!("  {} (since {})", p.user_id, p.registered_at);
            }
        }

        Commands::GetHolds { auction_id } => {
            let holds = MarketClient::connect(&cli.rpc, "")?
                .get_holds(auction_id)
                .await?;
            println!("Deposit holds of auction {}:", auction_id);
            for h in holds {
                println!(
                    "  #{} {} {} ({:?}, expires {})",
                    h.hold_id, h.owner, h.amount, h.status, h.expires_at
                );
            }
        }

        Commands::Sweep => {
            let report: SweepReport = client.request("admin_sweep", rpc_params![]).await?;
            println!(
                "Sweep: {} activated, {} ended, {} skipped, {} holds released, {} hold failures, {} reconciled",
                report.activated,
                report.ended,
                report.skipped,
                report.holds_released,
                report.hold_failures,
                report.reconciled
            );
        }

        Commands::Watch { ws, user, auctions } => {
            watch_cmd(&ws, &cli.rpc, user, auctions).await?;
        }
    }

    Ok(())
}
