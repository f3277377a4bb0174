//! Command-line front end for the lot ledger.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use lot_tracker::commands::{assets, quotes, reports, transactions};
use lot_tracker::config::Config;
use lot_tracker::models::AssetStatus;
use lot_tracker::quotes::cache::PriceCache;
use lot_tracker::quotes::yahoo::YahooSource;
use lot_tracker::{db, logging, rebuild};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lot-tracker", version, about = "Lot-based position tracking with profit targets")]
struct Cli {
    /// Database file (overrides settings and LOT_TRACKER_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage assets
    #[command(subcommand)]
    Asset(AssetCommand),
    /// Manage entry and profit targets
    #[command(subcommand)]
    Target(TargetCommand),
    /// Yearly out-of-pocket budgets
    #[command(subcommand)]
    Budget(BudgetCommand),
    /// Record a BUY; repeat --alloc TARGET=PERCENT to split it
    Buy {
        asset: i64,
        date: NaiveDate,
        price: f64,
        investment: f64,
        #[arg(long = "alloc", value_parser = parse_allocation)]
        allocations: Vec<(i64, f64)>,
        #[arg(long)]
        signal: Option<String>,
    },
    /// Record a SELL out of one wallet
    Sell {
        asset: i64,
        date: NaiveDate,
        wallet: i64,
        price: f64,
        quantity: f64,
    },
    /// Record a dividend payment
    Dividend { asset: i64, date: NaiveDate, amount: f64 },
    /// Record a securities lending payment
    Slp { asset: i64, date: NaiveDate, amount: f64 },
    /// Record a stock split (new shares per old share)
    Split { asset: i64, date: NaiveDate, ratio: f64 },
    /// Edit a recorded transaction; omitted fields keep their values
    EditTxn {
        id: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        investment: Option<f64>,
        #[arg(long)]
        quantity: Option<f64>,
        #[arg(long)]
        wallet: Option<i64>,
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        ratio: Option<f64>,
        #[arg(long = "alloc", value_parser = parse_allocation)]
        allocations: Vec<(i64, f64)>,
        #[arg(long)]
        signal: Option<String>,
    },
    /// Delete a transaction
    DeleteTxn { id: i64 },
    /// One transaction with its allocation rows
    ShowTxn { id: i64 },
    /// Allocation rows of a BUY
    Allocations { id: i64 },
    /// Transactions of an asset
    History { asset: i64 },
    /// Open wallets of an asset
    Wallets { asset: i64 },
    /// Cash position, optionally against a year's budget
    Cash {
        asset: i64,
        #[arg(long)]
        year: Option<i32>,
    },
    /// Position summary
    Position {
        asset: i64,
        #[arg(long)]
        price: Option<f64>,
    },
    /// Refresh prices and print signals for every active asset
    Signals {
        /// Use persisted snapshots only
        #[arg(long)]
        offline: bool,
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Rebuild wallets from the transaction log (all assets when omitted)
    Rebuild { asset: Option<i64> },
}

#[derive(Subcommand, Debug)]
enum AssetCommand {
    Add {
        symbol: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        commission: Option<f64>,
        #[arg(long)]
        test_price: Option<f64>,
    },
    List {
        #[arg(long)]
        all: bool,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        commission: Option<f64>,
        #[arg(long)]
        test_price: Option<f64>,
        #[arg(long)]
        clear_test_price: bool,
    },
    Status { id: i64, status: String },
    Delete { id: i64 },
}

#[derive(Subcommand, Debug)]
enum TargetCommand {
    Entry { asset: i64, percent: f64 },
    Profit {
        asset: i64,
        percent: f64,
        #[arg(long)]
        default_allocation: Option<f64>,
    },
    List { asset: i64 },
    UpdateEntry {
        id: i64,
        #[arg(long)]
        percent: Option<f64>,
        #[arg(long)]
        sort_order: Option<i64>,
    },
    UpdateProfit {
        id: i64,
        #[arg(long)]
        percent: Option<f64>,
        #[arg(long)]
        default_allocation: Option<f64>,
        #[arg(long)]
        sort_order: Option<i64>,
    },
    DeleteEntry { id: i64 },
    DeleteProfit { id: i64 },
}

#[derive(Subcommand, Debug)]
enum BudgetCommand {
    /// Set (or replace) the budget of one year
    Set { asset: i64, year: i32, max_oop: f64 },
    Show { asset: i64, year: i32 },
}

fn parse_allocation(s: &str) -> std::result::Result<(i64, f64), String> {
    let (target, pct) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=PERCENT, got '{}'", s))?;
    let target = target.trim().parse().map_err(|e| format!("bad target id: {}", e))?;
    let pct = pct.trim().parse().map_err(|e| format!("bad percent: {}", e))?;
    Ok((target, pct))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(path) = cli.db {
        config.database_path = path;
    }
    let mut conn = db::init_database(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;

    match cli.command {
        Command::Asset(cmd) => match cmd {
            AssetCommand::Add {
                symbol,
                name,
                commission,
                test_price,
            } => print_json(&assets::create_asset(
                &mut conn,
                assets::CreateAssetRequest {
                    symbol,
                    name,
                    commission,
                    test_price,
                },
            )?)?,
            AssetCommand::List { all } => print_json(&assets::list_assets(&conn, all)?)?,
            AssetCommand::Update {
                id,
                name,
                commission,
                test_price,
                clear_test_price,
            } => print_json(&assets::update_asset(
                &mut conn,
                &config,
                id,
                assets::UpdateAssetRequest {
                    symbol: None,
                    name,
                    commission,
                    test_price,
                    clear_test_price,
                },
            )?)?,
            AssetCommand::Status { id, status } => {
                let status = AssetStatus::from_str(&status).ok_or_else(|| anyhow!("Unknown status: {}", status))?;
                print_json(&assets::set_asset_status(&mut conn, id, status)?)?
            }
            AssetCommand::Delete { id } => assets::delete_asset(&mut conn, id)?,
        },
        Command::Target(cmd) => match cmd {
            TargetCommand::Entry { asset, percent } => {
                print_json(&assets::add_entry_target(&mut conn, asset, percent, None)?)?
            }
            TargetCommand::Profit {
                asset,
                percent,
                default_allocation,
            } => print_json(&assets::add_profit_target(
                &mut conn,
                asset,
                percent,
                default_allocation,
                None,
            )?)?,
            TargetCommand::List { asset } => {
                print_json(&assets::list_entry_targets(&conn, asset)?)?;
                print_json(&assets::list_profit_targets(&conn, asset)?)?;
            }
            TargetCommand::UpdateEntry { id, percent, sort_order } => {
                print_json(&assets::update_entry_target(&mut conn, id, percent, sort_order)?)?
            }
            TargetCommand::UpdateProfit {
                id,
                percent,
                default_allocation,
                sort_order,
            } => print_json(&assets::update_profit_target(
                &mut conn,
                &config,
                id,
                assets::UpdateProfitTargetRequest {
                    percent,
                    default_allocation,
                    sort_order,
                },
            )?)?,
            TargetCommand::DeleteEntry { id } => assets::delete_entry_target(&mut conn, id)?,
            TargetCommand::DeleteProfit { id } => assets::delete_profit_target(&mut conn, &config, id)?,
        },
        Command::Budget(cmd) => match cmd {
            BudgetCommand::Set { asset, year, max_oop } => {
                print_json(&assets::set_yearly_budget(&mut conn, asset, year, max_oop)?)?
            }
            BudgetCommand::Show { asset, year } => print_json(&assets::get_yearly_budget(&conn, asset, year)?)?,
        },
        Command::Buy {
            asset,
            date,
            price,
            investment,
            allocations,
            signal,
        } => {
            let mut req = transactions::CreateTransactionRequest::buy(asset, date, price, investment);
            if !allocations.is_empty() {
                req = req.with_allocations(allocations.into_iter().collect::<HashMap<_, _>>());
            }
            if let Some(signal) = signal {
                req = req.with_signal(&signal);
            }
            print_json(&transactions::create_transaction(&mut conn, &config, req)?)?
        }
        Command::Sell {
            asset,
            date,
            wallet,
            price,
            quantity,
        } => {
            let req = transactions::CreateTransactionRequest::sell(asset, date, wallet, price, quantity);
            print_json(&transactions::create_transaction(&mut conn, &config, req)?)?
        }
        Command::Dividend { asset, date, amount } => {
            let req = transactions::CreateTransactionRequest::dividend(asset, date, amount);
            print_json(&transactions::create_transaction(&mut conn, &config, req)?)?
        }
        Command::Slp { asset, date, amount } => {
            let req = transactions::CreateTransactionRequest::slp(asset, date, amount);
            print_json(&transactions::create_transaction(&mut conn, &config, req)?)?
        }
        Command::Split { asset, date, ratio } => {
            let req = transactions::CreateTransactionRequest::split(asset, date, ratio);
            print_json(&transactions::create_transaction(&mut conn, &config, req)?)?
        }
        Command::EditTxn {
            id,
            date,
            price,
            investment,
            quantity,
            wallet,
            amount,
            ratio,
            allocations,
            signal,
        } => {
            let req = transactions::UpdateTransactionRequest {
                date,
                price,
                investment,
                quantity,
                wallet_id: wallet,
                amount,
                split_ratio: ratio,
                allocations: (!allocations.is_empty()).then(|| allocations.into_iter().collect()),
                signal,
                ..Default::default()
            };
            print_json(&transactions::update_transaction(&mut conn, &config, id, req)?)?
        }
        Command::ShowTxn { id } => print_json(&transactions::get_transaction(&conn, id)?)?,
        Command::Allocations { id } => print_json(&transactions::list_allocations(&conn, id)?)?,
        Command::DeleteTxn { id } => transactions::delete_transaction(&mut conn, &config, id)?,
        Command::History { asset } => print_json(&transactions::list_transactions(&conn, asset)?)?,
        Command::Wallets { asset } => print_json(&transactions::list_wallets(&conn, asset)?)?,
        Command::Cash { asset, year } => {
            print_json(&reports::cash_report(&conn, asset, year, config.income_policy)?)?
        }
        Command::Position { asset, price } => print_json(&reports::position_summary(&conn, asset, price)?)?,
        Command::Signals { offline, today } => {
            let today = today.unwrap_or_else(|| chrono::Local::now().date_naive());
            let cache = PriceCache::new(config.price_cache_ttl_secs);
            let snapshots = if offline {
                cache.restore(&conn)?;
                cache.snapshots(&quotes::active_symbols(&conn)?)
            } else {
                let source = YahooSource::new(config.history_days)?;
                quotes::refresh_active_prices(&conn, &config, &cache, &source).await?
            };
            print_json(&reports::scan_signals(&conn, &snapshots, today, config.dip_lookback())?)?
        }
        Command::Rebuild { asset: Some(id) } => {
            let tx = conn.transaction()?;
            let report = rebuild::rebuild_wallets(&tx, id)?;
            tx.commit()?;
            print_json(&report)?
        }
        Command::Rebuild { asset: None } => print_json(&rebuild::rebuild_all_wallets(&mut conn)?)?,
    }
    Ok(())
}
