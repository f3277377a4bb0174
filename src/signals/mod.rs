//! Trading signals derived from wallets, the last BUY and a price snapshot.
//!
//! All values are recomputed per call and commission is never applied here,
//! so the LBD price stays comparable with the dip percentages.

use crate::models::{primary_entry_target, Asset, EntryTarget, Transaction};
use crate::quotes::PriceSnapshot;
use crate::wallets::Wallet;
use chrono::NaiveDate;
use serde::Serialize;

/// Limit-buy-down price: `buy × (1 − pdp/100)`.
pub fn lbd_price(buy_price: f64, pullback_percent: f64) -> f64 {
    buy_price - buy_price * (pullback_percent / 100.0)
}

/// Drop from `reference` to `current` in percent (positive means lower).
pub fn drop_percent(reference: f64, current: f64) -> Option<f64> {
    if reference > 0.0 {
        Some((reference - current) / reference * 100.0)
    } else {
        None
    }
}

/// Close `n` trading days back: the n-th most recent close strictly before
/// `today`.
pub fn reference_close(snapshot: &PriceSnapshot, today: NaiveDate, n: usize) -> Option<f64> {
    if n == 0 {
        return None;
    }
    let mut past: Vec<_> = snapshot.closes.iter().filter(|c| c.date < today).collect();
    past.sort_by(|a, b| b.date.cmp(&a.date));
    past.get(n - 1).map(|c| c.close)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSignals {
    pub asset_id: i64,
    pub symbol: String,
    /// None when neither the feed nor a test price had a value
    pub current_price: Option<f64>,
    pub last_buy_price: Option<f64>,
    pub last_buy_date: Option<NaiveDate>,
    pub days_since_last_buy: Option<i64>,
    pub lbd_price: Option<f64>,

    /// Drop from the last buy price, in percent
    pub entry_drop_percent: Option<f64>,
    pub entry_target_percent: Option<f64>,
    pub entry_triggered: bool,

    /// Change against the close `dip_lookback_days` back, in percent
    pub dip_percent: Option<f64>,
    pub dip_lookback_days: u32,
    pub dip_hidden: bool,

    pub lowest_profit_target_price: Option<f64>,
    pub percent_to_target: Option<f64>,
    pub target_hit: bool,
}

/// Everything one asset's signals are computed from.
pub struct SignalInputs<'a> {
    pub asset: &'a Asset,
    pub entry_targets: &'a [EntryTarget],
    pub wallets: &'a [Wallet],
    pub last_buy: Option<&'a Transaction>,
    pub snapshot: Option<&'a PriceSnapshot>,
    pub today: NaiveDate,
    pub dip_lookback_days: u32,
}

pub fn compute_signals(inputs: &SignalInputs) -> AssetSignals {
    let asset = inputs.asset;
    let current_price = asset
        .test_price
        .or_else(|| inputs.snapshot.and_then(|s| s.current_price))
        .filter(|p| p.is_finite() && *p > 0.0);

    let mut signals = AssetSignals {
        asset_id: asset.id,
        symbol: asset.symbol.clone(),
        current_price,
        dip_lookback_days: inputs.dip_lookback_days,
        ..Default::default()
    };

    if let Some(buy) = inputs.last_buy {
        signals.last_buy_price = buy.price;
        signals.last_buy_date = Some(buy.date);
        signals.days_since_last_buy = Some((inputs.today - buy.date).num_days());
        signals.lbd_price = buy.lbd_price;
    }

    // Entry pullback against the current primary entry target; the percent
    // recorded on the BUY only stands in once no entry target is configured
    signals.entry_target_percent = primary_entry_target(inputs.entry_targets)
        .map(|t| t.percent)
        .or_else(|| inputs.last_buy.and_then(|b| b.entry_target_percent));
    if let (Some(last), Some(price)) = (signals.last_buy_price, current_price) {
        signals.entry_drop_percent = drop_percent(last, price);
        signals.entry_triggered = match (signals.entry_drop_percent, signals.entry_target_percent) {
            (Some(drop), Some(target)) => drop >= target,
            _ => false,
        };
    }

    // N-day dip, hidden while the last buy is inside the window
    signals.dip_hidden = signals
        .days_since_last_buy
        .map_or(false, |days| days <= inputs.dip_lookback_days as i64);
    if !signals.dip_hidden {
        if let (Some(snapshot), Some(price)) = (inputs.snapshot, current_price) {
            signals.dip_percent =
                reference_close(snapshot, inputs.today, inputs.dip_lookback_days as usize)
                    .filter(|c| *c > 0.0)
                    .map(|close| (price - close) / close * 100.0);
        }
    }

    signals.lowest_profit_target_price = inputs
        .wallets
        .iter()
        .filter(|w| w.asset_id == asset.id && w.shares > 0)
        .map(|w| w.profit_target_price)
        .min_by(|a, b| a.total_cmp(b));
    if let (Some(target), Some(price)) = (signals.lowest_profit_target_price, current_price) {
        if target > 0.0 {
            signals.percent_to_target = Some((price - target) / target * 100.0);
            signals.target_hit = price >= target;
        }
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetStatus, TransactionType, SHARES_SCALE};
    use crate::quotes::DailyClose;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn asset() -> Asset {
        Asset {
            id: 1,
            symbol: "ABC".to_string(),
            name: "Abc Corp".to_string(),
            commission: None,
            test_price: None,
            status: AssetStatus::Active,
        }
    }

    fn snapshot(current: f64, closes: &[(u32, f64)]) -> PriceSnapshot {
        PriceSnapshot {
            symbol: "ABC".to_string(),
            current_price: Some(current),
            closes: closes
                .iter()
                .map(|(d, c)| DailyClose { date: date(*d), close: *c })
                .collect(),
        }
    }

    fn last_buy(day: u32, price: f64) -> Transaction {
        let mut t = Transaction::new(1, TransactionType::Buy, date(day));
        t.price = Some(price);
        t.investment = Some(1000.0);
        t.lbd_price = Some(lbd_price(price, 5.0));
        t
    }

    fn wallet(target_price: f64) -> Wallet {
        Wallet {
            id: 1,
            asset_id: 1,
            price_key: 1_000_000_000,
            profit_target_id: Some(1),
            shares: 10 * SHARES_SCALE,
            investment: 100.0,
            profit_target_price: target_price,
        }
    }

    fn inputs<'a>(
        asset: &'a Asset,
        targets: &'a [EntryTarget],
        wallets: &'a [Wallet],
        buy: Option<&'a Transaction>,
        snap: Option<&'a PriceSnapshot>,
    ) -> SignalInputs<'a> {
        SignalInputs {
            asset,
            entry_targets: targets,
            wallets,
            last_buy: buy,
            snapshot: snap,
            today: date(20),
            dip_lookback_days: 5,
        }
    }

    #[test]
    fn test_lbd_price() {
        assert!((lbd_price(100.0, 5.0) - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_entry_pullback_triggered() {
        let asset = asset();
        let targets = vec![
            EntryTarget { id: 1, asset_id: 1, percent: 5.0, sort_order: 0 },
            EntryTarget { id: 2, asset_id: 1, percent: 10.0, sort_order: 1 },
        ];
        let buy = last_buy(1, 100.0);
        let snap = snapshot(94.0, &[]);
        let s = compute_signals(&inputs(&asset, &targets, &[], Some(&buy), Some(&snap)));
        assert!((s.entry_drop_percent.unwrap() - 6.0).abs() < 1e-9);
        assert_eq!(s.entry_target_percent, Some(5.0));
        assert!(s.entry_triggered);

        let snap = snapshot(97.0, &[]);
        let s = compute_signals(&inputs(&asset, &targets, &[], Some(&buy), Some(&snap)));
        assert!(!s.entry_triggered);
    }

    #[test]
    fn test_entry_trigger_follows_current_primary_target() {
        let asset = asset();
        let mut buy = last_buy(1, 100.0);
        buy.entry_target_percent = Some(5.0);
        let snap = snapshot(94.0, &[]);

        // Primary target raised to 8% after the BUY: a 6% drop no longer triggers
        let raised = vec![EntryTarget { id: 1, asset_id: 1, percent: 8.0, sort_order: 0 }];
        let s = compute_signals(&inputs(&asset, &raised, &[], Some(&buy), Some(&snap)));
        assert_eq!(s.entry_target_percent, Some(8.0));
        assert!(!s.entry_triggered);

        // All entry targets removed: the recorded percent is used
        let s = compute_signals(&inputs(&asset, &[], &[], Some(&buy), Some(&snap)));
        assert_eq!(s.entry_target_percent, Some(5.0));
        assert!(s.entry_triggered);
    }

    #[test]
    fn test_dip_hidden_within_lookback() {
        let asset = asset();
        let closes = [(13, 100.0), (14, 100.0), (15, 100.0), (16, 100.0), (17, 100.0), (18, 100.0), (19, 98.0)];
        let snap = snapshot(90.0, &closes);

        for day in [15, 17, 20] {
            let buy = last_buy(day, 100.0);
            let s = compute_signals(&inputs(&asset, &[], &[], Some(&buy), Some(&snap)));
            assert!(s.days_since_last_buy.unwrap() <= 5);
            assert!(s.dip_hidden, "dip shown {} days after buy", s.days_since_last_buy.unwrap());
            assert!(s.dip_percent.is_none());
        }

        let buy = last_buy(14, 100.0);
        let s = compute_signals(&inputs(&asset, &[], &[], Some(&buy), Some(&snap)));
        assert_eq!(s.days_since_last_buy, Some(6));
        assert!(!s.dip_hidden);
        // 5th close before the 20th is the 15th (100.0)
        assert!((s.dip_percent.unwrap() + 10.0).abs() < 1e-9, "dip {:?}", s.dip_percent);
    }

    #[test]
    fn test_dip_without_history_is_none() {
        let asset = asset();
        let snap = snapshot(90.0, &[(19, 100.0)]);
        let s = compute_signals(&inputs(&asset, &[], &[], None, Some(&snap)));
        assert!(!s.dip_hidden);
        assert!(s.dip_percent.is_none());
        assert!(s.days_since_last_buy.is_none());
    }

    #[test]
    fn test_percent_to_lowest_target() {
        let asset = asset();
        let wallets = vec![wallet(12.0), wallet(11.0)];
        let snap = snapshot(10.0, &[]);
        let s = compute_signals(&inputs(&asset, &[], &wallets, None, Some(&snap)));
        assert_eq!(s.lowest_profit_target_price, Some(11.0));
        assert!((s.percent_to_target.unwrap() + 100.0 / 11.0).abs() < 1e-9);
        assert!(!s.target_hit);

        let snap = snapshot(11.0, &[]);
        let s = compute_signals(&inputs(&asset, &[], &wallets, None, Some(&snap)));
        assert!(s.target_hit);
    }

    #[test]
    fn test_test_price_overrides_feed() {
        let mut asset = asset();
        asset.test_price = Some(50.0);
        let snap = snapshot(90.0, &[]);
        let s = compute_signals(&inputs(&asset, &[], &[], None, Some(&snap)));
        assert_eq!(s.current_price, Some(50.0));

        asset.test_price = None;
        let s = compute_signals(&inputs(&asset, &[], &[], None, None));
        assert_eq!(s.current_price, None);
        assert!(s.percent_to_target.is_none());
    }

    #[test]
    fn test_days_since_last_buy() {
        let asset = asset();
        let buy = last_buy(3, 100.0);
        let s = compute_signals(&inputs(&asset, &[], &[], Some(&buy), None));
        assert_eq!(s.days_since_last_buy, Some(17));
        assert_eq!(s.lbd_price, Some(95.0));
    }
}
