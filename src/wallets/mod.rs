//! Lot store: open wallets keyed by (asset, purchase price, profit target).
//!
//! A wallet is a materialized view over the transaction log. The engines in
//! `allocation`, `sell` and `reversal` mutate a [`WalletBook`] incrementally;
//! `rebuild` produces one from scratch so both paths can be compared.
//!
//! Shares are fixed-point (× 10^8) and `investment` is always re-derived as
//! `shares × purchase price`, so the two never drift apart.

use crate::error::{LedgerError, Result};
use crate::models::{price_from_db, price_to_db, shares_from_db, SHARES_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Tolerance for money comparisons between two wallet states
pub const AMOUNT_TOLERANCE: f64 = 0.000_001;

/// Composite lot key. The price is a fixed-point integer, never a float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletKey {
    pub asset_id: i64,
    pub price_key: i64,
    /// `None` is the implicit 100% target of an asset without profit targets
    pub profit_target_id: Option<i64>,
}

impl WalletKey {
    pub fn new(asset_id: i64, purchase_price: f64, profit_target_id: Option<i64>) -> Self {
        Self {
            asset_id,
            price_key: price_to_db(purchase_price),
            profit_target_id,
        }
    }

    pub fn purchase_price(&self) -> f64 {
        price_from_db(self.price_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: i64,
    pub asset_id: i64,
    pub price_key: i64,
    pub profit_target_id: Option<i64>,
    /// × 10^8
    pub shares: i64,
    pub investment: f64,
    pub profit_target_price: f64,
}

impl Wallet {
    fn open(id: i64, key: WalletKey, profit_target_price: f64) -> Self {
        Self {
            id,
            asset_id: key.asset_id,
            price_key: key.price_key,
            profit_target_id: key.profit_target_id,
            shares: 0,
            investment: 0.0,
            profit_target_price,
        }
    }

    pub fn key(&self) -> WalletKey {
        WalletKey {
            asset_id: self.asset_id,
            price_key: self.price_key,
            profit_target_id: self.profit_target_id,
        }
    }

    pub fn purchase_price(&self) -> f64 {
        price_from_db(self.price_key)
    }

    pub fn shares_f64(&self) -> f64 {
        shares_from_db(self.shares)
    }

    pub fn expected_investment(&self) -> f64 {
        self.shares_f64() * self.purchase_price()
    }

    /// shares ≈ investment / purchase price
    pub fn is_consistent(&self) -> bool {
        (self.investment - self.expected_investment()).abs() <= AMOUNT_TOLERANCE
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.shares_f64() * price
    }

    fn set_shares(&mut self, shares: i64) {
        self.shares = shares;
        self.investment = self.expected_investment();
    }
}

/// In-memory lot store for one or more assets.
#[derive(Debug, Clone, Default)]
pub struct WalletBook {
    wallets: BTreeMap<WalletKey, Wallet>,
    next_id: i64,
    preferred_ids: HashMap<WalletKey, i64>,
}

impl WalletBook {
    pub fn new(next_id: i64) -> Self {
        Self {
            wallets: BTreeMap::new(),
            next_id: next_id.max(1),
            preferred_ids: HashMap::new(),
        }
    }

    /// Load persisted wallets. `next_id` is raised past every loaded id.
    pub fn from_wallets(wallets: Vec<Wallet>, next_id: i64) -> Self {
        let mut book = Self::new(next_id);
        for wallet in wallets {
            book.next_id = book.next_id.max(wallet.id + 1);
            book.wallets.insert(wallet.key(), wallet);
        }
        book
    }

    /// Ids to reuse when a key is (re)opened, so a rebuild keeps the ids of
    /// wallets that already exist in the store.
    pub fn with_preferred_ids(mut self, ids: HashMap<WalletKey, i64>) -> Self {
        for id in ids.values() {
            self.next_id = self.next_id.max(id + 1);
        }
        self.preferred_ids = ids;
        self
    }

    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn get(&self, key: &WalletKey) -> Option<&Wallet> {
        self.wallets.get(key)
    }

    pub fn get_by_id(&self, id: i64) -> Option<&Wallet> {
        self.wallets.values().find(|w| w.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn for_asset(&self, asset_id: i64) -> impl Iterator<Item = &Wallet> {
        self.wallets.values().filter(move |w| w.asset_id == asset_id)
    }

    pub fn into_wallets(self) -> Vec<Wallet> {
        self.wallets.into_values().collect()
    }

    fn id_in_use(&self, id: i64) -> bool {
        self.wallets.values().any(|w| w.id == id)
    }

    fn allocate_id(&mut self, key: &WalletKey, preferred: Option<i64>) -> i64 {
        let candidate = preferred.or_else(|| self.preferred_ids.get(key).copied());
        if let Some(id) = candidate {
            if !self.id_in_use(id) {
                self.next_id = self.next_id.max(id + 1);
                return id;
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Add (or, with a negative delta, remove) shares on a key, opening the
    /// wallet if needed. Same-price buys into the same target merge here.
    ///
    /// Negative balances are allowed transiently; call [`settle`](Self::settle)
    /// once a reversal/re-apply sequence is complete.
    pub fn apply_delta(
        &mut self,
        key: WalletKey,
        delta_shares: i64,
        profit_target_price: f64,
        preferred_id: Option<i64>,
    ) -> i64 {
        let new_id = if self.wallets.contains_key(&key) {
            None
        } else {
            Some(self.allocate_id(&key, preferred_id))
        };
        let wallet = self.wallets.entry(key).or_insert_with(|| {
            Wallet::open(new_id.unwrap_or_default(), key, profit_target_price)
        });
        wallet.set_shares(wallet.shares + delta_shares);
        wallet.profit_target_price = profit_target_price;
        wallet.id
    }

    /// Strict removal used by sells: never goes below zero and closes the
    /// wallet when the remainder is within epsilon. Returns the wallet as it
    /// was before the debit.
    pub fn debit(&mut self, wallet_id: i64, shares: i64) -> Result<Wallet> {
        let wallet = self
            .wallets
            .values_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| LedgerError::not_found("Wallet", wallet_id))?;
        let key = wallet.key();
        let before = wallet.clone();

        if shares > wallet.shares + SHARES_EPSILON {
            return Err(LedgerError::InsufficientShares {
                wallet_id,
                requested: shares_from_db(shares),
                available: wallet.shares_f64(),
            });
        }

        let remaining = wallet.shares - shares;
        if remaining <= SHARES_EPSILON {
            self.wallets.remove(&key);
        } else {
            wallet.set_shares(remaining);
        }
        Ok(before)
    }

    /// Close wallets that reached zero and reject any left negative.
    /// Returns the ids of closed wallets.
    pub fn settle(&mut self) -> Result<Vec<i64>> {
        let negative: Vec<String> = self
            .wallets
            .values()
            .filter(|w| w.shares < -SHARES_EPSILON)
            .map(|w| {
                format!(
                    "wallet {} (price {}, target {:?}) would hold {:.5} shares",
                    w.id,
                    w.purchase_price(),
                    w.profit_target_id,
                    w.shares_f64()
                )
            })
            .collect();
        if !negative.is_empty() {
            return Err(LedgerError::validation(format!(
                "shares from this transaction were already sold: {}",
                negative.join("; ")
            )));
        }

        let closed: Vec<WalletKey> = self
            .wallets
            .iter()
            .filter(|(_, w)| w.shares <= SHARES_EPSILON)
            .map(|(k, _)| *k)
            .collect();
        let mut ids = Vec::with_capacity(closed.len());
        for key in closed {
            if let Some(w) = self.wallets.remove(&key) {
                ids.push(w.id);
            }
        }
        Ok(ids)
    }

    /// Re-derive every wallet's profit target price (after a target or
    /// commission change).
    pub fn reprice(&mut self, target_price: impl Fn(&WalletKey) -> f64) {
        for (key, wallet) in self.wallets.iter_mut() {
            wallet.profit_target_price = target_price(key);
        }
    }

    /// Apply a stock split to one asset's wallets: shares × ratio, price ÷
    /// ratio. Lots that land on the same new key merge.
    pub fn apply_split(
        &mut self,
        asset_id: i64,
        ratio: f64,
        target_price: impl Fn(&WalletKey) -> f64,
    ) {
        let keys: Vec<WalletKey> = self
            .wallets
            .keys()
            .filter(|k| k.asset_id == asset_id)
            .copied()
            .collect();
        for key in keys {
            let old = match self.wallets.remove(&key) {
                Some(w) => w,
                None => continue,
            };
            let new_key = WalletKey::new(
                key.asset_id,
                key.purchase_price() / ratio,
                key.profit_target_id,
            );
            let new_shares = (old.shares as f64 * ratio).round() as i64;
            let price = target_price(&new_key);
            match self.wallets.get_mut(&new_key) {
                Some(existing) => {
                    existing.set_shares(existing.shares + new_shares);
                    existing.profit_target_price = price;
                }
                None => {
                    let mut wallet = Wallet::open(old.id, new_key, price);
                    wallet.set_shares(new_shares);
                    self.wallets.insert(new_key, wallet);
                }
            }
        }
    }

    pub fn total_shares(&self) -> f64 {
        self.wallets.values().map(|w| w.shares_f64()).sum()
    }

    pub fn total_investment(&self) -> f64 {
        self.wallets.values().map(|w| w.investment).sum()
    }

    /// The open wallet with the lowest profit target price.
    pub fn lowest_profit_target(&self) -> Option<&Wallet> {
        self.wallets
            .values()
            .min_by(|a, b| a.profit_target_price.total_cmp(&b.profit_target_price))
    }

    /// Internal invariants: no negative wallets, investment matches shares.
    pub fn check_invariants(&self) -> Result<()> {
        for w in self.wallets.values() {
            if w.shares < 0 {
                return Err(LedgerError::consistency(format!(
                    "wallet {} holds negative shares {}",
                    w.id,
                    w.shares_f64()
                )));
            }
            if !w.is_consistent() {
                return Err(LedgerError::consistency(format!(
                    "wallet {} investment {} does not match {} shares at {}",
                    w.id,
                    w.investment,
                    w.shares_f64(),
                    w.purchase_price()
                )));
            }
        }
        Ok(())
    }

    /// Differences between two books, compared by key (ids are ignored).
    pub fn diff(&self, other: &WalletBook) -> Vec<String> {
        let mut out = Vec::new();
        for (key, w) in &self.wallets {
            match other.wallets.get(key) {
                None => out.push(format!(
                    "wallet {} (price {}, target {:?}) missing from replay",
                    w.id,
                    key.purchase_price(),
                    key.profit_target_id
                )),
                Some(o) => {
                    if (w.shares - o.shares).abs() > SHARES_EPSILON {
                        out.push(format!(
                            "wallet {} shares {:.8} vs replay {:.8}",
                            w.id,
                            w.shares_f64(),
                            o.shares_f64()
                        ));
                    }
                    if (w.investment - o.investment).abs() > AMOUNT_TOLERANCE {
                        out.push(format!(
                            "wallet {} investment {:.6} vs replay {:.6}",
                            w.id, w.investment, o.investment
                        ));
                    }
                    if (w.profit_target_price - o.profit_target_price).abs() > AMOUNT_TOLERANCE {
                        out.push(format!(
                            "wallet {} target price {:.6} vs replay {:.6}",
                            w.id, w.profit_target_price, o.profit_target_price
                        ));
                    }
                }
            }
        }
        for (key, o) in &other.wallets {
            if !self.wallets.contains_key(key) {
                out.push(format!(
                    "replay has wallet at price {} target {:?} ({:.8} shares) not in store",
                    key.purchase_price(),
                    key.profit_target_id,
                    o.shares_f64()
                ));
            }
        }
        out
    }
}
