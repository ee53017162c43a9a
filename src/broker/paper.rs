// =============================================================================
// Paper Broker — in-memory simulated brokerage
// =============================================================================
//
// Default order route (`paper_mode = true`) and the test double for the
// execution path. Fills are synchronous: a LIMIT order fills at its limit
// price, a MARKET order at the last mark set for the symbol.
//
// Positions are kept internally as *signed* quantities — the same convention
// many real brokers use — so `positions()` exercises the normalization rule
// the adapter surface requires (explicit side, positive qty).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::broker::{Broker, OrderRequest};
use crate::error::BrokerError;
use crate::types::{
    format_ts, Account, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide,
};

struct BookEntry {
    /// Signed quantity: positive long, negative short.
    qty: f64,
    avg_price: f64,
    opened_at: String,
}

struct PaperState {
    cash: f64,
    realized_pnl: f64,
    starting_equity: f64,
    peak_equity: f64,
    blocked: bool,
    /// Optional buying-power override (test hook / funding simulation).
    buying_power_override: Option<f64>,
    book: HashMap<String, BookEntry>,
    orders: HashMap<String, Order>,
    marks: HashMap<String, f64>,
    /// Errors to fail the next submits with (test hook).
    fail_submits: VecDeque<BrokerError>,
    /// Errors to fail the next bracket-leg placements with (test hook).
    fail_legs: VecDeque<BrokerError>,
    order_seq: u64,
    /// client_order_id values already seen (broker-side idempotency).
    seen_client_ids: HashMap<String, String>,
}

/// In-memory simulated broker.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(starting_equity: f64) -> Self {
        info!(starting_equity, "paper broker initialized");
        Self {
            state: Mutex::new(PaperState {
                cash: starting_equity,
                realized_pnl: 0.0,
                starting_equity,
                peak_equity: starting_equity,
                blocked: false,
                buying_power_override: None,
                book: HashMap::new(),
                orders: HashMap::new(),
                marks: HashMap::new(),
                fail_submits: VecDeque::new(),
                fail_legs: VecDeque::new(),
                order_seq: 0,
                seen_client_ids: HashMap::new(),
            }),
        }
    }

    /// Set the mark price used to fill MARKET orders for `symbol`.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Override reported buying power (simulates deposits/withdrawals).
    pub fn set_buying_power(&self, bp: Option<f64>) {
        self.state.lock().buying_power_override = bp;
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().blocked = blocked;
    }

    /// Queue an error for the next `submit_order` call (test hook).
    pub fn fail_next_submit(&self, err: BrokerError) {
        self.state.lock().fail_submits.push_back(err);
    }

    /// Queue an error for the next stop/target placement (test hook).
    pub fn fail_next_leg(&self, err: BrokerError) {
        self.state.lock().fail_legs.push_back(err);
    }

    pub fn realized_pnl(&self) -> f64 {
        self.state.lock().realized_pnl
    }

    /// Orders submitted so far (mains and bracket legs).
    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    fn next_order_id(state: &mut PaperState) -> String {
        state.order_seq += 1;
        format!("paper-{}", state.order_seq)
    }

    /// Apply a fill to the signed book and cash, returning realized P&L for
    /// any quantity that reduced an opposing position.
    fn apply_fill(state: &mut PaperState, symbol: &str, side: OrderSide, qty: f64, price: f64) -> f64 {
        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };

        let entry = state.book.entry(symbol.to_string()).or_insert(BookEntry {
            qty: 0.0,
            avg_price: price,
            opened_at: format_ts(Utc::now()),
        });

        let mut realized = 0.0;
        if entry.qty == 0.0 || entry.qty.signum() == signed.signum() {
            // Opening or increasing: update the weighted average entry.
            let total = entry.qty + signed;
            if total != 0.0 {
                entry.avg_price = (entry.avg_price * entry.qty.abs() + price * qty) / total.abs();
            }
            if entry.qty == 0.0 {
                entry.opened_at = format_ts(Utc::now());
            }
            entry.qty = total;
        } else {
            // Reducing, closing, or crossing through zero.
            let closing = qty.min(entry.qty.abs());
            let direction = entry.qty.signum();
            realized = (price - entry.avg_price) * closing * direction;
            entry.qty += signed;
            if entry.qty.signum() == signed.signum() && entry.qty != 0.0 {
                // Crossed through zero: remainder opens at the fill price.
                entry.avg_price = price;
                entry.opened_at = format_ts(Utc::now());
            }
        }

        state.cash -= signed * price;
        state.realized_pnl += realized;
        if entry.qty == 0.0 {
            state.book.remove(symbol);
        }
        realized
    }

    fn equity(state: &PaperState) -> f64 {
        let marked: f64 = state
            .book
            .iter()
            .map(|(symbol, e)| {
                let mark = state.marks.get(symbol).copied().unwrap_or(e.avg_price);
                e.qty * mark
            })
            .sum();
        state.cash + marked
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn account(&self) -> Result<Account, BrokerError> {
        let mut state = self.state.lock();
        let equity = Self::equity(&state);
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        let day_pnl_pct = if state.starting_equity > 0.0 {
            (equity - state.starting_equity) / state.starting_equity
        } else {
            0.0
        };
        Ok(Account {
            equity,
            buying_power: state.buying_power_override.unwrap_or(state.cash.max(0.0)),
            day_pnl_pct,
            peak_equity: state.peak_equity,
            blocked: state.blocked,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let state = self.state.lock();
        let mut out: Vec<Position> = state
            .book
            .iter()
            .filter(|(_, e)| e.qty != 0.0)
            .map(|(symbol, e)| Position {
                symbol: symbol.clone(),
                side: if e.qty > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                qty: e.qty.abs(),
                entry_price: e.avg_price,
                opened_at: e.opened_at.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn submit_order(&self, req: &OrderRequest) -> Result<String, BrokerError> {
        let mut state = self.state.lock();

        if let Some(err) = state.fail_submits.pop_front() {
            return Err(err);
        }
        if state.blocked {
            return Err(BrokerError::Rejected("account blocked".into()));
        }

        // Broker-side idempotency on client order id.
        if let Some(cid) = &req.client_order_id {
            if let Some(existing) = state.seen_client_ids.get(cid) {
                debug!(client_order_id = %cid, order_id = %existing, "duplicate client order id; returning existing order");
                return Ok(existing.clone());
            }
        }

        let fill_price = match req.order_type {
            OrderType::Limit => req.limit_price.ok_or_else(|| {
                BrokerError::Rejected("limit order without a limit price".into())
            })?,
            OrderType::Market => state
                .marks
                .get(&req.symbol)
                .copied()
                .or(req.limit_price)
                .ok_or_else(|| BrokerError::Rejected("no mark price for market order".into()))?,
        };

        let order_id = Self::next_order_id(&mut state);
        Self::apply_fill(&mut state, &req.symbol, req.side, req.qty, fill_price);

        state.orders.insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                order_type: req.order_type,
                limit_price: req.limit_price,
                status: OrderStatus::Filled,
                filled_qty: req.qty,
                filled_avg_price: Some(fill_price),
            },
        );
        if let Some(cid) = &req.client_order_id {
            state.seen_client_ids.insert(cid.clone(), order_id.clone());
        }

        debug!(order_id = %order_id, symbol = %req.symbol, side = %req.side, qty = req.qty, fill_price, "paper order filled");
        Ok(order_id)
    }

    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_legs.pop_front() {
            return Err(err);
        }
        let order_id = Self::next_order_id(&mut state);
        state.orders.insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                symbol: symbol.into(),
                side,
                qty,
                order_type: OrderType::Market,
                limit_price: Some(stop_price),
                status: OrderStatus::Accepted,
                filled_qty: 0.0,
                filled_avg_price: None,
            },
        );
        Ok(order_id)
    }

    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_legs.pop_front() {
            return Err(err);
        }
        let order_id = Self::next_order_id(&mut state);
        state.orders.insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                symbol: symbol.into(),
                side,
                qty,
                order_type: OrderType::Limit,
                limit_price: Some(limit_price),
                status: OrderStatus::Accepted,
                filled_qty: 0.0,
                filled_avg_price: None,
            },
        );
        Ok(order_id)
    }

    async fn order(&self, order_id: &str) -> Result<Order, BrokerError> {
        self.state
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.into()))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownOrder(order_id.into())),
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PaperBroker")
            .field("cash", &state.cash)
            .field("positions", &state.book.len())
            .field("orders", &state.orders.len())
            .finish()
    }
}
