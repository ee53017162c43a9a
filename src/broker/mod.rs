// =============================================================================
// Broker interface — normalized account, position, and order operations
// =============================================================================
//
// The engine depends only on this trait. Adapters normalize their native
// representations on their side of the boundary: position side is explicit
// LONG/SHORT with positive quantity, rejection reasons map onto the
// BrokerError taxonomy.
//
// `CachedBroker` wraps any adapter with the read caches the pipeline
// expects: account snapshots for 30 s, positions for 10 s (defaults), both
// invalidated immediately after any successful order submission.
// =============================================================================

pub mod http;
pub mod paper;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::BrokerError;
use crate::types::{Account, Order, OrderSide, OrderType, Position};

pub use http::RestBroker;
pub use paper::PaperBroker;

// ---------------------------------------------------------------------------
// Order request
// ---------------------------------------------------------------------------

/// A new order as the engine submits it.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    /// Engine-side idempotency key (the signal id for entries).
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, side: OrderSide, qty: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            client_order_id: None,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            client_order_id: None,
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Broker: Send + Sync {
    async fn account(&self) -> Result<Account, BrokerError>;

    /// All open positions, normalized to explicit side + positive qty.
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        Ok(self
            .positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    /// Submit an order; returns the broker's order id.
    async fn submit_order(&self, req: &OrderRequest) -> Result<String, BrokerError>;

    /// Protective stop leg. `side` is the closing side of the position.
    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError>;

    /// Take-profit leg. `side` is the closing side of the position.
    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError>;

    async fn order(&self, order_id: &str) -> Result<Order, BrokerError>;

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError>;
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

struct Cached<T> {
    at: Instant,
    value: T,
}

/// Read-through cache over any broker adapter.
pub struct CachedBroker {
    inner: Arc<dyn Broker>,
    account_ttl: Duration,
    positions_ttl: Duration,
    account_cache: Mutex<Option<Cached<Account>>>,
    positions_cache: Mutex<Option<Cached<Vec<Position>>>>,
}

impl CachedBroker {
    pub fn new(inner: Arc<dyn Broker>, account_ttl: Duration, positions_ttl: Duration) -> Self {
        Self {
            inner,
            account_ttl,
            positions_ttl,
            account_cache: Mutex::new(None),
            positions_cache: Mutex::new(None),
        }
    }

    /// Drop both caches. Called after every successful order mutation.
    pub fn invalidate(&self) {
        *self.account_cache.lock() = None;
        *self.positions_cache.lock() = None;
        debug!("broker caches invalidated");
    }
}

#[async_trait]
impl Broker for CachedBroker {
    async fn account(&self) -> Result<Account, BrokerError> {
        if let Some(cached) = &*self.account_cache.lock() {
            if cached.at.elapsed() <= self.account_ttl {
                return Ok(cached.value.clone());
            }
        }

        let fresh = self.inner.account().await?;
        *self.account_cache.lock() = Some(Cached {
            at: Instant::now(),
            value: fresh.clone(),
        });
        Ok(fresh)
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        if let Some(cached) = &*self.positions_cache.lock() {
            if cached.at.elapsed() <= self.positions_ttl {
                return Ok(cached.value.clone());
            }
        }

        let fresh = self.inner.positions().await?;
        *self.positions_cache.lock() = Some(Cached {
            at: Instant::now(),
            value: fresh.clone(),
        });
        Ok(fresh)
    }

    async fn submit_order(&self, req: &OrderRequest) -> Result<String, BrokerError> {
        let order_id = self.inner.submit_order(req).await?;
        self.invalidate();
        Ok(order_id)
    }

    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        self.inner.place_stop(symbol, side, stop_price, qty).await
    }

    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        self.inner.place_target(symbol, side, limit_price, qty).await
    }

    async fn order(&self, order_id: &str) -> Result<Order, BrokerError> {
        self.inner.order(order_id).await
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let result = self.inner.cancel(order_id).await;
        if result.is_ok() {
            self.invalidate();
        }
        result
    }
}

impl std::fmt::Debug for CachedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBroker")
            .field("account_ttl", &self.account_ttl)
            .field("positions_ttl", &self.positions_ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts underlying calls so cache behavior is observable.
    struct CountingBroker {
        account_calls: AtomicU32,
        positions_calls: AtomicU32,
    }

    impl CountingBroker {
        fn new() -> Self {
            Self {
                account_calls: AtomicU32::new(0),
                positions_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn account(&self) -> Result<Account, BrokerError> {
            self.account_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Account {
                equity: 100_000.0,
                buying_power: 50_000.0,
                day_pnl_pct: 0.0,
                peak_equity: 100_000.0,
                blocked: false,
            })
        }

        async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
            self.positions_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Position {
                symbol: "NVDA".into(),
                side: PositionSide::Long,
                qty: 10.0,
                entry_price: 450.0,
                opened_at: "2025-06-01T00:00:00.000Z".into(),
            }])
        }

        async fn submit_order(&self, _req: &OrderRequest) -> Result<String, BrokerError> {
            Ok("order-1".into())
        }

        async fn place_stop(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _stop_price: f64,
            _qty: f64,
        ) -> Result<String, BrokerError> {
            Ok("stop-1".into())
        }

        async fn place_target(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _limit_price: f64,
            _qty: f64,
        ) -> Result<String, BrokerError> {
            Ok("target-1".into())
        }

        async fn order(&self, order_id: &str) -> Result<Order, BrokerError> {
            Err(BrokerError::UnknownOrder(order_id.into()))
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn account_and_positions_are_cached() {
        let counting = Arc::new(CountingBroker::new());
        let cached = CachedBroker::new(
            counting.clone(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        for _ in 0..5 {
            cached.account().await.unwrap();
            cached.positions().await.unwrap();
        }
        assert_eq!(counting.account_calls.load(Ordering::SeqCst), 1);
        assert_eq!(counting.positions_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_invalidates_caches() {
        let counting = Arc::new(CountingBroker::new());
        let cached = CachedBroker::new(
            counting.clone(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        cached.account().await.unwrap();
        cached
            .submit_order(&OrderRequest::limit("NVDA", OrderSide::Buy, 1.0, 450.0))
            .await
            .unwrap();
        cached.account().await.unwrap();
        assert_eq!(counting.account_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ttl_expiry_refetches() {
        let counting = Arc::new(CountingBroker::new());
        let cached = CachedBroker::new(
            counting.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        cached.account().await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        cached.account().await.unwrap();
        assert_eq!(counting.account_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn position_lookup_uses_the_positions_cache() {
        let counting = Arc::new(CountingBroker::new());
        let cached = CachedBroker::new(
            counting.clone(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        let found = cached.position("NVDA").await.unwrap();
        assert!(found.is_some());
        let missing = cached.position("AAPL").await.unwrap();
        assert!(missing.is_none());
        assert_eq!(counting.positions_calls.load(Ordering::SeqCst), 1);
    }
}
