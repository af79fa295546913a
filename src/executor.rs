//! Order Executor
//!
//! Turns approved orders into fills. In dry-run mode orders are filled in
//! simulation at the reference price and never reach the gateway. Otherwise
//! the order is submitted under a timeout and its outcome classified:
//! - filled -> `Fill`
//! - declined by the venue -> `EngineError::OrderRejected`
//! - timeout, transport failure or still pending -> `EngineError::AmbiguousFill`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::error::{EngineError, GatewayError};
use crate::gateway::{with_timeout, ExchangeGateway, OrderAck, OrderRequest, OrderState};
use crate::risk::{ApprovedOrder, Fill};

pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    dry_run: bool,
    order_timeout: Duration,
    request_timeout: Duration,
    status_polls: u32,
    poll_interval: Duration,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: &ExchangeConfig) -> Self {
        Self {
            gateway,
            dry_run: config.dry_run,
            order_timeout: Duration::from_secs(config.order_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            status_polls: config.order_status_polls,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn execute(&self, order: &ApprovedOrder, now: DateTime<Utc>) -> Result<Fill, EngineError> {
        if self.dry_run {
            debug!(
                symbol = %order.symbol,
                side = %order.side,
                quantity = order.quantity,
                price = order.reference_price,
                "Dry-run fill"
            );
            return Ok(Fill {
                client_order_id: order.client_order_id.clone(),
                order_id: format!("dry-{}", order.client_order_id),
                symbol: order.symbol.clone(),
                quantity: order.quantity,
                price: order.reference_price,
                filled_at: now,
            });
        }

        let request = OrderRequest {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            stop_price: order.stop_price,
            reduce_only: order.is_close(),
        };

        let ack = match with_timeout(self.order_timeout, self.gateway.submit_order(&request)).await {
            Ok(ack) => ack,
            Err(GatewayError::Rejected(reason)) => {
                return Err(self.rejected(order, &order.client_order_id, reason));
            }
            Err(GatewayError::UnknownSymbol(symbol)) => {
                return Err(self.rejected(order, &order.client_order_id, format!("unknown symbol {}", symbol)));
            }
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "Order submission outcome unknown");
                return Err(EngineError::AmbiguousFill {
                    order_id: order.client_order_id.clone(),
                    symbol: order.symbol.clone(),
                });
            }
        };

        self.resolve(order, ack).await
    }

    /// Follow a venue ack to a terminal state, polling a bounded number of times
    async fn resolve(&self, order: &ApprovedOrder, mut ack: OrderAck) -> Result<Fill, EngineError> {
        let mut polls = 0;
        loop {
            match ack.state {
                OrderState::Filled { quantity, avg_price } => {
                    info!(
                        symbol = %order.symbol,
                        side = %order.side,
                        order_id = %ack.order_id,
                        quantity,
                        price = avg_price,
                        "Order filled"
                    );
                    return Ok(Fill {
                        client_order_id: order.client_order_id.clone(),
                        order_id: ack.order_id,
                        symbol: order.symbol.clone(),
                        quantity,
                        price: avg_price,
                        filled_at: ack.timestamp,
                    });
                }
                OrderState::Rejected { reason } => {
                    return Err(self.rejected(order, &ack.order_id, reason));
                }
                OrderState::Pending if polls >= self.status_polls => {
                    warn!(
                        symbol = %order.symbol,
                        order_id = %ack.order_id,
                        polls,
                        "Order still pending, outcome unknown"
                    );
                    return Err(EngineError::AmbiguousFill {
                        order_id: ack.order_id,
                        symbol: order.symbol.clone(),
                    });
                }
                OrderState::Pending => {
                    polls += 1;
                    tokio::time::sleep(self.poll_interval).await;
                    let status = with_timeout(
                        self.request_timeout,
                        self.gateway.order_status(&order.symbol, &ack.order_id),
                    )
                    .await;
                    match status {
                        Ok(next) => ack = next,
                        Err(e) => {
                            debug!(order_id = %ack.order_id, error = %e, "Order status query failed");
                        }
                    }
                }
            }
        }
    }

    fn rejected(&self, order: &ApprovedOrder, order_id: &str, reason: String) -> EngineError {
        warn!(symbol = %order.symbol, side = %order.side, reason = %reason, "Order rejected");
        EngineError::OrderRejected {
            order_id: order_id.to_string(),
            symbol: order.symbol.clone(),
            reason,
        }
    }
}
