// 8.7: pending order scan. runs inside the tick, hands executions to the dispatcher

use super::core::TradingEngine;
use crate::cache::OrderPartition;
use crate::order::Order;
use crate::quotes::InstrumentBidAskPair;
use crate::services::BoxedTask;
use std::sync::Arc;
use tracing::{debug, error};

impl TradingEngine {
    /// The quote triggers the order and there is enough at the top of book,
    /// or the engine that would fill it offers a triggering price too.
    pub(super) fn is_ready_to_execute(&self, order: &Order, quote: &InstrumentBidAskPair) -> bool {
        let direction = order.direction();
        if !order.is_suitable_price(quote.price_for(direction)) {
            return false;
        }
        if quote.has_depth_for(direction, order.remaining_volume()) {
            return true;
        }
        let signed = direction.sign() * order.remaining_volume();
        self.router
            .for_order(order)
            .get_best_price_for_open(&order.asset_pair_id, signed)
            .map_or(false, |price| order.is_suitable_price(price))
    }

    /// Triggered orders leave their partition before dispatch, so a later
    /// tick cannot pick them up a second time. Closes go first, then oldest.
    pub(super) fn process_pending_orders(self: &Arc<Self>, quote: &InstrumentBidAskPair) {
        let mut triggered: Vec<(OrderPartition, Order)> = [OrderPartition::Active, OrderPartition::InProgress]
            .into_iter()
            .flat_map(|partition| {
                self.cache
                    .partition(partition)
                    .get_by_instrument(&quote.instrument)
                    .into_iter()
                    .map(move |order| (partition, order))
            })
            .filter(|(_, order)| self.is_ready_to_execute(order, quote))
            .collect();

        triggered.sort_by(|(_, a), (_, b)| {
            a.positions_to_be_closed
                .is_empty()
                .cmp(&b.positions_to_be_closed.is_empty())
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id))
        });

        for (partition, order) in triggered {
            let Some(order) = self.cache.partition(partition).try_remove(&order.id) else {
                continue;
            };
            debug!(order_id = %order.id, ?partition, "pending order triggered");

            let engine = Arc::clone(self);
            let task: BoxedTask = Box::pin(async move {
                let order_id = order.id.clone();
                if let Err(e) = engine.execute_pending_order(order).await {
                    error!(order_id = %order_id, error = %e, "pending order execution failed");
                }
            });
            self.dispatcher.dispatch("execute_pending_order", task);
        }
    }
}
