//! Stock restoration for orders whose payment failed or was cancelled.
//!
//! Restoration is per item and best-effort: one item failing never stops the
//! others or the status update that triggered it. With retries configured,
//! failed items are handed to a background worker over an mpsc channel.

use crate::config::CompensationConfig;
use crate::domain::order::{Order, OrderItem};
use crate::domain::ports::CatalogCollaboratorRef;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreResult {
    Restored,
    /// The catalog answered but did not apply the increment.
    Rejected,
    Errored(String),
    /// Failed now, handed to the retry worker.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRestore {
    pub item_id: String,
    pub quantity: u32,
    pub result: RestoreResult,
}

/// What happened to every item of one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationReport {
    pub order_id: String,
    pub items: Vec<ItemRestore>,
}

impl CompensationReport {
    pub fn failures(&self) -> impl Iterator<Item = &ItemRestore> {
        self.items
            .iter()
            .filter(|item| item.result != RestoreResult::Restored)
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[derive(Debug)]
struct RetryJob {
    order_id: String,
    item: OrderItem,
}

struct RetryQueue {
    sender: mpsc::UnboundedSender<RetryJob>,
    worker: JoinHandle<()>,
}

pub struct CompensationDispatcher {
    catalog: CatalogCollaboratorRef,
    retries: Mutex<Option<RetryQueue>>,
}

impl CompensationDispatcher {
    /// Best-effort only: failures are logged and left for manual follow-up.
    pub fn new(catalog: CatalogCollaboratorRef) -> Self {
        Self {
            catalog,
            retries: Mutex::new(None),
        }
    }

    /// Spawns the retry worker when `retry_attempts > 0`. Must be called
    /// inside a tokio runtime.
    pub fn with_config(catalog: CatalogCollaboratorRef, config: &CompensationConfig) -> Self {
        if config.retry_attempts == 0 {
            return Self::new(catalog);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(retry_worker(
            catalog.clone(),
            receiver,
            config.retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
        ));
        Self {
            catalog,
            retries: Mutex::new(Some(RetryQueue { sender, worker })),
        }
    }

    pub async fn restore_stock(&self, order: &Order) -> CompensationReport {
        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let result = match self
                .catalog
                .increment_stock(&item.item_id, item.quantity)
                .await
            {
                Ok(true) => RestoreResult::Restored,
                Ok(false) => RestoreResult::Rejected,
                Err(e) => RestoreResult::Errored(e.to_string()),
            };
            let result = if result == RestoreResult::Restored {
                result
            } else {
                warn!(
                    order_id = %order.id,
                    item_id = %item.item_id,
                    quantity = item.quantity,
                    ?result,
                    "stock restoration failed"
                );
                self.enqueue(&order.id, item).await.unwrap_or(result)
            };
            items.push(ItemRestore {
                item_id: item.item_id.clone(),
                quantity: item.quantity,
                result,
            });
        }

        let report = CompensationReport {
            order_id: order.id.clone(),
            items,
        };
        info!(
            order_id = %report.order_id,
            items = report.items.len(),
            failed = report.failures().count(),
            "stock restoration finished"
        );
        report
    }

    async fn enqueue(&self, order_id: &str, item: &OrderItem) -> Option<RestoreResult> {
        let retries = self.retries.lock().await;
        let queue = retries.as_ref()?;
        queue
            .sender
            .send(RetryJob {
                order_id: order_id.to_string(),
                item: item.clone(),
            })
            .ok()
            .map(|_| RestoreResult::Queued)
    }

    /// Closes the retry queue and waits for queued items to be worked off.
    pub async fn shutdown(&self) {
        let queue = self.retries.lock().await.take();
        if let Some(RetryQueue { sender, worker }) = queue {
            drop(sender);
            if let Err(e) = worker.await {
                error!(error = %e, "compensation retry worker panicked");
            }
        }
    }
}

async fn retry_worker(
    catalog: CatalogCollaboratorRef,
    mut receiver: mpsc::UnboundedReceiver<RetryJob>,
    attempts: u32,
    backoff: Duration,
) {
    while let Some(job) = receiver.recv().await {
        let mut restored = false;
        for attempt in 1..=attempts {
            tokio::time::sleep(backoff).await;
            match catalog
                .increment_stock(&job.item.item_id, job.item.quantity)
                .await
            {
                Ok(true) => {
                    info!(order_id = %job.order_id, item_id = %job.item.item_id, attempt, "stock restored on retry");
                    restored = true;
                    break;
                }
                Ok(false) => warn!(item_id = %job.item.item_id, attempt, "stock retry rejected"),
                Err(e) => warn!(item_id = %job.item.item_id, attempt, error = %e, "stock retry failed"),
            }
        }
        if !restored {
            error!(
                order_id = %job.order_id,
                item_id = %job.item.item_id,
                quantity = job.item.quantity,
                "stock restoration abandoned; manual follow-up required"
            );
        }
    }
}
