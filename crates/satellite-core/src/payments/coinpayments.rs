//! CoinPayments billing provider.
//!
//! Deposits arrive as pending transactions. The chore marks a transaction
//! completed once the received amount covers it, and a completed
//! transaction is credited to the user's balance exactly once.
//!
//! ```text
//!   Pending ──received >= amount──→ Completed ──credit balance──→ Applied
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{Billing, ProjectAccounting, StorageError, TransactionStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Accounts, Pricing, ProjectCharge};
use crate::chore::Cycle;
use crate::container::config::CoinPaymentsConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Service {
    billing: Arc<dyn Billing>,
    projects: Arc<dyn ProjectAccounting>,
    pricing: Pricing,
}

impl Service {
    pub fn new(
        config: &CoinPaymentsConfig,
        billing: Arc<dyn Billing>,
        projects: Arc<dyn ProjectAccounting>,
        pricing: Pricing,
    ) -> Result<Self, SubsystemError> {
        if config.public_key.is_empty() || config.private_key.is_empty() {
            return Err(SubsystemError::Config(
                "payments.coinpayments requires public_key and private_key".into(),
            ));
        }
        Ok(Self {
            billing,
            projects,
            pricing,
        })
    }

    /// Move fully funded pending transactions to completed.
    pub async fn update_transactions(&self) -> Result<usize, SubsystemError> {
        let mut completed = 0;
        for tx in self.billing.transactions_with_status(TransactionStatus::Pending).await? {
            if tx.received >= tx.amount {
                self.billing.update_status(tx.id, TransactionStatus::Completed).await?;
                completed += 1;
            }
        }
        if completed > 0 {
            info!(subsystem = "payments:chore", completed, "Transactions completed");
        }
        Ok(completed)
    }

    /// Credit completed transactions to their users' balances.
    pub async fn update_account_balances(&self) -> Result<usize, SubsystemError> {
        let mut applied = 0;
        for tx in self.billing.transactions_with_status(TransactionStatus::Completed).await? {
            // Status first: a failed credit is retried by hand, never applied twice.
            self.billing.update_status(tx.id, TransactionStatus::Applied).await?;
            self.billing.add_balance(&tx.user_id, tx.received).await?;
            debug!(subsystem = "payments:chore", user = %tx.user_id, amount = tx.received, "Balance credited");
            applied += 1;
        }
        Ok(applied)
    }
}

#[async_trait]
impl Accounts for Service {
    async fn balance(&self, user_id: &str) -> Result<i64, StorageError> {
        self.billing.balance(user_id).await
    }

    async fn project_charges(&self, project_id: &str) -> Result<ProjectCharge, StorageError> {
        let storage_bytes = self.projects.project_storage_total(project_id).await?;
        Ok(ProjectCharge {
            storage_bytes,
            storage_cents: self.pricing.storage_charge(storage_bytes),
        })
    }
}

/// Runs the transaction and balance updates on their own intervals.
pub struct Chore {
    service: Arc<Service>,
    transactions: Cycle,
    balances: Cycle,
    lifecycle: Lifecycle,
}

impl Chore {
    pub fn new(service: Arc<Service>, config: &CoinPaymentsConfig) -> Self {
        Self {
            service,
            transactions: Cycle::new(config.transaction_update_interval()),
            balances: Cycle::new(config.account_balance_update_interval()),
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl Subsystem for Chore {
    fn id(&self) -> SubsystemId {
        SubsystemId::PaymentsChore
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let service = &self.service;
        let transactions = self
            .transactions
            .run(&token, move || async move { service.update_transactions().await.map(drop) });
        let balances = self
            .balances
            .run(&token, move || async move { service.update_account_balances().await.map(drop) });
        tokio::try_join!(transactions, balances).map(drop)
    }

    fn close(&self) -> Result<(), SubsystemError> {
        self.lifecycle.stop();
        self.transactions.stop();
        self.balances.stop();
        Ok(())
    }

    fn state(&self) -> SubsystemState {
        self.lifecycle.state()
    }
}
