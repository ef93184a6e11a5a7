//! # Payments
//!
//! The billing provider is chosen by `payments.provider`:
//!
//! | Provider | Accounts | Chore |
//! |----------|----------|-------|
//! | `mock` | [`mock::accounts`] | none |
//! | `coinpayments` | [`coinpayments::Service`] | [`coinpayments::Chore`] |

pub mod coinpayments;
pub mod mock;

use async_trait::async_trait;
use shared_types::StorageError;

use crate::container::config::PaymentsConfig;

const BYTES_PER_TB: i128 = 1_000_000_000_000;

/// What a project owes for the storage it holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectCharge {
    pub storage_bytes: i64,
    pub storage_cents: i64,
}

/// Unit prices, in cents per TB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub storage_tb_cents: i64,
    pub egress_tb_cents: i64,
}

impl Pricing {
    pub fn from_config(config: &PaymentsConfig) -> Self {
        Self {
            storage_tb_cents: config.storage_tb_price_cents,
            egress_tb_cents: config.egress_tb_price_cents,
        }
    }

    /// Storage charge in cents, rounded down.
    #[must_use]
    pub fn storage_charge(&self, bytes: i64) -> i64 {
        let cents = i128::from(bytes) * i128::from(self.storage_tb_cents) / BYTES_PER_TB;
        i64::try_from(cents).unwrap_or(i64::MAX)
    }
}

/// Customer-facing account operations of a billing provider.
#[async_trait]
pub trait Accounts: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, StorageError>;

    async fn project_charges(&self, project_id: &str) -> Result<ProjectCharge, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_charge() {
        let pricing = Pricing::from_config(&PaymentsConfig::default());
        assert_eq!(pricing.storage_charge(1_000_000_000_000), 1000);
        assert_eq!(pricing.storage_charge(500_000_000_000), 500);
        assert_eq!(pricing.storage_charge(1), 0);
    }
}
