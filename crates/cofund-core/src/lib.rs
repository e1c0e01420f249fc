//! Settlement engine for co-funded servers.
//!
//! Backers pledge toward a resource's monthly cost and pay a fair share computed by
//! the [`allocator`]. Payment outcomes from the gateway are applied exactly once by
//! the [`reconciler`], boosts are capped platform-wide, repeated payment failures
//! suspend the payer, and owners are paid out monthly by the [`withdrawal`]
//! scheduler.

#![deny(unsafe_code)]

pub mod activity;
pub mod allocator;
pub mod boost;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod gateway;
pub mod pledge;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod withdrawal;

pub use activity::{format_minor, ActivityEntry, ActivityKind, ActivityQuery};
pub use allocator::{allocate, savings, Allocation, AllocationBranch};
pub use boost::BoostLedger;
pub use config::{EngineConfig, FeePolicy, FeeQuote, StorageConfig};
pub use engine::CofundEngine;
pub use error::{CofundError, ErrorClass};
pub use failure::FailureTracker;
pub use gateway::{
    GatewayClient, GatewayStatus, IntentMetadata, PaymentEvent, PaymentGateway, PaymentKind,
    PaymentOutcome, Payout, TransferReceipt,
};
pub use pledge::{build_pricing, PledgeLedger, PledgeReceipt};
pub use reconciler::{SettlementOutcome, SettlementReconciler};
pub use store::{bootstrap_store, MemoryStore, PostgresStore, StorageError, Store};
pub use types::{
    Boost, FailureStatus, PaymentFailureRecord, Pledge, PledgeStatus, PricingEntry, Resource,
    ResourcePricing, SweepReport, UserAccount, WithdrawalSchedule, WithdrawalStatus,
};
pub use withdrawal::{cycle_of, due_at, ProcessReport, ScheduleReport, WithdrawalScheduler};
