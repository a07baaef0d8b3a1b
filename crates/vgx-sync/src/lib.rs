//! vgx-sync — multi-step replication protocols.
//!
//! Two sides:
//!
//! - **node side**: [`SubscriberReconciler`] runs on a provider and moves
//!   its attached subscriber set to a goal, syncing new destinations
//!   first and restoring the original set on failure. The local engine
//!   is reached through the [`LocalEngine`] trait, peers over HTTP.
//! - **operator side**: [`force_copy`], [`rolling_forward_sync`] and
//!   [`reverse_sync`] drive several nodes through
//!   [`vgx_instance::InstanceHandle`]s.
//!
//! State-altering steps are undone best effort through [`compensate`];
//! a state that cannot be proven is reported as
//! [`vgx_core::AdminError::Incomplete`].

pub mod compensate;
pub mod forcecopy;
pub mod reconcile;
pub mod rolling;

pub use compensate::compensate;
pub use forcecopy::force_copy;
pub use reconcile::{GoalPlan, LocalEngine, PlannedSubscriber, SubscriberReconciler};
pub use rolling::{reverse_sync, rolling_forward_sync};
