//! Service layer
//!
//! Operator-facing business logic over the data layer.

mod admin;

pub use admin::{
    AdminDeliveryOps, DeliveryDetail, DeliveryFilter, DeliveryListItem, DeliveryListPage,
    RetryAllOutcome, SenderIdentity,
};
