//! Queued mutation records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Default retry ceiling for a newly queued action.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The closed set of mutations the admin client can queue while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
  OrderStatusUpdate,
  OrderCreate,
  ProductCreate,
  ProductUpdate,
  ProductDelete,
  InquiryUpdate,
  InquiryRespond,
  PartnerUpdate,
  CommissionApprove,
  CommissionPay,
}

impl ActionType {
  pub const ALL: [ActionType; 10] = [
    ActionType::OrderStatusUpdate,
    ActionType::OrderCreate,
    ActionType::ProductCreate,
    ActionType::ProductUpdate,
    ActionType::ProductDelete,
    ActionType::InquiryUpdate,
    ActionType::InquiryRespond,
    ActionType::PartnerUpdate,
    ActionType::CommissionApprove,
    ActionType::CommissionPay,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::OrderStatusUpdate => "order_status_update",
      Self::OrderCreate => "order_create",
      Self::ProductCreate => "product_create",
      Self::ProductUpdate => "product_update",
      Self::ProductDelete => "product_delete",
      Self::InquiryUpdate => "inquiry_update",
      Self::InquiryRespond => "inquiry_respond",
      Self::PartnerUpdate => "partner_update",
      Self::CommissionApprove => "commission_approve",
      Self::CommissionPay => "commission_pay",
    }
  }
}

impl fmt::Display for ActionType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace('-', "_");
    Self::ALL
      .iter()
      .copied()
      .find(|t| t.as_str() == normalized)
      .ok_or_else(|| format!("unknown action type '{}'", s))
  }
}

/// A mutation waiting for network delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
  pub id: i64,
  #[serde(rename = "type")]
  pub action_type: ActionType,
  /// Opaque serialized body. Never inspected by the engine.
  pub payload: Vec<u8>,
  pub timestamp: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  /// Reason for the most recent failed attempt
  pub last_error: Option<String>,
}

impl PendingAction {
  /// Stable key the backend can use to discard duplicate deliveries.
  pub fn idempotency_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.id.to_be_bytes());
    hasher.update(self.action_type.as_str().as_bytes());
    hasher.update(self.timestamp.timestamp_millis().to_be_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.timestamp
  }

  pub fn retries_left(&self) -> u32 {
    self.max_retries.saturating_sub(self.retry_count)
  }
}

/// An action that exhausted its retry budget and awaits manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAction {
  pub action: PendingAction,
  pub failed_at: DateTime<Utc>,
}

impl FailedAction {
  pub fn id(&self) -> i64 {
    self.action.id
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn action(id: i64) -> PendingAction {
    PendingAction {
      id,
      action_type: ActionType::OrderStatusUpdate,
      payload: b"{}".to_vec(),
      timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
      retry_count: 0,
      max_retries: DEFAULT_MAX_RETRIES,
      last_error: None,
    }
  }

  #[test]
  fn test_action_type_parse() {
    assert_eq!(
      "order-status-update".parse::<ActionType>().unwrap(),
      ActionType::OrderStatusUpdate
    );
    assert_eq!(
      "Commission_Pay".parse::<ActionType>().unwrap(),
      ActionType::CommissionPay
    );
    assert!("order_cancel".parse::<ActionType>().is_err());
  }

  #[test]
  fn test_action_type_serializes_snake_case() {
    let json = serde_json::to_string(&ActionType::InquiryRespond).unwrap();
    assert_eq!(json, "\"inquiry_respond\"");
  }

  #[test]
  fn test_idempotency_key_depends_on_id() {
    let a = action(1);
    let b = action(2);
    assert_eq!(a.idempotency_key(), action(1).idempotency_key());
    assert_ne!(a.idempotency_key(), b.idempotency_key());
    assert_eq!(a.idempotency_key().len(), 64);
  }

  #[test]
  fn test_retries_left() {
    let mut a = action(1);
    a.retry_count = 2;
    assert_eq!(a.retries_left(), 1);
    a.retry_count = 5;
    assert_eq!(a.retries_left(), 0);
  }
}
