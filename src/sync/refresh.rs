//! Collections pulled by a full refresh and where each one comes from.

use serde_json::Value;

use crate::cache::{Collection, Record};

/// Where a refreshed collection comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  Table(&'static str),
  Rpc(&'static str),
}

/// Collections rebuilt by a full refresh, fetched in this order.
pub const REFRESH_PLAN: [(Collection, Source); 9] = [
  (Collection::Expenses, Source::Table("expenses")),
  (Collection::Groups, Source::Table("groups")),
  (Collection::Transactions, Source::Table("personal_transactions")),
  (Collection::Hotels, Source::Table("hotels")),
  (Collection::PaymentMethods, Source::Table("payment_methods")),
  (Collection::Notifications, Source::Table("notifications")),
  (Collection::Categories, Source::Table("categories")),
  (Collection::PersonalCategories, Source::Table("personal_categories")),
  (Collection::Balance, Source::Rpc("get_user_balance")),
];

/// Store an aggregate result as a collection: arrays as-is, a lone object
/// as a single record, null as nothing.
pub fn rpc_records(value: Value) -> Vec<Record> {
  match value {
    Value::Array(rows) => rows,
    Value::Null => Vec::new(),
    other => vec![other],
  }
}
