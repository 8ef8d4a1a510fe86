/// Queued mutation types
///
/// Each variant carries the strongly-typed payload the remote backend expects,
/// so a queue record can never hold a payload of the wrong shape for its kind.
/// Money is stored in integer cents and weight in grams.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use reclaim_core::{Error, Result};

/// Tag identifying the kind of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateTransaction,
    CreateMaterial,
    CreateExpense,
    CreateOrder,
}

impl OperationKind {
    /// All known operation kinds
    pub const ALL: [OperationKind; 4] = [
        OperationKind::CreateTransaction,
        OperationKind::CreateMaterial,
        OperationKind::CreateExpense,
        OperationKind::CreateOrder,
    ];

    /// Stable snake_case name, also used as the remote resource path
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateTransaction => "create_transaction",
            OperationKind::CreateMaterial => "create_material",
            OperationKind::CreateExpense => "create_expense",
            OperationKind::CreateOrder => "create_order",
        }
    }

    /// Parse a snake_case name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a weighed material transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Material bought from a customer
    Purchase,
    /// Material sold to a buyer
    Sale,
}

/// A weighed purchase or sale at the scale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub kind: TransactionKind,
    pub material_id: String,
    pub weight_grams: u64,
    /// Price per kilogram
    pub unit_price_cents: i64,
    pub total_cents: i64,
    pub customer: Option<String>,
    /// Local receipt sequence number printed for the customer
    pub receipt_number: Option<u64>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A new material in the price list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialPayload {
    pub name: String,
    pub category: String,
    pub buy_price_cents_per_kg: i64,
    pub sell_price_cents_per_kg: i64,
}

/// An operating expense
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpensePayload {
    pub description: String,
    pub category: String,
    pub amount_cents: i64,
    pub incurred_at: DateTime<Utc>,
}

/// One line of a customer order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub material_id: String,
    pub weight_grams: u64,
    pub unit_price_cents: i64,
}

/// A customer order for future delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub customer_name: String,
    pub lines: Vec<OrderLine>,
    pub total_cents: i64,
    pub due_date: Option<NaiveDate>,
}

/// A locally-originated mutation awaiting remote application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    CreateTransaction(TransactionPayload),
    CreateMaterial(MaterialPayload),
    CreateExpense(ExpensePayload),
    CreateOrder(OrderPayload),
}

impl Operation {
    /// Get the kind tag for this operation
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateTransaction(_) => OperationKind::CreateTransaction,
            Operation::CreateMaterial(_) => OperationKind::CreateMaterial,
            Operation::CreateExpense(_) => OperationKind::CreateExpense,
            Operation::CreateOrder(_) => OperationKind::CreateOrder,
        }
    }

    /// Serialize the payload alone, as sent to the remote backend
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            Operation::CreateTransaction(p) => serde_json::to_value(p)?,
            Operation::CreateMaterial(p) => serde_json::to_value(p)?,
            Operation::CreateExpense(p) => serde_json::to_value(p)?,
            Operation::CreateOrder(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Build an operation from a kind tag and a JSON payload
    pub fn from_parts(kind: OperationKind, payload: serde_json::Value) -> Result<Self> {
        let op = match kind {
            OperationKind::CreateTransaction => Operation::CreateTransaction(serde_json::from_value(payload)?),
            OperationKind::CreateMaterial => Operation::CreateMaterial(serde_json::from_value(payload)?),
            OperationKind::CreateExpense => Operation::CreateExpense(serde_json::from_value(payload)?),
            OperationKind::CreateOrder => Operation::CreateOrder(serde_json::from_value(payload)?),
        };
        Ok(op)
    }

    /// Reject payloads that the backend would refuse anyway
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::CreateTransaction(p) => {
                require_text("material_id", &p.material_id)?;
                if p.weight_grams == 0 {
                    return Err(invalid("weight_grams must be greater than 0"));
                }
                if p.unit_price_cents < 0 || p.total_cents < 0 {
                    return Err(invalid("transaction amounts must not be negative"));
                }
            }
            Operation::CreateMaterial(p) => {
                require_text("name", &p.name)?;
                require_text("category", &p.category)?;
                if p.buy_price_cents_per_kg < 0 || p.sell_price_cents_per_kg < 0 {
                    return Err(invalid("material prices must not be negative"));
                }
            }
            Operation::CreateExpense(p) => {
                require_text("description", &p.description)?;
                if p.amount_cents <= 0 {
                    return Err(invalid("amount_cents must be greater than 0"));
                }
            }
            Operation::CreateOrder(p) => {
                require_text("customer_name", &p.customer_name)?;
                if p.lines.is_empty() {
                    return Err(invalid("order must have at least one line"));
                }
                for line in &p.lines {
                    require_text("material_id", &line.material_id)?;
                    if line.weight_grams == 0 {
                        return Err(invalid("order line weight_grams must be greater than 0"));
                    }
                }
                if p.total_cents < 0 {
                    return Err(invalid("total_cents must not be negative"));
                }
            }
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(&format!("{} must not be empty", field)));
    }
    Ok(())
}

fn invalid(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}
