use crate::domain::money::Currency;
use crate::domain::transaction::PaymentMethod;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOp {
    /// Registers an order; `detail` lists its items as `sku:qty;sku:qty`.
    Order,
    Create,
    /// Records the provider-side outcome named in `detail`.
    Settle,
    /// Delivers a signed callback claiming the status in `detail`.
    Callback,
    /// Delivers the same callback without a signature.
    Forged,
    Verify,
    Refund,
    Reconcile,
}

/// One line of a replay script. Every op addresses an order by its number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptCommand {
    pub op: ScriptOp,
    pub reference: String,
    pub method: Option<PaymentMethod>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub detail: Option<String>,
}

impl ScriptCommand {
    pub fn amount(&self) -> Result<Decimal> {
        self.amount
            .ok_or_else(|| PaymentError::ValidationError(format!("{:?} needs an amount", self.op)))
    }

    pub fn detail(&self) -> Result<&str> {
        self.detail
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| PaymentError::ValidationError(format!("{:?} needs a detail", self.op)))
    }
}

/// Reads replay commands from a CSV source.
///
/// Header: `op,reference,method,amount,currency,detail`. Fields are trimmed
/// and trailing empty columns may be omitted.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands; a bad line yields an error and the
    /// stream carries on.
    pub fn commands(self) -> impl Iterator<Item = Result<ScriptCommand>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
