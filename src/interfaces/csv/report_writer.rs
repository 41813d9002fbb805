use crate::domain::money::Currency;
use crate::domain::transaction::{PaymentMethod, PaymentStatus, PaymentTransaction};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    order: &'a str,
    method: PaymentMethod,
    status: PaymentStatus,
    amount: Decimal,
    refunded: Decimal,
    currency: Currency,
}

impl<'a> From<&'a PaymentTransaction> for ReportRow<'a> {
    fn from(tx: &'a PaymentTransaction) -> Self {
        Self {
            order: &tx.order_reference,
            method: tx.method,
            status: tx.status,
            amount: tx.amount.value().normalize(),
            refunded: tx.refunded_amount.normalize(),
            currency: tx.currency,
        }
    }
}

/// Writes the final state of payment transactions as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(sink),
        }
    }

    /// One row per attempt: `order,method,status,amount,refunded,currency`.
    /// The header is written even when there are no rows.
    pub fn write_transactions(&mut self, transactions: &[PaymentTransaction]) -> Result<()> {
        self.writer.write_record([
            "order", "method", "status", "amount", "refunded", "currency",
        ])?;
        for tx in transactions {
            self.writer.serialize(ReportRow::from(tx))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
