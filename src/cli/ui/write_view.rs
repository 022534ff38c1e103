use std::fmt::{self, Display, Formatter};

use crate::gatt::{WriteReceipt, WriteStrategy};

use super::painter::Painter;
use super::table::Table;

/// Summary of a completed reliable write.
pub(crate) struct WriteReceiptView<'a> {
    receipt: &'a WriteReceipt,
    strategy: WriteStrategy,
    painter: &'a Painter,
}

impl<'a> WriteReceiptView<'a> {
    pub(crate) fn new(receipt: &'a WriteReceipt, strategy: WriteStrategy, painter: &'a Painter) -> Self {
        Self {
            receipt,
            strategy,
            painter,
        }
    }

    fn counter(&self, count: u32) -> String {
        if count == 0 {
            self.painter.value(count.to_string())
        } else {
            self.painter.warning(count.to_string())
        }
    }
}

impl Display for WriteReceiptView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let table = Table::key_value(
            self.painter,
            vec![
                ("strategy", self.painter.value(self.strategy.to_string())),
                ("chunks", self.painter.value(self.receipt.chunks.to_string())),
                ("bytes", self.painter.value(self.receipt.bytes.to_string())),
                ("rewrites", self.counter(self.receipt.rewrites)),
                ("verify_reads", self.painter.value(self.receipt.verify_reads.to_string())),
                (
                    "unacknowledged_writes",
                    self.counter(self.receipt.unacknowledged_writes),
                ),
            ],
        );
        write!(f, "{}\n{table}", self.painter.success("Write complete"))
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn receipt_renders_counters() {
        let painter = Painter::new(false);
        let receipt = WriteReceipt {
            chunks: 3,
            bytes: 45,
            rewrites: 1,
            verify_reads: 4,
            unacknowledged_writes: 0,
        };
        assert_snapshot!(WriteReceiptView::new(&receipt, WriteStrategy::Verified, &painter).to_string(), @r"
        Write complete
        ╭───────────────────────┬──────────╮
        │ field                 │ value    │
        ├───────────────────────┼──────────┤
        │ strategy              │ verified │
        │ chunks                │ 3        │
        │ bytes                 │ 45       │
        │ rewrites              │ 1        │
        │ verify_reads          │ 4        │
        │ unacknowledged_writes │ 0        │
        ╰───────────────────────┴──────────╯
        ");
    }
}
