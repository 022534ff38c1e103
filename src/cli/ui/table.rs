use std::fmt::{self, Display, Formatter};

use tabled::builder::Builder;
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Style};

use super::painter::Painter;

/// Rounded table of CLI results.
#[derive(Debug)]
pub(crate) struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    numeric_columns: Vec<usize>,
}

impl Table {
    pub(crate) fn new(headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            numeric_columns: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn row(mut self, cells: Vec<String>) -> Self {
        self.rows.push(cells);
        self
    }

    /// Right-aligns a column, header included.
    #[must_use]
    pub(crate) fn numeric(mut self, column: usize) -> Self {
        self.numeric_columns.push(column);
        self
    }

    /// Two-column field/value table with muted field names.
    pub(crate) fn key_value(painter: &Painter, fields: Vec<(&str, String)>) -> Self {
        fields
            .into_iter()
            .fold(Self::new(["field", "value"]), |table, (field, value)| {
                table.row(vec![painter.muted(field), value])
            })
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(&self.headers);
        for row in &self.rows {
            builder.push_record(row);
        }
        let mut table = builder.build();
        table.with(Style::rounded());
        for column in &self.numeric_columns {
            table.modify(Columns::new(*column..*column + 1), Alignment::right());
        }
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn key_value_table_renders_field_value_pairs() {
        let painter = Painter::new(false);
        let table = Table::key_value(
            &painter,
            vec![("chunks", "3".into()), ("bytes", "45".into())],
        );
        assert_snapshot!(table.to_string(), @r"
        ╭────────┬───────╮
        │ field  │ value │
        ├────────┼───────┤
        │ chunks │ 3     │
        │ bytes  │ 45    │
        ╰────────┴───────╯
        ");
    }

    #[test]
    fn numeric_columns_align_right() {
        let table = Table::new(["device", "count"])
            .row(vec!["AA:BB".into(), "7".into()])
            .row(vec!["CC:DD".into(), "12".into()])
            .numeric(1);
        assert_snapshot!(table.to_string(), @r"
        ╭────────┬───────╮
        │ device │ count │
        ├────────┼───────┤
        │ AA:BB  │     7 │
        │ CC:DD  │    12 │
        ╰────────┴───────╯
        ");
    }
}
