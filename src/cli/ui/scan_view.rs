use std::fmt::{self, Display, Formatter};

use crate::hw::ScanEntry;
use crate::utils::format_rssi;

use super::painter::Painter;
use super::table::Table;

const UNNAMED: &str = "<unnamed>";

/// One reported scan result.
pub(crate) struct ScanEntryView<'a> {
    entry: &'a ScanEntry,
    painter: &'a Painter,
}

impl<'a> ScanEntryView<'a> {
    pub(crate) fn new(entry: &'a ScanEntry, painter: &'a Painter) -> Self {
        Self { entry, painter }
    }
}

impl Display for ScanEntryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let device = self.entry.device();
        let name = match device.name() {
            Some(name) => self.painter.value(name),
            None => self.painter.muted(UNNAMED),
        };
        write!(
            f,
            "{} {} {}",
            self.painter.identifier(device.address().as_str()),
            name,
            self.painter.muted(format_rssi(self.entry.rssi()))
        )
    }
}

/// Table of every device seen during a scan.
pub(crate) struct ScanSummaryView<'a> {
    entries: &'a [ScanEntry],
    painter: &'a Painter,
}

impl<'a> ScanSummaryView<'a> {
    pub(crate) fn new(entries: &'a [ScanEntry], painter: &'a Painter) -> Self {
        Self { entries, painter }
    }
}

impl Display for ScanSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "{}", self.painter.warning("No devices found."));
        }
        let table = self.entries.iter().fold(
            Table::new(["address", "name", "rssi", "sightings"])
                .numeric(2)
                .numeric(3),
            |table, entry| {
                table.row(vec![
                    entry.device().address().to_string(),
                    entry.device().name().unwrap_or(UNNAMED).to_string(),
                    format_rssi(entry.rssi()),
                    entry.sightings().to_string(),
                ])
            },
        );
        write!(
            f,
            "{}\n{table}",
            self.painter
                .heading(format!("Devices ({}):", self.entries.len()))
        )
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use tokio::time::Instant;

    use super::*;
    use crate::hw::Advertisement;

    fn entry(address: &str, name: Option<&str>, rssi: Option<i16>) -> ScanEntry {
        ScanEntry::first_sighting(
            &Advertisement::new(address, name.map(str::to_string), rssi),
            Instant::now(),
        )
    }

    #[test]
    fn entry_line_shows_address_name_and_rssi() {
        let painter = Painter::new(false);
        let named = entry("aa:bb:cc", Some("Thermo"), Some(-43));
        let unnamed = entry("11:22:33", None, None);

        assert_snapshot!(ScanEntryView::new(&named, &painter).to_string(), @"AA:BB:CC Thermo -43 dBm");
        assert_snapshot!(ScanEntryView::new(&unnamed, &painter).to_string(), @"11:22:33 <unnamed> -");
    }

    #[test]
    fn empty_summary_warns() {
        let painter = Painter::new(false);
        assert_snapshot!(ScanSummaryView::new(&[], &painter).to_string(), @"No devices found.");
    }

    #[test]
    fn summary_tabulates_devices() {
        let painter = Painter::new(false);
        let entries = [entry("AA:BB", Some("Thermo"), Some(-43))];
        assert_snapshot!(ScanSummaryView::new(&entries, &painter).to_string(), @r"
        Devices (1):
        ╭─────────┬────────┬─────────┬───────────╮
        │ address │ name   │    rssi │ sightings │
        ├─────────┼────────┼─────────┼───────────┤
        │ AA:BB   │ Thermo │ -43 dBm │         1 │
        ╰─────────┴────────┴─────────┴───────────╯
        ");
    }
}
