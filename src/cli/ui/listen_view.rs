use std::fmt::{self, Display, Formatter};

use uuid::Uuid;

use crate::cli::listen::{ListenStopReason, ListenSummary};
use crate::hw::RemoteDevice;
use crate::utils::format_hex;

use super::painter::Painter;
use super::table::Table;

/// Printed once notifications are enabled.
pub(crate) struct ListenReadyView<'a> {
    device: &'a RemoteDevice,
    service: Uuid,
    characteristics: &'a [Uuid],
    painter: &'a Painter,
}

impl<'a> ListenReadyView<'a> {
    pub(crate) fn new(
        device: &'a RemoteDevice,
        service: Uuid,
        characteristics: &'a [Uuid],
        painter: &'a Painter,
    ) -> Self {
        Self {
            device,
            service,
            characteristics,
            painter,
        }
    }
}

impl Display for ListenReadyView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let characteristics = self
            .characteristics
            .iter()
            .map(|uuid| self.painter.identifier(uuid.to_string()))
            .collect::<Vec<_>>()
            .join("\n");
        let table = Table::key_value(
            self.painter,
            vec![
                ("service", self.painter.identifier(self.service.to_string())),
                ("notify", characteristics),
            ],
        );
        write!(
            f,
            "{} {}\n{table}",
            self.painter.heading("Listening to"),
            self.painter.identifier(self.device.address().as_str())
        )
    }
}

/// A single notification line.
pub(crate) struct ListenNotificationView<'a> {
    index: usize,
    characteristic: Uuid,
    value: &'a [u8],
    painter: &'a Painter,
}

impl<'a> ListenNotificationView<'a> {
    pub(crate) fn new(
        index: usize,
        characteristic: Uuid,
        value: &'a [u8],
        painter: &'a Painter,
    ) -> Self {
        Self {
            index,
            characteristic,
            value,
            painter,
        }
    }
}

impl Display for ListenNotificationView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.painter.muted(format!("[{:04}]", self.index)),
            self.painter.identifier(self.characteristic.to_string()),
            self.painter.value(format_hex(self.value))
        )
    }
}

/// Why and after how many notifications listening stopped.
pub(crate) struct ListenSummaryView<'a> {
    summary: &'a ListenSummary,
    painter: &'a Painter,
}

impl<'a> ListenSummaryView<'a> {
    pub(crate) fn new(summary: &'a ListenSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for ListenSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let reason = self.summary.stop_reason.to_string();
        let reason = match self.summary.stop_reason {
            ListenStopReason::ReachedLimit => self.painter.success(reason),
            ListenStopReason::Interrupted | ListenStopReason::LinkLost => {
                self.painter.warning(reason)
            }
        };
        write!(
            f,
            "{} {reason} {}",
            self.painter.heading("Stopped:"),
            self.painter.value(format!(
                "- received {} notification(s)",
                self.summary.received
            ))
        )
    }
}
