mod listen_view;
mod painter;
mod scan_view;
mod spinner;
mod table;
mod write_view;

pub(crate) use self::listen_view::{ListenNotificationView, ListenReadyView, ListenSummaryView};
pub(crate) use self::painter::Painter;
pub(crate) use self::scan_view::{ScanEntryView, ScanSummaryView};
pub(crate) use self::spinner::ConnectSpinner;
pub(crate) use self::write_view::WriteReceiptView;
