use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;

use crate::gatt::SessionState;
use crate::hw::DeviceAddress;

/// Spinner that follows a session's state while it connects.
#[derive(Debug)]
pub(crate) struct ConnectSpinner {
    enabled: bool,
}

impl ConnectSpinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Drives `operation` to completion, relabelling the spinner on every
    /// state change. Renders nothing when disabled.
    pub(crate) async fn track<Fut, T>(
        &self,
        address: &DeviceAddress,
        mut states: watch::Receiver<SessionState>,
        operation: Fut,
    ) -> T
    where
        Fut: Future<Output = T>,
    {
        if !self.enabled {
            return operation.await;
        }

        let spinner = new_spinner(connect_message(address, *states.borrow_and_update()));
        tokio::pin!(operation);
        let result = loop {
            tokio::select! {
                result = &mut operation => break result,
                changed = states.changed() => {
                    if changed.is_err() {
                        break operation.await;
                    }
                    spinner.set_message(connect_message(address, *states.borrow_and_update()));
                }
            }
        };
        spinner.finish_and_clear();
        result
    }
}

fn connect_message(address: &DeviceAddress, state: SessionState) -> String {
    match state {
        SessionState::Disconnected => format!("Searching for {address}"),
        state => format!("{address}: {state}"),
    }
}

fn new_spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(90));
    spinner
}

fn spinner_style() -> ProgressStyle {
    let base_style = ProgressStyle::default_spinner();
    let templated =
        ProgressStyle::with_template("{spinner:.cyan.bold} {msg}").unwrap_or(base_style);
    templated.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::disabled(false)]
    #[case::enabled(true)]
    #[tokio::test]
    async fn track_returns_operation_result(#[case] enabled: bool) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let spinner = ConnectSpinner::new(enabled);

        let result = spinner
            .track(&DeviceAddress::new("AA:BB"), state_rx, async move {
                state_tx.send_replace(SessionState::Connecting);
                tokio::task::yield_now().await;
                state_tx.send_replace(SessionState::Ready);
                42
            })
            .await;

        assert_eq!(42, result);
    }

    #[rstest]
    #[case::searching(SessionState::Disconnected, "Searching for AA:BB")]
    #[case::discovering(SessionState::DiscoveringCapabilities, "AA:BB: discovering_capabilities")]
    fn message_names_address_and_state(#[case] state: SessionState, #[case] expected: &str) {
        assert_eq!(expected, connect_message(&DeviceAddress::new("aa:bb"), state));
    }
}
