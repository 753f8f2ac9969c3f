use async_trait::async_trait;
use tracing::warn;

use crate::error::RelayError;

/// Switching and watchdog-script access to the relay device.
///
/// Channels are zero-based. Implementations must bound every call with a
/// timeout so no caller blocks indefinitely.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn query_state(&self, channel: usize) -> Result<bool, RelayError>;

    async fn set_state(&self, channel: usize, on: bool) -> Result<(), RelayError>;

    /// Installs (if absent), enables and starts the device-side script that
    /// switches `channel` off some time after it was switched on.
    async fn ensure_auto_off_script(&self, channel: usize) -> Result<(), RelayError>;

    async fn ensure_script_running(&self, channel: usize) -> Result<(), RelayError>;
}

/// Installs the auto-off script on every channel. Returns the number of
/// channels that failed; failures are logged and do not stop the others.
pub async fn register_auto_off_scripts(relay: &dyn RelayClient, channels: usize) -> usize {
    let mut failed = 0;
    for channel in 0..channels {
        if let Err(err) = relay.ensure_auto_off_script(channel).await {
            warn!("could not register auto-off script for heating rod {channel}: {err}");
            failed += 1;
        }
    }
    failed
}

pub async fn restart_stopped_scripts(relay: &dyn RelayClient, channels: usize) -> usize {
    let mut failed = 0;
    for channel in 0..channels {
        if let Err(err) = relay.ensure_script_running(channel).await {
            warn!("could not check auto-off script of heating rod {channel}: {err}");
            failed += 1;
        }
    }
    failed
}
