use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::{error::RelayError, relay::RelayClient};

#[derive(Debug, Default)]
struct FakeRelayState {
    physical: BTreeMap<usize, bool>,
    commands: Vec<(usize, bool)>,
    fail_switching: bool,
    fail_queries: bool,
    installed_scripts: Vec<usize>,
    script_checks: Vec<usize>,
}

/// Relay double: remembers the physical state of each channel and every
/// switch command it received.
#[derive(Debug, Default)]
pub struct FakeRelay {
    state: Mutex<FakeRelayState>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips a channel without going through the controller, like a manual
    /// override or the device-side auto-off script would.
    pub fn flip_out_of_band(&self, channel: usize, on: bool) {
        self.lock().physical.insert(channel, on);
    }

    pub fn physical(&self, channel: usize) -> bool {
        self.lock().physical.get(&channel).copied().unwrap_or(false)
    }

    pub fn commands(&self) -> Vec<(usize, bool)> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    pub fn fail_switching(&self, fail: bool) {
        self.lock().fail_switching = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    pub fn installed_scripts(&self) -> Vec<usize> {
        self.lock().installed_scripts.clone()
    }

    pub fn script_checks(&self) -> Vec<usize> {
        self.lock().script_checks.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeRelayState> {
        self.state.lock().unwrap()
    }
}

fn transport_error(channel: usize) -> RelayError {
    RelayError::Transport {
        uri: format!("fake://switch/{channel}"),
        reason: "connection refused".to_string(),
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    async fn query_state(&self, channel: usize) -> Result<bool, RelayError> {
        let state = self.lock();
        if state.fail_queries {
            return Err(transport_error(channel));
        }
        Ok(state.physical.get(&channel).copied().unwrap_or(false))
    }

    async fn set_state(&self, channel: usize, on: bool) -> Result<(), RelayError> {
        let mut state = self.lock();
        state.commands.push((channel, on));
        if state.fail_switching {
            return Err(transport_error(channel));
        }
        state.physical.insert(channel, on);
        Ok(())
    }

    async fn ensure_auto_off_script(&self, channel: usize) -> Result<(), RelayError> {
        self.lock().installed_scripts.push(channel);
        Ok(())
    }

    async fn ensure_script_running(&self, channel: usize) -> Result<(), RelayError> {
        self.lock().script_checks.push(channel);
        Ok(())
    }
}
