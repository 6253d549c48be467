//! Bucket scan ordering, chosen once when the poller is built.

use crate::state::{ObjectState, RegistryMode, StateRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStrategy {
    /// Every scan lists the whole bucket from the start.
    Normal,
    /// Scans resume just before the persisted tail and keep only the
    /// `lookback_keys` greatest keys in the registry.
    Lexicographic { lookback_keys: usize },
}

impl PollingStrategy {
    pub fn registry_mode(self) -> RegistryMode {
        match self {
            PollingStrategy::Normal => RegistryMode::Normal,
            PollingStrategy::Lexicographic { lookback_keys } => {
                RegistryMode::Lexicographic { lookback_keys }
            }
        }
    }

    pub fn state_id(self, state: &ObjectState) -> String {
        match self {
            PollingStrategy::Normal => state.id(),
            PollingStrategy::Lexicographic { .. } => state.lexicographic_id(),
        }
    }

    /// Whether the listed object needs no work: already terminal in the
    /// registry or, in lexicographic mode, below the retained window.
    pub fn should_skip_object(self, registry: &StateRegistry, state: &ObjectState) -> bool {
        if registry.is_processed(&self.state_id(state)) {
            return true;
        }
        match self {
            PollingStrategy::Normal => false,
            PollingStrategy::Lexicographic { .. } => registry
                .tail()
                .is_some_and(|tail| state.key.as_str() < tail.as_str()),
        }
    }

    pub fn start_after_key(self, registry: &StateRegistry) -> Option<String> {
        match self {
            PollingStrategy::Normal => None,
            PollingStrategy::Lexicographic { .. } => registry.start_after_key(),
        }
    }
}
