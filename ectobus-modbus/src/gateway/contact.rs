//! Contact splitter (up to ten dry-contact inputs).

use serde::Serialize;
use thiserror::Error;

use super::GatewayCore;
use crate::identity::MAX_CONTACT_CHANNELS;
use crate::registers::{ContactRegisterMap, ReadBlock};

/// Channels packed into the base bitfield register.
const BASE_CHANNELS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactState {
    Open,
    Closed,
}

impl std::fmt::Display for ContactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactState::Open => write!(f, "open"),
            ContactState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel {0} out of range (1-{max})", max = MAX_CONTACT_CHANNELS)]
    OutOfRange(u8),
}

#[derive(Debug, Clone)]
pub struct ContactGateway {
    pub(super) core: GatewayCore,
    map: ContactRegisterMap,
}

impl ContactGateway {
    pub(crate) fn new(core: GatewayCore, map: ContactRegisterMap) -> Self {
        Self { core, map }
    }

    /// Number of channels reported by the device.
    pub fn channel_count(&self) -> u8 {
        self.core.identity.channel_count
    }

    pub(crate) fn read_plan(&self) -> Vec<ReadBlock> {
        let count = if self.channel_count() <= BASE_CHANNELS { 1 } else { 2 };
        vec![ReadBlock {
            kind: self.map.kind,
            start: self.map.base,
            count,
        }]
    }

    /// State of one channel (1-based).
    ///
    /// Channels beyond the device's channel count, or whose register has
    /// not been read yet, are `Ok(None)`.
    pub fn channel_state(&self, channel: u8) -> Result<Option<ContactState>, ChannelError> {
        if !(1..=MAX_CONTACT_CHANNELS).contains(&channel) {
            return Err(ChannelError::OutOfRange(channel));
        }
        if channel > self.channel_count() {
            return Ok(None);
        }

        let (address, bit) = if channel <= BASE_CHANNELS {
            (self.map.base, channel - 1)
        } else {
            (self.map.extended, channel - BASE_CHANNELS - 1)
        };

        Ok(self.core.cache.get(address).map(|word| {
            if word & (1 << bit) != 0 {
                ContactState::Closed
            } else {
                ContactState::Open
            }
        }))
    }

    /// States of channels `1..=channel_count`.
    pub fn channel_states(&self) -> Vec<(u8, Option<ContactState>)> {
        (1..=self.channel_count().min(MAX_CONTACT_CHANNELS))
            .map(|ch| (ch, self.channel_state(ch).ok().flatten()))
            .collect()
    }
}
