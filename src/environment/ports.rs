//! Host port pair allocation for browser containers.

use std::collections::HashSet;

use tracing::debug;

use super::{PortPair, ProvisionError};
use crate::config::DockerConfig;

/// Scans a fixed window of offsets from two base ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    pub selenium_base: u16,
    pub display_base: u16,
    pub window: u16,
}

impl PortAllocator {
    pub fn new(selenium_base: u16, display_base: u16, window: u16) -> Self {
        Self {
            selenium_base,
            display_base,
            window,
        }
    }

    pub fn from_config(config: &DockerConfig) -> Self {
        Self::new(
            config.selenium_base_port,
            config.display_base_port,
            config.port_window,
        )
    }

    /// First pair at offset `i` where neither port is in `occupied`.
    pub fn allocate(&self, occupied: &HashSet<u16>) -> Result<PortPair, ProvisionError> {
        for offset in 0..self.window {
            let (Some(selenium), Some(display_port)) = (
                self.selenium_base.checked_add(offset),
                self.display_base.checked_add(offset),
            ) else {
                break;
            };

            if selenium == display_port {
                continue;
            }
            if occupied.contains(&selenium) || occupied.contains(&display_port) {
                continue;
            }

            debug!(selenium, display_port, offset, "allocated port pair");
            return Ok(PortPair {
                selenium,
                display: display_port,
            });
        }

        Err(ProvisionError::NoPortsAvailable {
            selenium_base: self.selenium_base,
            display_base: self.display_base,
            window: self.window,
        })
    }
}
