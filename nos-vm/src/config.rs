//! Virtual memory configuration

use nos_api::error::{Result, config_error};

use crate::layout::AddressSpaceLayout;

/// Default number of user frames (4 MiB of user memory).
pub const DEFAULT_FRAME_BUDGET: usize = 1024;

/// Boot-time configuration of the virtual memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames available to user pages
    pub frame_budget: usize,
    /// User address space layout
    pub layout: AddressSpaceLayout,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_budget: DEFAULT_FRAME_BUDGET,
            layout: AddressSpaceLayout::default(),
        }
    }
}

impl VmConfig {
    /// Sets the frame budget.
    pub fn with_frame_budget(mut self, frame_budget: usize) -> Self {
        self.frame_budget = frame_budget;
        self
    }

    /// Sets the address space layout.
    pub fn with_layout(mut self, layout: AddressSpaceLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Checks the configuration before it is used to build the core.
    pub fn validate(&self) -> Result<()> {
        if self.frame_budget == 0 {
            return Err(config_error("frame budget must be at least one frame"));
        }
        self.layout.verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_api::Error;

    #[test]
    fn test_defaults_are_valid() {
        let config = VmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout.stack_limit, 8 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_zero_budget() {
        let config = VmConfig::default().with_frame_budget(0);
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_rejects_bad_layout() {
        let layout = AddressSpaceLayout { stack_limit: 100, ..Default::default() };
        assert!(VmConfig::default().with_layout(layout).validate().is_err());
    }
}
