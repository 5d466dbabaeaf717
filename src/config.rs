use {
    log::warn,
    serde::{Deserialize, Serialize},
    std::{fs::read_to_string, io::Error as IoError, path::Path},
    toml::from_str,
};

/// Default `;`-separated kernel library search path.
const DEFAULT_LIB_PATH: &str = "/usr/local/lib/streamline";

/// Scheduler configuration, consumed once at init.
///
/// Every accessor applies its documented default when the underlying value is
/// absent.
#[derive(Default)]
pub struct Config {
    data: Data,
}

#[derive(Default, Deserialize, Serialize)]
struct Data {
    enabled: Option<usize>,
    mask: Option<u32>,
    verbose: Option<i32>,
    path: Option<String>,
    memory_block_size: Option<usize>,
    memory_use: Option<u32>,
    memory_number_of_blocks: Option<i64>,
    show_caps: Option<bool>,
}

impl Config {
    /// Reads the configuration from a TOML file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, IoError> {
        Ok(Self::parse(&read_to_string(path)?))
    }

    /// Parses TOML text, falling back to defaults for anything unreadable.
    pub fn parse(text: &str) -> Self {
        Self {
            data: from_str(text).unwrap_or_else(|err| {
                warn!("config parse error ({err}), using defaults");

                Data::default()
            }),
        }
    }

    /// The number of devices to use. The default value is 0, which disables
    /// the device core.
    pub fn enabled(&self) -> usize {
        self.data.enabled.unwrap_or(0)
    }

    /// Bitmask of device ordinals eligible for use. The default enables all.
    pub fn mask(&self) -> u32 {
        self.data.mask.unwrap_or(u32::MAX)
    }

    /// Diagnostic verbosity; a negative value selects the debug fallback.
    pub fn verbose(&self) -> i32 {
        self.data.verbose.unwrap_or(-1)
    }

    /// Kernel library search path: a `;`-separated list of directories or
    /// shared-object files.
    pub fn path(&self) -> &str {
        self.data.path.as_deref().unwrap_or(DEFAULT_LIB_PATH)
    }

    /// Element size of pool blocks in bytes. The default value is 32 KiB.
    pub fn memory_block_size(&self) -> usize {
        self.data.memory_block_size.unwrap_or(32 * 1024)
    }

    /// Percent of free device memory to reserve. The default value is 95.
    pub fn memory_use(&self) -> u32 {
        self.data.memory_use.unwrap_or(95)
    }

    /// Exact pool block count; overrides `memory_use` when present.
    pub fn memory_number_of_blocks(&self) -> Option<usize> {
        match self.data.memory_number_of_blocks.unwrap_or(-1) {
            n if n < 0 => None,
            n => Some(n as usize),
        }
    }

    /// Whether to log a capability report for each enabled device.
    pub fn show_caps(&self) -> bool {
        self.data.show_caps.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.enabled(), 0);
        assert_eq!(config.mask(), u32::MAX);
        assert_eq!(config.verbose(), -1);
        assert_eq!(config.path(), DEFAULT_LIB_PATH);
        assert_eq!(config.memory_block_size(), 32 * 1024);
        assert_eq!(config.memory_use(), 95);
        assert_eq!(config.memory_number_of_blocks(), None);
        assert!(!config.show_caps());
    }

    #[test]
    fn parses_overrides() {
        let config = Config::parse(
            "enabled = 2\nmask = 1\nmemory_block_size = 1024\nmemory_number_of_blocks = 4\n",
        );

        assert_eq!(config.enabled(), 2);
        assert_eq!(config.mask(), 1);
        assert_eq!(config.memory_block_size(), 1024);
        assert_eq!(config.memory_number_of_blocks(), Some(4));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = Config::parse("enabled = \"many\"");

        assert_eq!(config.enabled(), 0);
    }
}
