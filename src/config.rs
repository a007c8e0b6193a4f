use crate::balance::LoadBalance;
use crate::network::ListenAddr;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Reactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen addresses: `[scheme://]host:port[?reuseport=bool]` or `unix://path`
    pub addrs: Vec<String>,

    /// Number of event loops (0 = one loop, negative = one per CPU)
    pub loops: i32,

    /// Which loop accepts a new connection
    pub load_balance: LoadBalance,

    /// Per-loop scratch read buffer size
    pub read_buffer_size: usize,

    /// Readiness events drained per wait
    pub events_capacity: usize,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addrs: vec!["tcp://127.0.0.1:6380".to_string()],
            loops: 1,
            load_balance: LoadBalance::Random,
            read_buffer_size: 64 * 1024, // 64KB
            events_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use feox_reactor::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("reactor.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.addrs.is_empty() {
            anyhow::bail!("at least one listen address is required");
        }

        for addr in &self.addrs {
            ListenAddr::parse(addr)?;
        }

        if self.read_buffer_size < 1024 {
            anyhow::bail!("read_buffer_size must be >= 1024");
        }

        if self.events_capacity == 0 {
            anyhow::bail!("events_capacity must be > 0");
        }

        Ok(())
    }

    /// Number of loops to start: exact when positive, one for zero, one per
    /// CPU when negative
    pub fn resolved_loops(&self) -> usize {
        match self.loops {
            n if n > 0 => n as usize,
            0 => 1,
            _ => num_cpus::get().max(1),
        }
    }

    /// Parsed listen addresses
    pub fn listen_addrs(&self) -> crate::Result<Vec<ListenAddr>> {
        self.addrs.iter().map(|a| ListenAddr::parse(a)).collect()
    }
}
