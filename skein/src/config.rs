//! Runtime configuration for an orchestrator instance.

/// Tunables applied when a plan is deployed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Overrides the graph's own maximum-container attribute when set.
    pub max_containers: Option<usize>,
    /// Expected interval between worker heartbeats, in milliseconds.
    pub heartbeat_millis: u64,
    /// Logical window length, in milliseconds.
    pub window_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_containers: None,
            heartbeat_millis: 1_000,
            window_millis: 500,
        }
    }
}

#[cfg(feature = "getopts")]
impl Config {
    /// Constructs a configuration by parsing supplied text arguments.
    ///
    /// Most commonly, this uses `std::env::args()` as the supplied iterator.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        opts.optopt("m", "max-containers", "maximum number of containers", "NUM");
        opts.optopt("b", "heartbeat-millis", "expected heartbeat interval", "MS");
        opts.optopt("w", "window-millis", "logical window length", "MS");

        let matches = opts.parse(args).map_err(|e| format!("{:?}", e))?;
        let mut config = Config::default();
        if let Some(x) = matches.opt_str("m") {
            let max = x.parse().map_err(|e| format!("max-containers: {}", e))?;
            if max == 0 {
                return Err("max-containers must be at least 1".to_owned());
            }
            config.max_containers = Some(max);
        }
        if let Some(x) = matches.opt_str("b") {
            config.heartbeat_millis = x.parse().map_err(|e| format!("heartbeat-millis: {}", e))?;
        }
        if let Some(x) = matches.opt_str("w") {
            config.window_millis = x.parse().map_err(|e| format!("window-millis: {}", e))?;
        }
        Ok(config)
    }
}

#[cfg(all(test, feature = "getopts"))]
mod tests {
    use super::*;

    fn args<'a>(text: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
        text.iter().map(|x| (*x).to_owned())
    }

    #[test]
    fn parses_overrides() {
        let config = Config::from_args(args(&["-m", "4", "-w", "250"])).unwrap();
        assert_eq!(config.max_containers, Some(4));
        assert_eq!(config.window_millis, 250);
        assert_eq!(config.heartbeat_millis, 1_000);
    }

    #[test]
    fn rejects_zero_containers() {
        assert!(Config::from_args(args(&["-m", "0"])).is_err());
    }
}
