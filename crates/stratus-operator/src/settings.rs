//! Flags of the `controller` command and the configuration built from them

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use stratus_cloud::{Credentials, LimiterConfig, DEFAULT_API_URL};
use stratus_common::ControllerConfig;

/// Settings of a running operator
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Base URL of the Stratus cloud API
    #[arg(long, env = "STRATUS_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Token used by resources without a credentialsRef
    #[arg(long, env = "STRATUS_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Objects of one kind reconciled in parallel
    #[arg(long, env = "STRATUS_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Override how long any condition may stay false before failing
    #[arg(long, env = "STRATUS_STALE_TIMEOUT_SECS")]
    pub stale_timeout_secs: Option<u64>,

    /// Override the retry delay of every kind
    #[arg(long, env = "STRATUS_RETRY_DELAY_SECS")]
    pub retry_delay_secs: Option<u64>,

    /// Requeue interval of ready objects
    #[arg(long, env = "STRATUS_RESYNC_INTERVAL_SECS", default_value_t = 600)]
    pub resync_interval_secs: u64,

    /// Instance creations admitted per account and window
    #[arg(long, env = "STRATUS_CREATION_CEILING", default_value_t = 10)]
    pub creation_ceiling: u32,

    /// Length of the instance creation window
    #[arg(long, env = "STRATUS_CREATION_WINDOW_SECS", default_value_t = 30)]
    pub creation_window_secs: u64,

    /// Timeout of one cloud API request
    #[arg(long, env = "STRATUS_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Kubeconfig to use instead of the in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl ControllerArgs {
    pub fn controller_config(&self) -> ControllerConfig {
        let mut config = ControllerConfig {
            limiter: self.limiter_config(),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            ..Default::default()
        };
        if let Some(secs) = self.stale_timeout_secs {
            config = config.with_stale_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.retry_delay_secs {
            config = config.with_retry_delay(Duration::from_secs(secs));
        }
        config
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            ceiling: self.creation_ceiling,
            window: Duration::from_secs(self.creation_window_secs),
        }
    }

    /// Credentials for resources that reference no Secret; blank tokens count as none
    pub fn default_credentials(&self) -> Option<Credentials> {
        self.api_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(Credentials::new)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ControllerArgs,
    }

    fn parse(flags: &[&str]) -> ControllerArgs {
        let argv = std::iter::once("stratus-operator").chain(flags.iter().copied());
        Harness::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn defaults_match_production_config() {
        let args = parse(&["--api-url", DEFAULT_API_URL]);
        let config = args.controller_config();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(args.concurrency, 4);
    }

    #[test]
    fn overrides_apply_to_every_kind() {
        let config = parse(&["--stale-timeout-secs", "90", "--retry-delay-secs", "3"])
            .controller_config();
        for timings in [&config.cluster, &config.machine, &config.firewall, &config.key] {
            assert_eq!(timings.stale_timeout, Duration::from_secs(90));
            assert_eq!(timings.retry_delay, Duration::from_secs(3));
        }
    }

    #[test]
    fn limiter_window_is_configurable() {
        let config = parse(&["--creation-ceiling", "3", "--creation-window-secs", "60"])
            .controller_config();
        assert_eq!(config.limiter.ceiling, 3);
        assert_eq!(config.limiter.window, Duration::from_secs(60));
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&["--api-token", "   "], false)]
    #[case(&["--api-token", "tok-123"], true)]
    fn default_credentials_need_a_token(#[case] flags: &[&str], #[case] expected: bool) {
        assert_eq!(parse(flags).default_credentials().is_some(), expected);
    }
}
