use crate::build_info;
use crate::domain::Domain;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Incremental chain-state indexer with health attestation",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[arg(long, value_delimiter = ',')]
    /// Domains to run (default: every domain with a configured upstream)
    pub domains: Vec<Domain>,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    #[arg(long = "metrics-bind")]
    /// Overrides METRICS_BIND
    pub metrics_bind: Option<String>,

    #[arg(long, default_value_t = false)]
    /// Do not run embedded migrations at start-up
    pub skip_migrations: bool,

    #[arg(long, default_value_t = false)]
    /// Run one sync tick per domain and one health tick, then exit
    pub once: bool,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use crate::build_info;
    use crate::domain::Domain;
    use clap::{error::ErrorKind, Parser};

    #[test]
    fn version_short_circuits_other_flags() {
        let err = Cli::try_parse_from(["chain_indexer", "--version", "--not-a-flag"])
            .expect_err("expected clap to stop parsing after --version");

        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(build_info::VERSION_WITH_COMMIT));
    }

    #[test]
    fn domains_are_comma_separated() {
        let cli = Cli::try_parse_from(["chain_indexer", "--domains", "block-signers,comet-txs"])
            .expect("valid domain list");

        assert_eq!(cli.domains, vec![Domain::BlockSigners, Domain::CometTxs]);
        assert!(!cli.once);
    }

    #[test]
    fn unknown_domain_is_rejected() {
        let err = Cli::try_parse_from(["chain_indexer", "--domains", "mempool"])
            .expect_err("unknown domain");
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }
}
