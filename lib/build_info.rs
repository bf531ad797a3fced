pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Full commit hash stamped by `build.rs`, or `unknown`.
pub const GIT_COMMIT_HASH: &str = env!("CHAIN_INDEXER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("CHAIN_INDEXER_GIT_COMMIT_HASH")
);

const SHORT_HASH_LEN: usize = 12;

pub fn short_commit_hash() -> &'static str {
    GIT_COMMIT_HASH
        .get(..SHORT_HASH_LEN)
        .unwrap_or(GIT_COMMIT_HASH)
}

/// `User-Agent` sent to node RPC and feed endpoints, e.g. `chain_indexer/0.1.0+3f2a9c1d4e5b`.
pub fn user_agent() -> String {
    format!("{}/{}+{}", env!("CARGO_PKG_NAME"), VERSION, short_commit_hash())
}

#[cfg(test)]
mod tests {
    use super::{short_commit_hash, user_agent, GIT_COMMIT_HASH, VERSION, VERSION_WITH_COMMIT};

    #[test]
    fn version_carries_commit_suffix() {
        assert_eq!(VERSION_WITH_COMMIT, format!("{VERSION}+{GIT_COMMIT_HASH}"));
    }

    #[test]
    fn short_hash_is_bounded_prefix() {
        assert!(GIT_COMMIT_HASH.starts_with(short_commit_hash()));
        assert!(short_commit_hash().len() <= 12);
        assert_eq!(short_commit_hash().is_empty(), GIT_COMMIT_HASH.is_empty());
    }

    #[test]
    fn user_agent_names_the_binary() {
        let agent = user_agent();
        assert!(agent.starts_with("chain_indexer/"));
        assert!(agent.ends_with(short_commit_hash()));
    }
}
