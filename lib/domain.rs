use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Logical monitoring pipeline. Each domain owns one sync driver and one health status slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    BlockSigners,
    CometTxs,
    NetworkBalances,
    AssetPrices,
    Segments,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::BlockSigners,
        Domain::CometTxs,
        Domain::NetworkBalances,
        Domain::AssetPrices,
        Domain::Segments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockSigners => "block-signers",
            Self::CometTxs => "comet-txs",
            Self::NetworkBalances => "network-balances",
            Self::AssetPrices => "asset-prices",
            Self::Segments => "segments",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|domain| domain.as_str() == normalized)
            .ok_or_else(|| format!("unknown domain `{raw}`"))
    }
}
