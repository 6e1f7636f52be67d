use crate::liquidity::LiquidityPolicy;
use bitcoin::secp256k1::PublicKey;
use clap::Parser;
use std::path::PathBuf;

/// Phoenix Lightning node daemon
#[derive(Parser, Debug, Clone)]
#[command(version, author, about)]
pub struct Config {
    /// Location of the seed, configuration, logs and database
    #[clap(long)]
    pub data_dir: Option<String>,

    /// Bitcoin chain to use
    #[clap(default_value = "mainnet", long)]
    pub chain: String,

    /// Bind address for the HTTP API
    #[clap(default_value = "127.0.0.1", long)]
    pub http_bind_ip: String,
    /// Port for the HTTP API
    #[clap(default_value_t = 9740, long)]
    pub http_bind_port: u16,
    /// Password granting full access to the HTTP API
    #[clap(long)]
    pub http_password: Option<String>,
    /// Password granting read-only access to the HTTP API
    #[clap(long)]
    pub http_password_limited_access: Option<String>,

    /// Webhook URL notified on every surfaced event, may be repeated
    #[clap(long)]
    pub webhook: Vec<String>,
    /// Secret used to sign webhook bodies
    #[clap(long)]
    pub webhook_secret: Option<String>,

    /// Max absolute on-chain fee accepted for a liquidity operation, in sat
    #[clap(default_value_t = 40_000, long)]
    pub auto_liquidity_max_absolute_fee: u64,
    /// Max on-chain fee relative to the incoming amount, in basis points
    #[clap(default_value_t = 300, long)]
    pub auto_liquidity_max_relative_fee_bp: u64,
    /// Max non-refundable fee credit the node may accumulate, in sat
    #[clap(default_value_t = 100_000, long)]
    pub max_fee_credit: u64,
    /// Skip the absolute fee cap, keeping only the relative one
    #[clap(long)]
    pub skip_absolute_fee_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: None,
            chain: "mainnet".to_string(),
            http_bind_ip: "127.0.0.1".to_string(),
            http_bind_port: 9740,
            http_password: None,
            http_password_limited_access: None,
            webhook: Vec::new(),
            webhook_secret: None,
            auto_liquidity_max_absolute_fee: 40_000,
            auto_liquidity_max_relative_fee_bp: 300,
            max_fee_credit: 100_000,
            skip_absolute_fee_check: false,
        }
    }
}

impl Config {
    pub fn chain(&self) -> bitcoin::Network {
        match self.chain.as_str() {
            "mainnet" => bitcoin::Network::Bitcoin,
            "bitcoin" => bitcoin::Network::Bitcoin,
            "testnet" => bitcoin::Network::Testnet,
            "regtest" => bitcoin::Network::Regtest,
            "signet" => bitcoin::Network::Signet,
            _ => panic!("Invalid chain"),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = std::env::var("HOME").expect("HOME is not set");
                PathBuf::from(home).join(".phoenix")
            }
        }
    }

    /// Database file name, bound to the chain and the node identity:
    /// `phoenix.<chain>.<nodeIdPrefix6>.db`.
    pub fn db_path(&self, node_id: &PublicKey) -> PathBuf {
        let prefix = &node_id.to_string()[..6];
        self.data_dir()
            .join(format!("phoenix.{}.{prefix}.db", self.chain))
    }

    pub fn seed_path(&self) -> PathBuf {
        self.data_dir().join("seed.dat")
    }

    pub fn conf_path(&self) -> PathBuf {
        self.data_dir().join("phoenix.conf")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join("phoenix.log")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir().join("exports")
    }

    pub fn liquidity_policy(&self) -> LiquidityPolicy {
        LiquidityPolicy {
            max_absolute_fee_sat: self.auto_liquidity_max_absolute_fee,
            max_relative_fee_basis_points: self.auto_liquidity_max_relative_fee_bp,
            max_allowed_credit_sat: self.max_fee_credit,
            skip_absolute_fee_check: self.skip_absolute_fee_check,
        }
        .clamped()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn db_path_carries_chain_and_node_id_prefix() {
        let config = Config {
            data_dir: Some("/tmp/phoenix-test".to_string()),
            chain: "testnet".to_string(),
            ..Default::default()
        };
        let node_id = PublicKey::from_str(
            "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619",
        )
        .unwrap();
        assert_eq!(
            config.db_path(&node_id),
            PathBuf::from("/tmp/phoenix-test/phoenix.testnet.02eec7.db")
        );
    }

    #[test]
    fn policy_comes_out_clamped() {
        let config = Config {
            auto_liquidity_max_absolute_fee: 1_000_000,
            ..Default::default()
        };
        assert_eq!(config.liquidity_policy().max_absolute_fee_sat, 100_000);
    }
}
