//! Per-network constants and the validator chain they imply.
//!
//! - `ChainParams::bitcoin()` for Bitcoin mainnet
//! - `ChainParams::bitcoin_cash()` for Bitcoin Cash mainnet
//! - `ChainParams::regtest()` for local regression testing

use crate::bitcoin_cash::{
    DifficultyAdjustmentValidator, EmergencyDifficultyValidator, DAA_ACTIVATION_HEIGHT, DAA_WINDOW,
};
use crate::block::{Block, BlockHeader, HEADER_SIZE};
use crate::dash::DarkGravityWaveValidator;
use crate::difficulty::{BitsValidator, LegacyRetargetValidator};
use crate::hash::Hash256;
use crate::validation::{BlockValidator, BlockValidatorChain, ProofOfWorkValidator};
use crate::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    /// Bitcoin mainnet.
    Bitcoin,
    /// Bitcoin Cash mainnet.
    BitcoinCash,
    /// Local regression-test network.
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Bitcoin => "bitcoin",
            Network::BitcoinCash => "bitcoin-cash",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "bitcoin-cash" | "bch" => Ok(Network::BitcoinCash),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// A difficulty rule in a chain's validator list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidatorKind {
    /// `bits` equals the parent's.
    Bits,
    /// Fixed-interval retarget at heights divisible by the interval.
    Legacy,
    /// Bitcoin Cash emergency adjustment.
    Eda,
    /// Bitcoin Cash averaging algorithm, active from the given parent height.
    Daa { activation_height: u32 },
    /// Dark Gravity Wave over `interval` blocks, for candidates from
    /// `activation_height` on.
    DarkGravityWave {
        interval: u32,
        #[serde(default)]
        activation_height: u32,
    },
}

/// Bytes per serialized checkpoint line: header, height, hash.
const CHECKPOINT_RECORD_SIZE: usize = HEADER_SIZE + 4 + 32;

/// A trusted block the sync starts from.
///
/// `additional_blocks` are ancestors of the checkpoint, stored alongside it
/// so that per-block difficulty rules have a full window right above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Checkpoint height.
    pub height: u32,
    /// Checkpoint header.
    pub header: BlockHeader,
    /// Ancestors of the checkpoint, newest first.
    pub additional_blocks: Vec<Block>,
}

impl Checkpoint {
    /// Build a checkpoint from display-order hex hashes, verifying `hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        height: u32,
        version: i32,
        previous_hash: &str,
        merkle_root: &str,
        timestamp: u32,
        bits: u32,
        nonce: u32,
        hash: &str,
    ) -> ConsensusResult<Self> {
        let header = BlockHeader {
            version,
            previous_block_hash: Hash256::from_hex(previous_hash)?,
            merkle_root: Hash256::from_hex(merkle_root)?,
            timestamp,
            bits,
            nonce,
        };

        let expected = Hash256::from_hex(hash)?;
        if header.hash() != expected {
            return Err(ConsensusError::NoHeader(format!(
                "checkpoint {} hashes to {}, expected {}",
                height,
                header.hash(),
                expected
            )));
        }

        Ok(Self {
            height,
            header,
            additional_blocks: Vec::new(),
        })
    }

    /// Parse a checkpoint file.
    ///
    /// Each non-empty line is the hex of an 80-byte header, a little-endian
    /// height and the 32-byte header hash. The first line is the checkpoint,
    /// the rest are its ancestors.
    pub fn parse(text: &str) -> ConsensusResult<Self> {
        let mut blocks = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse_checkpoint_record);

        let checkpoint = blocks
            .next()
            .ok_or_else(|| ConsensusError::NoHeader("empty checkpoint file".to_string()))??;
        let additional_blocks = blocks.collect::<ConsensusResult<Vec<Block>>>()?;

        Self {
            height: checkpoint.height,
            header: checkpoint.header,
            additional_blocks: Vec::new(),
        }
        .with_additional_blocks(additional_blocks)
    }

    /// Attach ancestors, checking that they link down from the checkpoint
    /// without gaps.
    pub fn with_additional_blocks(mut self, mut blocks: Vec<Block>) -> ConsensusResult<Self> {
        blocks.sort_by(|a, b| b.height.cmp(&a.height));

        let mut child = self.block();
        for block in &blocks {
            if block.height + 1 != child.height || block.hash != child.header.previous_block_hash {
                return Err(ConsensusError::NoHeader(format!(
                    "checkpoint ancestor {} at height {} does not link to {}",
                    block.hash, block.height, child.hash
                )));
            }
            child = block.clone();
        }

        self.additional_blocks = blocks;
        Ok(self)
    }

    /// The checkpoint as a (non-stale) stored block.
    pub fn block(&self) -> Block {
        Block::new(self.header.clone(), self.height)
    }

    /// The checkpoint followed by its stored ancestors.
    pub fn blocks(&self) -> Vec<Block> {
        std::iter::once(self.block())
            .chain(self.additional_blocks.iter().cloned())
            .collect()
    }

    /// Checkpoint header hash.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

fn parse_checkpoint_record(line: &str) -> ConsensusResult<Block> {
    let bytes = hex::decode(line).map_err(|e| ConsensusError::InvalidHex(e.to_string()))?;
    if bytes.len() != CHECKPOINT_RECORD_SIZE {
        return Err(ConsensusError::NoHeader(format!(
            "checkpoint record needs {} bytes, got {}",
            CHECKPOINT_RECORD_SIZE,
            bytes.len()
        )));
    }

    let header = BlockHeader::parse(&bytes[..HEADER_SIZE])?;
    let height = i32::from_le_bytes([
        bytes[HEADER_SIZE],
        bytes[HEADER_SIZE + 1],
        bytes[HEADER_SIZE + 2],
        bytes[HEADER_SIZE + 3],
    ]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[HEADER_SIZE + 4..]);

    if header.hash() != Hash256(hash) {
        return Err(ConsensusError::NoHeader(format!(
            "checkpoint record at height {} hashes to {}",
            height,
            header.hash()
        )));
    }
    let height = u32::try_from(height)
        .map_err(|_| ConsensusError::NoHeader(format!("negative checkpoint height {}", height)))?;
    Ok(Block::new(header, height))
}

/// Network constants, immutable after construction.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Network identity.
    pub network: Network,
    /// Message start bytes.
    pub magic: [u8; 4],
    /// Default P2P port.
    pub default_port: u16,
    /// DNS seeds for peer discovery.
    pub dns_seeds: Vec<String>,
    /// Retarget interval in blocks.
    pub retarget_interval: u32,
    /// Target seconds between blocks.
    pub target_spacing: i64,
    /// Nominal seconds per retarget interval.
    pub target_timespan: i64,
    /// Easiest allowed target, compact-encoded.
    pub max_target_bits: u32,
    /// Maximum serialized block size.
    pub max_block_size: u32,
    /// Trusted starting block.
    pub checkpoint: Checkpoint,
    /// Difficulty rules in chain-of-responsibility order.
    pub validators: Vec<ValidatorKind>,
}

impl ChainParams {
    /// Parameters for `network`.
    pub fn for_network(network: Network) -> ConsensusResult<Self> {
        match network {
            Network::Bitcoin => Self::bitcoin(),
            Network::BitcoinCash => Self::bitcoin_cash(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Bitcoin mainnet.
    pub fn bitcoin() -> ConsensusResult<Self> {
        Ok(Self {
            network: Network::Bitcoin,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            dns_seeds: seeds(&[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
                "seed.bitcoin.sprovoost.nl",
            ]),
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 1_209_600,
            max_target_bits: 0x1d00ffff,
            max_block_size: 1_000_000,
            checkpoint: Checkpoint::from_parts(
                574_560,
                545_259_520,
                "00000000000000000001b2505c11119fcf29be733ec379f686518bf1090a522a",
                "cc09d95fd8ccc985826b9eb46bf73f8449116f18535423129f0574500985cf90",
                1_556_958_733,
                388_628_280,
                2_897_942_742,
                "00000000000000000008c8427670a65dec4360e88bf6c8381541ef26b30bd8fc",
            )?,
            validators: vec![ValidatorKind::Legacy, ValidatorKind::Bits],
        })
    }

    /// Bitcoin Cash mainnet.
    pub fn bitcoin_cash() -> ConsensusResult<Self> {
        Ok(Self {
            network: Network::BitcoinCash,
            magic: [0xe3, 0xe1, 0xf3, 0xe8],
            default_port: 8333,
            dns_seeds: seeds(&[
                "seed.bitcoinabc.org",
                "seed-abc.bitcoinforks.org",
                "btccash-seeder.bitcoinunlimited.info",
                "seed.bitprim.org",
                "seed.deadalnix.me",
                "seeder.criptolayer.net",
            ]),
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 1_209_600,
            max_target_bits: 0x1d00ffff,
            max_block_size: 32 * 1024 * 1024,
            checkpoint: Checkpoint::from_parts(
                596_855,
                536_870_912,
                "000000000000000000553bfbe09e381b8bf90aaf5918aec2a9ca04cbb380de4c",
                "eddba5abfaf472c82adfdb0585eb672fbcb142b4ca485d00e76afd9e71184991",
                1_566_454_348,
                0x18039165,
                2_279_816_485,
                "00000000000000000376c7174b3d07ca1797dbbda4247e0df02147a8748489e8",
            )?,
            validators: vec![
                ValidatorKind::Daa {
                    activation_height: DAA_ACTIVATION_HEIGHT,
                },
                ValidatorKind::Legacy,
                ValidatorKind::Eda,
            ],
        })
    }

    /// Regression-test network starting from its genesis block.
    pub fn regtest() -> ConsensusResult<Self> {
        Ok(Self {
            network: Network::Regtest,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            dns_seeds: Vec::new(),
            retarget_interval: 2016,
            target_spacing: 600,
            target_timespan: 1_209_600,
            max_target_bits: 0x207fffff,
            max_block_size: 1_000_000,
            checkpoint: Checkpoint::from_parts(
                0,
                1,
                "0000000000000000000000000000000000000000000000000000000000000000",
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                1_296_688_602,
                0x207fffff,
                2,
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            )?,
            validators: vec![ValidatorKind::Bits],
        })
    }

    /// Override the default port (local test networks).
    pub fn with_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Replace the checkpoint, e.g. with one loaded from a checkpoint file.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Blocks ending at the checkpoint that the difficulty rules read
    /// when validating its first child.
    pub fn required_history(&self) -> usize {
        self.validators
            .iter()
            .map(|kind| match kind {
                ValidatorKind::Daa { .. } => DAA_WINDOW,
                ValidatorKind::DarkGravityWave { interval, .. } => *interval as usize,
                _ => 1,
            })
            .max()
            .unwrap_or(1)
    }

    /// Blocks ending at the checkpoint that will be stored.
    pub fn stored_history(&self) -> usize {
        1 + self.checkpoint.additional_blocks.len()
    }

    /// Build the validator chain: proof of work always, then `validators`.
    pub fn validator_chain(&self) -> BlockValidatorChain {
        self.validators.iter().fold(
            BlockValidatorChain::new().with_always(Box::new(ProofOfWorkValidator)),
            |chain, kind| chain.with_chained(self.build_validator(kind)),
        )
    }

    fn build_validator(&self, kind: &ValidatorKind) -> Box<dyn BlockValidator> {
        match kind {
            ValidatorKind::Bits => Box::new(BitsValidator),
            ValidatorKind::Legacy => Box::new(LegacyRetargetValidator::new(
                self.retarget_interval,
                self.target_timespan,
                self.max_target_bits,
            )),
            ValidatorKind::Eda => Box::new(EmergencyDifficultyValidator::new(self.max_target_bits)),
            ValidatorKind::Daa { activation_height } => Box::new(
                DifficultyAdjustmentValidator::new(self.target_spacing, *activation_height),
            ),
            ValidatorKind::DarkGravityWave {
                interval,
                activation_height,
            } => Box::new(DarkGravityWaveValidator::new(
                *interval,
                *interval as i64 * self.target_spacing,
                self.max_target_bits,
                *activation_height,
            )),
        }
    }
}

fn seeds(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|h| h.to_string()).collect()
}
