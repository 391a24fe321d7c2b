//! Immutable per-network parameter bundles.
//!
//! All consensus-relevant constants live here: packet magic, genesis block,
//! proof-of-work limits, difficulty retargeting, the subsidy schedule and
//! the mandatory checkpoint table. Parameters are immutable once built;
//! tests that need unusual values construct a bespoke bundle rather than
//! mutating a shared one.

use crate::{Block, BlockHeader, Sha256dHash, Transaction, TxInput, TxOutput, COIN};
use num_bigint::BigUint;
use num_traits::One;
use std::collections::HashMap;

/// Identifies which chain a parameter bundle describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// Local testing with trivial proof of work.
    UnitTest,
}

/// The parameter bundle for one network.
#[derive(Debug, Clone)]
pub struct NetworkParameters {
    /// Which network this bundle describes.
    pub network: Network,
    /// First four bytes of every message frame, as a big-endian u32.
    pub packet_magic: u32,
    /// Default TCP port.
    pub default_port: u16,
    /// Version byte for pay-to-pubkey-hash addresses.
    pub address_header: u8,
    /// Version byte for dumped private keys.
    pub dumped_private_key_header: u8,
    /// Easiest allowed proof-of-work target.
    pub max_target: BigUint,
    /// The genesis block.
    pub genesis: Block,
    /// Blocks between subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Depth a coinbase output must reach before it may be spent.
    pub spendable_coinbase_depth: u32,
    /// Blocks between difficulty retargets.
    pub retarget_interval: u32,
    /// Expected wall-clock seconds per retarget interval.
    pub target_timespan_secs: u32,
    /// Mandatory block hashes at fixed heights.
    pub checkpoints: HashMap<u32, Sha256dHash>,
}

impl NetworkParameters {
    /// Production network parameters.
    pub fn mainnet() -> Self {
        let checkpoints = [
            (
                91722u32,
                "00000000000271a2dc26e7667f8419f2e15416dc6955e5a6c6cdf3f2574dd08e",
            ),
            (
                91812,
                "00000000000af0aed4792b1acee3d966af36cf5def14935db8de83d6f9306f2f",
            ),
            (
                91842,
                "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
            ),
            (
                91880,
                "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
            ),
            (
                200000,
                "000000000000034a7dedef4a161fa058a2d67a173a90155f3a2fe6fc132e0ebf",
            ),
        ]
        .into_iter()
        .map(|(height, hash)| (height, Sha256dHash::from_hex(hash).expect("static hash")))
        .collect();

        Self {
            network: Network::Mainnet,
            packet_magic: 0xF9BE_B4D9,
            default_port: 8333,
            address_header: 0,
            dumped_private_key_header: 128,
            max_target: BigUint::from(0xFFFFu32) << (8usize * (0x1D - 3)),
            genesis: genesis_block(1_231_006_505, 0x1D00_FFFF, 2_083_236_893),
            subsidy_halving_interval: 210_000,
            spendable_coinbase_depth: 100,
            retarget_interval: 2016,
            target_timespan_secs: 14 * 24 * 60 * 60,
            checkpoints,
        }
    }

    /// Public test network parameters.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            packet_magic: 0x0B11_0907,
            default_port: 18333,
            address_header: 111,
            dumped_private_key_header: 239,
            max_target: BigUint::from(0xFFFFu32) << (8usize * (0x1D - 3)),
            genesis: genesis_block(1_296_688_602, 0x1D00_FFFF, 414_098_458),
            subsidy_halving_interval: 210_000,
            spendable_coinbase_depth: 100,
            retarget_interval: 2016,
            target_timespan_secs: 14 * 24 * 60 * 60,
            checkpoints: HashMap::new(),
        }
    }

    /// Parameters for unit tests: the target admits every hash, so blocks
    /// never need solving, and the retarget interval is far away.
    pub fn unit_tests() -> Self {
        Self {
            network: Network::UnitTest,
            packet_magic: 0x0B11_0907,
            default_port: 18333,
            address_header: 111,
            dumped_private_key_header: 239,
            max_target: BigUint::one() << 256u32,
            genesis: genesis_block(1_296_688_602, 0x2101_0000, 0),
            subsidy_halving_interval: 210_000,
            spendable_coinbase_depth: 100,
            retarget_interval: 10_000,
            target_timespan_secs: 10_000 * 600,
            checkpoints: HashMap::new(),
        }
    }

    /// A copy of these parameters with a different retarget interval.
    /// Tests use this instead of mutating shared state.
    pub fn with_retarget_interval(mut self, interval: u32) -> Self {
        self.retarget_interval = interval;
        self.target_timespan_secs = interval * 600;
        self
    }

    /// A copy with a different coinbase maturity depth.
    pub fn with_spendable_coinbase_depth(mut self, depth: u32) -> Self {
        self.spendable_coinbase_depth = depth;
        self
    }

    /// A copy with an extra checkpoint.
    pub fn with_checkpoint(mut self, height: u32, hash: Sha256dHash) -> Self {
        self.checkpoints.insert(height, hash);
        self
    }

    /// Block subsidy at the given height, following the halving schedule.
    pub fn subsidy(&self, height: u32) -> i64 {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            0
        } else {
            (50 * COIN) >> halvings
        }
    }

    /// Mandatory hash at a checkpointed height, if any.
    pub fn checkpoint_at(&self, height: u32) -> Option<&Sha256dHash> {
        self.checkpoints.get(&height)
    }

    /// Expected seconds between blocks.
    pub fn target_spacing_secs(&self) -> u32 {
        self.target_timespan_secs / self.retarget_interval
    }
}

/// Build the genesis block shared by all networks, varying only the header
/// fields that differ per chain.
fn genesis_block(time: u32, bits: u32, nonce: u32) -> Block {
    // "The Times 03/Jan/2009 Chancellor on brink of second bailout for
    // banks", preceded by the difficulty and a push of 0x04.
    let script_sig = hex::decode(
        "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e20627\
         2696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73",
    )
    .expect("static script");

    // Push of Satoshi's public key followed by OP_CHECKSIG.
    let script_pubkey = hex::decode(
        "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f3550\
         4e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
    )
    .expect("static script");

    let mut coinbase = Transaction::new();
    coinbase.add_input(TxInput::coinbase(script_sig));
    coinbase.add_output(TxOutput::new(50 * COIN, script_pubkey));

    let header = BlockHeader {
        version: 1,
        prev_hash: Sha256dHash::ZERO,
        merkle_root: coinbase.hash(),
        time,
        bits,
        nonce,
    };

    Block::new(header, vec![coinbase])
}
