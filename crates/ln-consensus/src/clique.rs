//! Proof-of-authority engine.
//!
//! The signer set lives in the extra-data of checkpoint headers:
//! `vanity (32) || signers (20 each) || seal (96)`.  Every other header
//! carries only vanity and seal.

use std::sync::Arc;
use std::time::Duration;

use ln_types::{Address, Block, CliqueConfig, Hash, Header, Receipt, RpcApi, Transaction, U256};
use parking_lot::RwLock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::signature::{recover, SignFn, SIGNATURE_LENGTH};
use crate::{ChainReader, ConsensusError, StateWriter};

/// Bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = SIGNATURE_LENGTH;

/// Difficulty of a block signed by the in-turn signer.
pub const DIFF_IN_TURN: u64 = 2;

/// Difficulty of a block signed out of turn.
pub const DIFF_NO_TURN: u64 = 1;

/// Random delay granularity per signer for out-of-turn blocks.
const WIGGLE_TIME: Duration = Duration::from_millis(500);

const ALLOWED_FUTURE_BLOCK_TIME: u64 = 15;

struct Inner {
    config: CliqueConfig,
    signer: RwLock<Option<(Address, SignFn)>>,
}

#[derive(Clone)]
pub struct Clique {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Clique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clique")
            .field("config", &self.inner.config)
            .field("signer", &self.signer())
            .finish()
    }
}

/// Build checkpoint extra-data listing `signers`.
pub fn checkpoint_extra(vanity: &[u8], signers: &[Address]) -> Vec<u8> {
    let mut extra = vec![0u8; EXTRA_VANITY];
    let n = vanity.len().min(EXTRA_VANITY);
    extra[..n].copy_from_slice(&vanity[..n]);
    for signer in signers {
        extra.extend_from_slice(signer.as_bytes());
    }
    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
    extra
}

/// Signers listed in checkpoint extra-data, sorted ascending.
pub fn parse_signers(extra: &[u8]) -> Result<Vec<Address>, ConsensusError> {
    if extra.len() < EXTRA_VANITY {
        return Err(ConsensusError::MissingVanity);
    }
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(ConsensusError::MissingSignature);
    }
    let list = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
    if list.len() % Address::LEN != 0 {
        return Err(ConsensusError::InvalidCheckpointSigners);
    }
    let mut signers = list
        .chunks(Address::LEN)
        .map(Address::from_slice)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConsensusError::InvalidCheckpointSigners)?;
    signers.sort();
    Ok(signers)
}

impl Clique {
    pub fn new(config: CliqueConfig) -> Self {
        let config = CliqueConfig {
            epoch: if config.epoch == 0 { 30_000 } else { config.epoch },
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                signer: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> CliqueConfig {
        self.inner.config
    }

    /// The authorized signing address, if any.
    pub fn signer(&self) -> Option<Address> {
        self.inner.signer.read().as_ref().map(|(addr, _)| *addr)
    }

    /// Inject the key used to seal new blocks.
    pub fn authorize(&self, signer: Address, sign_fn: SignFn) {
        *self.inner.signer.write() = Some((signer, sign_fn));
    }

    /// Recover the signer of a sealed header.
    pub fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        if header.extra.len() < EXTRA_SEAL {
            return Err(ConsensusError::MissingSignature);
        }
        let seal = &header.extra[header.extra.len() - EXTRA_SEAL..];
        recover(&header.hash_without_extra_seal(EXTRA_SEAL), seal)
    }

    /// Signer set in force for block `number`.  A checkpoint header defines
    /// its own set.
    pub fn signers(&self, chain: &dyn ChainReader, header: &Header) -> Result<Vec<Address>, ConsensusError> {
        let checkpoint = header.number - header.number % self.inner.config.epoch;
        if checkpoint == header.number {
            return parse_signers(&header.extra);
        }
        let source = chain
            .get_header_by_number(checkpoint)
            .ok_or(ConsensusError::UnknownAncestor(header.parent_hash))?;
        parse_signers(&source.extra)
    }

    fn in_turn(signers: &[Address], number: u64, signer: &Address) -> bool {
        if signers.is_empty() {
            return false;
        }
        signers[(number % signers.len() as u64) as usize] == *signer
    }

    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Ok(());
        }
        if header.time > now() + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::FutureBlock);
        }
        if header.extra.len() < EXTRA_VANITY {
            return Err(ConsensusError::MissingVanity);
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(ConsensusError::MissingSignature);
        }
        let checkpoint = header.number % self.inner.config.epoch == 0;
        let list_len = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        if !checkpoint && list_len != 0 {
            return Err(ConsensusError::InvalidCheckpointSigners);
        }
        if checkpoint && list_len % Address::LEN != 0 {
            return Err(ConsensusError::InvalidCheckpointSigners);
        }
        if !header.mix_digest.is_zero() {
            return Err(ConsensusError::InvalidMixDigest);
        }
        if header.difficulty != U256::from(DIFF_IN_TURN) && header.difficulty != U256::from(DIFF_NO_TURN) {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty.to_string(),
                want: "1 or 2".into(),
            });
        }
        let parent = chain
            .get_header(&header.parent_hash, header.number - 1)
            .ok_or(ConsensusError::UnknownAncestor(header.parent_hash))?;
        if parent.time + self.inner.config.period > header.time {
            return Err(ConsensusError::InvalidTimestamp);
        }
        if seal {
            self.verify_seal(chain, header)?;
        }
        Ok(())
    }

    /// Check the seal was produced by an authorized signer with the
    /// difficulty matching its turn.
    pub fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Err(ConsensusError::InvalidNumber {
                have: 0,
                want: 1,
            });
        }
        let signer = self.author(header)?;
        let signers = self.signers(chain, header)?;
        if !signers.contains(&signer) {
            return Err(ConsensusError::Unauthorized(signer));
        }
        let want = if Self::in_turn(&signers, header.number, &signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        };
        if header.difficulty != U256::from(want) {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty.to_string(),
                want: want.to_string(),
            });
        }
        Ok(())
    }

    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError> {
        let parent = header
            .number
            .checked_sub(1)
            .and_then(|n| chain.get_header(&header.parent_hash, n))
            .ok_or(ConsensusError::UnknownAncestor(header.parent_hash))?;

        header.coinbase = Address::zero();
        header.nonce = 0;
        header.mix_digest = Hash::zero();

        let signers = self.signers(chain, &parent)?;
        header.difficulty = self.calc_difficulty(&signers, header.number);

        let vanity = header.extra.clone();
        header.extra = if header.number % self.inner.config.epoch == 0 {
            checkpoint_extra(&vanity, &signers)
        } else {
            checkpoint_extra(&vanity, &[])
        };

        header.time = (parent.time + self.inner.config.period).max(now());
        Ok(())
    }

    /// Difficulty the local signer would seal block `number` with.
    pub fn calc_difficulty(&self, signers: &[Address], number: u64) -> U256 {
        match self.signer() {
            Some(signer) if Self::in_turn(signers, number, &signer) => U256::from(DIFF_IN_TURN),
            _ => U256::from(DIFF_NO_TURN),
        }
    }

    /// No block rewards under proof-of-authority.
    pub fn finalize(
        &self,
        mut header: Header,
        state: &mut dyn StateWriter,
        transactions: Vec<Transaction>,
        receipts: &[Receipt],
    ) -> Block {
        header.state_root = state.intermediate_root();
        Block::new(header, transactions, receipts)
    }

    /// Wait for the block's slot and sign it.  Returns `Ok(None)` if `stop`
    /// fires while waiting.
    pub async fn seal(
        &self,
        chain: &dyn ChainReader,
        block: &Block,
        stop: CancellationToken,
    ) -> Result<Option<Block>, ConsensusError> {
        let header = &block.header;
        if header.number == 0 {
            return Err(ConsensusError::InvalidNumber { have: 0, want: 1 });
        }
        if self.inner.config.period == 0 && block.transactions.is_empty() {
            return Err(ConsensusError::WaitTransactions);
        }
        let (signer, sign_fn) = self
            .inner
            .signer
            .read()
            .clone()
            .ok_or(ConsensusError::SignerMissing)?;

        let signers = self.signers(chain, header)?;
        if !signers.contains(&signer) {
            return Err(ConsensusError::Unauthorized(signer));
        }

        let mut delay = Duration::from_secs(header.time.saturating_sub(now()));
        if header.difficulty == U256::from(DIFF_NO_TURN) {
            let wiggle = WIGGLE_TIME * (signers.len() as u32 / 2 + 1);
            delay += rand::thread_rng().gen_range(Duration::ZERO..=wiggle);
            trace!(?wiggle, "Out-of-turn signing requested");
        }
        debug!(number = header.number, ?delay, "Waiting for slot to sign and propagate");

        tokio::select! {
            _ = stop.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }

        let sighash = header.hash_without_extra_seal(EXTRA_SEAL);
        let signature = sign_fn(&signer, &sighash).map_err(ConsensusError::SignFailed)?;
        if signature.len() != EXTRA_SEAL {
            return Err(ConsensusError::InvalidSignature);
        }
        let mut sealed = header.clone();
        let start = sealed.extra.len() - EXTRA_SEAL;
        sealed.extra[start..].copy_from_slice(&signature);
        Ok(Some(block.with_seal(sealed)))
    }

    pub fn apis(&self, chain: Arc<dyn ChainReader>) -> Vec<RpcApi> {
        vec![RpcApi::new(
            "clique",
            "1.0",
            CliqueApi {
                chain,
                clique: self.clone(),
            },
            true,
        )]
    }
}

/// `clique` RPC namespace.
pub struct CliqueApi {
    chain: Arc<dyn ChainReader>,
    clique: Clique,
}

impl CliqueApi {
    /// Signers authorized at `number`, or at the head when `None`.
    pub fn get_signers(&self, number: Option<u64>) -> Result<Vec<Address>, ConsensusError> {
        let header = match number {
            Some(n) => self
                .chain
                .get_header_by_number(n)
                .ok_or(ConsensusError::InvalidNumber { have: n, want: n })?,
            None => self.chain.current_header(),
        };
        self.clique.signers(self.chain.as_ref(), &header)
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
