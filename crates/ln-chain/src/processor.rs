use ln_types::params::TX_GAS;
use ln_types::receipt::RECEIPT_STATUS_SUCCESSFUL;
use ln_types::{Address, Hash, Header, Log, Receipt, Transaction, U256};
use ln_consensus::StateWriter;

use crate::{ChainError, StateDb};

/// Applies value transfers to a [`StateDb`].
///
/// Every transaction costs [`TX_GAS`]; calldata sent to an address is
/// recorded as a single log whose topic is the digest of the data.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateProcessor;

impl StateProcessor {
    /// Apply `transactions` on top of `state`.  Returns the receipts and
    /// total gas used.
    pub fn process(
        &self,
        header: &Header,
        transactions: &[Transaction],
        state: &mut StateDb,
    ) -> Result<(Vec<Receipt>, u64), ChainError> {
        let mut receipts = Vec::with_capacity(transactions.len());
        let mut gas_used = 0u64;
        for (index, tx) in transactions.iter().enumerate() {
            let receipt = self.apply_transaction(header, tx, index, gas_used, state)?;
            gas_used = receipt.cumulative_gas_used;
            receipts.push(receipt);
        }
        Ok((receipts, gas_used))
    }

    pub fn apply_transaction(
        &self,
        header: &Header,
        tx: &Transaction,
        index: usize,
        cumulative_gas: u64,
        state: &mut StateDb,
    ) -> Result<Receipt, ChainError> {
        let expected = state.nonce(&tx.from);
        if tx.nonce != expected {
            return Err(ChainError::InvalidTransaction(format!(
                "nonce {} from {}, expected {expected}",
                tx.nonce, tx.from
            )));
        }
        if tx.gas < TX_GAS {
            return Err(ChainError::InvalidTransaction(format!(
                "intrinsic gas too low: {} < {TX_GAS}",
                tx.gas
            )));
        }
        if cumulative_gas + TX_GAS > header.gas_limit {
            return Err(ChainError::InvalidTransaction("block gas limit reached".into()));
        }
        let fee = tx.gas_price * U256::from(TX_GAS);
        if !state.sub_balance(&tx.from, tx.value + fee) {
            return Err(ChainError::InvalidTransaction(format!(
                "insufficient funds for {}",
                tx.from
            )));
        }
        state.set_nonce(&tx.from, tx.nonce + 1);
        if let Some(to) = &tx.to {
            state.add_balance(to, tx.value);
        }
        state.add_balance(&header.coinbase, fee);

        let tx_hash = tx.hash();
        let logs = match (&tx.to, tx.data.is_empty()) {
            (Some(to), false) => vec![transfer_log(to, header, tx, tx_hash, index)],
            _ => Vec::new(),
        };
        Ok(Receipt::new(
            RECEIPT_STATUS_SUCCESSFUL,
            cumulative_gas + TX_GAS,
            TX_GAS,
            tx_hash,
            logs,
        ))
    }
}

fn transfer_log(to: &Address, header: &Header, tx: &Transaction, tx_hash: Hash, index: usize) -> Log {
    Log {
        address: *to,
        topics: vec![Hash::digest(&tx.data)],
        data: tx.data.clone(),
        block_number: header.number,
        tx_hash,
        tx_index: index as u32,
        ..Log::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(who: Address) -> StateDb {
        let mut state = StateDb::new();
        state.add_balance(&who, U256::from(1_000_000_000u64));
        state
    }

    fn header() -> Header {
        Header {
            coinbase: Address([0xcc; 20]),
            gas_limit: 1_000_000,
            ..Header::default()
        }
    }

    #[test]
    fn transfer_moves_value_and_pays_fee() {
        let from = Address([1u8; 20]);
        let to = Address([2u8; 20]);
        let mut state = funded(from);
        let tx = Transaction::new(from, 0, Some(to), U256::from(100), TX_GAS, U256::from(2), Vec::new());
        let (receipts, gas) = StateProcessor.process(&header(), &[tx], &mut state).unwrap();
        assert_eq!(gas, TX_GAS);
        assert!(receipts[0].logs.is_empty());
        assert_eq!(state.balance(&to), U256::from(100));
        assert_eq!(state.balance(&header().coinbase), U256::from(2 * TX_GAS));
        assert_eq!(state.nonce(&from), 1);
    }

    #[test]
    fn calldata_produces_one_log() {
        let from = Address([1u8; 20]);
        let to = Address([2u8; 20]);
        let mut state = funded(from);
        let tx = Transaction::new(from, 0, Some(to), U256::zero(), TX_GAS, U256::one(), b"ping".to_vec());
        let (receipts, _) = StateProcessor.process(&header(), &[tx], &mut state).unwrap();
        assert_eq!(receipts[0].logs.len(), 1);
        assert!(receipts[0].bloom.contains(to.as_bytes()));
    }

    #[test]
    fn nonce_gap_is_rejected() {
        let from = Address([1u8; 20]);
        let mut state = funded(from);
        let tx = Transaction::new(from, 3, None, U256::zero(), TX_GAS, U256::one(), Vec::new());
        assert!(StateProcessor.process(&header(), &[tx], &mut state).is_err());
    }
}
