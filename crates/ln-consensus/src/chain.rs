use ln_types::{Address, ChainConfig, Hash, Header, U256};

/// Read access to the local header chain, as needed by header verification
/// and block preparation.
pub trait ChainReader: Send + Sync {
    fn config(&self) -> ChainConfig;

    fn current_header(&self) -> Header;

    fn get_header(&self, hash: &Hash, number: u64) -> Option<Header>;

    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    fn get_header_by_hash(&self, hash: &Hash) -> Option<Header>;
}

/// The slice of mutable state an engine touches while finalising a block.
pub trait StateWriter {
    fn add_balance(&mut self, address: &Address, amount: U256);

    /// Root committing to the current state.
    fn intermediate_root(&self) -> Hash;
}
