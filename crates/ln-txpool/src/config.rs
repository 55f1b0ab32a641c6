use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Transaction pool policy.
#[derive(Debug, Clone)]
pub struct TxPoolConfig {
    /// Treat every transaction as remote.
    pub no_locals: bool,
    /// Local transaction journal, relative to the data directory unless
    /// absolute.  Empty disables journaling.
    pub journal: PathBuf,
    /// Interval between journal rewrites.
    pub rejournal: Duration,
    /// Minimum gas price for remote transactions.
    pub price_limit: u64,
    /// Percentage a replacement must raise the gas price by.
    pub price_bump: u64,
    /// Executable slots guaranteed per account.
    pub account_slots: u64,
    /// Executable slots across all accounts.
    pub global_slots: u64,
    /// Non-executable slots per account.
    pub account_queue: u64,
    /// Non-executable slots across all accounts.
    pub global_queue: u64,
    /// How long a non-executable transaction may stay queued.
    pub lifetime: Duration,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            no_locals: false,
            journal: PathBuf::from("transactions.rlp"),
            rejournal: Duration::from_secs(60 * 60),
            price_limit: 1,
            price_bump: 10,
            account_slots: 16,
            global_slots: 4096,
            account_queue: 64,
            global_queue: 1024,
            lifetime: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl TxPoolConfig {
    /// Replace unusable values with defaults.
    pub fn sanitize(&self) -> Self {
        let defaults = Self::default();
        let mut conf = self.clone();
        if conf.rejournal < Duration::from_secs(1) {
            warn!(provided = ?conf.rejournal, updated = ?Duration::from_secs(1), "Sanitizing invalid txpool journal time");
            conf.rejournal = Duration::from_secs(1);
        }
        if conf.price_limit < 1 {
            warn!(provided = conf.price_limit, updated = defaults.price_limit, "Sanitizing invalid txpool price limit");
            conf.price_limit = defaults.price_limit;
        }
        if conf.price_bump < 1 {
            warn!(provided = conf.price_bump, updated = defaults.price_bump, "Sanitizing invalid txpool price bump");
            conf.price_bump = defaults.price_bump;
        }
        conf
    }

    /// A journal-less pool for tests and light nodes.
    pub fn without_journal() -> Self {
        Self {
            journal: PathBuf::new(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_defaults() {
        let conf = TxPoolConfig {
            price_limit: 0,
            price_bump: 0,
            rejournal: Duration::ZERO,
            ..TxPoolConfig::default()
        }
        .sanitize();
        assert_eq!(conf.price_limit, 1);
        assert_eq!(conf.price_bump, 10);
        assert_eq!(conf.rejournal, Duration::from_secs(1));
    }
}
