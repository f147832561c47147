//! Reservation scratchpad for mixing output scripts.
//!
//! Every session reserves fresh receiving scripts while preparing its entry.
//! On success they are kept (marked used), on any failure they go back to the
//! key pool. Leaking a reservation silently burns addresses, so the session
//! calls exactly one of [`KeyHolder::keep_all`] / [`KeyHolder::return_all`]
//! on every terminal path.

use crate::tx::Script;
use crate::wallet::{ReservedKey, Wallet};
use crate::Result;

#[derive(Debug, Default)]
pub struct KeyHolder {
    reserved: Vec<ReservedKey>,
}

impl KeyHolder {
    pub fn new() -> KeyHolder {
        KeyHolder::default()
    }

    /// Reserve one fresh script from the wallet's key pool.
    pub fn reserve(&mut self, wallet: &dyn Wallet) -> Result<Script> {
        let key = wallet.reserve_key()?;
        let script = key.script.clone();
        self.reserved.push(key);
        Ok(script)
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// Commit all reserved scripts as used.
    pub fn keep_all(&mut self, wallet: &dyn Wallet) {
        let keys = std::mem::take(&mut self.reserved);
        if !keys.is_empty() {
            log::debug!("keys: keeping {} reserved scripts", keys.len());
        }
        for key in &keys {
            wallet.keep_key(key);
        }
    }

    /// Release all reserved scripts back to the pool.
    pub fn return_all(&mut self, wallet: &dyn Wallet) {
        let keys = std::mem::take(&mut self.reserved);
        if !keys.is_empty() {
            log::debug!("keys: returning {} reserved scripts", keys.len());
        }
        for key in keys {
            wallet.return_key(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryWallet;

    #[test]
    fn keep_and_return_are_terminal() {
        let wallet = MemoryWallet::new();
        let mut holder = KeyHolder::new();
        holder.reserve(&wallet).unwrap();
        holder.reserve(&wallet).unwrap();
        assert_eq!(holder.len(), 2);
        assert_eq!(wallet.reserved_key_count(), 2);

        holder.keep_all(&wallet);
        assert!(holder.is_empty());
        assert_eq!(wallet.reserved_key_count(), 0);
        assert_eq!(wallet.kept_key_count(), 2);

        holder.reserve(&wallet).unwrap();
        holder.return_all(&wallet);
        assert!(holder.is_empty());
        assert_eq!(wallet.reserved_key_count(), 0);
        assert_eq!(wallet.kept_key_count(), 2);
    }
}
