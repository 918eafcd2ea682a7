use std::collections::BTreeMap;

/// Currency balances of the entities taking part in the market.
///
/// An account is created on its first credit, even a zero one, and survives
/// across ticks until [`Ledger::reset`].
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    accounts: BTreeMap<String, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&mut self, id: &str, amount: u64) {
        match self.accounts.get_mut(id) {
            Some(balance) => *balance = balance.saturating_add(amount),
            None => {
                self.accounts.insert(id.to_string(), amount);
            }
        }
    }

    /// Removes at most the current balance and returns what was removed.
    pub fn debit(&mut self, id: &str, amount: u64) -> u64 {
        let Some(balance) = self.accounts.get_mut(id) else {
            return 0;
        };
        let debited = amount.min(*balance);
        *balance -= debited;
        debited
    }

    pub fn balance(&self, id: &str) -> u64 {
        self.accounts.get(id).copied().unwrap_or(0)
    }

    /// Zeroes every balance, keeping the accounts themselves.
    pub fn reset(&mut self) {
        self.accounts.values_mut().for_each(|balance| *balance = 0);
    }

    pub fn accounts(&self) -> &BTreeMap<String, u64> {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
