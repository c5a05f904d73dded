// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The invocation journal: a bounded, ordered record of every replayed call.

use std::collections::VecDeque;

use cmdmox_proto::Invocation;

/// Ordered sequence of finalized invocations.
///
/// Entries are appended after response determination, so the order equals
/// response-completion order. With a bound configured, the oldest entries
/// are evicted FIFO once the bound is exceeded.
#[derive(Debug, Default)]
pub struct Journal {
    entries: VecDeque<Invocation>,
    max_entries: Option<usize>,
}

impl Journal {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn push(&mut self, invocation: Invocation) {
        if let Some(bound) = self.max_entries {
            while self.entries.len() >= bound {
                self.entries.pop_front();
            }
        }
        self.entries.push_back(invocation);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Invocation> {
        self.entries.iter()
    }

    /// Owned copy of the journal in order, for verification and inspection.
    pub fn snapshot(&self) -> Vec<Invocation> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn invocation(command: &str) -> Invocation {
        Invocation::new(command, Vec::new(), "", BTreeMap::new(), command)
    }

    #[test]
    fn bounded_journal_evicts_fifo() {
        let mut journal = Journal::new(Some(2));
        journal.push(invocation("alpha"));
        journal.push(invocation("beta"));
        journal.push(invocation("gamma"));

        let commands: Vec<&str> = journal.iter().map(|inv| inv.command.as_str()).collect();
        assert_eq!(commands, ["beta", "gamma"]);
    }

    #[test]
    fn unbounded_journal_keeps_everything() {
        let mut journal = Journal::new(None);
        for index in 0..100 {
            journal.push(invocation(&format!("cmd{index}")));
        }
        assert_eq!(journal.len(), 100);
    }
}
