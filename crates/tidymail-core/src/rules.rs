use std::collections::HashMap;

use crate::senders::normalize_address;
use crate::stores::{PSEUDO_LABELS, RuleStore, SenderLabels, StoreError, Unsubscribed};

/// What the rule-based organizer does with mail from one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePolicy {
    Label(String),
    /// Move to the trash; never labelled.
    Unsubscribed,
}

/// Address → policy, built once per run.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    policies: HashMap<String, RulePolicy>,
}

impl RuleTable {
    /// Label entries are read first and unsubscribes last, so an unsubscribed
    /// address never keeps a label policy.
    pub fn build(labels: &SenderLabels, unsubscribed: &Unsubscribed) -> Self {
        let mut policies = HashMap::new();

        for (label, addresses) in labels {
            if PSEUDO_LABELS.contains(&label.as_str()) {
                continue;
            }
            for address in addresses {
                policies.insert(normalize_address(address), RulePolicy::Label(label.clone()));
            }
        }

        for (address, active) in unsubscribed {
            if *active {
                policies.insert(normalize_address(address), RulePolicy::Unsubscribed);
            }
        }

        Self { policies }
    }

    pub async fn load(store: &RuleStore) -> Result<Self, StoreError> {
        let labels = store.load_labels().await?;
        let unsubscribed = store.load_unsubscribed().await?;
        Ok(Self::build(&labels, &unsubscribed))
    }

    pub fn policy_for(&self, address: &str) -> Option<&RulePolicy> {
        self.policies.get(address)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
