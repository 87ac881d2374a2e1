//! Builders for wire frames and subscription requests.

use std::collections::HashMap;

use crate::transport::frame::{
    CommitmentLevel, ServerFrame, SubscribeRequest, TransactionFilter, TransactionUpdate,
};

/// A subscribe-everything request at confirmed commitment.
pub fn subscribe_all() -> SubscribeRequest {
    SubscribeRequest::new(HashMap::new(), CommitmentLevel::Confirmed)
}

/// A request filtering on a single named account set.
pub fn subscribe_accounts(name: &str, accounts: &[&str]) -> SubscribeRequest {
    let mut filters = HashMap::new();
    filters.insert(
        name.to_string(),
        TransactionFilter {
            include_failed: Some(false),
            account_include: accounts.iter().map(|a| (*a).to_string()).collect(),
            account_exclude: Vec::new(),
        },
    );
    SubscribeRequest::new(filters, CommitmentLevel::Confirmed)
}

/// A data frame carrying the given signature.
pub fn transaction(signature: &[u8]) -> ServerFrame {
    ServerFrame::transaction(TransactionUpdate {
        signature: signature.to_vec(),
        slot: 1,
        payload: vec![0x01],
    })
}

/// A data frame with no extractable signature.
pub fn unsigned_transaction() -> ServerFrame {
    ServerFrame::transaction(TransactionUpdate {
        signature: Vec::new(),
        slot: 1,
        payload: vec![0x01],
    })
}

/// A pong frame echoing `id`.
pub fn pong(id: u64) -> ServerFrame {
    ServerFrame::pong(id)
}
