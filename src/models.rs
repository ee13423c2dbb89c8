/// Data Models Module
///
/// This module defines the core data structures used throughout the application.
/// These models represent chain data (blocks, operation groups, operations,
/// account snapshots) decoded from node RPC payloads, plus the fee-band record
/// persisted by the aggregation pass.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Sentinel level returned by max-level queries when no rows exist yet.
pub const NO_LEVEL: i64 = -1;

/// Block header fields as reported by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub level: i64,
    pub predecessor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fitness: Vec<String>,
    pub operations_hash: Option<String>,
    pub signature: Option<String>,
}

/// A decoded block: header plus the operation groups it contains.
///
/// Immutable once constructed; written once per sync pass, and re-written
/// only when re-fetched during fork resolution.
#[derive(Debug, Clone)]
pub struct Block {
    pub hash: String,
    pub protocol: String,
    pub header: BlockHeader,
    pub operation_groups: Vec<OperationGroup>,
}

/// A group of operations sharing one group hash, belonging to one block
#[derive(Debug, Clone)]
pub struct OperationGroup {
    pub hash: String,
    pub block_id: String,
    pub operations: Vec<Operation>,
}

/// A single typed chain action with kind-specific optional fields.
///
/// Denormalizes the parent block's hash, level, and timestamp so fee
/// sampling and the query layer never need a join back to blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub delegate: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub amount: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub fee: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub balance: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub gas_limit: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub storage_limit: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub counter: Option<i64>,
    #[serde(skip)]
    pub block_hash: String,
    #[serde(skip)]
    pub block_level: i64,
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Operation kinds tracked by the fee aggregation pass
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Transaction,
    Origination,
    Delegation,
    Reveal,
    Endorsement,
    Ballot,
    Proposals,
    SeedNonceRevelation,
    ActivateAccount,
}

impl OperationKind {
    /// Kinds that carry a fee and therefore get a fee band computed
    pub const FEE_KINDS: [OperationKind; 4] =
        [Self::Transaction, Self::Origination, Self::Delegation, Self::Reveal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Origination => "origination",
            Self::Delegation => "delegation",
            Self::Reveal => "reveal",
            Self::Endorsement => "endorsement",
            Self::Ballot => "ballot",
            Self::Proposals => "proposals",
            Self::SeedNonceRevelation => "seed_nonce_revelation",
            Self::ActivateAccount => "activate_account",
        }
    }
}

/// Account state snapshot as of a given block level.
///
/// Keyed by (account_id, block_level); older snapshots are retained for
/// history until the purge pass removes them.
#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: String,
    pub block_id: String,
    pub block_level: i64,
    pub manager: Option<String>,
    pub spendable: bool,
    pub delegate_setable: bool,
    pub delegate_value: Option<String>,
    pub balance: i64,
    pub counter: i64,
    pub script: Option<String>,
}

/// Fee band estimate for one operation kind
#[derive(Debug, Clone, PartialEq)]
pub struct AverageFees {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
}

/// A row of the invalidated-blocks ledger used for fork resolution
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvalidatedBlock {
    pub hash: String,
    pub level: i64,
    pub is_invalidated: bool,
}

// ---------------------------------------------------------------------------
// Wire decoding
// ---------------------------------------------------------------------------

/// Block payload shape without the operations nesting, as decoded from
/// `blocks/{id}`
#[derive(Deserialize)]
struct RawShell {
    protocol: String,
    hash: String,
    header: BlockHeader,
}

/// The parts of the payload the operations decoding needs
#[derive(Deserialize)]
struct RawOperationsView {
    hash: String,
    header: BlockHeader,
    #[serde(default)]
    operations: Vec<Vec<RawOperationGroup>>,
}

#[derive(Deserialize)]
struct RawOperationGroup {
    hash: String,
    #[serde(default)]
    contents: Vec<Operation>,
}

impl Block {
    /// Decode only the block shell (hash, protocol, header) from a block
    /// payload, leaving the operation groups empty. Paired with
    /// [`decode_operation_groups`] over the same payload by the block
    /// fetcher's `add_decoding` composition.
    pub fn decode_shell(payload: &Value) -> Result<Block> {
        let raw = RawShell::deserialize(payload).context("Failed to decode block payload")?;
        Ok(Block { hash: raw.hash, protocol: raw.protocol, header: raw.header, operation_groups: Vec::new() })
    }

    /// Decode a complete block, shell and operation groups, from one payload
    pub fn decode(payload: &Value) -> Result<Block> {
        let mut block = Self::decode_shell(payload)?;
        block.operation_groups = decode_operation_groups(payload)?;
        Ok(block)
    }
}

/// Decode the operation groups of a block payload, flattening the node's
/// validation-pass nesting and stamping every operation with the parent
/// block's hash, level, and timestamp.
pub fn decode_operation_groups(payload: &Value) -> Result<Vec<OperationGroup>> {
    let raw = RawOperationsView::deserialize(payload).context("Failed to decode block operations")?;

    Ok(raw
        .operations
        .into_iter()
        .flatten()
        .map(|group| OperationGroup {
            block_id: raw.hash.clone(),
            operations: group
                .contents
                .into_iter()
                .map(|mut op| {
                    op.block_hash = raw.hash.clone();
                    op.block_level = raw.header.level;
                    op.timestamp = Some(raw.header.timestamp);
                    op
                })
                .collect(),
            hash: group.hash,
        })
        .collect())
}

/// Raw account (contract) payload shape as returned by `context/contracts/{id}`
#[derive(Deserialize)]
struct RawAccount {
    #[serde(default)]
    manager: Option<String>,
    #[serde(default)]
    spendable: Option<bool>,
    #[serde(default)]
    delegate: Option<RawDelegate>,
    #[serde(deserialize_with = "de_opt_i64", default)]
    balance: Option<i64>,
    #[serde(deserialize_with = "de_opt_i64", default)]
    counter: Option<i64>,
    #[serde(default)]
    script: Option<Value>,
}

#[derive(Deserialize)]
struct RawDelegate {
    #[serde(default)]
    setable: Option<bool>,
    #[serde(default)]
    value: Option<String>,
}

impl Account {
    /// Decode an account payload into a snapshot tagged with the block it
    /// was observed at.
    pub fn decode(account_id: String, block_id: String, block_level: i64, payload: Value) -> Result<Account> {
        let raw: RawAccount =
            serde_json::from_value(payload).with_context(|| format!("Failed to decode account {account_id}"))?;

        let (delegate_setable, delegate_value) = match raw.delegate {
            Some(d) => (d.setable.unwrap_or(false), d.value),
            None => (false, None),
        };

        Ok(Account {
            account_id,
            block_id,
            block_level,
            manager: raw.manager,
            spendable: raw.spendable.unwrap_or(false),
            delegate_setable,
            delegate_value,
            balance: raw.balance.unwrap_or(0),
            counter: raw.counter.unwrap_or(0),
            script: raw.script.map(|s| s.to_string()),
        })
    }
}

/// The node encodes mutez amounts and counters as decimal strings; accept
/// either a string or a plain JSON number.
fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse::<i64>().map(Some).map_err(de::Error::custom),
        Some(Value::Number(n)) => {
            n.as_i64().map(Some).ok_or_else(|| de::Error::custom("numeric field out of i64 range"))
        }
        Some(other) => Err(de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_block_flattens_operations() {
        let payload = json!({
            "protocol": "PsddFKi32cMJ2qPjf43Qv5GDWLDPZb3T3bF6fLKiF5HtvHNU7aP",
            "hash": "BLockHash111",
            "header": {
                "level": 100,
                "predecessor": "BLockHash110",
                "timestamp": "2019-04-18T12:00:00Z",
                "fitness": ["00", "000000000005f2f2"],
                "operations_hash": "LLoaPtpI",
                "signature": "sigSample"
            },
            "operations": [
                [{"hash": "opGroupA", "contents": [
                    {"kind": "endorsement", "level": 99}
                ]}],
                [{"hash": "opGroupB", "contents": [
                    {"kind": "transaction", "source": "tz1Src", "destination": "tz1Dst",
                     "fee": "1278", "amount": "42000000", "gas_limit": "10100",
                     "storage_limit": "0", "counter": "5"}
                ]}]
            ]
        });

        let block = Block::decode(&payload).unwrap();
        assert_eq!(block.hash, "BLockHash111");
        assert_eq!(block.header.level, 100);
        assert_eq!(block.operation_groups.len(), 2);

        let tx = &block.operation_groups[1].operations[0];
        assert_eq!(tx.kind, "transaction");
        assert_eq!(tx.fee, Some(1278));
        assert_eq!(tx.amount, Some(42_000_000));
        assert_eq!(tx.block_hash, "BLockHash111");
        assert_eq!(tx.block_level, 100);
        assert!(tx.timestamp.is_some());
    }

    #[test]
    fn test_decode_block_rejects_malformed_payload() {
        let payload = json!({"hash": "BLockHash111"});
        assert!(Block::decode(&payload).is_err());
    }

    #[test]
    fn test_decode_shell_leaves_groups_empty() {
        let payload = json!({
            "protocol": "PsddFKi3",
            "hash": "BLockHash111",
            "header": {
                "level": 100,
                "predecessor": "BLockHash110",
                "timestamp": "2019-04-18T12:00:00Z"
            },
            "operations": [[{"hash": "opGroupA", "contents": [{"kind": "endorsement"}]}]]
        });

        let shell = Block::decode_shell(&payload).unwrap();
        assert!(shell.operation_groups.is_empty());

        let groups = decode_operation_groups(&payload).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].block_id, "BLockHash111");
    }

    #[test]
    fn test_decode_account() {
        let payload = json!({
            "manager": "tz1Manager",
            "balance": "4000000",
            "spendable": true,
            "delegate": {"setable": true, "value": "tz1Delegate"},
            "counter": "7"
        });

        let account = Account::decode("tz1Acct".into(), "BLockHash111".into(), 100, payload).unwrap();
        assert_eq!(account.balance, 4_000_000);
        assert_eq!(account.counter, 7);
        assert!(account.spendable);
        assert!(account.delegate_setable);
        assert_eq!(account.delegate_value.as_deref(), Some("tz1Delegate"));
        assert_eq!(account.block_level, 100);
        assert!(account.script.is_none());
    }

    #[test]
    fn test_decode_account_defaults() {
        let account = Account::decode("KT1Thing".into(), "BLockHash111".into(), 100, json!({})).unwrap();
        assert_eq!(account.balance, 0);
        assert!(!account.spendable);
        assert!(account.delegate_value.is_none());
    }

    #[test]
    fn test_operation_kind_as_str() {
        assert_eq!(OperationKind::Transaction.as_str(), "transaction");
        assert_eq!(OperationKind::SeedNonceRevelation.as_str(), "seed_nonce_revelation");
    }
}
