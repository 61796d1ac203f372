//! ABI event registry — maps `(contract address, event selector)` to an ABI
//! event descriptor and decodes raw event payloads against it.
//!
//! The registry is built once from the subscriptions registered before
//! `start()` and is immutable afterwards. Decoding walks the ABI's members in
//! declaration order, consuming felts from `keys` for key members (skipping
//! `keys[0]`, the selector) and from `data` for data members.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AbiDecodeError, IndexerError};
use crate::handler::EventHandler;
use crate::selector::{event_selector, normalize_hex};

// ─── ABI model ────────────────────────────────────────────────────────────────

/// Where a member's felts are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbiMemberKind {
    Key,
    Data,
}

/// A single member of a struct-kind ABI event.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiEventMember {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub kind: AbiMemberKind,
}

#[derive(Debug, Clone, Deserialize)]
struct AbiEventEntry {
    name: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    members: Vec<AbiEventMember>,
}

/// Pull the `type == "event"` entries out of a Cairo ABI JSON array.
fn event_entries(abi: &Value) -> Vec<AbiEventEntry> {
    let Some(entries) = abi.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some("event"))
        .filter_map(|e| serde_json::from_value(e.clone()).ok())
        .collect()
}

/// Match an ABI event entry by its fully-qualified name or its trailing
/// path segment (`"Transfer"` matches `"erc20::Token::Transfer"`).
fn matches_name(entry_name: &str, wanted: &str) -> bool {
    entry_name == wanted || entry_name.rsplit("::").next() == Some(wanted)
}

// ─── Subscriptions and registry ───────────────────────────────────────────────

/// A user subscription: which contract, which event, decoded how, handled by
/// whom. Frozen at `start()`.
#[derive(Clone)]
pub struct EventSubscription {
    pub contract_address: String,
    pub event_name: String,
    /// The contract's Cairo ABI as a JSON array.
    pub abi: Value,
    pub handler: Arc<dyn EventHandler>,
}

/// A resolved subscription, keyed into the dispatch table.
#[derive(Clone)]
pub struct RegisteredEvent {
    /// Normalized `starknet_keccak` selector of the event name.
    pub selector: String,
    /// Normalized contract address.
    pub contract_address: String,
    /// Fully-qualified event name from the ABI.
    pub event_name: String,
    pub members: Vec<AbiEventMember>,
    pub handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for RegisteredEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredEvent")
            .field("selector", &self.selector)
            .field("contract_address", &self.contract_address)
            .field("event_name", &self.event_name)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

/// Immutable dispatch table: `(contract, selector)` → registered event.
///
/// The selector is the primary key; collisions across contracts are
/// disambiguated by the contract address.
#[derive(Default, Debug)]
pub struct AbiRegistry {
    entries: HashMap<(String, String), RegisteredEvent>,
}

impl AbiRegistry {
    /// Resolve every subscription against its ABI. Any mismatch (event
    /// missing from the ABI, non-struct event kind, duplicate subscription)
    /// is a configuration error surfaced at `start()`.
    pub fn build(subscriptions: Vec<EventSubscription>) -> Result<Self, IndexerError> {
        let mut entries = HashMap::new();
        for sub in subscriptions {
            let events = event_entries(&sub.abi);
            let entry = events
                .iter()
                .find(|e| matches_name(&e.name, &sub.event_name))
                .ok_or_else(|| {
                    IndexerError::Configuration(format!(
                        "event '{}' not found in ABI for contract {}",
                        sub.event_name, sub.contract_address
                    ))
                })?;
            match entry.kind.as_deref() {
                Some("struct") | None => {}
                Some(other) => {
                    return Err(IndexerError::Configuration(format!(
                        "event '{}' has unsupported kind '{}'",
                        entry.name, other
                    )));
                }
            }

            let selector = event_selector(&entry.name);
            let contract = normalize_hex(&sub.contract_address);
            let key = (contract.clone(), selector.clone());
            if entries.contains_key(&key) {
                return Err(IndexerError::Configuration(format!(
                    "duplicate subscription for event '{}' on contract {}",
                    sub.event_name, contract
                )));
            }
            entries.insert(
                key,
                RegisteredEvent {
                    selector,
                    contract_address: contract,
                    event_name: entry.name.clone(),
                    members: entry.members.clone(),
                    handler: sub.handler,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Look up a registered event by contract address and raw selector.
    /// Both are normalized before the lookup.
    pub fn lookup(&self, contract: &str, selector: &str) -> Option<&RegisteredEvent> {
        self.entries
            .get(&(normalize_hex(contract), normalize_hex(selector)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// Decode a raw `keys`/`data` payload against a registered event descriptor.
///
/// Strict on length: felts left over after the last member, or a member
/// reaching into an exhausted section, fail the decode. The caller persists
/// the event raw in that case.
pub fn decode_event(
    descriptor: &RegisteredEvent,
    keys: &[String],
    data: &[String],
) -> Result<Map<String, Value>, AbiDecodeError> {
    // keys[0] is the selector.
    let mut keys_iter = keys.get(1..).unwrap_or(&[]).iter();
    let mut data_iter = data.iter();
    let mut fields = Map::new();

    for member in &descriptor.members {
        let (section, section_name) = match member.kind {
            AbiMemberKind::Key => (&mut keys_iter, "keys"),
            AbiMemberKind::Data => (&mut data_iter, "data"),
        };
        let value = decode_member(member, section, section_name)?;
        fields.insert(member.name.clone(), value);
    }

    let keys_left = keys_iter.count();
    let data_left = data_iter.count();
    if keys_left > 0 || data_left > 0 {
        return Err(AbiDecodeError::TrailingPayload {
            keys_left,
            data_left,
        });
    }
    Ok(fields)
}

fn decode_member(
    member: &AbiEventMember,
    section: &mut std::slice::Iter<'_, String>,
    section_name: &'static str,
) -> Result<Value, AbiDecodeError> {
    let mut next = || {
        section.next().ok_or(AbiDecodeError::PayloadExhausted {
            field: member.name.clone(),
            section: section_name,
        })
    };

    match short_type(&member.ty) {
        "felt252" | "ContractAddress" | "ClassHash" | "EthAddress" | "StorageAddress"
        | "bytes31" => Ok(Value::String(normalize_hex(next()?))),
        "bool" => {
            let felt = next()?;
            Ok(Value::Bool(parse_felt_u128(felt)? != 0))
        }
        "u8" | "u16" | "u32" | "u64" | "usize" => {
            let felt = next()?;
            let n = parse_felt_u128(felt)?;
            let n = u64::try_from(n).map_err(|_| AbiDecodeError::InvalidFelt {
                value: felt.clone(),
                reason: format!("out of range for {}", member.ty),
            })?;
            Ok(Value::Number(n.into()))
        }
        "u128" => {
            let felt = next()?;
            let n = parse_felt_u128(felt)?;
            match u64::try_from(n) {
                Ok(small) => Ok(Value::Number(small.into())),
                Err(_) => Ok(Value::String(n.to_string())),
            }
        }
        "u256" => {
            let low = next()?.clone();
            let high = next()?.clone();
            Ok(Value::String(combine_u256(&low, &high)?))
        }
        _ => Err(AbiDecodeError::UnsupportedType {
            field: member.name.clone(),
            ty: member.ty.clone(),
        }),
    }
}

/// Trailing path segment of a Cairo type, e.g.
/// `core::starknet::contract_address::ContractAddress` → `ContractAddress`.
fn short_type(ty: &str) -> &str {
    ty.rsplit("::").next().unwrap_or(ty)
}

fn parse_felt_u128(felt: &str) -> Result<u128, AbiDecodeError> {
    let stripped = felt.strip_prefix("0x").unwrap_or(felt);
    u128::from_str_radix(stripped, 16).map_err(|e| AbiDecodeError::InvalidFelt {
        value: felt.to_string(),
        reason: e.to_string(),
    })
}

/// Compose a u256 from its `(low, high)` felt pair into normalized hex.
fn combine_u256(low: &str, high: &str) -> Result<String, AbiDecodeError> {
    let low_val = parse_felt_u128(low)?;
    let high_val = parse_felt_u128(high)?;
    if high_val == 0 {
        Ok(normalize_hex(&format!("0x{low_val:x}")))
    } else {
        Ok(format!("0x{high_val:x}{low_val:032x}"))
    }
}
