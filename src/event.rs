//! Decoded block events as delivered by the ledger network client.
//!
//! The client owns consensus decoding; these types only mirror the nested
//! envelope layout it hands over (`header`, `data.data[]`, channel header,
//! first action's proposal-response extension).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One delivered block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub header: BlockHeader,
    #[serde(default)]
    pub data: BlockData,
}

/// Block header. `number` arrives as a decimal string (uint64 on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: String,
    pub data_hash: String,
    pub previous_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    #[serde(default)]
    pub data: Vec<Envelope>,
}

/// A transaction envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub header: PayloadHeader,
    #[serde(default)]
    pub data: PayloadData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub channel_header: ChannelHeader,
}

/// Channel header of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub tx_id: String,
    #[serde(rename = "type")]
    pub header_type: i32,
    #[serde(rename = "typeString", default)]
    pub type_string: String,
    pub timestamp: DateTime<Utc>,
    pub channel_id: String,
    #[serde(default)]
    pub version: i32,
}

/// Envelope data. Configuration transactions carry no actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadData {
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub payload: ActionPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub action: EndorsedAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsedAction {
    pub proposal_response_payload: ProposalResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponsePayload {
    #[serde(default)]
    pub extension: Option<ChaincodeAction>,
}

/// Chaincode proposal-response extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeAction {
    pub chaincode_id: ChaincodeId,
    pub response: ChaincodeResponse,
    #[serde(default)]
    pub results: TxReadWriteSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeId {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeResponse {
    pub status: i32,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReadWriteSet {
    #[serde(default)]
    pub ns_rwset: Vec<NsReadWriteSet>,
}

/// Read/write set of one chaincode namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsReadWriteSet {
    #[serde(default)]
    pub namespace: String,
    pub rwset: KvRwSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRwSet {
    #[serde(default)]
    pub reads: Vec<KvRead>,
    #[serde(default)]
    pub writes: Vec<KvWrite>,
}

/// A key read; `version` is absent when the key had never been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRead {
    pub key: String,
    #[serde(default)]
    pub version: Option<KvVersion>,
}

/// Committed version. Both numbers arrive as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvVersion {
    pub block_num: String,
    pub tx_num: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvWrite {
    pub key: String,
    #[serde(rename = "isDelete", default)]
    pub is_delete: bool,
    #[serde(default)]
    pub value: Vec<u8>,
}

impl Envelope {
    /// Chaincode extension of the first action, if any.
    pub fn chaincode_action(&self) -> Option<&ChaincodeAction> {
        self.payload
            .data
            .actions
            .first()?
            .payload
            .action
            .proposal_response_payload
            .extension
            .as_ref()
    }
}
