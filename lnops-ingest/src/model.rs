use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::util::{convert_lnd_short_channel_id, time_from_nanos};

/// Internal channel identifier, the surrogate key assigned by the store.
///
/// Values `<= 0` are treated as "no channel".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub i32);

impl ChannelId {
    pub fn is_empty(&self) -> bool {
        self.0 <= 0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal node identifier, the surrogate key assigned by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i32);

impl NodeId {
    pub fn is_empty(&self) -> bool {
        self.0 <= 0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A short channel id in its textual `block x tx x output` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelId(String);

impl ShortChannelId {
    /// Returns `None` for the empty and the all-zero id, which name no channel.
    pub fn new<S: Into<String>>(s: S) -> Option<Self> {
        let s = s.into();
        if s.is_empty() || s == "0x0x0" {
            None
        } else {
            Some(ShortChannelId(s))
        }
    }

    /// Convert from the packed 64-bit form reported by the node backend.
    pub fn from_lnd(id: u64) -> Option<Self> {
        Self::new(convert_lnd_short_channel_id(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The funding transaction output of a channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FundingOutpoint {
    /// Funding transaction hash, hex encoded
    pub txid: String,
    pub output_index: u32,
}

impl FundingOutpoint {
    pub fn new<S: Into<String>>(txid: S, output_index: u32) -> Self {
        FundingOutpoint { txid: txid.into(), output_index }
    }

    pub fn is_empty(&self) -> bool {
        self.txid.is_empty()
    }
}

impl Display for FundingOutpoint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.output_index)
    }
}

/// Channel lifecycle status.
///
/// The discriminants are the stored status ids. Every status from
/// `CooperativeClosed` upward means the channel is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum ChannelStatus {
    Opening = 0,
    Open = 1,
    Closing = 2,
    CooperativeClosed = 100,
    LocalForceClosed = 101,
    RemoteForceClosed = 102,
    BreachClosed = 103,
    FundingCancelledClosed = 104,
    AbandonedClosed = 105,
}

impl ChannelStatus {
    pub fn is_closed(&self) -> bool {
        *self >= ChannelStatus::CooperativeClosed
    }

    pub fn id(&self) -> i32 {
        *self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        use ChannelStatus::*;
        let status = match id {
            0 => Opening,
            1 => Open,
            2 => Closing,
            100 => CooperativeClosed,
            101 => LocalForceClosed,
            102 => RemoteForceClosed,
            103 => BreachClosed,
            104 => FundingCancelledClosed,
            105 => AbandonedClosed,
            _ => return None,
        };
        Some(status)
    }
}

/// What the identifier cache knows about a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    pub channel_id: ChannelId,
    /// Absent while the channel is pending
    pub short_channel_id: Option<ShortChannelId>,
    pub funding_outpoint: FundingOutpoint,
    pub status: ChannelStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Litecoin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    MainNet,
    TestNet,
    RegTest,
    SigNet,
    SimNet,
}

impl Display for Chain {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Chain::Bitcoin => f.write_str("bitcoin"),
            Chain::Litecoin => f.write_str("litecoin"),
        }
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(Chain::Bitcoin),
            "litecoin" => Ok(Chain::Litecoin),
            _ => Err(format!("unknown chain {}", s)),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Network::MainNet => "mainnet",
            Network::TestNet => "testnet",
            Network::RegTest => "regtest",
            Network::SigNet => "signet",
            Network::SimNet => "simnet",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::MainNet),
            "testnet" => Ok(Network::TestNet),
            "regtest" => Ok(Network::RegTest),
            "signet" => Ok(Network::SigNet),
            "simnet" => Ok(Network::SimNet),
            _ => Err(format!("unknown network {}", s)),
        }
    }
}

/// The external identity of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    /// Public key, hex encoded
    pub public_key: String,
    pub chain: Chain,
    pub network: Network,
}

impl NodeKey {
    pub fn new<S: Into<String>>(public_key: S, chain: Chain, network: Network) -> Self {
        NodeKey { public_key: public_key.into(), chain, network }
    }
}

/// The local node an ingestor is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSettings {
    pub node_id: NodeId,
    pub chain: Chain,
    pub network: Network,
}

impl NodeSettings {
    pub fn node_key(&self, public_key: &str) -> NodeKey {
        NodeKey::new(public_key, self.chain, self.network)
    }
}

/// A completed forwarding circuit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEvent {
    /// Nanoseconds since the epoch at which the circuit completed
    pub time_ns: u64,
    /// Packed short channel id of the incoming HTLC
    pub incoming_channel: u64,
    /// Packed short channel id of the outgoing HTLC
    pub outgoing_channel: u64,
    pub fee_msat: u64,
    pub amount_in_msat: u64,
    pub amount_out_msat: u64,
}

impl ForwardEvent {
    /// The event time at microsecond resolution, as stored.
    pub fn time(&self) -> OffsetDateTime {
        time_from_nanos(self.time_ns)
    }

    /// The natural key of the stored row.
    pub fn natural_key(&self) -> (OffsetDateTime, u64) {
        (self.time(), self.time_ns)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HtlcEventOrigin {
    Unknown,
    Send,
    Receive,
    Forward,
}

impl Display for HtlcEventOrigin {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            HtlcEventOrigin::Unknown => "UNKNOWN",
            HtlcEventOrigin::Send => "SEND",
            HtlcEventOrigin::Receive => "RECEIVE",
            HtlcEventOrigin::Forward => "FORWARD",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcInfo {
    pub incoming_timelock: u32,
    pub outgoing_timelock: u32,
    pub incoming_amt_msat: u64,
    pub outgoing_amt_msat: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFailure {
    pub info: HtlcInfo,
    pub wire_failure: String,
    pub failure_detail: String,
    pub failure_string: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcEventKind {
    Forward(HtlcInfo),
    ForwardFail,
    LinkFail(LinkFailure),
    Settle {
        /// hex encoded
        preimage: String,
    },
    /// Final resolution notice, not recorded
    FinalHtlc { settled: bool, offchain: bool },
    /// Subscription acknowledgement, not recorded
    Subscribed,
}

/// An HTLC lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcEvent {
    pub timestamp_ns: u64,
    pub origin: HtlcEventOrigin,
    pub incoming_channel_id: u64,
    pub outgoing_channel_id: u64,
    pub incoming_htlc_id: u64,
    pub outgoing_htlc_id: u64,
    pub kind: HtlcEventKind,
}

/// Natural key of a stored HTLC event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HtlcEventKey {
    pub timestamp_ns: u64,
    pub event_type: &'static str,
    pub incoming_channel_id: u64,
    pub outgoing_channel_id: u64,
    pub incoming_htlc_id: u64,
    pub outgoing_htlc_id: u64,
}

impl HtlcEvent {
    /// The stored event type, or `None` for kinds which are not recorded.
    pub fn event_type(&self) -> Option<&'static str> {
        match self.kind {
            HtlcEventKind::Forward(_) => Some("ForwardEvent"),
            HtlcEventKind::ForwardFail => Some("ForwardFailEvent"),
            HtlcEventKind::LinkFail(_) => Some("LinkFailEvent"),
            HtlcEventKind::Settle { .. } => Some("SettleEvent"),
            HtlcEventKind::FinalHtlc { .. } | HtlcEventKind::Subscribed => None,
        }
    }

    pub fn natural_key(&self) -> Option<HtlcEventKey> {
        Some(HtlcEventKey {
            timestamp_ns: self.timestamp_ns,
            event_type: self.event_type()?,
            incoming_channel_id: self.incoming_channel_id,
            outgoing_channel_id: self.outgoing_channel_id,
            incoming_htlc_id: self.incoming_htlc_id,
            outgoing_htlc_id: self.outgoing_htlc_id,
        })
    }

    pub fn info(&self) -> Option<&HtlcInfo> {
        match &self.kind {
            HtlcEventKind::Forward(info) => Some(info),
            HtlcEventKind::LinkFail(failure) => Some(&failure.info),
            _ => None,
        }
    }

    pub fn time(&self) -> OffsetDateTime {
        time_from_nanos(self.timestamp_ns)
    }
}

/// An on-chain wallet transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTransaction {
    /// Seconds since the epoch
    pub timestamp: i64,
    pub tx_hash: String,
    pub amount: i64,
    pub num_confirmations: i32,
    pub block_hash: String,
    /// Zero while unconfirmed
    pub block_height: u32,
    pub total_fees: i64,
    pub dest_addresses: Vec<String>,
    pub raw_tx_hex: String,
    pub label: String,
}

impl OnChainTransaction {
    pub fn natural_key(&self) -> (i64, String) {
        (self.timestamp, self.tx_hash.clone())
    }
}

// Amounts are signed where they are persisted, databases don't map unsigned 64-bit integers well.
/// The routing policy one node announces for a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub time_lock_delta: u32,
    pub min_htlc: i64,
    pub fee_base_msat: i64,
    pub fee_rate_milli_msat: i64,
    pub disabled: bool,
    pub max_htlc_msat: i64,
}

/// Identifies the stream of routing policies of one direction of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelPolicyKey {
    pub channel_id: ChannelId,
    pub announcing_node_id: NodeId,
    pub connecting_node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub network: String,
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub is_required: bool,
    pub is_known: bool,
}

/// The attributes a node advertises in the channel graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub alias: String,
    pub color: String,
    pub addresses: Vec<NodeAddress>,
    pub features: BTreeMap<u32, Feature>,
}

/// A stored snapshot of a change-logged entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub event_time: OffsetDateTime,
    /// The local node which observed the change
    pub node_id: NodeId,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(event_time: OffsetDateTime, node_id: NodeId, value: T) -> Self {
        Versioned { event_time, node_id, value }
    }
}
