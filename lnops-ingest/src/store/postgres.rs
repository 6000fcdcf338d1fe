use async_trait::async_trait;
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};
pub use deadpool_postgres::{CreatePoolError, PoolError};
use log::*;
use tokio_postgres::types::{Json, ToSql};
pub use tokio_postgres::Error as PgError;
use tokio_postgres::{NoTls, Row};

use super::{Error, Store};
use crate::model::{
    ChannelId, ChannelPolicyKey, ChannelSettings, ChannelStatus, ForwardEvent, FundingOutpoint,
    HtlcEvent, HtlcEventKind, NodeAnnouncement, NodeId, NodeKey, OnChainTransaction, RoutingPolicy,
    ShortChannelId, Versioned,
};
use crate::util::{convert_lnd_short_channel_id, time_from_secs, to_i32, to_i64};

/// Connection settings, read from the `PG_*` environment variables.
#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

impl PostgresConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("PG_HOST").unwrap_or_else(|_| "/var/run/postgresql".to_string());
        let port = std::env::var("PG_PORT").ok().and_then(|port| port.parse().ok());
        let user = std::env::var("PG_USER").unwrap_or_else(|_| "dev".to_string());
        let password = std::env::var("PG_PASS").ok();
        let dbname = std::env::var("PG_DB").unwrap_or_else(|_| "dev".to_string());
        PostgresConfig { host, port, user, password, dbname }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS node (
    node_id SERIAL PRIMARY KEY,
    public_key TEXT NOT NULL,
    chain TEXT NOT NULL,
    network TEXT NOT NULL,
    created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (public_key, chain, network)
);
CREATE TABLE IF NOT EXISTS channel (
    channel_id SERIAL PRIMARY KEY,
    short_channel_id TEXT,
    funding_transaction_hash TEXT NOT NULL,
    funding_output_index INTEGER NOT NULL,
    status_id INTEGER NOT NULL,
    UNIQUE (funding_transaction_hash, funding_output_index)
);
CREATE TABLE IF NOT EXISTS forward (
    time TIMESTAMPTZ NOT NULL,
    time_ns BIGINT NOT NULL,
    fee_msat BIGINT NOT NULL,
    lnd_incoming_short_channel_id BIGINT NOT NULL,
    lnd_outgoing_short_channel_id BIGINT NOT NULL,
    incoming_short_channel_id TEXT NOT NULL,
    outgoing_short_channel_id TEXT NOT NULL,
    incoming_amount_msat BIGINT NOT NULL,
    outgoing_amount_msat BIGINT NOT NULL,
    PRIMARY KEY (time, time_ns)
);
CREATE TABLE IF NOT EXISTS htlc_event (
    time TIMESTAMPTZ NOT NULL,
    timestamp_ns BIGINT NOT NULL,
    event_origin TEXT NOT NULL,
    event_type TEXT NOT NULL,
    lnd_incoming_short_channel_id BIGINT NOT NULL,
    lnd_outgoing_short_channel_id BIGINT NOT NULL,
    incoming_short_channel_id TEXT NOT NULL,
    outgoing_short_channel_id TEXT NOT NULL,
    incoming_htlc_id BIGINT NOT NULL,
    outgoing_htlc_id BIGINT NOT NULL,
    incoming_timelock BIGINT,
    outgoing_timelock BIGINT,
    incoming_amt_msat BIGINT,
    outgoing_amt_msat BIGINT,
    bolt_failure_code TEXT,
    bolt_failure_string TEXT,
    lnd_failure_detail TEXT,
    data JSONB NOT NULL,
    UNIQUE (timestamp_ns, event_type, lnd_incoming_short_channel_id,
        lnd_outgoing_short_channel_id, incoming_htlc_id, outgoing_htlc_id)
);
CREATE TABLE IF NOT EXISTS tx (
    timestamp TIMESTAMPTZ NOT NULL,
    tx_hash TEXT NOT NULL,
    amount BIGINT NOT NULL,
    num_confirmations INTEGER NOT NULL,
    block_hash TEXT NOT NULL,
    block_height INTEGER NOT NULL,
    total_fees BIGINT NOT NULL,
    dest_addresses TEXT[] NOT NULL,
    raw_tx_hex TEXT NOT NULL,
    label TEXT NOT NULL,
    PRIMARY KEY (timestamp, tx_hash)
);
CREATE TABLE IF NOT EXISTS routing_policy (
    ts TIMESTAMPTZ NOT NULL,
    channel_id INTEGER NOT NULL,
    announcing_node_id INTEGER NOT NULL,
    connecting_node_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    disabled BOOLEAN NOT NULL,
    time_lock_delta BIGINT NOT NULL,
    min_htlc BIGINT NOT NULL,
    max_htlc_msat BIGINT NOT NULL,
    fee_base_msat BIGINT NOT NULL,
    fee_rate_milli_msat BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS routing_policy_channel
    ON routing_policy (channel_id, announcing_node_id, connecting_node_id, ts DESC);
CREATE TABLE IF NOT EXISTS node_event (
    timestamp TIMESTAMPTZ NOT NULL,
    event_node_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    alias TEXT NOT NULL,
    color TEXT NOT NULL,
    node_addresses JSONB NOT NULL,
    features JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS node_event_node ON node_event (event_node_id, timestamp DESC);
";

const TABLES: &str = "node, channel, forward, htlc_event, tx, routing_policy, node_event";

const INSERT_FORWARD: &str = "INSERT INTO forward (time, time_ns, fee_msat, \
     lnd_incoming_short_channel_id, lnd_outgoing_short_channel_id, \
     incoming_short_channel_id, outgoing_short_channel_id, \
     incoming_amount_msat, outgoing_amount_msat) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (time, time_ns) DO NOTHING";

const INSERT_TRANSACTION: &str = "INSERT INTO tx (timestamp, tx_hash, amount, \
     num_confirmations, block_hash, block_height, total_fees, dest_addresses, raw_tx_hex, label) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT (timestamp, tx_hash) DO NOTHING";

/// Create the store and empty every table.
pub async fn new_and_clear(config: &PostgresConfig) -> Result<PostgresStore, Error> {
    let store = PostgresStore::connect(config).await?;
    let client = store.pool.get().await?;
    client.batch_execute(&format!("TRUNCATE {} RESTART IDENTITY", TABLES)).await?;
    Ok(store)
}

async fn migrate_database(client: &tokio_postgres::Client) -> Result<(), Error> {
    client.batch_execute(SCHEMA).await?;
    Ok(())
}

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Connect and create the schema if needed.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, Error> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = config.port;
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = config.password.clone();
        cfg.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        {
            let client = pool.get().await?;
            migrate_database(&client).await?;
        }
        info!("connected to postgres at {}", config.host);
        Ok(PostgresStore { pool })
    }

    /// Register a channel, as the channel management layer would.
    pub async fn insert_channel(
        &self,
        outpoint: &FundingOutpoint,
        short_channel_id: Option<&ShortChannelId>,
        status: ChannelStatus,
    ) -> Result<ChannelId, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO channel (short_channel_id, funding_transaction_hash, \
                 funding_output_index, status_id) VALUES ($1, $2, $3, $4) RETURNING channel_id",
                &[
                    &short_channel_id.map(|scid| scid.as_str()),
                    &outpoint.txid,
                    &to_i32(outpoint.output_index),
                    &status.id(),
                ],
            )
            .await?;
        Ok(ChannelId(row.get(0)))
    }
}

fn forward_params(forward: &ForwardEvent) -> Vec<Box<dyn ToSql + Sync + Send>> {
    vec![
        Box::new(forward.time()),
        Box::new(to_i64(forward.time_ns)),
        Box::new(to_i64(forward.fee_msat)),
        Box::new(to_i64(forward.incoming_channel)),
        Box::new(to_i64(forward.outgoing_channel)),
        Box::new(convert_lnd_short_channel_id(forward.incoming_channel)),
        Box::new(convert_lnd_short_channel_id(forward.outgoing_channel)),
        Box::new(to_i64(forward.amount_in_msat)),
        Box::new(to_i64(forward.amount_out_msat)),
    ]
}

fn transaction_params(tx: &OnChainTransaction) -> Vec<Box<dyn ToSql + Sync + Send>> {
    vec![
        Box::new(time_from_secs(tx.timestamp)),
        Box::new(tx.tx_hash.clone()),
        Box::new(tx.amount),
        Box::new(tx.num_confirmations),
        Box::new(tx.block_hash.clone()),
        Box::new(to_i32(tx.block_height)),
        Box::new(tx.total_fees),
        Box::new(tx.dest_addresses.clone()),
        Box::new(tx.raw_tx_hex.clone()),
        Box::new(tx.label.clone()),
    ]
}

fn as_refs(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|param| param.as_ref() as &(dyn ToSql + Sync)).collect()
}

fn routing_policy_from_row(row: &Row) -> Result<Versioned<RoutingPolicy>, Error> {
    let time_lock_delta: i64 = row.get("time_lock_delta");
    let policy = RoutingPolicy {
        time_lock_delta: u32::try_from(time_lock_delta)
            .map_err(|_| Error::Corrupt(format!("time_lock_delta {}", time_lock_delta)))?,
        min_htlc: row.get("min_htlc"),
        fee_base_msat: row.get("fee_base_msat"),
        fee_rate_milli_msat: row.get("fee_rate_milli_msat"),
        disabled: row.get("disabled"),
        max_htlc_msat: row.get("max_htlc_msat"),
    };
    Ok(Versioned::new(row.get("ts"), NodeId(row.get("node_id")), policy))
}

fn node_announcement_from_row(row: &Row) -> Versioned<NodeAnnouncement> {
    let Json(addresses) = row.get("node_addresses");
    let Json(features) = row.get("features");
    let announcement =
        NodeAnnouncement { alias: row.get("alias"), color: row.get("color"), addresses, features };
    Versioned::new(row.get("timestamp"), NodeId(row.get("node_id")), announcement)
}

#[async_trait]
impl Store for PostgresStore {
    async fn last_forward_time_ns(&self) -> Result<Option<u64>, Error> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT MAX(time_ns) FROM forward", &[]).await?;
        let time_ns: Option<i64> = row.get(0);
        Ok(time_ns.map(|ns| ns.max(0) as u64))
    }

    async fn store_forwards(&self, forwards: &[ForwardEvent]) -> Result<usize, Error> {
        let mut client = self.pool.get().await?;
        let statement = client.prepare(INSERT_FORWARD).await?;
        let tx = client.transaction().await?;
        let mut inserted = 0;
        for forward in forwards {
            let params = forward_params(forward);
            inserted += tx.execute(&statement, &as_refs(&params)).await?;
        }
        tx.commit().await?;
        debug!("stored {} of {} forwards", inserted, forwards.len());
        Ok(inserted as usize)
    }

    async fn store_htlc_event(&self, event: &HtlcEvent) -> Result<bool, Error> {
        let event_type = match event.event_type() {
            Some(event_type) => event_type,
            None => return Ok(false),
        };
        let info = event.info();
        let failure = match &event.kind {
            HtlcEventKind::LinkFail(failure) => Some(failure),
            _ => None,
        };
        let data = serde_json::to_value(event)?;
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO htlc_event (time, timestamp_ns, event_origin, event_type, \
                 lnd_incoming_short_channel_id, lnd_outgoing_short_channel_id, \
                 incoming_short_channel_id, outgoing_short_channel_id, \
                 incoming_htlc_id, outgoing_htlc_id, incoming_timelock, outgoing_timelock, \
                 incoming_amt_msat, outgoing_amt_msat, bolt_failure_code, bolt_failure_string, \
                 lnd_failure_detail, data) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18) \
                 ON CONFLICT DO NOTHING",
                &[
                    &event.time(),
                    &to_i64(event.timestamp_ns),
                    &event.origin.to_string(),
                    &event_type,
                    &to_i64(event.incoming_channel_id),
                    &to_i64(event.outgoing_channel_id),
                    &convert_lnd_short_channel_id(event.incoming_channel_id),
                    &convert_lnd_short_channel_id(event.outgoing_channel_id),
                    &to_i64(event.incoming_htlc_id),
                    &to_i64(event.outgoing_htlc_id),
                    &info.map(|info| i64::from(info.incoming_timelock)),
                    &info.map(|info| i64::from(info.outgoing_timelock)),
                    &info.map(|info| to_i64(info.incoming_amt_msat)),
                    &info.map(|info| to_i64(info.outgoing_amt_msat)),
                    &failure.map(|failure| failure.wire_failure.as_str()),
                    &failure.map(|failure| failure.failure_string.as_str()),
                    &failure.map(|failure| failure.failure_detail.as_str()),
                    &Json(data),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn last_transaction_height(&self) -> Result<Option<u32>, Error> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT MAX(block_height) FROM tx", &[]).await?;
        let height: Option<i32> = row.get(0);
        Ok(height.map(|height| height.max(0) as u32))
    }

    async fn store_transactions(
        &self,
        transactions: &[OnChainTransaction],
    ) -> Result<usize, Error> {
        let mut client = self.pool.get().await?;
        let statement = client.prepare(INSERT_TRANSACTION).await?;
        let tx = client.transaction().await?;
        let mut inserted = 0;
        for transaction in transactions {
            let params = transaction_params(transaction);
            inserted += tx.execute(&statement, &as_refs(&params)).await?;
        }
        tx.commit().await?;
        Ok(inserted as usize)
    }

    async fn store_transaction(&self, transaction: &OnChainTransaction) -> Result<bool, Error> {
        let client = self.pool.get().await?;
        let params = transaction_params(transaction);
        let inserted = client.execute(INSERT_TRANSACTION, &as_refs(&params)).await?;
        Ok(inserted > 0)
    }

    async fn latest_routing_policy(
        &self,
        key: &ChannelPolicyKey,
    ) -> Result<Option<Versioned<RoutingPolicy>>, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT ts, node_id, disabled, time_lock_delta, min_htlc, max_htlc_msat, \
                 fee_base_msat, fee_rate_milli_msat FROM routing_policy \
                 WHERE channel_id = $1 AND announcing_node_id = $2 AND connecting_node_id = $3 \
                 ORDER BY ts DESC LIMIT 1",
                &[&key.channel_id.0, &key.announcing_node_id.0, &key.connecting_node_id.0],
            )
            .await?;
        row.as_ref().map(routing_policy_from_row).transpose()
    }

    async fn insert_routing_policy(
        &self,
        key: &ChannelPolicyKey,
        policy: &Versioned<RoutingPolicy>,
    ) -> Result<(), Error> {
        let client = self.pool.get().await?;
        let value = &policy.value;
        client
            .execute(
                "INSERT INTO routing_policy (ts, channel_id, announcing_node_id, \
                 connecting_node_id, node_id, disabled, time_lock_delta, min_htlc, \
                 max_htlc_msat, fee_base_msat, fee_rate_milli_msat) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &policy.event_time,
                    &key.channel_id.0,
                    &key.announcing_node_id.0,
                    &key.connecting_node_id.0,
                    &policy.node_id.0,
                    &value.disabled,
                    &i64::from(value.time_lock_delta),
                    &value.min_htlc,
                    &value.max_htlc_msat,
                    &value.fee_base_msat,
                    &value.fee_rate_milli_msat,
                ],
            )
            .await?;
        Ok(())
    }

    async fn latest_node_announcement(
        &self,
        node: NodeId,
    ) -> Result<Option<Versioned<NodeAnnouncement>>, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT timestamp, node_id, alias, color, node_addresses, features \
                 FROM node_event WHERE event_node_id = $1 ORDER BY timestamp DESC LIMIT 1",
                &[&node.0],
            )
            .await?;
        Ok(row.as_ref().map(node_announcement_from_row))
    }

    async fn insert_node_announcement(
        &self,
        node: NodeId,
        announcement: &Versioned<NodeAnnouncement>,
    ) -> Result<(), Error> {
        let client = self.pool.get().await?;
        let value = &announcement.value;
        client
            .execute(
                "INSERT INTO node_event (timestamp, event_node_id, node_id, alias, color, \
                 node_addresses, features) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &announcement.event_time,
                    &node.0,
                    &announcement.node_id.0,
                    &value.alias,
                    &value.color,
                    &Json(&value.addresses),
                    &Json(&value.features),
                ],
            )
            .await?;
        Ok(())
    }

    async fn add_node_when_new(&self, key: &NodeKey) -> Result<NodeId, Error> {
        let client = self.pool.get().await?;
        let chain = key.chain.to_string();
        let network = key.network.to_string();
        client
            .execute(
                "INSERT INTO node (public_key, chain, network) VALUES ($1, $2, $3) \
                 ON CONFLICT (public_key, chain, network) DO NOTHING",
                &[&key.public_key, &chain, &network],
            )
            .await?;
        let row = client
            .query_one(
                "SELECT node_id FROM node WHERE public_key = $1 AND chain = $2 AND network = $3",
                &[&key.public_key, &chain, &network],
            )
            .await?;
        Ok(NodeId(row.get(0)))
    }

    async fn channels(&self) -> Result<Vec<ChannelSettings>, Error> {
        let client = self.pool.get().await?;
        client
            .query(
                "SELECT channel_id, short_channel_id, funding_transaction_hash, \
                 funding_output_index, status_id FROM channel",
                &[],
            )
            .await?
            .iter()
            .map(|row| -> Result<ChannelSettings, Error> {
                let status_id: i32 = row.get("status_id");
                let status = ChannelStatus::from_id(status_id)
                    .ok_or_else(|| Error::Corrupt(format!("channel status {}", status_id)))?;
                let output_index: i32 = row.get("funding_output_index");
                let short_channel_id: Option<String> = row.get("short_channel_id");
                Ok(ChannelSettings {
                    channel_id: ChannelId(row.get("channel_id")),
                    short_channel_id: short_channel_id.and_then(ShortChannelId::new),
                    funding_outpoint: FundingOutpoint::new(
                        row.get::<_, String>("funding_transaction_hash"),
                        output_index.max(0) as u32,
                    ),
                    status,
                })
            })
            .collect()
    }

    async fn nodes(&self) -> Result<Vec<(NodeKey, NodeId)>, Error> {
        let client = self.pool.get().await?;
        client
            .query("SELECT node_id, public_key, chain, network FROM node", &[])
            .await?
            .iter()
            .map(|row| -> Result<(NodeKey, NodeId), Error> {
                let chain: String = row.get("chain");
                let network: String = row.get("network");
                let key = NodeKey {
                    public_key: row.get("public_key"),
                    chain: chain.parse().map_err(Error::Corrupt)?,
                    network: network.parse().map_err(Error::Corrupt)?,
                };
                Ok((key, NodeId(row.get("node_id"))))
            })
            .collect()
    }
}
