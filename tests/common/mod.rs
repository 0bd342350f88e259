//! Shared fixtures: a sending node and a receiving node wired through an
//! in-process loopback transport.

#![allow(dead_code)]

use async_trait::async_trait;
use db_relay::adapters::outbound::{
    DashMapParameterStore, MemoryNodeRepository, SqliteBatchStore, SqliteClusterService,
    SqliteTargetDatabase,
};
use db_relay::application::{DataLoaderService, PushService, RouterService};
use db_relay::domain::entities::{ChangeRecord, Node, NodeChannel, TableHistory};
use db_relay::domain::errors::TransportError;
use db_relay::domain::ports::{ChangeLog, OutgoingTransport, TransportManager};
use db_relay::domain::services::WriterSettings;
use db_relay::domain::value_objects::{DataEventType, NodeId};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const SENDER: &str = "corp";
pub const RECEIVER: &str = "store-1";

/// Delivers each push to the receiving node's loader in-process.
#[derive(Default)]
pub struct LoopbackTransports {
    loaders: HashMap<String, Arc<DataLoaderService>>,
    pub payloads: Arc<Mutex<Vec<String>>>,
}

impl LoopbackTransports {
    pub fn with_loader(mut self, node_id: &str, loader: Arc<DataLoaderService>) -> Self {
        self.loaders.insert(node_id.to_string(), loader);
        self
    }
}

struct LoopbackTransport {
    loader: Arc<DataLoaderService>,
    body: String,
    payloads: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TransportManager for LoopbackTransports {
    async fn open_push(
        &self,
        remote: &Node,
        _local: &Node,
    ) -> Result<Box<dyn OutgoingTransport>, TransportError> {
        let loader = self
            .loaders
            .get(remote.node_id.as_str())
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(remote.node_id.to_string()))?;
        Ok(Box::new(LoopbackTransport {
            loader,
            body: String::new(),
            payloads: self.payloads.clone(),
        }))
    }
}

#[async_trait]
impl OutgoingTransport for LoopbackTransport {
    fn write(&mut self, payload: &str) -> Result<(), TransportError> {
        self.body.push_str(payload);
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Vec<String>, TransportError> {
        self.payloads.lock().push(self.body.clone());
        Ok(self.loader.load_payload(&self.body))
    }

    async fn close(&mut self) {}
}

/// Sending node: runtime database, topology and cluster lock.
pub struct Sender {
    _temp: NamedTempFile,
    pub store: Arc<SqliteBatchStore>,
    pub nodes: Arc<MemoryNodeRepository>,
    pub cluster: Arc<SqliteClusterService>,
}

impl Sender {
    pub fn new(channels: &[(&str, i32)]) -> Self {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        let store = SqliteBatchStore::new(path.clone());
        store.init_db().unwrap();
        let cluster = SqliteClusterService::new(path, "corp-1", Arc::new(DashMapParameterStore::default()));
        cluster.init_db().unwrap();

        let nodes = MemoryNodeRepository::new(Node::new(SENDER, "corp"));
        nodes.add_push_target(Node::new(RECEIVER, "store").with_sync_url("http://store-1/sync"));
        for (channel, order) in channels {
            nodes.set_channel(NodeChannel::new(NodeId::new(RECEIVER), *channel, *order));
        }

        Self {
            _temp: temp,
            store: Arc::new(store),
            nodes: Arc::new(nodes),
            cluster: Arc::new(cluster),
        }
    }

    pub fn customer_history(&self) -> Arc<TableHistory> {
        self.store
            .register_table_history("customer", "customer", &["id".into(), "name".into()], &["id".into()])
            .unwrap()
    }

    /// Capture a change routed to the receiver. Returns its data id.
    pub fn capture(&self, record: ChangeRecord) -> i64 {
        self.store.append(&record, &[NodeId::new(RECEIVER)]).unwrap()
    }

    pub fn router(&self) -> RouterService {
        RouterService::new(self.nodes.clone(), self.store.clone(), self.store.clone())
    }

    pub fn push_service(&self, transports: Arc<dyn TransportManager>) -> PushService {
        PushService::new(
            self.nodes.clone(),
            self.store.clone(),
            self.store.clone(),
            self.cluster.clone(),
            transports,
        )
    }
}

/// Receiving node: incoming ledger and a file-backed target database.
pub struct Receiver {
    _ledger: NamedTempFile,
    target: NamedTempFile,
    pub store: Arc<SqliteBatchStore>,
}

impl Receiver {
    pub fn new() -> Self {
        let ledger = NamedTempFile::new().unwrap();
        let store = SqliteBatchStore::new(ledger.path().to_str().unwrap());
        store.init_db().unwrap();

        let target = NamedTempFile::new().unwrap();
        Connection::open(target.path())
            .unwrap()
            .execute_batch(
                "CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE client (client_id INTEGER PRIMARY KEY, client_name TEXT, deleted TEXT);",
            )
            .unwrap();

        Self {
            _ledger: ledger,
            target,
            store: Arc::new(store),
        }
    }

    pub fn loader(&self, settings: WriterSettings) -> DataLoaderService {
        self.loader_with_ledger(self.store.clone(), settings)
    }

    /// Loader over the same target database but a different ledger, so a
    /// batch already loaded is applied again.
    pub fn loader_with_ledger(&self, ledger: Arc<SqliteBatchStore>, settings: WriterSettings) -> DataLoaderService {
        let target = SqliteTargetDatabase::open(self.target.path().to_str().unwrap()).unwrap();
        DataLoaderService::new(NodeId::new(RECEIVER), Box::new(target), ledger, Arc::new(settings))
    }

    /// Direct connection to the target database for assertions and seeding.
    pub fn target(&self) -> Connection {
        Connection::open(self.target.path()).unwrap()
    }

    pub fn customer_names(&self) -> Vec<(i64, String)> {
        let conn = self.target();
        let mut stmt = conn.prepare("SELECT id, name FROM customer ORDER BY id").unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }
}

pub fn vals(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

pub fn insert(history: &Arc<TableHistory>, row: &[&str]) -> ChangeRecord {
    ChangeRecord::new(DataEventType::Insert, history.clone())
        .with_row(vals(row))
        .with_channel("sales")
}

pub fn update(history: &Arc<TableHistory>, old: &[&str], row: &[&str]) -> ChangeRecord {
    ChangeRecord::new(DataEventType::Update, history.clone())
        .with_row(vals(row))
        .with_old(vals(old))
        .with_channel("sales")
}

pub fn delete(history: &Arc<TableHistory>, pk: &[&str], old: &[&str]) -> ChangeRecord {
    ChangeRecord::new(DataEventType::Delete, history.clone())
        .with_pk(vals(pk))
        .with_old(vals(old))
        .with_channel("sales")
}
