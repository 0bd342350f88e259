//! Line Protocol
//!
//! Text format batches travel in, and the acknowledgement that comes back.
//! Everything here is Sans-IO: functions turn values into text and back,
//! the transport moves the bytes.
//!
//! ```text
//! nodeid,corp
//! binary,NONE
//! channel,sales
//! batch,42
//! table,customer
//! keys,id
//! columns,id,name
//! insert,"1","ann"
//! old,"1","ann"
//! update,"1","bob","1"
//! delete,"1"
//! commit,42
//! ```

pub mod ack;
pub mod csv;
pub mod reader;
pub mod writer;

pub use ack::{decode_acks, encode_acks};
pub use reader::{read_payload, FailedBatch, ParsedBatch, ParsedPayload};
pub use writer::BatchStreamWriter;

/// Line tokens.
pub mod tokens {
    pub const NODE_ID: &str = "nodeid";
    pub const BINARY: &str = "binary";
    pub const BINARY_NONE: &str = "NONE";
    pub const CHANNEL: &str = "channel";
    pub const BATCH: &str = "batch";
    pub const CATALOG: &str = "catalog";
    pub const SCHEMA: &str = "schema";
    pub const TABLE: &str = "table";
    pub const KEYS: &str = "keys";
    pub const COLUMNS: &str = "columns";
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const OLD: &str = "old";
    pub const DELETE: &str = "delete";
    pub const SQL: &str = "sql";
    pub const CREATE: &str = "create";
    pub const BSH: &str = "bsh";
    pub const RELOAD: &str = "reload";
    pub const IGNORE: &str = "ignore";
    pub const COMMIT: &str = "commit";
}
