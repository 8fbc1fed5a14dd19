//! RocksDB-backed graph store.
//!
//! Column families:
//! - `conversations`    : Conversation records (bincode, LZ4 compressed)
//! - `messages`         : Message records (bincode, LZ4 compressed)
//! - `children`         : Parent index, keyed `conv\0parent\0child` (empty parent = root)
//! - `tool_uses`        : ToolUse records (JSON, LZ4 compressed)
//! - `message_tool_uses`: Tool-use index, keyed `message\0tool_use`
//!
//! Every write goes through one `WriteBatch` while holding the store's
//! write lock, so a transaction's reads see no interleaved writer and its
//! writes land together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::GraphError;
use super::model::{Conversation, Message, ToolUse};
use super::store::{next_branch_index, GraphStore, GraphTx};

const CF_CONVERSATIONS: &str = "conversations";
const CF_MESSAGES: &str = "messages";
const CF_CHILDREN: &str = "children";
const CF_TOOL_USES: &str = "tool_uses";
const CF_MESSAGE_TOOL_USES: &str = "message_tool_uses";

const COLUMN_FAMILIES: &[&str] = &[
    CF_CONVERSATIONS,
    CF_MESSAGES,
    CF_CHILDREN,
    CF_TOOL_USES,
    CF_MESSAGE_TOOL_USES,
];

const KEY_SEP: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("alicia_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for GraphError {
    fn from(e: rocksdb::Error) -> Self {
        GraphError::Database(e.to_string())
    }
}

/// Durable [`GraphStore`] on RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences (tip updates, branch indexes).
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, GraphError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Graph store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Records are already LZ4-compressed before they reach RocksDB.
            CF_CONVERSATIONS | CF_MESSAGES | CF_TOOL_USES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            // Key-only indexes, prefix scanned.
            CF_CHILDREN | CF_MESSAGE_TOOL_USES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), GraphError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, GraphError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| GraphError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, GraphError> {
        self.write_lock
            .lock()
            .map_err(|_| GraphError::Database("graph store write lock poisoned".into()))
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), GraphError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> Result<Option<T>, GraphError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load_message(&self, id: &str) -> Result<Option<Message>, GraphError> {
        self.load(CF_MESSAGES, id)
    }

    fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, GraphError> {
        self.load(CF_CONVERSATIONS, id)
    }

    fn load_tool_use(&self, id: &str) -> Result<Option<ToolUse>, GraphError> {
        let cf = self.cf(CF_TOOL_USES)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Keys under `prefix` in `cf_name`, with the prefix stripped.
    fn scan_suffixes(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<String>, GraphError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut suffixes = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let suffix = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| GraphError::Serialization(e.to_string()))?;
            suffixes.push(suffix);
        }
        Ok(suffixes)
    }

    fn children_of(
        &self,
        conversation_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<Message>, GraphError> {
        let prefix = children_prefix(conversation_id, parent);
        let mut children = Vec::new();
        for id in self.scan_suffixes(CF_CHILDREN, &prefix)? {
            if let Some(message) = self.load_message(&id)? {
                children.push(message);
            }
        }
        Ok(children)
    }
}

impl GraphStore for RocksStore {
    fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, GraphError> {
        let cf = self.cf(CF_CONVERSATIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, conversation.id.as_bytes(), encode_record(&conversation)?);
        let _guard = self.lock()?;
        self.commit(batch)?;
        Ok(conversation)
    }

    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError> {
        self.load_conversation(id)?
            .ok_or_else(|| GraphError::NotFound(format!("conversation {id}")))
    }

    fn create_message(&self, message: Message) -> Result<Message, GraphError> {
        let mut created = None;
        self.with_tx(&mut |tx| {
            created = Some(tx.create_message(message.clone())?);
            Ok(())
        })?;
        created.ok_or_else(|| GraphError::Database("message insert produced no record".into()))
    }

    fn get_message(&self, id: &str) -> Result<Message, GraphError> {
        self.load_message(id)?
            .ok_or_else(|| GraphError::NotFound(format!("message {id}")))
    }

    fn update_conversation_tip(
        &self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError> {
        self.with_tx(&mut |tx| tx.update_conversation_tip(conversation_id, tip))
    }

    fn get_message_siblings(&self, message_id: &str) -> Result<Vec<Message>, GraphError> {
        let message = self.get_message(message_id)?;
        let mut siblings =
            self.children_of(&message.conversation_id, message.previous_id.as_deref())?;
        siblings.sort_by_key(|m| m.branch_index);
        Ok(siblings)
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, GraphError> {
        let mut prefix = conversation_id.as_bytes().to_vec();
        prefix.push(KEY_SEP);

        let mut messages = Vec::new();
        for suffix in self.scan_suffixes(CF_CHILDREN, &prefix)? {
            // suffix = parent \0 child
            let Some((_, child)) = suffix.split_once(KEY_SEP as char) else {
                continue;
            };
            if let Some(message) = self.load_message(child)? {
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.branch_index.cmp(&b.branch_index))
        });
        Ok(messages)
    }

    fn create_tool_use(&self, tool_use: ToolUse) -> Result<ToolUse, GraphError> {
        let cf_tools = self.cf(CF_TOOL_USES)?;
        let cf_index = self.cf(CF_MESSAGE_TOOL_USES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tools, tool_use.id.as_bytes(), encode_json(&tool_use)?);
        batch.put_cf(&cf_index, tool_index_key(&tool_use.message_id, &tool_use.id), b"");

        let _guard = self.lock()?;
        self.commit(batch)?;
        Ok(tool_use)
    }

    fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), GraphError> {
        let cf = self.cf(CF_TOOL_USES)?;
        let _guard = self.lock()?;
        if self.load_tool_use(&tool_use.id)?.is_none() {
            return Err(GraphError::NotFound(format!("tool use {}", tool_use.id)));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, tool_use.id.as_bytes(), encode_json(tool_use)?);
        self.commit(batch)
    }

    fn get_tool_use(&self, id: &str) -> Result<ToolUse, GraphError> {
        self.load_tool_use(id)?
            .ok_or_else(|| GraphError::NotFound(format!("tool use {id}")))
    }

    fn tool_uses_for_message(&self, message_id: &str) -> Result<Vec<ToolUse>, GraphError> {
        let mut prefix = message_id.as_bytes().to_vec();
        prefix.push(KEY_SEP);

        let mut tool_uses = Vec::new();
        for id in self.scan_suffixes(CF_MESSAGE_TOOL_USES, &prefix)? {
            if let Some(tool_use) = self.load_tool_use(&id)? {
                tool_uses.push(tool_use);
            }
        }
        tool_uses.sort_by_key(|t| t.created_at);
        Ok(tool_uses)
    }

    fn with_tx(
        &self,
        f: &mut dyn FnMut(&mut dyn GraphTx) -> Result<(), GraphError>,
    ) -> Result<(), GraphError> {
        let _guard = self.lock()?;
        let mut tx = RocksTx {
            store: self,
            batch: WriteBatch::default(),
            messages: HashMap::new(),
            conversations: HashMap::new(),
        };
        f(&mut tx)?;
        self.commit(tx.batch)
    }
}

/// Pending writes of one transaction. Staged records shadow the database
/// so later reads in the same transaction see earlier writes.
struct RocksTx<'a> {
    store: &'a RocksStore,
    batch: WriteBatch,
    messages: HashMap<String, Message>,
    conversations: HashMap<String, Conversation>,
}

impl RocksTx<'_> {
    fn message(&self, id: &str) -> Result<Option<Message>, GraphError> {
        match self.messages.get(id) {
            Some(message) => Ok(Some(message.clone())),
            None => self.store.load_message(id),
        }
    }

    fn stage_message(&mut self, message: &Message) -> Result<(), GraphError> {
        let cf = self.store.cf(CF_MESSAGES)?;
        self.batch
            .put_cf(&cf, message.id.as_bytes(), encode_record(message)?);
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }
}

impl GraphTx for RocksTx<'_> {
    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError> {
        if let Some(conversation) = self.conversations.get(id) {
            return Ok(conversation.clone());
        }
        self.store.get_conversation(id)
    }

    fn create_message(&mut self, mut message: Message) -> Result<Message, GraphError> {
        if let Some(mut existing) = self.message(&message.id)? {
            existing.content = message.content;
            existing.reasoning = message.reasoning;
            existing.status = message.status;
            self.stage_message(&existing)?;
            return Ok(existing);
        }

        self.get_conversation(&message.conversation_id)?;

        let parent = message.previous_id.as_deref();
        let mut siblings = self.store.children_of(&message.conversation_id, parent)?;
        siblings.extend(
            self.messages
                .values()
                .filter(|m| m.conversation_id == message.conversation_id)
                .filter(|m| m.previous_id.as_deref() == parent)
                .cloned(),
        );
        message.branch_index = next_branch_index(siblings.iter());

        let cf_children = self.store.cf(CF_CHILDREN)?;
        self.batch.put_cf(
            &cf_children,
            children_key(&message.conversation_id, parent, &message.id),
            message.branch_index.to_be_bytes(),
        );
        self.stage_message(&message)?;
        Ok(message)
    }

    fn update_conversation_tip(
        &mut self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError> {
        let mut conversation = self.get_conversation(conversation_id)?;
        conversation.tip_message_id = tip.map(str::to_string);
        conversation.updated_at = chrono::Utc::now();

        let cf = self.store.cf(CF_CONVERSATIONS)?;
        self.batch
            .put_cf(&cf, conversation_id.as_bytes(), encode_record(&conversation)?);
        self.conversations
            .insert(conversation_id.to_string(), conversation);
        Ok(())
    }
}

fn children_prefix(conversation_id: &str, parent: Option<&str>) -> Vec<u8> {
    let parent = parent.unwrap_or_default();
    let mut key = Vec::with_capacity(conversation_id.len() + parent.len() + 2);
    key.extend_from_slice(conversation_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(parent.as_bytes());
    key.push(KEY_SEP);
    key
}

fn children_key(conversation_id: &str, parent: Option<&str>, child: &str) -> Vec<u8> {
    let mut key = children_prefix(conversation_id, parent);
    key.extend_from_slice(child.as_bytes());
    key
}

fn tool_index_key(message_id: &str, tool_use_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(message_id.len() + tool_use_id.len() + 1);
    key.extend_from_slice(message_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(tool_use_id.as_bytes());
    key
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, GraphError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| GraphError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GraphError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| GraphError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| GraphError::Serialization(e.to_string()))?;
    Ok(value)
}

// Tool uses carry free-form JSON, which bincode cannot round-trip.
fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, GraphError> {
    let raw = serde_json::to_vec(value).map_err(|e| GraphError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GraphError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| GraphError::Compression(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| GraphError::Serialization(e.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
