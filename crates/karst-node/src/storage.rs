//! RocksDB-backed persistent stores.
//!
//! One database, column families per store. Write cursors buffer into an
//! atomic [`WriteBatch`] with a read-your-writes overlay; dropping a
//! cursor without committing discards the batch. A per-store mutex
//! enforces the single-writer rule while readers go straight to the last
//! committed state, so concurrent readers are supported.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};

use karst_core::error::StorageError;
use karst_core::store::{
    ChainStateCursor, HeaderStore, InvalidBlockStore, MempoolCursor, StorageBackend,
};
use karst_core::types::{
    BlockHeader, BlockUndo, ChainedHeader, Hash256, TxOutput, TxOutputKey, UnconfirmedTx,
    UnspentTx,
};

const CF_HEADERS: &str = "headers";
const CF_CHAIN_STATE: &str = "chain_state";
const CF_OUTPUTS: &str = "outputs";
const CF_UNDO: &str = "undo";
const CF_METADATA: &str = "metadata";
const CF_MEMPOOL: &str = "mempool";
const CF_MEMPOOL_SPENDS: &str = "mempool_spends";
const CF_INVALID: &str = "invalid_blocks";

const ALL_CFS: &[&str] = &[
    CF_HEADERS,
    CF_CHAIN_STATE,
    CF_OUTPUTS,
    CF_UNDO,
    CF_METADATA,
    CF_MEMPOOL,
    CF_MEMPOOL_SPENDS,
    CF_INVALID,
];

const META_CHAIN_TIP: &[u8] = b"chain_tip";
const META_UTXO_COUNT: &[u8] = b"unspent_tx_count";
const META_MEMPOOL_TIP: &[u8] = b"mempool_tip";

type WriteGate = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, ()>;
type Overlay = HashMap<(&'static str, Vec<u8>), Option<Vec<u8>>>;

fn backend_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StorageError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(value)
}

/// Output key as 36 fixed bytes: hash, then big-endian index for ordered
/// prefix scans.
fn output_key_bytes(key: &TxOutputKey) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[0..32].copy_from_slice(key.tx_hash.as_bytes());
    out[32..36].copy_from_slice(&key.index.to_be_bytes());
    out
}

fn tip_bytes(tip: (u32, Hash256)) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[0..4].copy_from_slice(&tip.0.to_be_bytes());
    out[4..36].copy_from_slice(tip.1.as_bytes());
    out
}

fn tip_from_bytes(bytes: &[u8]) -> Result<(u32, Hash256), StorageError> {
    if bytes.len() != 36 {
        return Err(StorageError::Serialization("chain tip row has wrong length".into()));
    }
    let height = u32::from_be_bytes(bytes[0..4].try_into().expect("4 bytes"));
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[4..36]);
    Ok((height, Hash256(hash)))
}

/// RocksDB-backed [`StorageBackend`].
pub struct RocksBackend {
    db: Arc<DB>,
    chain_gate: Arc<Mutex<()>>,
    mempool_gate: Arc<Mutex<()>>,
}

impl RocksBackend {
    /// Open or create the database, creating all column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), descriptors)
            .map_err(backend_err)?;

        Ok(Self {
            db: Arc::new(db),
            chain_gate: Arc::new(Mutex::new(())),
            mempool_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Flush all memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(backend_err)
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, StorageError> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::Backend(format!("missing column family: {name}")))
}

impl StorageBackend for RocksBackend {
    fn begin_chain_state(
        &self,
        read_only: bool,
    ) -> Result<Box<dyn ChainStateCursor>, StorageError> {
        let gate = if read_only { None } else { Some(self.chain_gate.lock_arc()) };
        Ok(Box::new(RocksChainStateCursor {
            db: Arc::clone(&self.db),
            batch: WriteBatch::default(),
            overlay: Overlay::new(),
            gate,
        }))
    }

    fn begin_mempool(&self) -> Result<Box<dyn MempoolCursor>, StorageError> {
        Ok(Box::new(RocksMempoolCursor {
            db: Arc::clone(&self.db),
            batch: WriteBatch::default(),
            overlay: Overlay::new(),
            _gate: self.mempool_gate.lock_arc(),
        }))
    }

    fn header_index(&self) -> Arc<dyn HeaderStore> {
        Arc::new(RocksHeaderStore { db: Arc::clone(&self.db) })
    }

    fn invalid_block_cache(&self) -> Arc<dyn InvalidBlockStore> {
        Arc::new(RocksInvalidBlockStore { db: Arc::clone(&self.db) })
    }

    fn supports_concurrent_readers(&self) -> bool {
        // Readers see the last committed state; writers buffer in a batch.
        true
    }
}

/// Shared get/put/delete over batch + overlay.
struct CursorCore;

impl CursorCore {
    fn get(
        db: &DB,
        overlay: &Overlay,
        cf_name: &'static str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = overlay.get(&(cf_name, key.to_vec())) {
            return Ok(staged.clone());
        }
        db.get_cf(cf(db, cf_name)?, key).map_err(backend_err)
    }

    fn put(
        db: &DB,
        batch: &mut WriteBatch,
        overlay: &mut Overlay,
        cf_name: &'static str,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        batch.put_cf(cf(db, cf_name)?, key, &value);
        overlay.insert((cf_name, key.to_vec()), Some(value));
        Ok(())
    }

    fn delete(
        db: &DB,
        batch: &mut WriteBatch,
        overlay: &mut Overlay,
        cf_name: &'static str,
        key: &[u8],
    ) -> Result<(), StorageError> {
        batch.delete_cf(cf(db, cf_name)?, key);
        overlay.insert((cf_name, key.to_vec()), None);
        Ok(())
    }

    /// Committed rows of a column family merged with the overlay.
    fn scan(
        db: &DB,
        overlay: &Overlay,
        cf_name: &'static str,
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError> {
        let mut rows = HashMap::new();
        for item in db.iterator_cf(cf(db, cf_name)?, IteratorMode::Start) {
            let (key, value) = item.map_err(backend_err)?;
            rows.insert(key.to_vec(), value.to_vec());
        }
        for ((name, key), value) in overlay {
            if *name != cf_name {
                continue;
            }
            match value {
                Some(v) => rows.insert(key.clone(), v.clone()),
                None => rows.remove(key),
            };
        }
        Ok(rows)
    }
}

struct RocksChainStateCursor {
    db: Arc<DB>,
    batch: WriteBatch,
    overlay: Overlay,
    gate: Option<WriteGate>,
}

impl RocksChainStateCursor {
    fn check_writable(&self) -> Result<(), StorageError> {
        if self.gate.is_some() { Ok(()) } else { Err(StorageError::ReadOnly) }
    }

    fn get(&self, cf_name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        CursorCore::get(&self.db, &self.overlay, cf_name, key)
    }

    fn put(&mut self, cf_name: &'static str, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.check_writable()?;
        CursorCore::put(&self.db, &mut self.batch, &mut self.overlay, cf_name, key, value)
    }

    fn delete(&mut self, cf_name: &'static str, key: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        CursorCore::delete(&self.db, &mut self.batch, &mut self.overlay, cf_name, key)
    }
}

impl ChainStateCursor for RocksChainStateCursor {
    fn read_only(&self) -> bool {
        self.gate.is_none()
    }

    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError> {
        self.get(CF_METADATA, META_CHAIN_TIP)?
            .map(|bytes| tip_from_bytes(&bytes))
            .transpose()
    }

    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError> {
        match tip {
            Some(tip) => self.put(CF_METADATA, META_CHAIN_TIP, tip_bytes(tip).to_vec()),
            None => self.delete(CF_METADATA, META_CHAIN_TIP),
        }
    }

    fn unspent_tx_count(&self) -> Result<u64, StorageError> {
        match self.get(CF_METADATA, META_UTXO_COUNT)? {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
            }
            Some(_) => Err(StorageError::Serialization("utxo count row has wrong length".into())),
            None => Ok(0),
        }
    }

    fn set_unspent_tx_count(&mut self, count: u64) -> Result<(), StorageError> {
        self.put(CF_METADATA, META_UTXO_COUNT, count.to_le_bytes().to_vec())
    }

    fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, StorageError> {
        self.get(CF_CHAIN_STATE, tx_hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn try_add_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError> {
        if self.try_get_unspent_tx(tx_hash)?.is_some() {
            return Ok(false);
        }
        let row = encode(row)?;
        self.put(CF_CHAIN_STATE, tx_hash.as_bytes(), row)?;
        Ok(true)
    }

    fn try_update_unspent_tx(
        &mut self,
        tx_hash: &Hash256,
        row: &UnspentTx,
    ) -> Result<bool, StorageError> {
        if self.try_get_unspent_tx(tx_hash)?.is_none() {
            return Ok(false);
        }
        let row = encode(row)?;
        self.put(CF_CHAIN_STATE, tx_hash.as_bytes(), row)?;
        Ok(true)
    }

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, StorageError> {
        if self.try_get_unspent_tx(tx_hash)?.is_none() {
            return Ok(false);
        }
        self.delete(CF_CHAIN_STATE, tx_hash.as_bytes())?;
        Ok(true)
    }

    fn try_get_unspent_output(
        &self,
        key: &TxOutputKey,
    ) -> Result<Option<TxOutput>, StorageError> {
        self.get(CF_OUTPUTS, &output_key_bytes(key))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn try_add_unspent_output(
        &mut self,
        key: &TxOutputKey,
        output: &TxOutput,
    ) -> Result<bool, StorageError> {
        let raw = output_key_bytes(key);
        if self.get(CF_OUTPUTS, &raw)?.is_some() {
            return Ok(false);
        }
        self.put(CF_OUTPUTS, &raw, encode(output)?)?;
        Ok(true)
    }

    fn try_remove_unspent_output(&mut self, key: &TxOutputKey) -> Result<bool, StorageError> {
        let raw = output_key_bytes(key);
        if self.get(CF_OUTPUTS, &raw)?.is_none() {
            return Ok(false);
        }
        self.delete(CF_OUTPUTS, &raw)?;
        Ok(true)
    }

    fn block_undo(&self, block: &Hash256) -> Result<Option<BlockUndo>, StorageError> {
        self.get(CF_UNDO, block.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn put_block_undo(&mut self, block: &Hash256, undo: &BlockUndo) -> Result<(), StorageError> {
        let undo = encode(undo)?;
        self.put(CF_UNDO, block.as_bytes(), undo)
    }

    fn remove_block_undo(&mut self, block: &Hash256) -> Result<bool, StorageError> {
        if self.block_undo(block)?.is_none() {
            return Ok(false);
        }
        self.delete(CF_UNDO, block.as_bytes())?;
        Ok(true)
    }

    fn unspent_txs(&self) -> Result<Vec<(Hash256, UnspentTx)>, StorageError> {
        let rows = CursorCore::scan(&self.db, &self.overlay, CF_CHAIN_STATE)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() != 32 {
                return Err(StorageError::Serialization("chain state key has wrong length".into()));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            out.push((Hash256(hash), decode(&value)?));
        }
        Ok(out)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.check_writable()?;
        let this = *self;
        this.db.write(this.batch).map_err(backend_err)
    }
}

struct RocksMempoolCursor {
    db: Arc<DB>,
    batch: WriteBatch,
    overlay: Overlay,
    _gate: WriteGate,
}

impl RocksMempoolCursor {
    fn get(&self, cf_name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        CursorCore::get(&self.db, &self.overlay, cf_name, key)
    }

    fn put(&mut self, cf_name: &'static str, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        CursorCore::put(&self.db, &mut self.batch, &mut self.overlay, cf_name, key, value)
    }

    fn delete(&mut self, cf_name: &'static str, key: &[u8]) -> Result<(), StorageError> {
        CursorCore::delete(&self.db, &mut self.batch, &mut self.overlay, cf_name, key)
    }

    fn spend_key(key: &TxOutputKey, txid: &Hash256) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[0..36].copy_from_slice(&output_key_bytes(key));
        out[36..68].copy_from_slice(txid.as_bytes());
        out
    }
}

impl MempoolCursor for RocksMempoolCursor {
    fn chain_tip(&self) -> Result<Option<(u32, Hash256)>, StorageError> {
        self.get(CF_METADATA, META_MEMPOOL_TIP)?
            .map(|bytes| tip_from_bytes(&bytes))
            .transpose()
    }

    fn set_chain_tip(&mut self, tip: Option<(u32, Hash256)>) -> Result<(), StorageError> {
        match tip {
            Some(tip) => self.put(CF_METADATA, META_MEMPOOL_TIP, tip_bytes(tip).to_vec()),
            None => self.delete(CF_METADATA, META_MEMPOOL_TIP),
        }
    }

    fn get_tx(&self, txid: &Hash256) -> Result<Option<UnconfirmedTx>, StorageError> {
        self.get(CF_MEMPOOL, txid.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn put_tx(&mut self, tx: &UnconfirmedTx) -> Result<(), StorageError> {
        let row = encode(tx)?;
        self.put(CF_MEMPOOL, tx.txid.as_bytes(), row)
    }

    fn remove_tx(&mut self, txid: &Hash256) -> Result<bool, StorageError> {
        if self.get_tx(txid)?.is_none() {
            return Ok(false);
        }
        self.delete(CF_MEMPOOL, txid.as_bytes())?;
        Ok(true)
    }

    fn add_spender(&mut self, key: &TxOutputKey, txid: &Hash256) -> Result<(), StorageError> {
        self.put(CF_MEMPOOL_SPENDS, &Self::spend_key(key, txid), Vec::new())
    }

    fn remove_spender(
        &mut self,
        key: &TxOutputKey,
        txid: &Hash256,
    ) -> Result<bool, StorageError> {
        let raw = Self::spend_key(key, txid);
        if self.get(CF_MEMPOOL_SPENDS, &raw)?.is_none() {
            return Ok(false);
        }
        self.delete(CF_MEMPOOL_SPENDS, &raw)?;
        Ok(true)
    }

    fn spenders(&self, key: &TxOutputKey) -> Result<Vec<Hash256>, StorageError> {
        let prefix = output_key_bytes(key);
        let mut found: HashSet<Hash256> = HashSet::new();

        let handle = cf(&self.db, CF_MEMPOOL_SPENDS)?;
        for item in self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix.as_slice(), Direction::Forward))
        {
            let (raw, _) = item.map_err(backend_err)?;
            if !raw.starts_with(&prefix) {
                break;
            }
            if raw.len() == 68 {
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&raw[36..68]);
                found.insert(Hash256(txid));
            }
        }

        // Staged index entries shadow the committed rows.
        for ((name, raw), value) in &self.overlay {
            if *name != CF_MEMPOOL_SPENDS || !raw.starts_with(&prefix) || raw.len() != 68 {
                continue;
            }
            let mut txid = [0u8; 32];
            txid.copy_from_slice(&raw[36..68]);
            match value {
                Some(_) => found.insert(Hash256(txid)),
                None => found.remove(&Hash256(txid)),
            };
        }

        Ok(found.into_iter().collect())
    }

    fn txs(&self) -> Result<Vec<UnconfirmedTx>, StorageError> {
        let rows = CursorCore::scan(&self.db, &self.overlay, CF_MEMPOOL)?;
        rows.values().map(|bytes| decode(bytes)).collect()
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        this.db.write(this.batch).map_err(backend_err)
    }
}

struct RocksHeaderStore {
    db: Arc<DB>,
}

impl HeaderStore for RocksHeaderStore {
    fn put(&self, chained: &ChainedHeader) -> Result<(), StorageError> {
        let mut work = [0u8; 32];
        chained.total_work.to_big_endian(&mut work);
        let row = encode(&(chained.header, chained.height, work))?;
        self.db
            .put_cf(cf(&self.db, CF_HEADERS)?, chained.hash.as_bytes(), row)
            .map_err(backend_err)
    }

    fn load_all(&self) -> Result<Vec<ChainedHeader>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf(&self.db, CF_HEADERS)?, IteratorMode::Start) {
            let (_, value) = item.map_err(backend_err)?;
            let (header, height, work): (BlockHeader, u32, [u8; 32]) = decode(&value)?;
            out.push(ChainedHeader {
                hash: header.hash(),
                header,
                height,
                total_work: U256::from_big_endian(&work),
            });
        }
        Ok(out)
    }
}

struct RocksInvalidBlockStore {
    db: Arc<DB>,
}

impl InvalidBlockStore for RocksInvalidBlockStore {
    fn put(&self, hash: &Hash256, reason: &str) -> Result<(), StorageError> {
        self.db
            .put_cf(cf(&self.db, CF_INVALID)?, hash.as_bytes(), reason.as_bytes())
            .map_err(backend_err)
    }

    fn load_all(&self) -> Result<Vec<(Hash256, String)>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf(&self.db, CF_INVALID)?, IteratorMode::Start) {
            let (key, value) = item.map_err(backend_err)?;
            if key.len() != 32 {
                return Err(StorageError::Serialization("invalid-block key has wrong length".into()));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            out.push((Hash256(hash), String::from_utf8_lossy(&value).into_owned()));
        }
        Ok(out)
    }
}
