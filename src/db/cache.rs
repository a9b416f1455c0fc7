use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use byteorder::NativeEndian;
use heed::types::{DecodeIgnore, SerdeBincode, Str, U32};
use heed::{Database, Env, EnvOpenOptions, RoTxn, WithTls};
use log::{debug, error, info, warn};

use super::model::{EmbeddingEntry, MetaKey};

/// 缓存格式版本，不一致时整个缓存会被丢弃重建
pub const SCHEMA_VERSION: u32 = 2;

/// 模型 ID 的最大字节数，lmdb 的键不能超过 511 字节
pub const MAX_MODEL_ID_LEN: usize = 256;

/// lmdb 的虚拟地址空间大小，实际占用按需增长
const MAP_SIZE: usize = 1 << 34;

type EntryDb = Database<Str, SerdeBincode<EmbeddingEntry>>;

enum Pending {
    Put(EmbeddingEntry),
    Remove,
}

/// 无法写入的记录
#[derive(Debug)]
pub struct RejectedEntry {
    pub entry: EmbeddingEntry,
    pub reason: String,
}

/// 一次提交的结果
#[derive(Debug, Default)]
pub struct Commit {
    pub written: usize,
    pub rejected: Vec<RejectedEntry>,
}

/// 持久化的嵌入向量缓存，键为 `(path, model_id)`
///
/// 数据库中的键为 `"{model_id}\0{blake3(path)}"`，长度与路径无关，完整路径保存在记录中。
///
/// 写入先进入内存缓冲区，调用 [`FingerprintCache::flush`] 时在同一个写事务中提交，
/// 读取会优先查看缓冲区。缓存损坏或版本不一致时视为空缓存。
pub struct FingerprintCache {
    path: PathBuf,
    env: Env<WithTls>,
    db_entry: EntryDb,
    db_meta: Database<Str, U32<NativeEndian>>,
    pending: Mutex<HashMap<String, Pending>>,
}

fn path_digest(path: &Path) -> String {
    blake3::hash(path.as_os_str().as_encoded_bytes()).to_hex().to_string()
}

fn entry_key(model_id: &str, path: &Path) -> String {
    format!("{}\0{}", model_id, path_digest(path))
}

/// 只影响单条记录的写入错误，其余错误说明整个缓存不可用
fn is_record_error(e: &heed::Error) -> bool {
    matches!(e, heed::Error::Encoding(_) | heed::Error::Mdb(heed::MdbError::BadValSize))
}

fn model_prefix(model_id: &str) -> String {
    format!("{}\0", model_id)
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('\0')
}

impl FingerprintCache {
    /// 打开缓存，不存在则创建
    ///
    /// 无法读取或版本不兼容的缓存会被删除并重新创建，只有重建本身失败时才会返回错误
    pub fn open(path: impl AsRef<Path>) -> heed::Result<Self> {
        let path = path.as_ref();
        match Self::open_inner(path) {
            Ok(cache) => Ok(cache),
            Err(e) => {
                warn!("缓存不可用，将重建: {} ({})", path.display(), e);
                if path.exists() {
                    std::fs::remove_dir_all(path)?;
                }
                Self::open_inner(path)
            }
        }
    }

    fn open_inner(path: &Path) -> heed::Result<Self> {
        std::fs::create_dir_all(path)?;
        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE).max_dbs(2).open(path)? };
        let mut txn = env.write_txn()?;
        let db_entry: EntryDb = env.create_database(&mut txn, Some("entry"))?;
        let db_meta: Database<Str, U32<NativeEndian>> =
            env.create_database(&mut txn, Some("meta"))?;
        match db_meta.get(&txn, MetaKey::SchemaVersion.as_ref())? {
            Some(SCHEMA_VERSION) => {}
            Some(version) => {
                return Err(heed::Error::Io(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("schema version mismatch: {} != {}", version, SCHEMA_VERSION),
                )));
            }
            None => {
                db_meta.put(&mut txn, MetaKey::SchemaVersion.as_ref(), &SCHEMA_VERSION)?;
            }
        }
        txn.commit()?;
        info!("打开缓存: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            env,
            db_entry,
            db_meta,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap()
    }

    /// 查询缓存记录，无法解码的记录视为不存在
    pub fn lookup(&self, path: &Path, model_id: &str) -> heed::Result<Option<EmbeddingEntry>> {
        let key = entry_key(model_id, path);
        if let Some(op) = self.pending().get(&key) {
            return Ok(match op {
                Pending::Put(entry) => Some(entry.clone()),
                Pending::Remove => None,
            });
        }
        let txn = self.env.read_txn()?;
        match self.db_entry.get(&txn, &key) {
            Ok(entry) => Ok(entry),
            Err(heed::Error::Decoding(e)) => {
                warn!("缓存记录损坏，忽略: {} ({})", path.display(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 插入或覆盖记录
    pub fn put(&self, entry: EmbeddingEntry) {
        let key = entry_key(&entry.model_id, &entry.path);
        self.pending().insert(key, Pending::Put(entry));
    }

    pub fn remove(&self, path: &Path, model_id: &str) {
        self.pending().insert(entry_key(model_id, path), Pending::Remove);
    }

    /// 删除某个路径在所有模型下的记录
    pub fn remove_all_for_path(&self, path: &Path) -> heed::Result<usize> {
        self.remove_all_for_paths(&HashSet::from([path.to_path_buf()]))
    }

    /// 删除一批路径在所有模型下的记录，只需遍历一次缓存
    pub fn remove_all_for_paths(&self, paths: &HashSet<PathBuf>) -> heed::Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let digests = paths.iter().map(|path| path_digest(path)).collect::<HashSet<_>>();
        let mut keys = vec![];
        {
            let txn = self.env.read_txn()?;
            for item in self.db_entry.remap_data_type::<DecodeIgnore>().iter(&txn)? {
                let (key, ()) = item?;
                if let Some((_, digest)) = split_key(key) {
                    if digests.contains(digest) {
                        keys.push(key.to_owned());
                    }
                }
            }
        }
        let mut pending = self.pending();
        for (key, op) in pending.iter_mut() {
            if let Pending::Put(entry) = op {
                if paths.contains(&entry.path) {
                    keys.push(key.clone());
                }
            }
        }
        let count = keys.len();
        for key in keys {
            pending.insert(key, Pending::Remove);
        }
        Ok(count)
    }

    /// 未提交的写入数量
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// 在一个写事务中提交所有缓冲的写入，返回提交的数量
    ///
    /// 无法写入的单条记录会被丢弃，见 [`FingerprintCache::commit`]
    pub fn flush(&self) -> heed::Result<usize> {
        self.commit().map(|commit| commit.written)
    }

    /// 在一个写事务中提交所有缓冲的写入
    ///
    /// 单条记录的写入失败不影响其他记录，失败的记录从缓冲区中移除并在结果中返回
    pub fn commit(&self) -> heed::Result<Commit> {
        let mut pending = self.pending();
        let mut commit = Commit::default();
        if pending.is_empty() {
            return Ok(commit);
        }
        let mut txn = self.env.write_txn()?;
        let mut rejected = HashMap::new();
        for (key, op) in pending.iter() {
            let result = match op {
                Pending::Put(entry) => self.db_entry.put(&mut txn, key, entry),
                Pending::Remove => self.db_entry.delete(&mut txn, key).map(|_| ()),
            };
            match result {
                Ok(()) => commit.written += 1,
                Err(e) if is_record_error(&e) => {
                    rejected.insert(key.clone(), e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        txn.commit()?;
        for (key, op) in pending.drain() {
            let Some(reason) = rejected.remove(&key) else {
                continue;
            };
            match op {
                Pending::Put(entry) => {
                    warn!("缓存记录无法写入，已丢弃: {} ({})", entry.path.display(), reason);
                    commit.rejected.push(RejectedEntry { entry, reason });
                }
                Pending::Remove => warn!("缓存记录无法删除: {}", reason),
            }
        }
        debug!("缓存提交 {} 条写入", commit.written);
        Ok(commit)
    }

    /// 提交缓冲区后打开一个只读快照，快照内看不到之后的写入
    pub fn snapshot(&self) -> heed::Result<CacheSnapshot<'_>> {
        self.flush()?;
        let txn = self.env.read_txn()?;
        Ok(CacheSnapshot { txn, db_entry: self.db_entry })
    }

    /// 各模型的记录数量
    pub fn models(&self) -> heed::Result<BTreeMap<String, usize>> {
        self.flush()?;
        let txn = self.env.read_txn()?;
        let mut models = BTreeMap::new();
        for item in self.db_entry.remap_data_type::<DecodeIgnore>().iter(&txn)? {
            let (key, ()) = item?;
            if let Some((model, _)) = split_key(key) {
                *models.entry(model.to_owned()).or_insert(0) += 1;
            }
        }
        Ok(models)
    }

    /// 删除某个模型的全部记录
    pub fn remove_model(&self, model_id: &str) -> heed::Result<usize> {
        self.flush()?;
        let prefix = model_prefix(model_id);
        let mut txn = self.env.write_txn()?;
        let keys = self
            .db_entry
            .remap_data_type::<DecodeIgnore>()
            .prefix_iter(&txn, &prefix)?
            .map(|item| item.map(|(key, ())| key.to_owned()))
            .collect::<heed::Result<Vec<_>>>()?;
        for key in &keys {
            self.db_entry.delete(&mut txn, key)?;
        }
        txn.commit()?;
        Ok(keys.len())
    }

    /// 清空所有记录
    pub fn clear(&self) -> heed::Result<()> {
        self.pending().clear();
        let mut txn = self.env.write_txn()?;
        self.db_entry.clear(&mut txn)?;
        txn.commit()?;
        Ok(())
    }

    #[cfg(test)]
    fn set_schema_version(&self, version: u32) -> heed::Result<()> {
        let mut txn = self.env.write_txn()?;
        self.db_meta.put(&mut txn, MetaKey::SchemaVersion.as_ref(), &version)?;
        txn.commit()
    }
}

impl Drop for FingerprintCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("关闭缓存时提交失败: {}", e);
        }
    }
}

/// 缓存的只读快照
pub struct CacheSnapshot<'a> {
    txn: RoTxn<'a, WithTls>,
    db_entry: EntryDb,
}

impl CacheSnapshot<'_> {
    /// 惰性遍历某个模型的全部记录，无法解码的记录会被跳过
    pub fn iterate(
        &self,
        model_id: &str,
    ) -> heed::Result<impl Iterator<Item = heed::Result<EmbeddingEntry>> + '_> {
        let prefix = model_prefix(model_id);
        let iter = self.db_entry.prefix_iter(&self.txn, &prefix)?;
        Ok(iter.filter_map(|item| match item {
            Ok((_, entry)) => Some(Ok(entry)),
            Err(heed::Error::Decoding(e)) => {
                warn!("缓存记录损坏，跳过: {}", e);
                None
            }
            Err(e) => Some(Err(e)),
        }))
    }

    /// 某个模型的记录数量
    pub fn count(&self, model_id: &str) -> heed::Result<usize> {
        let prefix = model_prefix(model_id);
        let mut count = 0;
        for item in self.db_entry.remap_data_type::<DecodeIgnore>().prefix_iter(&self.txn, &prefix)? {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
