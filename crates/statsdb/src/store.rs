use crate::ring::{WindowRing, WriteOutcome};
use crate::value::{FieldKind, FieldSchema, Value};
use crate::{now_epoch, Key, SHARD_HASH_SEED};
use prost::Message;
use proto_breakwater::{RepType, ReplicationMsg, ReplicationSink, SdbOpType, SdbOperation};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

// Matches the original deployment defaults: half a million tracked keys per
// store, one expiry pass per second.
const DEFAULT_SOFT_MAX_ENTRIES: usize = 524_288;
const DEFAULT_EXPIRE_SLEEP_MS: u64 = 1_000;

struct Entry {
    last_access: i64,
    fields: HashMap<String, WindowRing>,
}

struct Shard {
    map: RwLock<HashMap<String, Entry>>,
    /// High-watermark of entries ever held.
    max_size: AtomicUsize,
}

struct Inner {
    name: String,
    window_size: i64,
    num_windows: usize,
    shards: Vec<Shard>,
    schema: RwLock<FieldSchema>,
    v4_prefix: AtomicU8,
    v6_prefix: AtomicU8,
    replicated: AtomicBool,
    soft_max_entries: AtomicUsize,
    expire_sleep_ms: AtomicU64,
    sink: RwLock<Option<ReplicationSink>>,
}

/// A named sliding-window statistics store. Cheap to clone; clones share
/// state, like the registry and every expiry worker do.
#[derive(Clone)]
pub struct StatsDb {
    inner: Arc<Inner>,
}

/// An opaque snapshot of one entry, produced by [`StatsDb::dump_shard`] and
/// consumed by [`StatsDb::restore_entry`].
#[derive(Clone)]
pub struct DumpEntry {
    last_access: i64,
    fields: HashMap<String, WindowRing>,
}

impl StatsDb {
    pub fn new(name: &str, window_size: i64, num_windows: usize, num_shards: usize) -> StatsDb {
        let num_shards = num_shards.max(1);
        StatsDb {
            inner: Arc::new(Inner {
                name: name.to_string(),
                window_size: window_size.max(1),
                num_windows: num_windows.max(1),
                shards: (0..num_shards)
                    .map(|_| Shard {
                        map: RwLock::new(HashMap::new()),
                        max_size: AtomicUsize::new(0),
                    })
                    .collect(),
                schema: RwLock::new(FieldSchema::new()),
                v4_prefix: AtomicU8::new(32),
                v6_prefix: AtomicU8::new(128),
                replicated: AtomicBool::new(false),
                soft_max_entries: AtomicUsize::new(DEFAULT_SOFT_MAX_ENTRIES),
                expire_sleep_ms: AtomicU64::new(DEFAULT_EXPIRE_SLEEP_MS),
                sink: RwLock::new(None),
            }),
        }
    }

    pub fn with_fields(
        name: &str,
        window_size: i64,
        num_windows: usize,
        num_shards: usize,
        schema: FieldSchema,
    ) -> StatsDb {
        let db = StatsDb::new(name, window_size, num_windows, num_shards);
        db.set_fields(schema);
        db
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn window_size(&self) -> i64 {
        self.inner.window_size
    }

    pub fn num_windows(&self) -> usize {
        self.inner.num_windows
    }

    pub fn num_shards(&self) -> usize {
        self.inner.shards.len()
    }

    /// Add fields to the schema. Existing entries keep their rings; writes
    /// to fields outside the schema are dropped.
    pub fn set_fields(&self, schema: FieldSchema) {
        self.inner.schema.write().unwrap().extend(schema);
    }

    pub fn field_kinds(&self) -> Vec<(String, FieldKind)> {
        let schema = self.inner.schema.read().unwrap();
        let mut kinds: Vec<_> = schema.iter().map(|(k, v)| (k.clone(), *v)).collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        kinds
    }

    /// Applied to address keys before shard hashing. Does not rekey
    /// existing entries.
    pub fn set_v4_prefix(&self, bits: u8) {
        self.inner.v4_prefix.store(bits.min(32), Ordering::Relaxed);
    }

    pub fn set_v6_prefix(&self, bits: u8) {
        self.inner.v6_prefix.store(bits.min(128), Ordering::Relaxed);
    }

    pub fn enable_replication(&self) {
        self.inner.replicated.store(true, Ordering::Relaxed);
    }

    pub fn disable_replication(&self) {
        self.inner.replicated.store(false, Ordering::Relaxed);
    }

    pub fn replication_status(&self) -> bool {
        self.inner.replicated.load(Ordering::Relaxed)
    }

    /// Install the transport handoff used when this store replicates.
    pub fn set_replication_sink(&self, sink: ReplicationSink) {
        *self.inner.sink.write().unwrap() = Some(sink);
    }

    pub fn size(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.map.read().unwrap().len())
            .sum()
    }

    pub fn max_size(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.max_size.load(Ordering::Relaxed))
            .sum()
    }

    pub fn set_size_soft(&self, size: usize) {
        self.inner.soft_max_entries.store(size, Ordering::Relaxed);
    }

    pub fn set_expire_sleep(&self, ms: u64) {
        self.inner
            .expire_sleep_ms
            .store(ms.max(1), Ordering::Relaxed);
    }

    pub fn key_string(&self, key: &Key) -> String {
        key.canonicalize(
            self.inner.v4_prefix.load(Ordering::Relaxed),
            self.inner.v6_prefix.load(Ordering::Relaxed),
        )
    }

    fn shard_index(&self, key: &str) -> usize {
        let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), SHARD_HASH_SEED)
            .unwrap_or_default();
        hash as usize % self.inner.shards.len()
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.inner.shards[self.shard_index(key)]
    }

    fn current_epoch(&self, now: i64) -> i64 {
        now.div_euclid(self.inner.window_size)
    }

    fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.inner.schema.read().unwrap().get(field).copied()
    }

    // ---- mutations ----

    pub fn add(&self, key: &Key, field: &str, value: Value, offset: Option<i64>) {
        self.add_internal(key, field, value, offset, true);
    }

    pub fn add_internal(
        &self,
        key: &Key,
        field: &str,
        value: Value,
        offset: Option<i64>,
        replicate: bool,
    ) {
        self.add_at(key, field, value, offset, replicate, now_epoch());
    }

    pub(crate) fn add_at(
        &self,
        key: &Key,
        field: &str,
        value: Value,
        offset: Option<i64>,
        replicate: bool,
        now: i64,
    ) {
        // Explicit offsets pair with string-form values only; the wire
        // format has a single integer slot, which an integer add already
        // occupies.
        if offset.is_some() && matches!(value, Value::Int(_)) {
            tracing::debug!(db = %self.inner.name, field, "dropping integer add with window offset");
            ops::metrics::SDB_TYPE_MISMATCH.inc();
            return;
        }

        let Some(kind) = self.field_kind(field) else {
            tracing::debug!(db = %self.inner.name, field, "dropping write to unknown field");
            ops::metrics::SDB_TYPE_MISMATCH.inc();
            return;
        };

        let key_str = self.key_string(key);
        let epoch = self.current_epoch(now);
        let num_windows = self.inner.num_windows;

        let outcome = {
            let shard = self.shard(&key_str);
            let mut map = shard.map.write().unwrap();
            let entry = map.entry(key_str.clone()).or_insert_with(|| Entry {
                last_access: now,
                fields: HashMap::new(),
            });
            entry.last_access = now;
            let ring = entry
                .fields
                .entry(field.to_string())
                .or_insert_with(|| WindowRing::new(kind, num_windows));
            let outcome = ring.add(epoch, offset.unwrap_or(0), &value);
            if let WriteOutcome::Ok = outcome {
                let len = map.len();
                shard.max_size.fetch_max(len, Ordering::Relaxed);
            }
            outcome
        };

        match outcome {
            WriteOutcome::Ok => {}
            WriteOutcome::TypeMismatch => {
                tracing::debug!(db = %self.inner.name, field, "dropping type-mismatched value");
                ops::metrics::SDB_TYPE_MISMATCH.inc();
                return;
            }
            WriteOutcome::OutOfRange => {
                ops::metrics::SDB_BUCKET_DROP.inc();
                return;
            }
        }

        if replicate && self.replication_status() {
            let op = match &value {
                Value::Int(v) => self.sdb_op(SdbOpType::Add, &key_str, Some(field), None, Some(*v)),
                other => {
                    // Address values travel in their plain string form.
                    let item = other.as_sketch_item().unwrap_or_default();
                    self.sdb_op(SdbOpType::Add, &key_str, Some(field), Some(item), offset)
                }
            };
            self.replicate(op);
        }
    }

    pub fn sub(&self, key: &Key, field: &str, value: Value) {
        self.sub_internal(key, field, value, true);
    }

    pub fn sub_internal(&self, key: &Key, field: &str, value: Value, replicate: bool) {
        self.sub_at(key, field, value, replicate, now_epoch());
    }

    pub(crate) fn sub_at(&self, key: &Key, field: &str, value: Value, replicate: bool, now: i64) {
        let Some(kind) = self.field_kind(field) else {
            tracing::debug!(db = %self.inner.name, field, "dropping sub on unknown field");
            ops::metrics::SDB_TYPE_MISMATCH.inc();
            return;
        };

        let key_str = self.key_string(key);
        let epoch = self.current_epoch(now);
        let num_windows = self.inner.num_windows;

        let outcome = {
            let shard = self.shard(&key_str);
            let mut map = shard.map.write().unwrap();
            let entry = map.entry(key_str.clone()).or_insert_with(|| Entry {
                last_access: now,
                fields: HashMap::new(),
            });
            entry.last_access = now;
            let ring = entry
                .fields
                .entry(field.to_string())
                .or_insert_with(|| WindowRing::new(kind, num_windows));
            ring.sub(epoch, &value)
        };

        if outcome != WriteOutcome::Ok {
            tracing::debug!(db = %self.inner.name, field, "dropping sub on non-additive field");
            ops::metrics::SDB_TYPE_MISMATCH.inc();
            return;
        }

        if replicate && self.replication_status() {
            let op = match &value {
                Value::Int(v) => self.sdb_op(SdbOpType::Sub, &key_str, Some(field), None, Some(*v)),
                other => {
                    let item = other.as_sketch_item().unwrap_or_default();
                    self.sdb_op(SdbOpType::Sub, &key_str, Some(field), Some(item), None)
                }
            };
            self.replicate(op);
        }
    }

    pub fn reset(&self, key: &Key) {
        self.reset_internal(key, true);
    }

    pub fn reset_internal(&self, key: &Key, replicate: bool) {
        self.reset_at(key, replicate, now_epoch());
    }

    pub(crate) fn reset_at(&self, key: &Key, replicate: bool, now: i64) {
        let key_str = self.key_string(key);
        {
            let mut map = self.shard(&key_str).map.write().unwrap();
            if let Some(entry) = map.get_mut(&key_str) {
                entry.last_access = now;
                for ring in entry.fields.values_mut() {
                    ring.reset();
                }
            }
        }

        if replicate && self.replication_status() {
            let op = self.sdb_op(SdbOpType::Reset, &key_str, None, None, None);
            self.replicate(op);
        }
    }

    pub fn reset_field(&self, key: &Key, field: &str) {
        self.reset_field_internal(key, field, true);
    }

    pub fn reset_field_internal(&self, key: &Key, field: &str, replicate: bool) {
        let key_str = self.key_string(key);
        {
            let mut map = self.shard(&key_str).map.write().unwrap();
            if let Some(ring) = map
                .get_mut(&key_str)
                .and_then(|entry| entry.fields.get_mut(field))
            {
                ring.reset();
            }
        }

        if replicate && self.replication_status() {
            let op = self.sdb_op(SdbOpType::ResetField, &key_str, Some(field), None, None);
            self.replicate(op);
        }
    }

    // ---- queries ----

    pub fn get(&self, key: &Key, field: &str, aux: Option<&str>) -> i64 {
        self.get_at(key, field, aux, now_epoch())
    }

    pub(crate) fn get_at(&self, key: &Key, field: &str, aux: Option<&str>, now: i64) -> i64 {
        self.read_ring(key, field, |ring| {
            ring.aggregate(self.current_epoch(now), aux).unwrap_or(0)
        })
    }

    pub fn get_current(&self, key: &Key, field: &str, aux: Option<&str>) -> i64 {
        self.get_current_at(key, field, aux, now_epoch())
    }

    pub(crate) fn get_current_at(
        &self,
        key: &Key,
        field: &str,
        aux: Option<&str>,
        now: i64,
    ) -> i64 {
        self.read_ring(key, field, |ring| {
            ring.current(self.current_epoch(now), aux).unwrap_or(0)
        })
    }

    /// Per-window values, newest first. An unknown key or field yields all
    /// zeroes rather than an error.
    pub fn get_windows(&self, key: &Key, field: &str, aux: Option<&str>) -> Vec<i64> {
        self.get_windows_at(key, field, aux, now_epoch())
    }

    pub(crate) fn get_windows_at(
        &self,
        key: &Key,
        field: &str,
        aux: Option<&str>,
        now: i64,
    ) -> Vec<i64> {
        let key_str = self.key_string(key);
        let map = self.shard(&key_str).map.read().unwrap();
        match map.get(&key_str).and_then(|e| e.fields.get(field)) {
            Some(ring) => ring.windows(self.current_epoch(now), aux),
            None => vec![0; self.inner.num_windows],
        }
    }

    /// Aggregate every schema field that has an integer projection without
    /// an auxiliary argument (count sketches are skipped).
    pub fn get_all_fields(&self, key: &Key) -> Vec<(String, i64)> {
        self.get_all_fields_at(key, now_epoch())
    }

    pub(crate) fn get_all_fields_at(&self, key: &Key, now: i64) -> Vec<(String, i64)> {
        let epoch = self.current_epoch(now);
        let key_str = self.key_string(key);
        let map = self.shard(&key_str).map.read().unwrap();
        let entry = map.get(&key_str);

        self.field_kinds()
            .into_iter()
            .filter_map(|(name, kind)| {
                if kind == FieldKind::CountMin {
                    return None;
                }
                let value = entry
                    .and_then(|e| e.fields.get(&name))
                    .and_then(|ring| ring.aggregate(epoch, None))
                    .unwrap_or(0);
                Some((name, value))
            })
            .collect()
    }

    fn read_ring<F: FnOnce(&WindowRing) -> i64>(&self, key: &Key, field: &str, f: F) -> i64 {
        let key_str = self.key_string(key);
        let map = self.shard(&key_str).map.read().unwrap();
        match map.get(&key_str).and_then(|e| e.fields.get(field)) {
            Some(ring) => f(ring),
            None => 0,
        }
    }

    // ---- replication ----

    fn sdb_op(
        &self,
        op_type: SdbOpType,
        key: &str,
        field: Option<&str>,
        str_param: Option<String>,
        int_param: Option<i64>,
    ) -> SdbOperation {
        SdbOperation {
            op_type: op_type as i32,
            db_name: self.inner.name.clone(),
            key: key.to_string(),
            field_name: field.map(|f| f.to_string()),
            str_param,
            int_param,
        }
    }

    fn replicate(&self, op: SdbOperation) {
        let sink = self.inner.sink.read().unwrap();
        if let Some(sink) = sink.as_ref() {
            sink(ReplicationMsg {
                rep_type: RepType::Sdb as i32,
                rep_op: op.encode_to_vec(),
            });
        }
    }

    /// Apply an operation received from a peer. Inbound applications never
    /// replicate again.
    pub fn apply(&self, op: &SdbOperation) {
        let key = Key::Str(op.key.clone());
        match SdbOpType::try_from(op.op_type).unwrap_or(SdbOpType::None) {
            SdbOpType::None => {}
            SdbOpType::Reset => self.reset_internal(&key, false),
            SdbOpType::ResetField => {
                let Some(field) = op.field_name.as_deref() else {
                    tracing::warn!(db = %self.inner.name, "reset-field operation without field name");
                    return;
                };
                self.reset_field_internal(&key, field, false);
            }
            SdbOpType::Add => {
                let Some(field) = op.field_name.as_deref() else {
                    tracing::warn!(db = %self.inner.name, "add operation without field name");
                    return;
                };
                match (&op.str_param, op.int_param) {
                    (Some(s), offset @ Some(_)) => {
                        self.add_internal(&key, field, Value::Str(s.clone()), offset, false)
                    }
                    (Some(s), None) => {
                        self.add_internal(&key, field, Value::Str(s.clone()), None, false)
                    }
                    (None, Some(v)) => self.add_internal(&key, field, Value::Int(v), None, false),
                    (None, None) => {
                        tracing::warn!(db = %self.inner.name, "malformed add operation")
                    }
                }
            }
            SdbOpType::Sub => {
                let Some(field) = op.field_name.as_deref() else {
                    tracing::warn!(db = %self.inner.name, "sub operation without field name");
                    return;
                };
                match (&op.str_param, op.int_param) {
                    (Some(s), _) => self.sub_internal(&key, field, Value::Str(s.clone()), false),
                    (None, Some(v)) => self.sub_internal(&key, field, Value::Int(v), false),
                    (None, None) => {
                        tracing::warn!(db = %self.inner.name, "malformed sub operation")
                    }
                }
            }
        }
    }

    // ---- expiry and snapshots ----

    /// Start one expiry worker per shard. Workers run for the remaining
    /// process lifetime.
    pub fn start_expire_workers(&self) {
        for shard in 0..self.inner.shards.len() {
            let db = self.clone();
            std::thread::Builder::new()
                .name(format!("bw/expire-{}-{shard}", self.inner.name))
                .spawn(move || loop {
                    let sleep = db.inner.expire_sleep_ms.load(Ordering::Relaxed);
                    std::thread::sleep(std::time::Duration::from_millis(sleep));
                    db.expire_shard_at(shard, now_epoch());
                })
                .expect("spawning expiry worker");
        }
    }

    pub(crate) fn expire_pass_at(&self, now: i64) {
        for shard in 0..self.inner.shards.len() {
            self.expire_shard_at(shard, now);
        }
    }

    fn expire_shard_at(&self, shard: usize, now: i64) {
        let horizon = self.inner.window_size * self.inner.num_windows as i64;
        let soft_max = self.inner.soft_max_entries.load(Ordering::Relaxed);
        let per_shard_cap = (soft_max / self.inner.shards.len()).max(1);

        let current_epoch = now.div_euclid(self.inner.window_size);
        let mut map = self.inner.shards[shard].map.write().unwrap();
        let before = map.len();
        map.retain(|_, entry| {
            let idle = entry.last_access + horizon < now;
            let all_stale = !entry.fields.is_empty()
                && entry.fields.values().all(|ring| ring.is_stale(current_epoch));
            !idle && !all_stale
        });

        // Still over the soft cap: evict in last_access order.
        if map.len() > per_shard_cap {
            let mut by_access: Vec<(i64, String)> = map
                .iter()
                .map(|(k, e)| (e.last_access, k.clone()))
                .collect();
            by_access.sort();
            let excess = map.len() - per_shard_cap;
            for (_, key) in by_access.into_iter().take(excess) {
                map.remove(&key);
            }
        }

        let evicted = before - map.len();
        if evicted > 0 {
            tracing::debug!(
                db = %self.inner.name,
                shard,
                evicted,
                remaining = map.len(),
                "expiry pass"
            );
        }
    }

    /// Snapshot one shard's entries. Takes the shard read lock for the
    /// duration of the copy, never across I/O.
    pub fn dump_shard(&self, shard: usize) -> Vec<(String, DumpEntry)> {
        let map = self.inner.shards[shard].map.read().unwrap();
        map.iter()
            .map(|(k, e)| {
                (
                    k.clone(),
                    DumpEntry {
                        last_access: e.last_access,
                        fields: e.fields.clone(),
                    },
                )
            })
            .collect()
    }

    /// Repopulate an entry from a snapshot, e.g. after restart.
    pub fn restore_entry(&self, key: &str, entry: DumpEntry) {
        let mut map = self.shard(key).map.write().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                last_access: entry.last_access,
                fields: entry.fields,
            },
        );
        let len = map.len();
        self.inner.shards[self.shard_index(key)]
            .max_size
            .fetch_max(len, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse_field_schema;
    use std::net::IpAddr;
    use std::sync::Mutex;

    fn int_db(name: &str) -> StatsDb {
        StatsDb::with_fields(
            name,
            10,
            6,
            1,
            parse_field_schema([("f", "int")]).unwrap(),
        )
    }

    #[test]
    fn sum_and_expiry_across_windows() {
        let db = int_db("s");
        db.add_at(&Key::from("k1"), "f", Value::Int(3), None, false, 0);
        db.add_at(&Key::from("k1"), "f", Value::Int(5), None, false, 12);

        assert_eq!(db.get_at(&Key::from("k1"), "f", None, 12), 8);
        assert_eq!(db.get_current_at(&Key::from("k1"), "f", None, 12), 5);
        assert_eq!(db.get_at(&Key::from("k1"), "f", None, 65), 0);
    }

    #[test]
    fn type_mismatches_drop_silently() {
        let db = int_db("mismatch");
        db.add_at(&Key::from("k"), "f", Value::from("str"), None, false, 0);
        db.add_at(&Key::from("k"), "nosuch", Value::Int(1), None, false, 0);
        assert_eq!(db.get_at(&Key::from("k"), "f", None, 0), 0);
    }

    #[test]
    fn out_of_range_offsets_drop() {
        let db = StatsDb::with_fields(
            "offsets",
            10,
            6,
            1,
            parse_field_schema([("who", "distinct_strings")]).unwrap(),
        );
        let k = Key::from("k");
        db.add_at(&k, "who", Value::from("a"), Some(6), false, 100);
        assert_eq!(db.get_at(&k, "who", None, 100), 0);
        db.add_at(&k, "who", Value::from("a"), Some(1), false, 100);
        assert_eq!(db.get_at(&k, "who", None, 100), 1);
    }

    #[test]
    fn sub_clamps_at_zero() {
        let db = int_db("subs");
        let k = Key::from("k");
        db.add_at(&k, "f", Value::Int(5), None, false, 0);
        db.sub_at(&k, "f", Value::Int(2), false, 0);
        assert_eq!(db.get_at(&k, "f", None, 0), 3);
        db.sub_at(&k, "f", Value::Int(100), false, 0);
        assert_eq!(db.get_at(&k, "f", None, 0), 0);
    }

    #[test]
    fn address_keys_use_prefixes_without_rekeying() {
        let db = int_db("prefix");
        db.set_v4_prefix(24);
        let addr: IpAddr = "192.0.2.17".parse().unwrap();
        db.add_at(&Key::from(addr), "f", Value::Int(1), None, false, 0);
        assert_eq!(db.get_at(&Key::from("192.0.2.0/24"), "f", None, 0), 1);

        // Narrowing the prefix re-keys new lookups but not stored entries.
        db.set_v4_prefix(32);
        assert_eq!(db.get_at(&Key::from(addr), "f", None, 0), 0);
        assert_eq!(db.get_at(&Key::from("192.0.2.0/24"), "f", None, 0), 1);
    }

    #[test]
    fn reset_zeroes_all_fields() {
        let db = StatsDb::with_fields(
            "resets",
            10,
            6,
            2,
            parse_field_schema([("a", "int"), ("b", "int")]).unwrap(),
        );
        let k = Key::from("k");
        db.add_at(&k, "a", Value::Int(2), None, false, 0);
        db.add_at(&k, "b", Value::Int(3), None, false, 0);
        db.reset_at(&k, false, 0);
        assert_eq!(db.get_at(&k, "a", None, 0), 0);
        assert_eq!(db.get_at(&k, "b", None, 0), 0);
    }

    #[test]
    fn get_all_fields_skips_count_sketches() {
        let db = StatsDb::with_fields(
            "all",
            10,
            6,
            1,
            parse_field_schema([("n", "int"), ("cm", "countmin"), ("d", "distinct_strings")])
                .unwrap(),
        );
        let k = Key::from("k");
        db.add_at(&k, "n", Value::Int(4), None, false, 0);
        db.add_at(&k, "d", Value::from("x"), None, false, 0);
        db.add_at(&k, "cm", Value::from("x"), None, false, 0);

        let fields = db.get_all_fields_at(&k, 0);
        assert_eq!(
            fields,
            vec![("d".to_string(), 1), ("n".to_string(), 4)]
        );
    }

    #[test]
    fn soft_cap_eviction_keeps_most_recent() {
        let db = StatsDb::with_fields(
            "cap",
            10_000,
            6,
            4,
            parse_field_schema([("f", "int")]).unwrap(),
        );
        db.set_size_soft(1_000);
        for i in 0..4_000i64 {
            db.add_at(&Key::Str(format!("key-{i}")), "f", Value::Int(1), None, false, i);
        }
        assert_eq!(db.size(), 4_000);

        db.expire_pass_at(4_000);
        assert!(db.size() <= 1_000, "size {} exceeds soft cap", db.size());
        // The most recently accessed keys survive.
        assert_eq!(db.get_at(&Key::from("key-3999"), "f", None, 4_000), 1);
        assert_eq!(db.get_at(&Key::from("key-0"), "f", None, 4_000), 0);
        assert!(db.max_size() >= 4_000);
    }

    #[test]
    fn stale_entries_expire() {
        let db = int_db("stale");
        db.add_at(&Key::from("old"), "f", Value::Int(1), None, false, 0);
        db.add_at(&Key::from("new"), "f", Value::Int(1), None, false, 100);
        db.expire_pass_at(100);
        assert_eq!(db.size(), 1);
        assert_eq!(db.get_at(&Key::from("new"), "f", None, 100), 1);
    }

    #[test]
    fn replication_sink_sees_outbound_only() {
        let db = int_db("repl");
        db.enable_replication();
        let captured: Arc<Mutex<Vec<ReplicationMsg>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_capture = captured.clone();
        db.set_replication_sink(Arc::new(move |msg| {
            sink_capture.lock().unwrap().push(msg);
        }));

        db.add(&Key::from("u:1"), "f", Value::Int(4), None);
        assert_eq!(captured.lock().unwrap().len(), 1);

        // Applying the captured operation on a peer must not replicate again.
        let peer = int_db("repl");
        peer.enable_replication();
        let peer_captured: Arc<Mutex<Vec<ReplicationMsg>>> = Arc::new(Mutex::new(Vec::new()));
        let peer_capture = peer_captured.clone();
        peer.set_replication_sink(Arc::new(move |msg| {
            peer_capture.lock().unwrap().push(msg);
        }));

        let msg = captured.lock().unwrap().remove(0);
        let op = SdbOperation::decode(msg.rep_op.as_slice()).unwrap();
        peer.apply(&op);
        assert_eq!(peer.get(&Key::from("u:1"), "f", None), 4);
        assert!(peer_captured.lock().unwrap().is_empty());

        // Replaying the same commutative op grows monotonically.
        peer.apply(&op);
        assert_eq!(peer.get(&Key::from("u:1"), "f", None), 8);
    }

    #[test]
    fn disabled_replication_stays_local() {
        let db = int_db("local");
        let captured: Arc<Mutex<Vec<ReplicationMsg>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_capture = captured.clone();
        db.set_replication_sink(Arc::new(move |msg| {
            sink_capture.lock().unwrap().push(msg);
        }));

        db.add(&Key::from("k"), "f", Value::Int(1), None);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn dump_and_restore_round_trip() {
        let db = int_db("dump");
        db.add_at(&Key::from("k"), "f", Value::Int(7), None, false, 0);

        let restored = int_db("dump2");
        for shard in 0..db.num_shards() {
            for (key, entry) in db.dump_shard(shard) {
                restored.restore_entry(&key, entry);
            }
        }
        assert_eq!(restored.get_at(&Key::from("k"), "f", None, 0), 7);
    }
}
