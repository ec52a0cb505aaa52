use crate::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

const REFERENCE_PREFIX: &[u8] = b"cr_";
const TREE_PREFIX: &str = "cs_";
const REFERENCE_VERSION: u8 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Persisted metadata of a census. The tree itself is never part of it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct ReferenceRecord {
    version: u8,
    auth_token: Option<Uuid>,
    census_type: CensusType,
    indexed: bool,
    is_public: bool,
}

impl ReferenceRecord {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let record: ReferenceRecord = serde_cbor::from_slice(bytes)?;
        if record.version != REFERENCE_VERSION {
            return Err(Error::UnsupportedVersion {
                record: "census reference",
                version: record.version,
            });
        }
        Ok(record)
    }
}

/// A loaded census: its identity, access control and the tree itself
pub struct CensusRef<S: Store> {
    id: Vec<u8>,
    tree: Arc<CensusTree<S>>,
    auth_token: Option<Uuid>,
    census_type: CensusType,
    indexed: bool,
}

impl<S: Store> CensusRef<S> {
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn tree(&self) -> &Arc<CensusTree<S>> {
        &self.tree
    }

    pub fn auth_token(&self) -> Option<&Uuid> {
        self.auth_token.as_ref()
    }

    pub fn census_type(&self) -> CensusType {
        self.census_type
    }

    pub fn indexed(&self) -> bool {
        self.indexed
    }

    pub fn is_public(&self) -> bool {
        self.tree.is_published()
    }

    /// A `None` token skips the check entirely
    fn check_auth(&self, token: Option<&Uuid>) -> Result<(), Error> {
        match (token, &self.auth_token) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(Error::CensusLocked),
            (Some(given), Some(stored)) if given != stored => Err(Error::WrongAuthToken),
            _ => Ok(()),
        }
    }

    fn record(&self) -> ReferenceRecord {
        ReferenceRecord {
            version: REFERENCE_VERSION,
            auth_token: self.auth_token,
            census_type: self.census_type,
            indexed: self.indexed,
            is_public: self.is_public(),
        }
    }
}

impl<S: Store> std::fmt::Debug for CensusRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CensusRef")
            .field("id", &hex::encode(&self.id))
            .field("census_type", &self.census_type)
            .field("indexed", &self.indexed)
            .field("is_public", &self.is_public())
            .field("root", &self.tree.root())
            .finish()
    }
}

/// A census exported for import elsewhere, as JSON
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CensusDump {
    #[serde(rename = "type")]
    pub census_type: CensusType,

    #[serde(
        rename = "rootHash",
        default,
        with = "serde_base64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub root_hash: Option<Vec<u8>>,

    /// Compressed claim records, see [`encode_dump`]
    #[serde(default, with = "serde_base64::option", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,

    #[serde(default)]
    pub indexed: bool,
}

/// Pack claims as concatenated fixed-size records, gzip compressed
pub fn encode_dump(claims: &[Claim]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for claim in claims {
        encoder.write_all(&claim.to_bytes())?;
    }
    Ok(encoder.finish()?)
}

/// Unpack claims produced by [`encode_dump`]. Uncompressed input is accepted as is.
pub fn decode_dump(data: &[u8]) -> Result<Vec<Claim>, Error> {
    let raw = if data.starts_with(&GZIP_MAGIC) {
        let mut raw = Vec::new();
        GzDecoder::new(data).read_to_end(&mut raw)?;
        raw
    } else {
        data.to_vec()
    };

    if raw.len() % CLAIM_RECORD_SIZE != 0 {
        return Err(Error::CorruptedNode(format!(
            "dump of {} bytes is not a whole number of claims",
            raw.len()
        )));
    }
    raw.chunks(CLAIM_RECORD_SIZE).map(Claim::from_bytes).collect()
}

fn reference_key(id: &[u8]) -> Vec<u8> {
    let mut key = REFERENCE_PREFIX.to_vec();
    key.extend_from_slice(id);
    key
}

fn tree_namespace(id: &[u8]) -> String {
    format!("{}{}", TREE_PREFIX, hex::encode(id))
}

fn tree_options(census_type: CensusType, indexed: bool) -> TreeOptions {
    TreeOptions {
        census_type,
        indexed,
        max_levels: MAX_LEVELS,
    }
}

/// A cache slot. Holding its lock serializes every operation on one census id.
type Slot<S> = Mutex<Option<Arc<CensusRef<S>>>>;

/// Tree namespaces queued for deletion. A marker is locked while its storage is being deleted.
type Pending = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Delete the storage of `namespace` if it is still queued.
///
/// Only callers reclaiming the same namespace wait on each other.
fn reclaim<S: Store>(store: &S, pending: &Pending, namespace: &str) -> Result<bool, Error> {
    let marker = match pending.lock().get(namespace) {
        Some(marker) => marker.clone(),
        None => return Ok(false),
    };
    let _deleting = marker.lock();
    let still_queued = pending
        .lock()
        .get(namespace)
        .map_or(false, |m| Arc::ptr_eq(m, &marker));
    if !still_queued {
        return Ok(false);
    }
    CensusTree::delete_storage(store, namespace)?;
    pending.lock().remove(namespace);
    Ok(true)
}

/// Keeps track of every census tree: creation, authenticated loading, deletion and imports.
///
/// At most one `CensusTree` instance exists per census id. Physical deletion of a tree's
/// storage happens on a background thread.
pub struct CensusRegistry<S: Store> {
    store: S,
    cache: RwLock<HashMap<Vec<u8>, Arc<Slot<S>>>>,
    pending: Arc<Pending>,
    queue: Mutex<Option<mpsc::Sender<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Store> CensusRegistry<S> {
    pub fn new(store: S) -> Result<Self, Error> {
        let pending: Arc<Pending> = Arc::default();
        let (sender, receiver) = mpsc::channel::<String>();

        let worker_store = store.clone();
        let worker_pending = pending.clone();
        let worker = std::thread::Builder::new()
            .name("census-deleter".to_owned())
            .spawn(move || {
                for namespace in receiver {
                    match reclaim(&worker_store, &worker_pending, &namespace) {
                        Ok(true) => debug!("deleted census storage {}", namespace),
                        Ok(false) => {}
                        Err(e) => warn!("error deleting census storage {}: {}", namespace, e),
                    }
                }
            })?;

        Ok(CensusRegistry {
            store,
            cache: RwLock::new(HashMap::new()),
            pending,
            queue: Mutex::new(Some(sender)),
            worker: Some(worker),
        })
    }

    /// Run `f` holding the slot of `id`, creating the slot if needed
    fn with_slot<T, F>(&self, id: &[u8], f: F) -> T
    where
        F: FnOnce(&Arc<Slot<S>>, &mut Option<Arc<CensusRef<S>>>) -> T,
    {
        loop {
            let existing = self.cache.read().get(id).cloned();
            let slot = match existing {
                Some(slot) => slot,
                None => self
                    .cache
                    .write()
                    .entry(id.to_vec())
                    .or_default()
                    .clone(),
            };
            let mut census = slot.lock();
            // The slot may have been evicted while we waited for it
            let current = self
                .cache
                .read()
                .get(id)
                .map_or(false, |s| Arc::ptr_eq(s, &slot));
            if current {
                return f(&slot, &mut *census);
            }
        }
    }

    // Called with the slot locked and empty
    fn forget_slot(&self, id: &[u8], slot: &Arc<Slot<S>>) {
        let mut cache = self.cache.write();
        if cache.get(id).map_or(false, |s| Arc::ptr_eq(s, slot)) {
            cache.remove(id);
        }
    }

    /// Create a census and cache it.
    ///
    /// Only loaded censuses are considered when checking for an existing id.
    pub fn create(
        &self,
        id: &[u8],
        census_type: CensusType,
        indexed: bool,
        public: bool,
        auth_token: Option<Uuid>,
    ) -> Result<Arc<CensusRef<S>>, Error> {
        self.with_slot(id, |slot, cached| {
            if cached.is_some() {
                return Err(Error::AlreadyExists(format!("census {}", hex::encode(id))));
            }
            match self.open_new(id, census_type, indexed, public, auth_token) {
                Ok(census) => {
                    *cached = Some(census.clone());
                    debug!("created census {}", hex::encode(id));
                    Ok(census)
                }
                Err(e) => {
                    self.forget_slot(id, slot);
                    Err(e)
                }
            }
        })
    }

    fn open_new(
        &self,
        id: &[u8],
        census_type: CensusType,
        indexed: bool,
        public: bool,
        auth_token: Option<Uuid>,
    ) -> Result<Arc<CensusRef<S>>, Error> {
        let namespace = tree_namespace(id);
        // Stale data of a deleted census with the same id must be gone first
        reclaim(&self.store, &self.pending, &namespace)?;

        let tree = CensusTree::open(&self.store, &namespace, tree_options(census_type, indexed))?;
        if public {
            tree.publish();
        }
        let census = Arc::new(CensusRef {
            id: id.to_vec(),
            tree: Arc::new(tree),
            auth_token,
            census_type,
            indexed,
        });
        self.persist(&census)?;
        Ok(census)
    }

    /// Return a cached census, or load it from storage.
    ///
    /// A `None` token skips authentication.
    pub fn load(&self, id: &[u8], auth_token: Option<&Uuid>) -> Result<Arc<CensusRef<S>>, Error> {
        let existing = self.cache.read().get(id).cloned();
        if let Some(slot) = existing {
            let cached = slot.lock().clone();
            if let Some(census) = cached {
                census.check_auth(auth_token)?;
                return Ok(census);
            }
        }

        self.with_slot(id, |slot, cached| {
            if let Some(census) = cached.as_ref() {
                census.check_auth(auth_token)?;
                return Ok(census.clone());
            }
            let loaded = self.open_existing(id).and_then(|census| {
                census.check_auth(auth_token)?;
                Ok(census)
            });
            match loaded {
                Ok(census) => {
                    *cached = Some(census.clone());
                    debug!("loaded census {}", hex::encode(id));
                    Ok(census)
                }
                Err(e) => {
                    self.forget_slot(id, slot);
                    Err(e)
                }
            }
        })
    }

    fn open_existing(&self, id: &[u8]) -> Result<Arc<CensusRef<S>>, Error> {
        let bytes = self
            .store
            .get(&reference_key(id))?
            .ok_or_else(|| Error::NotFound(format!("census {}", hex::encode(id))))?;
        let record = ReferenceRecord::from_bytes(&bytes)?;

        let tree = CensusTree::open(
            &self.store,
            &tree_namespace(id),
            tree_options(record.census_type, record.indexed),
        )?;
        if record.is_public {
            tree.publish();
        }
        Ok(Arc::new(CensusRef {
            id: id.to_vec(),
            tree: Arc::new(tree),
            auth_token: record.auth_token,
            census_type: record.census_type,
            indexed: record.indexed,
        }))
    }

    /// Whether the census is loaded. Persisted but not yet loaded censuses are not reported.
    pub fn exists(&self, id: &[u8]) -> bool {
        let slot = self.cache.read().get(id).cloned();
        slot.map_or(false, |slot| slot.lock().is_some())
    }

    /// Delete a census. Its storage is reclaimed in the background.
    pub fn del(&self, id: &[u8]) -> Result<(), Error> {
        let namespace = tree_namespace(id);
        self.with_slot(id, |slot, cached| {
            let mut tx = self.store.write_tx();
            tx.delete(reference_key(id));
            if let Err(e) = tx.commit() {
                if cached.is_none() {
                    self.forget_slot(id, slot);
                }
                return Err(e);
            }
            // Queued before eviction, so a create of the same id always reclaims first
            self.pending.lock().entry(namespace.clone()).or_default();
            *cached = None;
            self.forget_slot(id, slot);
            Ok(())
        })?;

        let queued = match self.queue.lock().as_ref() {
            Some(sender) => sender.send(namespace.clone()).is_ok(),
            None => false,
        };
        if !queued {
            warn!("census deleter is gone, reclaiming {} synchronously", namespace);
            reclaim(&self.store, &self.pending, &namespace)?;
        }
        Ok(())
    }

    /// Freeze a census and persist it as public
    pub fn publish(&self, id: &[u8], auth_token: Option<&Uuid>) -> Result<(), Error> {
        let census = self.load(id, auth_token)?;
        if census.is_public() {
            return Ok(());
        }
        census.tree.publish();
        self.persist(&census)
    }

    /// Export the claims of a census under `root`, or its current root, as a JSON dump
    pub fn export(&self, id: &[u8], root: Option<&Hash>) -> Result<Vec<u8>, Error> {
        let census = self.load(id, None)?;
        let root = root.copied().unwrap_or_else(|| census.tree.root());
        let claims = census.tree.dump(Some(&root))?;

        let dump = CensusDump {
            census_type: census.census_type,
            root_hash: Some(root.as_bytes().to_vec()),
            data: Some(encode_dump(&claims)?),
            indexed: census.indexed,
        };
        Ok(serde_json::to_vec(&dump)?)
    }

    /// Import a JSON dump as a new public census, identified by its root hash.
    ///
    /// If the imported claims do not reproduce the root, the census is deleted again.
    pub fn import_as_public(&self, dump: &[u8]) -> Result<Arc<CensusRef<S>>, Error> {
        let dump: CensusDump = serde_json::from_slice(dump)?;
        let (root, data) = match (dump.root_hash, dump.data) {
            (Some(root), Some(data)) => (root, data),
            _ => return Err(Error::MissingFields),
        };
        if self.exists(&root) {
            return Err(Error::AlreadyExists(format!("census {}", hex::encode(&root))));
        }
        info!(
            "importing census {} of type {:?}",
            hex::encode(&root),
            dump.census_type
        );

        let census = self.create(&root, dump.census_type, dump.indexed, true, None)?;
        if let Err(e) = populate(&census, &root, &data) {
            if let Err(del_err) = self.del(&root) {
                warn!("could not delete census {}: {}", hex::encode(&root), del_err);
            }
            return Err(e);
        }
        Ok(census)
    }

    fn persist(&self, census: &CensusRef<S>) -> Result<(), Error> {
        let record = serde_cbor::to_vec(&census.record())?;
        let mut tx = self.store.write_tx();
        tx.set(reference_key(&census.id), record);
        tx.commit()
    }
}

fn populate<S: Store>(census: &CensusRef<S>, root: &[u8], data: &[u8]) -> Result<(), Error> {
    let claims = decode_dump(data)?;
    census.tree.import_dump(&claims)?;
    if census.tree.root().as_bytes() != root {
        return Err(Error::RootMismatch);
    }
    Ok(())
}

impl<S: Store> Drop for CensusRegistry<S> {
    fn drop(&mut self) {
        // Closing the queue ends the worker once it drained what is left
        self.queue.lock().take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("census deleter panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (MemStore, CensusRegistry<MemStore>) {
        let store = MemStore::new();
        let registry = CensusRegistry::new(store.clone()).unwrap();
        (store, registry)
    }

    #[test]
    fn create_and_exists() {
        let (_, registry) = registry();
        assert!(!registry.exists(b"census-1"));

        let census = registry
            .create(b"census-1", CensusType::Sha256, false, false, None)
            .unwrap();
        census.tree().add_claim(b"voter").unwrap();
        assert!(registry.exists(b"census-1"));

        assert!(matches!(
            registry.create(b"census-1", CensusType::Sha256, false, false, None),
            Err(Error::AlreadyExists(_))
        ));

        // The cached instance is shared
        let loaded = registry.load(b"census-1", None).unwrap();
        assert!(Arc::ptr_eq(loaded.tree(), census.tree()));
    }

    #[test]
    fn load_from_storage() {
        let store = MemStore::new();
        let token = Uuid::new_v4();
        let root = {
            let registry = CensusRegistry::new(store.clone()).unwrap();
            let census = registry
                .create(b"persisted", CensusType::Blake3, true, false, Some(token))
                .unwrap();
            census.tree().add_keyed_claim(b"alice", b"1").unwrap();
            registry.publish(b"persisted", Some(&token)).unwrap();
            census.tree().root()
        };

        let registry = CensusRegistry::new(store).unwrap();
        // Not loaded yet
        assert!(!registry.exists(b"persisted"));

        let census = registry.load(b"persisted", Some(&token)).unwrap();
        assert_eq!(census.tree().root(), root);
        assert_eq!(census.census_type(), CensusType::Blake3);
        assert!(census.indexed());
        assert!(census.is_public());
        assert!(matches!(
            census.tree().add_keyed_claim(b"bob", b"1"),
            Err(Error::ReadOnly)
        ));
        assert!(registry.exists(b"persisted"));

        assert!(matches!(
            registry.load(b"missing", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn authentication() {
        let (store, registry) = registry();
        let token = Uuid::new_v4();
        registry
            .create(b"locked", CensusType::Sha256, false, false, Some(token))
            .unwrap();
        registry
            .create(b"open", CensusType::Sha256, false, false, None)
            .unwrap();

        assert!(registry.load(b"locked", Some(&token)).is_ok());
        assert!(registry.load(b"locked", None).is_ok());
        assert!(matches!(
            registry.load(b"locked", Some(&Uuid::new_v4())),
            Err(Error::WrongAuthToken)
        ));
        assert!(matches!(
            registry.load(b"open", Some(&token)),
            Err(Error::CensusLocked)
        ));
        assert!(registry.load(b"open", None).is_ok());

        // Same rules when loading from storage
        let fresh = CensusRegistry::new(store).unwrap();
        assert!(matches!(
            fresh.load(b"locked", Some(&Uuid::new_v4())),
            Err(Error::WrongAuthToken)
        ));
        assert!(!fresh.exists(b"locked"));
        assert!(matches!(
            fresh.load(b"open", Some(&token)),
            Err(Error::CensusLocked)
        ));
    }

    #[test]
    fn delete() {
        let (store, registry) = registry();
        let census = registry
            .create(b"doomed", CensusType::Sha256, false, false, None)
            .unwrap();
        census.tree().add_claim(b"voter").unwrap();
        drop(census);

        registry.del(b"doomed").unwrap();
        assert!(!registry.exists(b"doomed"));
        assert!(matches!(
            registry.load(b"doomed", None),
            Err(Error::NotFound(_))
        ));

        // Joining the worker guarantees the storage is gone
        drop(registry);
        assert_eq!(store.total_len(), 0);
    }

    #[test]
    fn recreate_after_delete_starts_empty() {
        let (_, registry) = registry();
        let census = registry
            .create(b"again", CensusType::Sha256, false, false, None)
            .unwrap();
        census.tree().add_claim(b"old voter").unwrap();
        registry.del(b"again").unwrap();

        let census = registry
            .create(b"again", CensusType::Sha256, false, false, None)
            .unwrap();
        assert!(census.tree().root().is_zero());
        census.tree().add_claim(b"new voter").unwrap();
        assert_eq!(census.tree().size(None).unwrap(), 1);
    }

    fn populated(registry: &CensusRegistry<MemStore>) -> Arc<CensusRef<MemStore>> {
        let census = registry
            .create(b"source", CensusType::Sha256, false, false, None)
            .unwrap();
        for i in 0..25u32 {
            census
                .tree()
                .add_claim(format!("voter-{}", i).as_bytes())
                .unwrap();
        }
        census
    }

    #[test]
    fn export_and_import() {
        let (_, source) = registry();
        let census = populated(&source);
        let dump = source.export(b"source", None).unwrap();

        let (_, target) = registry();
        let imported = target.import_as_public(&dump).unwrap();
        let root = census.tree().root();
        assert_eq!(imported.id(), root.as_bytes());
        assert_eq!(imported.tree().root(), root);
        assert!(imported.is_public());
        assert!(target.exists(root.as_bytes()));

        let proof = imported.tree().gen_proof(b"voter-7").unwrap();
        assert!(check_proof(root.as_bytes(), &proof, b"voter-7").unwrap());

        assert!(matches!(
            target.import_as_public(&dump),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn export_older_root() {
        let (_, registry) = registry();
        let census = populated(&registry);
        let old_root = census.tree().root();
        census.tree().add_claim(b"late voter").unwrap();

        let dump = registry.export(b"source", Some(&old_root)).unwrap();
        let dump: CensusDump = serde_json::from_slice(&dump).unwrap();
        assert_eq!(dump.root_hash, Some(old_root.as_bytes().to_vec()));
        assert_eq!(decode_dump(&dump.data.unwrap()).unwrap().len(), 25);
    }

    #[test]
    fn import_with_wrong_root_is_rolled_back() {
        let (_, source) = registry();
        populated(&source);
        let dump = source.export(b"source", None).unwrap();
        let mut dump: CensusDump = serde_json::from_slice(&dump).unwrap();
        let bogus = CensusType::Sha256.hash(&[b"bogus"]);
        dump.root_hash = Some(bogus.as_bytes().to_vec());

        let (store, target) = registry();
        assert!(matches!(
            target.import_as_public(&serde_json::to_vec(&dump).unwrap()),
            Err(Error::RootMismatch)
        ));
        assert!(!target.exists(bogus.as_bytes()));
        assert!(matches!(
            target.load(bogus.as_bytes(), None),
            Err(Error::NotFound(_))
        ));
        drop(target);
        assert_eq!(store.total_len(), 0);
    }

    #[test]
    fn import_missing_fields() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.import_as_public(br#"{"type":0,"indexed":false}"#),
            Err(Error::MissingFields)
        ));
        assert!(registry.import_as_public(b"not json").unwrap_err().is_decode());
    }

    #[test]
    fn dump_encoding() {
        let claims = vec![
            Claim::encode(b"a").unwrap(),
            Claim::with_key(b"k", b"b").unwrap(),
        ];
        let packed = encode_dump(&claims).unwrap();
        assert_eq!(&packed[..2], &GZIP_MAGIC);
        assert_eq!(decode_dump(&packed).unwrap(), claims);

        // Uncompressed records are accepted too
        let raw: Vec<u8> = claims.iter().flat_map(|c| c.to_bytes().to_vec()).collect();
        assert_eq!(decode_dump(&raw).unwrap(), claims);
        assert!(decode_dump(&raw[1..]).is_err());
        assert!(decode_dump(&[]).unwrap().is_empty());
    }

    #[test]
    fn dump_json_layout() {
        let dump = CensusDump {
            census_type: CensusType::Blake3,
            root_hash: Some(vec![0xff, 0x00, 0x01]),
            data: Some(b"cafe".to_vec()),
            indexed: true,
        };
        let json: serde_json::Value = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["rootHash"], "/wAB");
        assert_eq!(json["data"], "Y2FmZQ==");
        assert_eq!(json["indexed"], true);
    }

    #[test]
    fn sled_backed_registry() {
        let dir = tempfile::tempdir().unwrap();
        let root = {
            let store = SledStore::open(dir.path()).unwrap();
            let registry = CensusRegistry::new(store.clone()).unwrap();
            let census = registry
                .create(b"on-disk", CensusType::Sha256, false, false, None)
                .unwrap();
            census.tree().add_claim(b"a").unwrap();
            census.tree().add_claim(b"b").unwrap();
            store.flush().unwrap();
            census.tree().root()
        };

        let registry = CensusRegistry::new(SledStore::open(dir.path()).unwrap()).unwrap();
        let census = registry.load(b"on-disk", None).unwrap();
        assert_eq!(census.tree().root(), root);
        assert!(!census.tree().gen_proof(b"a").unwrap().is_empty());
    }

    #[test]
    fn unknown_reference_version() {
        let (store, registry) = registry();
        let record = ReferenceRecord {
            version: REFERENCE_VERSION + 1,
            auth_token: None,
            census_type: CensusType::Sha256,
            indexed: false,
            is_public: false,
        };
        let mut tx = store.write_tx();
        tx.set(reference_key(b"future"), serde_cbor::to_vec(&record).unwrap());
        tx.commit().unwrap();

        let err = registry.load(b"future", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { version: 2, .. }));
        assert!(err.is_decode());
        assert!(!registry.exists(b"future"));
    }

    #[test]
    fn concurrent_loads_share_one_tree() {
        use std::sync::Barrier;

        let store = MemStore::new();
        {
            let registry = CensusRegistry::new(store.clone()).unwrap();
            let census = registry
                .create(b"shared", CensusType::Sha256, false, false, None)
                .unwrap();
            census.tree().add_claim(b"voter").unwrap();
        }

        let registry = Arc::new(CensusRegistry::new(store).unwrap());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.load(b"shared", None).unwrap()
                })
            })
            .collect();
        let loaded: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for census in &loaded[1..] {
            assert!(Arc::ptr_eq(census.tree(), loaded[0].tree()));
        }
        let cached = registry.load(b"shared", None).unwrap();
        assert!(Arc::ptr_eq(cached.tree(), loaded[0].tree()));
    }

    #[test]
    fn concurrent_delete_and_recreate() {
        use std::sync::Barrier;

        let store = MemStore::new();
        for _ in 0..20 {
            let registry = Arc::new(CensusRegistry::new(store.clone()).unwrap());
            let census = registry
                .create(b"contested", CensusType::Sha256, false, false, None)
                .unwrap();
            census.tree().add_claim(b"old voter").unwrap();
            drop(census);

            let barrier = Arc::new(Barrier::new(2));
            let deleter = {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.del(b"contested").unwrap();
                })
            };
            let creator = {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .create(b"contested", CensusType::Sha256, false, false, None)
                        .map(|census| {
                            census.tree().add_claim(b"new voter").unwrap();
                            census.tree().root()
                        })
                })
            };
            deleter.join().unwrap();
            let created = creator.join().unwrap();

            // Waits for the background deletion to finish
            drop(registry);

            let registry = CensusRegistry::new(store.clone()).unwrap();
            match created {
                Ok(root) => {
                    let census = registry.load(b"contested", None).unwrap();
                    assert_eq!(census.tree().root(), root);
                    assert_eq!(census.tree().size(None).unwrap(), 1);
                    assert!(!census.tree().gen_proof(b"new voter").unwrap().is_empty());
                    assert!(census.tree().gen_proof(b"old voter").unwrap().is_empty());
                    registry.del(b"contested").unwrap();
                }
                Err(e) => {
                    assert!(matches!(e, Error::AlreadyExists(_)));
                    assert!(matches!(
                        registry.load(b"contested", None),
                        Err(Error::NotFound(_))
                    ));
                }
            }
            drop(registry);
            assert_eq!(store.total_len(), 0);
        }
    }

    /// Wraps a `MemStore` whose namespace deletion is slow
    #[derive(Clone)]
    struct SlowStore {
        inner: MemStore,
        delay: std::time::Duration,
    }

    impl Store for SlowStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn apply(&self, batch: Batch) -> Result<()> {
            self.inner.apply(batch)
        }

        fn scan(&self, prefix: &[u8], start: &[u8]) -> KvIter<'_> {
            self.inner.scan(prefix, start)
        }

        fn namespace(&self, name: &str) -> Result<Self> {
            Ok(SlowStore {
                inner: self.inner.namespace(name)?,
                delay: self.delay,
            })
        }

        fn drop_namespace(&self, name: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.drop_namespace(name)
        }
    }

    #[test]
    fn slow_deletion_does_not_block_other_censuses() {
        use std::time::{Duration, Instant};

        let delay = Duration::from_millis(1000);
        let store = SlowStore {
            inner: MemStore::new(),
            delay,
        };
        let registry = CensusRegistry::new(store.clone()).unwrap();
        let big = registry
            .create(b"big", CensusType::Sha256, false, false, None)
            .unwrap();
        big.tree().add_claim(b"voter").unwrap();
        drop(big);
        registry
            .create(b"other", CensusType::Sha256, false, false, None)
            .unwrap();

        registry.del(b"big").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        registry.del(b"other").unwrap();
        registry
            .create(b"unrelated", CensusType::Sha256, false, false, None)
            .unwrap();
        assert!(registry.exists(b"unrelated"));
        assert!(start.elapsed() < delay / 2);

        // Recreating the census being deleted waits for its old storage to go
        let big = registry
            .create(b"big", CensusType::Sha256, false, false, None)
            .unwrap();
        assert!(big.tree().root().is_zero());
        assert!(big.tree().gen_proof(b"voter").unwrap().is_empty());
    }
}
