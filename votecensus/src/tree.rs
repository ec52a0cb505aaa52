use crate::*;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum depth of a census tree
pub const MAX_LEVELS: usize = 256;

const ROOT_KEY: &[u8] = b"root";

const NODE_LEAF: u8 = 0x01;
const NODE_MIDDLE: u8 = 0x02;

/// Options a census tree is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    pub census_type: CensusType,
    /// Claims carry an explicit key instead of being indexed by their own prefix
    pub indexed: bool,
    pub max_levels: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            census_type: CensusType::default(),
            indexed: false,
            max_levels: MAX_LEVELS,
        }
    }
}

/// A node of the sparse Merkle tree as persisted in the store
#[derive(Debug, Clone)]
pub enum Node {
    Empty,
    Leaf(Claim),
    Middle(Hash, Hash),
}

impl Node {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Node::Empty => vec![],
            Node::Leaf(claim) => {
                let mut out = Vec::with_capacity(1 + CLAIM_RECORD_SIZE);
                out.push(NODE_LEAF);
                out.extend_from_slice(&claim.to_bytes());
                out
            }
            Node::Middle(left, right) => {
                let mut out = Vec::with_capacity(1 + 2 * HASH_LEN);
                out.push(NODE_MIDDLE);
                out.extend_from_slice(left.as_bytes());
                out.extend_from_slice(right.as_bytes());
                out
            }
        }
    }

    fn from_bytes(key: &Hash, bytes: &[u8]) -> Result<Self, Error> {
        match bytes.split_first() {
            Some((&NODE_LEAF, rest)) => Ok(Node::Leaf(Claim::from_bytes(rest)?)),
            Some((&NODE_MIDDLE, rest)) if rest.len() == 2 * HASH_LEN => Ok(Node::Middle(
                Hash::from_slice(&rest[..HASH_LEN])?,
                Hash::from_slice(&rest[HASH_LEN..])?,
            )),
            _ => Err(Error::CorruptedNode(key.to_hex())),
        }
    }
}

/// Nodes written by an in-flight mutation, readable before they are committed
#[derive(Default)]
struct Staging {
    batch: Batch,
    nodes: HashMap<Hash, Node>,
}

impl Staging {
    fn put(&mut self, key: Hash, node: Node) -> Hash {
        self.batch.set(key.as_bytes().to_vec(), node.to_bytes());
        self.nodes.insert(key, node);
        key
    }
}

/// A Merkle tree over census claims.
///
/// The path of a leaf is the bit sequence of its index hash, and a leaf lives at the shallowest
/// level where that path is unique. The root therefore only depends on the set of claims.
pub struct CensusTree<S: Store> {
    store: S,
    options: TreeOptions,
    root: RwLock<Hash>,
    published: AtomicBool,
    snapshot: bool,
    write_lock: Mutex<()>,
}

impl<S: Store> CensusTree<S> {
    /// Open, or create, the tree persisted under `namespace`
    pub fn open(parent: &S, namespace: &str, options: TreeOptions) -> Result<Self, Error> {
        if namespace.is_empty() {
            return Err(Error::InvalidNamespace);
        }
        if options.max_levels < 2 || options.max_levels > MAX_LEVELS {
            return Err(Error::InvalidMaxLevels(options.max_levels));
        }
        let store = parent.namespace(namespace)?;
        let root = match store.get(ROOT_KEY)? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map_err(|_| Error::CorruptedNode("root".to_owned()))?,
            None => Hash::ZERO,
        };
        Ok(CensusTree {
            store,
            options,
            root: RwLock::new(root),
            published: AtomicBool::new(false),
            snapshot: false,
            write_lock: Mutex::new(()),
        })
    }

    /// Physically remove a tree's storage
    pub fn delete_storage(parent: &S, namespace: &str) -> Result<(), Error> {
        parent.drop_namespace(namespace)
    }

    pub fn options(&self) -> TreeOptions {
        self.options
    }

    pub fn census_type(&self) -> CensusType {
        self.options.census_type
    }

    pub fn max_claim_size(&self) -> usize {
        MAX_CLAIM_SIZE
    }

    /// Freeze the tree. No claims can be added afterwards.
    pub fn publish(&self) {
        self.published.store(true, Ordering::SeqCst);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// The current root
    pub fn root(&self) -> Hash {
        *self.root.read()
    }

    /// Encode a payload the way this tree indexes it
    pub fn claim(&self, payload: &[u8]) -> Result<Claim, Error> {
        if self.options.indexed {
            return Err(Error::NotIndexed);
        }
        Claim::encode(payload)
    }

    /// Encode a keyed payload, for indexed trees
    pub fn keyed_claim(&self, key: &[u8], payload: &[u8]) -> Result<Claim, Error> {
        if !self.options.indexed {
            return Err(Error::NotIndexed);
        }
        Claim::with_key(key, payload)
    }

    pub fn add_claim(&self, payload: &[u8]) -> Result<(), Error> {
        let claim = self.claim(payload)?;
        self.add(&claim)
    }

    pub fn add_keyed_claim(&self, key: &[u8], payload: &[u8]) -> Result<(), Error> {
        let claim = self.keyed_claim(key, payload)?;
        self.add(&claim)
    }

    /// Insert an encoded claim and update the root
    pub fn add(&self, claim: &Claim) -> Result<(), Error> {
        if self.is_published() || self.snapshot {
            return Err(Error::ReadOnly);
        }
        self.insert_all(std::slice::from_ref(claim))
    }

    /// Add every claim of a dump in a single atomic write
    pub fn import_dump(&self, claims: &[Claim]) -> Result<(), Error> {
        if self.snapshot {
            return Err(Error::ReadOnly);
        }
        // A published tree may still be populated from a dump while it is empty
        if self.is_published() && !self.root().is_zero() {
            return Err(Error::ReadOnly);
        }
        debug!("importing {} claims", claims.len());
        self.insert_all(claims)
    }

    fn insert_all(&self, claims: &[Claim]) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let mut staging = Staging::default();
        let mut root = self.root();
        for claim in claims {
            let ct = self.options.census_type;
            let h_index = claim.hash_index(ct);
            let h_value = claim.hash_value(ct);
            root = self.add_leaf(&mut staging, claim, &h_index, &h_value, root, 0)?;
        }
        staging.batch.set(ROOT_KEY.to_vec(), root.as_bytes().to_vec());
        self.store.apply(staging.batch)?;
        *self.root.write() = root;
        Ok(())
    }

    fn add_leaf(
        &self,
        staging: &mut Staging,
        claim: &Claim,
        h_index: &Hash,
        h_value: &Hash,
        key: Hash,
        level: usize,
    ) -> Result<Hash, Error> {
        if level > self.options.max_levels - 1 {
            return Err(Error::ReachedMaxLevels);
        }
        let ct = self.options.census_type;
        match self.staged_node(staging, &key)? {
            Node::Empty => {
                let leaf = leaf_key(ct, h_index, h_value);
                Ok(staging.put(leaf, Node::Leaf(claim.clone())))
            }
            Node::Leaf(old) => {
                let old_index = old.hash_index(ct);
                if old_index == *h_index {
                    return Err(Error::AlreadyExists(format!("claim {}", h_index)));
                }
                self.push_leaf(staging, claim, h_index, h_value, key, &old_index, level)
            }
            Node::Middle(left, right) => {
                let (left, right) = if h_index.bit(level) {
                    let right = self.add_leaf(staging, claim, h_index, h_value, right, level + 1)?;
                    (left, right)
                } else {
                    let left = self.add_leaf(staging, claim, h_index, h_value, left, level + 1)?;
                    (left, right)
                };
                let middle = middle_key(ct, &left, &right);
                Ok(staging.put(middle, Node::Middle(left, right)))
            }
        }
    }

    // Push an existing leaf down until its path diverges from the new one
    #[allow(clippy::too_many_arguments)]
    fn push_leaf(
        &self,
        staging: &mut Staging,
        claim: &Claim,
        h_index: &Hash,
        h_value: &Hash,
        old_key: Hash,
        old_index: &Hash,
        level: usize,
    ) -> Result<Hash, Error> {
        if level > self.options.max_levels - 2 {
            return Err(Error::ReachedMaxLevels);
        }
        let ct = self.options.census_type;
        let new_bit = h_index.bit(level);
        let (left, right) = if new_bit == old_index.bit(level) {
            let next = self.push_leaf(
                staging,
                claim,
                h_index,
                h_value,
                old_key,
                old_index,
                level + 1,
            )?;
            if new_bit {
                (Hash::ZERO, next)
            } else {
                (next, Hash::ZERO)
            }
        } else {
            let leaf = staging.put(
                leaf_key(ct, h_index, h_value),
                Node::Leaf(claim.clone()),
            );
            if new_bit {
                (old_key, leaf)
            } else {
                (leaf, old_key)
            }
        };
        let middle = middle_key(ct, &left, &right);
        Ok(staging.put(middle, Node::Middle(left, right)))
    }

    fn staged_node(&self, staging: &Staging, key: &Hash) -> Result<Node, Error> {
        match staging.nodes.get(key) {
            Some(node) => Ok(node.clone()),
            None => self.node(key),
        }
    }

    /// Fetch a node by its key
    pub fn node(&self, key: &Hash) -> Result<Node, Error> {
        if key.is_zero() {
            return Ok(Node::Empty);
        }
        match self.store.get(key.as_bytes())? {
            Some(bytes) => Node::from_bytes(key, &bytes),
            None => Err(Error::CorruptedNode(format!("missing node {}", key))),
        }
    }

    /// Whether a node with this key is stored. Returns false for the empty node.
    pub fn hash_exists(&self, key: &Hash) -> Result<bool, Error> {
        if key.is_zero() {
            return Ok(false);
        }
        self.store.contains(key.as_bytes())
    }

    /// Generate an inclusion proof for a payload.
    ///
    /// An empty result means the claim is not in the tree.
    pub fn gen_proof(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let claim = self.claim(payload)?;
        self.gen_claim_proof(&claim)
    }

    pub fn gen_keyed_proof(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, Error> {
        let claim = self.keyed_claim(key, payload)?;
        self.gen_claim_proof(&claim)
    }

    pub fn gen_claim_proof(&self, claim: &Claim) -> Result<Vec<u8>, Error> {
        let ct = self.options.census_type;
        let h_index = claim.hash_index(ct);
        let h_value = claim.hash_value(ct);

        let mut path = Vec::new();
        let mut key = self.root();
        for level in 0..self.options.max_levels {
            match self.node(&key)? {
                Node::Empty => return Ok(vec![]),
                Node::Leaf(leaf) => {
                    if leaf.hash_index(ct) == h_index && leaf.hash_value(ct) == h_value {
                        return Ok(Proof::from_path(ct, &path).to_bytes());
                    }
                    return Ok(vec![]);
                }
                Node::Middle(left, right) => {
                    if h_index.bit(level) {
                        path.push(left);
                        key = right;
                    } else {
                        path.push(right);
                        key = left;
                    }
                }
            }
        }
        Err(Error::ReachedMaxLevels)
    }

    /// Check a proof for a payload against the current root
    pub fn check_proof(&self, proof: &[u8], payload: &[u8]) -> Result<bool, Error> {
        check_proof(self.root().as_bytes(), proof, payload)
    }

    fn resolve_root(&self, root: Option<&Hash>) -> Hash {
        match root {
            Some(root) => *root,
            None => self.root(),
        }
    }

    /// Visit every node reachable from `root`, depth first, left before right
    pub fn walk<F>(&self, root: Option<&Hash>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Hash, &Node),
    {
        let root = self.resolve_root(root);
        if root.is_zero() {
            return Ok(());
        }
        if !self.hash_exists(&root)? {
            return Err(Error::NotFound(format!("root {}", root)));
        }
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            let node = self.node(&key)?;
            if let Node::Middle(left, right) = &node {
                if !right.is_zero() {
                    stack.push(*right);
                }
                if !left.is_zero() {
                    stack.push(*left);
                }
            }
            f(&key, &node);
        }
        Ok(())
    }

    /// Every claim reachable from `root`, or from the current root
    pub fn dump(&self, root: Option<&Hash>) -> Result<Vec<Claim>, Error> {
        let mut claims = Vec::new();
        self.walk(root, |_, node| {
            if let Node::Leaf(claim) = node {
                claims.push(claim.clone());
            }
        })?;
        Ok(claims)
    }

    /// The decoded payloads reachable from `root`, as base64 or as NFC normalized text
    pub fn dump_plain(&self, root: Option<&Hash>, as_base64: bool) -> Result<Vec<String>, Error> {
        use base64::Engine;

        let mut out = Vec::new();
        self.walk(root, |_, node| {
            if let Node::Leaf(claim) = node {
                let fields = [claim.value_slot()];
                if as_base64 {
                    let payload = decode_leaf_to_payload(&fields);
                    out.push(base64::engine::general_purpose::STANDARD.encode(payload));
                } else {
                    out.push(decode_leaf_to_text(&fields));
                }
            }
        })?;
        Ok(out)
    }

    /// Number of leaves reachable from `root`. Walks the whole tree.
    pub fn size(&self, root: Option<&Hash>) -> Result<u64, Error> {
        let mut size = 0;
        self.walk(root, |_, node| {
            if let Node::Leaf(_) = node {
                size += 1;
            }
        })?;
        Ok(size)
    }

    /// A read-only view of the tree pinned at `root`
    pub fn snapshot(&self, root: Option<&Hash>) -> Result<CensusTree<S>, Error> {
        let root = self.resolve_root(root);
        if !root.is_zero() && !self.hash_exists(&root)? {
            return Err(Error::NotFound(format!("root {}", root)));
        }
        Ok(CensusTree {
            store: self.store.clone(),
            options: self.options,
            root: RwLock::new(root),
            published: AtomicBool::new(true),
            snapshot: true,
            write_lock: Mutex::new(()),
        })
    }
}
