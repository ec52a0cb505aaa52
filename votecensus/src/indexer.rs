use crate::*;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};

const TALLY_PREFIX: &[u8] = b"p/";
const VOTE_PREFIX: &[u8] = b"v/";
const TX_PREFIX: &[u8] = b"t/";
const HEIGHT_PREFIX: &[u8] = b"h/";
const TX_COUNT_KEY: &[u8] = b"m/txcount";

/// Commit events delivered by the consensus engine, in commit order.
///
/// Handlers never fail: malformed or out of order events are logged and dropped.
pub trait EventListener {
    fn on_process_created(&self, process_id: &[u8]);

    fn on_vote_cast(&self, vote: &Vote);

    fn on_new_tx(&self, block_height: u32, tx_index: i32);

    /// Persist everything buffered for the block at `height`
    fn commit(&self, height: u32) -> Result<(), Error>;

    /// Discard everything buffered since the last commit
    fn rollback(&self);
}

/// A vote as delivered by the consensus engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vote {
    pub process_id: Vec<u8>,
    pub nullifier: Vec<u8>,
    /// JSON encoded [`VotePackage`]
    pub package: Vec<u8>,
    pub weight: u64,
    pub height: u32,
    pub tx_index: i32,
}

/// The selected option for every question, in question order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct VotePackage {
    pub votes: Vec<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxReference {
    /// Sequential, gap free, starting at 1
    pub index: u64,
    pub block_height: u32,
    pub tx_block_index: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VoteReference {
    pub nullifier: Vec<u8>,
    pub process_id: Vec<u8>,
    pub height: u32,
    pub weight: u64,
    pub tx_index: i32,
    pub creation_time: DateTime<Utc>,
}

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

fn tx_key(index: u64) -> Vec<u8> {
    prefixed(TX_PREFIX, &index.to_be_bytes())
}

fn height_key(height: u32, index: u64) -> Vec<u8> {
    let mut key = prefixed(HEIGHT_PREFIX, &height.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[derive(Default)]
struct TxPool {
    pending: Vec<TxReference>,
    committed: u64,
}

/// Keeps vote tallies per process and a sequential index of every transaction.
pub struct Indexer<S: Store> {
    store: S,
    batch_size: usize,
    tx_count: AtomicU64,
    pool: Mutex<TxPool>,

    // Tally updates are read-modify-write
    write_lock: Mutex<()>,
}

impl<S: Store> Indexer<S> {
    pub fn new(store: S, batch_size: usize) -> Result<Self, Error> {
        let committed = match store.get(TX_COUNT_KEY)? {
            Some(bytes) => u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::CorruptedNode("transaction counter".to_owned()))?,
            ),
            None => 0,
        };
        debug!("indexer opened with {} transactions", committed);

        Ok(Indexer {
            store,
            batch_size: batch_size.max(1),
            tx_count: AtomicU64::new(committed),
            pool: Mutex::new(TxPool {
                pending: Vec::new(),
                committed,
            }),
            write_lock: Mutex::new(()),
        })
    }

    pub fn from_config(store: S, config: &Config) -> Result<Self, Error> {
        Self::new(store, config.tx_batch)
    }

    fn tally(&self, process_id: &[u8]) -> Result<Option<ProcessVotes>, Error> {
        match self.store.get(&prefixed(TALLY_PREFIX, process_id))? {
            Some(bytes) => Ok(Some(ProcessVotes::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn create_process(&self, process_id: &[u8]) -> Result<bool, Error> {
        let _guard = self.write_lock.lock();
        let key = prefixed(TALLY_PREFIX, process_id);
        if self.store.contains(&key)? {
            return Ok(false);
        }
        let mut tx = self.store.write_tx();
        tx.set(key, ProcessVotes::new().to_bytes()?);
        tx.commit()?;
        Ok(true)
    }

    fn add_vote(&self, vote: &Vote) -> Result<(), Error> {
        let package: VotePackage = serde_json::from_slice(&vote.package)?;
        if package.votes.len() > MAX_QUESTIONS {
            warn!(
                "too many questions ({}) in vote for process {}",
                package.votes.len(),
                hex::encode(&vote.process_id)
            );
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let vote_key = prefixed(VOTE_PREFIX, &vote.nullifier);
        if self.store.contains(&vote_key)? {
            warn!("vote {} already indexed", hex::encode(&vote.nullifier));
            return Ok(());
        }
        let mut tally = match self.tally(&vote.process_id)? {
            Some(tally) => tally,
            None => {
                warn!(
                    "process {} does not exist, skipping vote",
                    hex::encode(&vote.process_id)
                );
                return Ok(());
            }
        };

        for (question, option) in package.votes.iter().enumerate() {
            if !tally.increment(question, *option) {
                warn!("option {} overflows question {}", option, question);
            }
        }

        let reference = VoteReference {
            nullifier: vote.nullifier.clone(),
            process_id: vote.process_id.clone(),
            height: vote.height,
            weight: vote.weight,
            tx_index: vote.tx_index,
            creation_time: Utc::now(),
        };
        let mut tx = self.store.write_tx();
        tx.set(prefixed(TALLY_PREFIX, &vote.process_id), tally.to_bytes()?);
        tx.set(vote_key, serde_cbor::to_vec(&reference)?);
        tx.commit()?;

        debug!("vote added on process {}", hex::encode(&vote.process_id));
        Ok(())
    }

    /// The pruned result matrix of a process
    pub fn process_result(&self, process_id: &[u8]) -> Result<Vec<Vec<u32>>, Error> {
        match self.tally(process_id)? {
            Some(tally) => Ok(tally.pruned()),
            None => Err(Error::NotFound(format!(
                "process {}",
                hex::encode(process_id)
            ))),
        }
    }

    pub fn process_list_size(&self) -> Result<usize, Error> {
        self.store.count(TALLY_PREFIX)
    }

    /// Up to `max` process ids in key order, starting after `from` when given
    pub fn process_list(&self, max: usize, from: Option<&[u8]>) -> Result<Vec<Vec<u8>>, Error> {
        let start = prefixed(TALLY_PREFIX, from.unwrap_or_default());
        let mut list = Vec::new();
        for item in self.store.scan(TALLY_PREFIX, &start) {
            if list.len() >= max {
                break;
            }
            let (key, _) = item?;
            let id = &key[TALLY_PREFIX.len()..];
            if from == Some(id) {
                continue;
            }
            list.push(id.to_vec());
        }
        Ok(list)
    }

    pub fn get_vote_reference(&self, nullifier: &[u8]) -> Result<VoteReference, Error> {
        match self.store.get(&prefixed(VOTE_PREFIX, nullifier))? {
            Some(bytes) => Ok(serde_cbor::from_slice(&bytes)?),
            None => Err(Error::NotFound(format!("vote {}", hex::encode(nullifier)))),
        }
    }

    /// Number of transactions seen so far, including those not yet committed
    pub fn transaction_count(&self) -> u64 {
        self.tx_count.load(Ordering::SeqCst)
    }

    /// The first committed transaction of the block at `height`
    pub fn get_tx_reference(&self, height: u32) -> Result<TxReference, Error> {
        let prefix = prefixed(HEIGHT_PREFIX, &height.to_be_bytes());
        let entry = self.store.scan(&prefix, &prefix).next().transpose()?;
        match entry {
            Some((_, index)) => {
                let index: [u8; 8] = index
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::CorruptedNode(format!("height index {}", height)))?;
                self.get_tx_reference_by_index(u64::from_be_bytes(index))
            }
            None => Err(Error::NotFound(format!("tx height {}", height))),
        }
    }

    pub fn get_tx_reference_by_index(&self, index: u64) -> Result<TxReference, Error> {
        match self.store.get(&tx_key(index))? {
            Some(bytes) => Ok(serde_cbor::from_slice(&bytes)?),
            None => Err(Error::NotFound(format!("tx index {}", index))),
        }
    }

    fn flush(&self, pool: &mut TxPool) -> Result<(), Error> {
        let last = match pool.pending.last() {
            Some(last) => last.index,
            None => return Ok(()),
        };
        let mut tx = self.store.write_tx();
        for reference in &pool.pending {
            tx.set(tx_key(reference.index), serde_cbor::to_vec(reference)?);
            tx.set(
                height_key(reference.block_height, reference.index),
                reference.index.to_be_bytes().to_vec(),
            );
        }
        tx.set(TX_COUNT_KEY.to_vec(), last.to_be_bytes().to_vec());
        tx.commit()?;

        debug!("flushed {} transaction references", pool.pending.len());
        pool.pending.clear();
        pool.committed = last;
        Ok(())
    }
}

impl<S: Store> EventListener for Indexer<S> {
    fn on_process_created(&self, process_id: &[u8]) {
        match self.create_process(process_id) {
            Ok(true) => info!("process {} added", hex::encode(process_id)),
            Ok(false) => warn!("process {} already exists", hex::encode(process_id)),
            Err(e) => error!("cannot add process {}: {}", hex::encode(process_id), e),
        }
    }

    fn on_vote_cast(&self, vote: &Vote) {
        if let Err(e) = self.add_vote(vote) {
            if e.is_decode() {
                warn!("dropping malformed vote {}: {}", hex::encode(&vote.nullifier), e);
            } else {
                error!("cannot add vote {}: {}", hex::encode(&vote.nullifier), e);
            }
        }
    }

    fn on_new_tx(&self, block_height: u32, tx_index: i32) {
        let mut pool = self.pool.lock();
        let index = self.tx_count.fetch_add(1, Ordering::SeqCst) + 1;
        pool.pending.push(TxReference {
            index,
            block_height,
            tx_block_index: tx_index,
        });
        if pool.pending.len() >= self.batch_size {
            if let Err(e) = self.flush(&mut pool) {
                error!("cannot store transaction references: {}", e);
            }
        }
    }

    fn commit(&self, height: u32) -> Result<(), Error> {
        let mut pool = self.pool.lock();
        self.flush(&mut pool)?;
        debug!("indexer committed block {}", height);
        Ok(())
    }

    fn rollback(&self) {
        let mut pool = self.pool.lock();
        if !pool.pending.is_empty() {
            debug!("discarding {} transaction references", pool.pending.len());
        }
        pool.pending.clear();
        self.tx_count.store(pool.committed, Ordering::SeqCst);
    }
}
