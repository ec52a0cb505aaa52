use crate::*;
use std::env::var;
use std::path::PathBuf;

const DEFAULT_DIR: &str = ".dvote";
const DEFAULT_TX_BATCH: usize = 1000;

/// Runtime configuration, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root directory for every store
    pub data_dir: PathBuf,

    /// Maximum number of buffered transaction references before they are flushed
    pub tx_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            tx_batch: DEFAULT_TX_BATCH,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let data_dir = match var("VOTECENSUS_DATA_DIR") {
            Ok(val) if !val.is_empty() => PathBuf::from(val),
            _ => default_data_dir(),
        };

        let tx_batch = match var("VOTECENSUS_TX_BATCH") {
            Ok(val) => parse_batch(&val)?,
            Err(_e) => DEFAULT_TX_BATCH,
        };

        Ok(Config { data_dir, tx_batch })
    }

    pub fn census_dir(&self) -> PathBuf {
        self.data_dir.join("census")
    }

    pub fn indexer_dir(&self) -> PathBuf {
        self.data_dir.join("indexer")
    }

    pub fn open_census_store(&self) -> Result<SledStore, Error> {
        SledStore::open(&self.census_dir())
    }

    pub fn open_indexer_store(&self) -> Result<SledStore, Error> {
        SledStore::open(&self.indexer_dir())
    }
}

fn default_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(DEFAULT_DIR),
        None => PathBuf::from("dvote"),
    }
}

fn parse_batch(val: &str) -> Result<usize, Error> {
    match val.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config("VOTECENSUS_TX_BATCH")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_values() {
        assert_eq!(parse_batch("250").unwrap(), 250);
        assert_eq!(parse_batch(" 7 ").unwrap(), 7);
        assert!(matches!(parse_batch("0"), Err(Error::Config(_))));
        assert!(matches!(parse_batch("lots"), Err(Error::Config(_))));
    }

    #[test]
    fn component_dirs() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/votes"),
            tx_batch: 10,
        };
        assert_eq!(config.census_dir(), PathBuf::from("/var/lib/votes/census"));
        assert_eq!(config.indexer_dir(), PathBuf::from("/var/lib/votes/indexer"));
        assert_eq!(Config::default().tx_batch, DEFAULT_TX_BATCH);
    }

    #[test]
    fn opens_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_owned(),
            tx_batch: 10,
        };
        let census = config.open_census_store().unwrap();
        let mut tx = census.write_tx();
        tx.set(b"k".to_vec(), b"v".to_vec());
        tx.commit().unwrap();
        assert!(config.indexer_dir().parent() == Some(dir.path()));
        config.open_indexer_store().unwrap();
        assert!(config.census_dir().exists());
    }
}
