use crate::*;

/// Maximum number of questions in a vote package
pub const MAX_QUESTIONS: usize = 64;

/// Maximum number of options per question
pub const MAX_OPTIONS: usize = 64;

const TALLY_VERSION: u8 = 1;

/// Vote counts of a voting process, indexed by question then option.
///
/// Always `MAX_QUESTIONS x MAX_OPTIONS`. Counters only ever grow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessVotes {
    version: u8,
    counts: Vec<Vec<u32>>,
}

impl Default for ProcessVotes {
    fn default() -> Self {
        ProcessVotes {
            version: TALLY_VERSION,
            counts: vec![vec![0; MAX_OPTIONS]; MAX_QUESTIONS],
        }
    }
}

impl ProcessVotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, question: usize, option: usize) -> u32 {
        self.counts
            .get(question)
            .and_then(|q| q.get(option))
            .copied()
            .unwrap_or(0)
    }

    /// Count one vote for `option` on `question`. Returns false if either is out of range.
    pub fn increment(&mut self, question: usize, option: usize) -> bool {
        if question >= MAX_QUESTIONS || option >= MAX_OPTIONS {
            return false;
        }
        let counter = &mut self.counts[question][option];
        *counter = counter.saturating_add(1);
        true
    }

    /// The results with trailing empty questions removed, and each remaining question
    /// trimmed of its own trailing zero options.
    pub fn pruned(&self) -> Vec<Vec<u32>> {
        let is_empty = |q: &Vec<u32>| q.iter().all(|c| *c == 0);
        let questions = match self.counts.iter().rposition(|q| !is_empty(q)) {
            Some(last) => last + 1,
            None => return vec![],
        };

        self.counts[..questions]
            .iter()
            .map(|q| {
                let options = q.iter().rposition(|c| *c != 0).map_or(0, |last| last + 1);
                q[..options].to_vec()
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let votes: ProcessVotes = serde_cbor::from_slice(bytes)?;
        if votes.version != TALLY_VERSION {
            return Err(Error::UnsupportedVersion {
                record: "tally",
                version: votes.version,
            });
        }
        if votes.counts.len() != MAX_QUESTIONS
            || votes.counts.iter().any(|q| q.len() != MAX_OPTIONS)
        {
            return Err(Error::CorruptedNode("tally matrix dimensions".to_owned()));
        }
        Ok(votes)
    }
}
