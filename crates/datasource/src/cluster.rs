//! Hashed data source cluster.
//!
//! Routes each request to one member of a fixed set of data sources by hash,
//! so that the same key always lands on the same database.

use crate::datasource::DataSource;
use crate::error::PoolError;
use crate::pool::PoolGuard;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// A fixed set of data sources selected by hash code.
///
/// The hash-to-index mapping is part of the contract: changing it would
/// move existing keys to different databases.
#[derive(Debug)]
pub struct HashedDataSourceCluster<S: DataSource> {
    members: Vec<S>,
}

impl<S: DataSource> HashedDataSourceCluster<S> {
    /// Create a cluster. At least one member is required.
    pub fn new(members: Vec<S>) -> Result<Self, PoolError> {
        if members.is_empty() {
            return Err(PoolError::Configuration(
                "a data source cluster needs at least one member".into(),
            ));
        }
        Ok(Self { members })
    }

    /// Number of data sources in the cluster.
    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The data sources, in index order.
    #[must_use]
    pub fn members(&self) -> &[S] {
        &self.members
    }

    /// Member index for a hash code.
    ///
    /// Negative codes are read as unsigned 32-bit values.
    #[must_use]
    pub fn index_for_hash_code(&self, hash_code: i32) -> usize {
        let unsigned = u64::from(hash_code as u32);
        (unsigned % self.members.len() as u64) as usize
    }

    /// Member index for a byte key, using a stable FNV-1a hash.
    #[must_use]
    pub fn index_for_key(&self, key: &[u8]) -> usize {
        self.index_for_hash_code(fnv1a(key) as i32)
    }

    /// Get a connection from the member at `index`.
    pub async fn connection_for_index(
        &self,
        index: usize,
    ) -> Result<PoolGuard<S::Factory>, PoolError> {
        let member = self.members.get(index).ok_or_else(|| {
            PoolError::NoValidConnection(format!(
                "index {index} is out of range for a cluster of {}",
                self.members.len()
            ))
        })?;
        member.get_connection().await
    }

    /// Get a connection from the member selected by `hash_code`.
    pub async fn connection_for_hash_code(
        &self,
        hash_code: i32,
    ) -> Result<PoolGuard<S::Factory>, PoolError> {
        self.connection_for_index(self.index_for_hash_code(hash_code))
            .await
    }

    /// Get a connection from the member selected by `key`.
    pub async fn connection_for_key(
        &self,
        key: impl AsRef<[u8]>,
    ) -> Result<PoolGuard<S::Factory>, PoolError> {
        self.connection_for_index(self.index_for_key(key.as_ref()))
            .await
    }

    /// Dispose every member.
    pub async fn dispose(&self) {
        for member in &self.members {
            member.dispose().await;
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }
}
