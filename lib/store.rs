//! Out-of-core storage for sweep state.
//!
//! A [`TensorStore`] keeps one file per stored object in a directory, named
//! by a run tag and a [`StoreKey`]. Objects are written with `bincode`
//! through buffered readers and writers, so a round trip reproduces block
//! data and label structure exactly.

use std::{
    fs,
    io::{ BufReader, BufWriter },
    path::{ Path, PathBuf },
};
use serde::{ Serialize, de::DeserializeOwned };
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Returned when the underlying file system reports an error.
    #[error("error in tensor store: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when an object cannot be encoded or decoded.
    #[error("error in tensor store: {0}")]
    Codec(#[from] bincode::Error),

    /// Returned when loading an object that was never saved.
    #[error("error in tensor store: missing object {0}")]
    Missing(String),
}
use StoreError::*;
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifies one stored object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Site tensor at a chain position.
    Site(usize),
    /// Left bond basis after a number of sites.
    LeftBasis(usize),
    /// Right bond basis before a number of sites.
    RightBasis(usize),
    /// Left environment block covering the sites before a position.
    LeftEnv(usize),
    /// Right environment block covering the sites from a position on.
    RightEnv(usize),
    /// Canonical-form tags of the whole state.
    CanonicalForm,
    /// Descriptive data of the whole state.
    Info,
}

impl StoreKey {
    fn file_stem(&self) -> String {
        match self {
            Self::Site(i) => format!("site-{}", i),
            Self::LeftBasis(i) => format!("left-basis-{}", i),
            Self::RightBasis(i) => format!("right-basis-{}", i),
            Self::LeftEnv(i) => format!("left-env-{}", i),
            Self::RightEnv(i) => format!("right-env-{}", i),
            Self::CanonicalForm => "canonical-form".to_string(),
            Self::Info => "info".to_string(),
        }
    }
}

/// Directory of persisted objects sharing a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorStore {
    dir: PathBuf,
    tag: String,
}

impl TensorStore {
    /// Open (creating if necessary) a store in `dir` for objects tagged `tag`.
    pub fn new<P>(dir: P, tag: &str) -> StoreResult<Self>
    where P: AsRef<Path>
    {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self { dir: dir.as_ref().to_path_buf(), tag: tag.to_string() })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn tag(&self) -> &str { &self.tag }

    /// A store in the same directory with a different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self { dir: self.dir.clone(), tag: tag.to_string() }
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        self.dir.join(format!("{}.{}.bin", self.tag, key.file_stem()))
    }

    /// Return `true` if an object is stored under `key`.
    pub fn contains(&self, key: StoreKey) -> bool { self.path(key).is_file() }

    /// Write `value` under `key`, replacing any previous object.
    pub fn save<T>(&self, key: StoreKey, value: &T) -> StoreResult<()>
    where T: Serialize
    {
        let path = self.path(key);
        let writer = BufWriter::new(fs::File::create(&path)?);
        bincode::serialize_into(writer, value)?;
        trace!(path = %path.display(), "saved");
        Ok(())
    }

    /// Read the object stored under `key`.
    pub fn load<T>(&self, key: StoreKey) -> StoreResult<T>
    where T: DeserializeOwned
    {
        let path = self.path(key);
        if !path.is_file() {
            return Err(Missing(format!("{}/{}", self.tag, key.file_stem())));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let value: T = bincode::deserialize_from(reader)?;
        trace!(path = %path.display(), "loaded");
        Ok(value)
    }

    /// Delete the object stored under `key`, if any.
    pub fn remove(&self, key: StoreKey) -> StoreResult<()> {
        let path = self.path(key);
        if path.is_file() { fs::remove_file(path)?; }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        basis::BondBasis,
        block::{ BlockInfo, BlockMatrix },
        quantum::U1,
    };

    #[test]
    fn block_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::new(dir.path(), "psi").unwrap();
        let basis = BondBasis::from_pairs([(U1(-1), 2), (U1(1), 3)]);
        let mut rng = StdRng::seed_from_u64(7);
        let mat = BlockMatrix::random(
            BlockInfo::wavefunction(basis.clone(), basis.clone(), U1(0)), &mut rng);
        store.save(StoreKey::Site(3), &mat).unwrap();
        store.save(StoreKey::LeftBasis(3), &basis).unwrap();
        let back: BlockMatrix<U1> = store.load(StoreKey::Site(3)).unwrap();
        let back_basis: BondBasis<U1> = store.load(StoreKey::LeftBasis(3)).unwrap();
        assert_eq!(back, mat);
        assert_eq!(back_basis, basis);
        assert!(store.contains(StoreKey::Site(3)));
        store.remove(StoreKey::Site(3)).unwrap();
        assert!(!store.contains(StoreKey::Site(3)));
    }

    #[test]
    fn tags_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = TensorStore::new(dir.path(), "bra").unwrap();
        let b = a.with_tag("ket");
        a.save(StoreKey::CanonicalForm, &"LLCR".to_string()).unwrap();
        assert!(matches!(
            b.load::<String>(StoreKey::CanonicalForm),
            Err(Missing(_))
        ));
        assert_eq!(a.load::<String>(StoreKey::CanonicalForm).unwrap(), "LLCR");
    }
}
