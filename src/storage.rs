use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::RnsError;
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::identity::{PrivateIdentity, PUBLIC_KEY_LENGTH};

/// Persistence capability the core consumes: a flat blob store addressed by
/// slash-separated paths. Every persisted artifact is msgpack with a single
/// stable schema.
pub trait Store {
    fn load(&mut self, path: &str) -> Result<Option<Vec<u8>>, RnsError>;
    fn store(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError>;
    fn remove(&mut self, path: &str) -> Result<(), RnsError>;
    fn list(&mut self, prefix: &str) -> Result<Vec<String>, RnsError>;
}

/// Blob-per-file store rooted at a directory. Writes go through a temporary
/// file and a rename so a crash never leaves a half-written artifact.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RnsError> {
        if path.is_empty() || path.split('/').any(|part| part.is_empty() || part.starts_with('.')) {
            return Err(RnsError::InvalidArgument);
        }

        let mut full = self.root.clone();
        for part in path.split('/') {
            full.push(part);
        }
        Ok(full)
    }
}

impl Store for FilesystemStore {
    fn load(&mut self, path: &str) -> Result<Option<Vec<u8>>, RnsError> {
        let full = self.resolve(path)?;
        if !full.exists() {
            return Ok(None);
        }
        fs::read(&full).map(Some).map_err(|_| RnsError::StorageError)
    }

    fn store(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|_| RnsError::StorageError)?;
        }

        let tmp = full.with_extension("tmp");
        fs::write(&tmp, data).map_err(|_| RnsError::StorageError)?;
        fs::rename(&tmp, &full).map_err(|_| RnsError::StorageError)
    }

    fn remove(&mut self, path: &str) -> Result<(), RnsError> {
        let full = self.resolve(path)?;
        if full.exists() {
            fs::remove_file(&full).map_err(|_| RnsError::StorageError)?;
        }
        Ok(())
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, RnsError> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();

        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(out);
        };

        for entry in entries.flatten() {
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(format!("{}/{}", prefix, name));
                }
            }
        }

        out.sort();
        Ok(out)
    }
}

/// In-memory store for tests and diskless deployments.
#[derive(Default)]
pub struct MemoryStore {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&mut self, path: &str) -> Result<Option<Vec<u8>>, RnsError> {
        Ok(self.blobs.get(path).cloned())
    }

    fn store(&mut self, path: &str, data: &[u8]) -> Result<(), RnsError> {
        self.blobs.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), RnsError> {
        self.blobs.remove(path);
        Ok(())
    }

    fn list(&mut self, prefix: &str) -> Result<Vec<String>, RnsError> {
        Ok(self.blobs.keys().filter(|key| key.starts_with(prefix)).cloned().collect())
    }
}

//***************************************************************************//

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    enc_priv: ByteBuf,
    sign_priv: ByteBuf,
}

pub fn identity_path(identity: &PrivateIdentity) -> String {
    format!("identity/{}", identity.address_hash().to_hex())
}

pub fn save_identity(store: &mut dyn Store, identity: &PrivateIdentity) -> Result<(), RnsError> {
    let bytes = identity.to_private_key_bytes();
    let persisted = PersistedIdentity {
        enc_priv: ByteBuf::from(bytes[..PUBLIC_KEY_LENGTH].to_vec()),
        sign_priv: ByteBuf::from(bytes[PUBLIC_KEY_LENGTH..].to_vec()),
    };
    let encoded = rmp_serde::to_vec(&persisted).map_err(|_| RnsError::StorageError)?;

    store.store(&identity_path(identity), &encoded)
}

pub fn load_identity(store: &mut dyn Store, path: &str) -> Result<PrivateIdentity, RnsError> {
    let data = store.load(path)?.ok_or(RnsError::NotFound)?;
    let persisted: PersistedIdentity =
        rmp_serde::from_slice(&data).map_err(|_| RnsError::Malformed)?;

    if persisted.enc_priv.len() != PUBLIC_KEY_LENGTH
        || persisted.sign_priv.len() != PUBLIC_KEY_LENGTH
    {
        return Err(RnsError::Malformed);
    }

    let mut bytes = [0u8; PUBLIC_KEY_LENGTH * 2];
    bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(persisted.enc_priv.as_ref());
    bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(persisted.sign_priv.as_ref());

    PrivateIdentity::from_private_key_bytes(&bytes)
}

#[derive(Serialize, Deserialize)]
pub struct PersistedPath {
    #[serde(with = "serde_bytes")]
    pub destination: Vec<u8>,
    pub hops: u8,
}

pub const PATH_SNAPSHOT_PATH: &str = "transport/paths";

pub fn save_paths(store: &mut dyn Store, paths: &[(AddressHash, u8)]) -> Result<(), RnsError> {
    let persisted: Vec<PersistedPath> = paths
        .iter()
        .map(|(destination, hops)| PersistedPath {
            destination: destination.as_slice().to_vec(),
            hops: *hops,
        })
        .collect();
    let encoded = rmp_serde::to_vec(&persisted).map_err(|_| RnsError::StorageError)?;

    store.store(PATH_SNAPSHOT_PATH, &encoded)
}

pub fn load_paths(store: &mut dyn Store) -> Result<Vec<(AddressHash, u8)>, RnsError> {
    let Some(data) = store.load(PATH_SNAPSHOT_PATH)? else {
        return Ok(Vec::new());
    };

    let persisted: Vec<PersistedPath> =
        rmp_serde::from_slice(&data).map_err(|_| RnsError::Malformed)?;

    let mut out = Vec::new();
    for entry in persisted {
        if entry.destination.len() == ADDRESS_HASH_SIZE {
            out.push((AddressHash::read_from(&entry.destination)?, entry.hops));
        }
    }
    Ok(out)
}

#[derive(Serialize, Deserialize)]
pub struct DestinationRecord {
    #[serde(with = "serde_bytes")]
    pub address_hash: Vec<u8>,
    pub full_name: String,
    #[serde(with = "serde_bytes")]
    pub identity_hash: Vec<u8>,
}

pub fn save_destination_record(
    store: &mut dyn Store,
    record: &DestinationRecord,
) -> Result<(), RnsError> {
    let encoded = rmp_serde::to_vec(record).map_err(|_| RnsError::StorageError)?;
    store.store(&format!("destinations/{}", hex::encode(&record.address_hash)), &encoded)
}

pub fn load_destination_records(store: &mut dyn Store) -> Result<Vec<DestinationRecord>, RnsError> {
    let mut out = Vec::new();
    for path in store.list("destinations")? {
        if let Some(data) = store.load(&path)? {
            if let Ok(record) = rmp_serde::from_slice::<DestinationRecord>(&data) {
                out.push(record);
            }
        }
    }
    Ok(out)
}
