use std::fmt::Debug;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::mapping::Mapping;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed mapping file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of the mappings that should currently be forwarded.
///
/// The store is owned by whatever administers the mappings; the forwarding
/// core only ever reads from it. Reads may block, so the forwarder runs
/// them on the blocking pool.
pub trait MappingStore: Debug + Send + Sync {
    fn list_active(&self) -> Result<Vec<Mapping>, StoreError>;
}

/// Mappings fixed at startup, taken from `forward` directives.
#[derive(Debug, Clone, Default)]
pub struct StaticStore {
    mappings: Vec<Mapping>,
}

impl StaticStore {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self { mappings }
    }
}

impl MappingStore for StaticStore {
    fn list_active(&self) -> Result<Vec<Mapping>, StoreError> {
        Ok(self.mappings.iter().filter(|x| x.active).cloned().collect())
    }
}

/// A JSON list of mapping records, re-read on every call.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { path: path.into() }
    }
}

impl MappingStore for JsonStore {
    fn list_active(&self) -> Result<Vec<Mapping>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(x) => x,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("mapping file {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let mappings: Vec<Mapping> =
            serde_json::from_str(&data).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        Ok(mappings.into_iter().filter(|x| x.active).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn json_store_filters_inactive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"external_port": 9000, "target_server": "10.0.0.2", "target_port": 80, "is_active": true, "description": "web"}},
                {{"external_port": 9001, "target_server": "10.0.0.3", "target_port": 22, "is_active": false}},
                {{"external_port": 9002, "target_host": "db", "target_port": 5432}}
            ]"#
        )
        .unwrap();

        let store = JsonStore::new(file.path());
        let active = store.list_active().unwrap();

        let ports: Vec<u16> = active.iter().map(|x| x.external_port).collect();
        assert_eq!(ports, vec![9000, 9002]);
        assert_eq!(active[0].description, "web");
    }

    #[test]
    fn json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("port_mappings.json"));

        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn json_store_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"external_port": 9000}}"#).unwrap();

        let store = JsonStore::new(file.path());
        assert!(matches!(
            store.list_active(),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn static_store_filters_inactive() {
        let mut off = Mapping::new(2, "b:2".parse().unwrap());
        off.active = false;

        let store = StaticStore::new(vec![Mapping::new(1, "a:1".parse().unwrap()), off]);
        assert_eq!(store.list_active().unwrap().len(), 1);
    }
}
