//! Shared image-encoder dictionary handles.
//!
//! The actual dictionary contents belong to the codec backends; this
//! module only manages identity and sharing so that channel clients of
//! one remote party agree on which dictionary a stream of encoded images
//! refers to, including across migration.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DictionaryError {
    #[error("dictionary {id} already exists with window {existing}, requested {requested}")]
    WindowMismatch {
        id: u8,
        existing: i32,
        requested: i32,
    },
}

/// Encoder state snapshot carried in a migration payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictRestoreData {
    pub window_size: i32,
    pub last_image_id: u64,
}

#[derive(Debug)]
pub struct EncoderDictionary {
    client: u64,
    id: u8,
    window_size: i32,
    restore: Mutex<Option<DictRestoreData>>,
}

impl EncoderDictionary {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn window_size(&self) -> i32 {
        self.window_size
    }

    /// Restore snapshot installed by migration, if any.
    pub fn restore_data(&self) -> Option<DictRestoreData> {
        *self.restore.lock().unwrap()
    }
}

#[derive(Default)]
struct Registry {
    dicts: Vec<Weak<EncoderDictionary>>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(Mutex::default)
}

fn lookup(reg: &mut Registry, client: u64, id: u8) -> Option<Arc<EncoderDictionary>> {
    reg.dicts.retain(|w| w.strong_count() > 0);
    reg.dicts
        .iter()
        .filter_map(Weak::upgrade)
        .find(|d| d.client == client && d.id == id)
}

/// Looks up or creates the dictionary `(client, id)`.
pub fn dictionary_get(
    client: u64,
    id: u8,
    window_size: i32,
) -> Result<Arc<EncoderDictionary>, DictionaryError> {
    let mut reg = registry().lock().unwrap();
    if let Some(existing) = lookup(&mut reg, client, id) {
        if existing.window_size != window_size {
            return Err(DictionaryError::WindowMismatch {
                id,
                existing: existing.window_size,
                requested: window_size,
            });
        }
        return Ok(existing);
    }
    debug!(client, id, window_size, "creating encoder dictionary");
    let dict = Arc::new(EncoderDictionary {
        client,
        id,
        window_size,
        restore: Mutex::new(None),
    });
    reg.dicts.push(Arc::downgrade(&dict));
    Ok(dict)
}

/// Re-binds a migrated dictionary, installing its restore snapshot.
pub fn dictionary_restore(
    client: u64,
    id: u8,
    data: DictRestoreData,
) -> Result<Arc<EncoderDictionary>, DictionaryError> {
    let dict = dictionary_get(client, id, data.window_size)?;
    *dict.restore.lock().unwrap() = Some(data);
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionaries_are_shared_per_party() {
        let a = dictionary_get(17, 1, 64).unwrap();
        let b = dictionary_get(17, 1, 64).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            dictionary_get(17, 1, 128),
            Err(DictionaryError::WindowMismatch { .. })
        ));
    }

    #[test]
    fn restore_installs_snapshot() {
        let data = DictRestoreData {
            window_size: 32,
            last_image_id: 99,
        };
        let d = dictionary_restore(18, 2, data).unwrap();
        assert_eq!(d.restore_data(), Some(data));
    }
}
