//! Migration payload: freezing a client's cache state on the source and
//! rebinding it on the destination.

use lumen_cache::{dictionary_restore, pixmap_cache_get, DictRestoreData, SyncVector};
use lumen_gfx::region::Region;
use lumen_gfx::wire::{Reader, Writer};
use lumen_gfx::Rect;
use tracing::{debug, error};

use crate::client::{ClientError, WIDE_CLIENT_ACK_WINDOW};
use crate::config::WanCompression;
use crate::display::{ClientId, DisplayState};
use crate::pipe::PipeItem;

pub const MIGRATION_MAGIC: [u8; 4] = *b"DPLY";
pub const MIGRATION_VERSION: u32 = 1;

/// Fixed part of the payload; the surfaces block floats behind it.
pub const MIGRATION_FIXED_SIZE: usize = 68;

/// Surfaces the client already has, with their lossy areas when JPEG is
/// in play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfacesAtClient {
    Lossless(Vec<u32>),
    Lossy(Vec<(u32, Rect)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationData {
    pub pixmap_cache_id: u8,
    pub pixmap_cache_size: i64,
    pub pixmap_cache_clients: SyncVector,
    pub pixmap_cache_freezer: bool,
    pub glz_dict_id: u8,
    pub glz_dict_data: DictRestoreData,
    pub low_bandwidth: bool,
    pub surfaces: SurfacesAtClient,
}

impl MigrationData {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(&MIGRATION_MAGIC).u32(MIGRATION_VERSION);
        w.u8(self.pixmap_cache_id);
        w.u64(self.pixmap_cache_size as u64);
        for s in self.pixmap_cache_clients {
            w.u64(s);
        }
        w.u8(u8::from(self.pixmap_cache_freezer));
        w.u8(self.glz_dict_id);
        w.i32(self.glz_dict_data.window_size);
        w.u64(self.glz_dict_data.last_image_id);
        w.u8(u8::from(self.low_bandwidth));
        w.u32(MIGRATION_FIXED_SIZE as u32);
        debug_assert_eq!(w.len(), MIGRATION_FIXED_SIZE);
        match &self.surfaces {
            SurfacesAtClient::Lossless(ids) => {
                w.u32(ids.len() as u32);
                for id in ids {
                    w.u32(*id);
                }
            }
            SurfacesAtClient::Lossy(entries) => {
                w.u32(entries.len() as u32);
                for (id, rect) in entries {
                    w.u32(*id);
                    w.rect(rect);
                }
            }
        }
        w.into_vec()
    }

    /// Decodes a payload. Whether the surfaces block is lossy is a
    /// property of the channel (JPEG enabled), not of the payload.
    pub fn decode(bytes: &[u8], lossy_surfaces: bool) -> Result<Self, ClientError> {
        if bytes.len() < MIGRATION_FIXED_SIZE {
            return Err(ClientError::BadMigrationData("payload too short"));
        }
        let mut r = Reader::new(bytes);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(r.bytes(4).expect("length checked"));
        if magic != MIGRATION_MAGIC {
            return Err(ClientError::BadMigrationData("bad magic"));
        }
        let bad = |_| ClientError::BadMigrationData("payload truncated");
        if r.u32().map_err(bad)? != MIGRATION_VERSION {
            return Err(ClientError::BadMigrationData("unsupported version"));
        }
        let pixmap_cache_id = r.u8().map_err(bad)?;
        let pixmap_cache_size = r.u64().map_err(bad)? as i64;
        let mut pixmap_cache_clients = SyncVector::default();
        for s in &mut pixmap_cache_clients {
            *s = r.u64().map_err(bad)?;
        }
        let pixmap_cache_freezer = r.u8().map_err(bad)? != 0;
        let glz_dict_id = r.u8().map_err(bad)?;
        let glz_dict_data = DictRestoreData {
            window_size: r.i32().map_err(bad)?,
            last_image_id: r.u64().map_err(bad)?,
        };
        let low_bandwidth = r.u8().map_err(bad)? != 0;
        let surfaces_ptr = r.u32().map_err(bad)? as usize;
        if surfaces_ptr > bytes.len() {
            return Err(ClientError::BadMigrationData("surfaces offset out of range"));
        }

        let mut r = Reader::new(&bytes[surfaces_ptr..]);
        let num = r.u32().map_err(bad)?;
        let surfaces = if lossy_surfaces {
            let mut entries = Vec::with_capacity(num as usize);
            for _ in 0..num {
                let id = r.u32().map_err(bad)?;
                let rect = r.rect().map_err(bad)?;
                entries.push((id, rect));
            }
            SurfacesAtClient::Lossy(entries)
        } else {
            let mut ids = Vec::with_capacity(num as usize);
            for _ in 0..num {
                ids.push(r.u32().map_err(bad)?);
            }
            SurfacesAtClient::Lossless(ids)
        };

        Ok(Self {
            pixmap_cache_id,
            pixmap_cache_size,
            pixmap_cache_clients,
            pixmap_cache_freezer,
            glz_dict_id,
            glz_dict_data,
            low_bandwidth,
            surfaces,
        })
    }
}

impl DisplayState {
    /// Restores one surface's client-created bit; duplicates mean the
    /// payload disagrees with the channel state.
    fn restore_surface(&mut self, client: ClientId, surface_id: u32) -> Result<(), ClientError> {
        let Some(dcc) = self.client_mut(client) else {
            return Err(ClientError::BadMigrationData("client gone"));
        };
        match dcc.surface_client_created.get_mut(surface_id as usize) {
            Some(created) if !*created => {
                *created = true;
                Ok(())
            }
            Some(_) => Err(ClientError::BadMigrationData(
                "surface already marked client-created",
            )),
            None => Err(ClientError::BadMigrationData("surface id out of range")),
        }
    }

    /// Applies a migration payload received for `client`.
    pub fn handle_migrate_data(
        &mut self,
        client: ClientId,
        bytes: &[u8],
    ) -> Result<(), ClientError> {
        // Two-stage decode: the fixed part decides whether JPEG (and with
        // it the lossy surfaces dialect) switches on before the surfaces
        // block is interpreted.
        let fixed = MigrationData::decode(bytes, false)?;
        let jpeg_enabled = self.enable_jpeg
            || (fixed.low_bandwidth && self.config.jpeg_state == WanCompression::Auto);
        let data = MigrationData::decode(bytes, jpeg_enabled)?;
        let token = self
            .client(client)
            .map(|dcc| dcc.client_token)
            .ok_or(ClientError::BadMigrationData("client gone"))?;

        // Size -1 keeps the cache frozen until the freezing peer thaws it
        // through a reset.
        let cache = pixmap_cache_get(token, data.pixmap_cache_id, -1);
        cache.merge_sync_vector(&data.pixmap_cache_clients);
        let mut push_reset = false;
        if data.pixmap_cache_freezer {
            cache.set_capacity(data.pixmap_cache_size);
            push_reset = true;
        }

        let dict = match dictionary_restore(token, data.glz_dict_id, data.glz_dict_data) {
            Ok(dict) => dict,
            Err(err) => {
                error!(%err, "restoring encoder dictionary failed");
                return Err(ClientError::BadMigrationData("dictionary restore failed"));
            }
        };

        {
            let dcc = self
                .client_mut(client)
                .ok_or(ClientError::BadMigrationData("client gone"))?;
            dcc.pixmap_cache_generation = cache.generation();
            dcc.pixmap_cache = Some(cache);
            dcc.glz_dict = Some(dict);
            dcc.is_low_bandwidth = data.low_bandwidth;
            if data.low_bandwidth {
                dcc.ack_window = WIDE_CLIENT_ACK_WINDOW;
            }
        }
        if data.low_bandwidth {
            if self.config.jpeg_state == WanCompression::Auto {
                self.enable_jpeg = true;
            }
            if self.config.zlib_glz_state == WanCompression::Auto {
                self.enable_zlib_glz_wrap = true;
            }
        }
        if push_reset {
            self.pipe_push(client, PipeItem::PixmapReset);
        }

        match &data.surfaces {
            SurfacesAtClient::Lossless(ids) => {
                for id in ids {
                    self.restore_surface(client, *id)?;
                }
            }
            SurfacesAtClient::Lossy(entries) => {
                for (id, rect) in entries {
                    self.restore_surface(client, *id)?;
                    if let Some(dcc) = self.client_mut(client) {
                        if let Some(region) =
                            dcc.surface_client_lossy_region.get_mut(*id as usize)
                        {
                            *region = Region::from_rect(*rect);
                        }
                    }
                }
            }
        }

        self.pipe_push(client, PipeItem::PaletteInvalAll);
        debug!(client, "migration data applied");
        Ok(())
    }

    /// Produces the migration payload for `client`, freezing the shared
    /// pixmap cache.
    pub fn marshall_migrate_data(&mut self, client: ClientId) -> Option<Vec<u8>> {
        let (cache, dict, low_bandwidth, created, lossy_regions) = {
            let dcc = self.client(client)?;
            (
                dcc.pixmap_cache.clone()?,
                dcc.glz_dict.clone()?,
                dcc.is_low_bandwidth,
                dcc.surface_client_created.clone(),
                dcc.surface_client_lossy_region.clone(),
            )
        };

        let freezer = cache.freeze();
        let surfaces = if self.enable_jpeg {
            SurfacesAtClient::Lossy(
                created
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c)
                    .map(|(id, _)| {
                        let rect = lossy_regions
                            .get(id)
                            .map(|r| r.extents())
                            .unwrap_or_default();
                        (id as u32, rect)
                    })
                    .collect(),
            )
        } else {
            SurfacesAtClient::Lossless(
                created
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c)
                    .map(|(id, _)| id as u32)
                    .collect(),
            )
        };

        let data = MigrationData {
            pixmap_cache_id: cache.id(),
            pixmap_cache_size: cache.capacity(),
            pixmap_cache_clients: cache.sync_vector(),
            pixmap_cache_freezer: freezer,
            glz_dict_id: dict.id(),
            glz_dict_data: DictRestoreData {
                window_size: dict.window_size(),
                last_image_id: dict.restore_data().map(|d| d.last_image_id).unwrap_or(0),
            },
            low_bandwidth,
            surfaces,
        };
        Some(data.encode())
    }
}
