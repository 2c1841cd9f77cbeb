//! Channel-client behaviour: the init handshake, cache wiring and the
//! migration round trip.

mod common;

use common::{count_pipe_items, TestRig};
use lumen_cache::DictRestoreData;
use lumen_display::client::WIDE_CLIENT_ACK_WINDOW;
use lumen_display::migrate::{MigrationData, SurfacesAtClient};
use lumen_display::msgc::{msgc, DisplayInit};
use lumen_display::{ClientCaps, ClientMessage, PipeItem, WanCompression};
use lumen_gfx::wire::Writer;
use lumen_gfx::Rect;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

fn init_body(cache_id: u8, cache_size: u64, dict_id: u8, dict_window: i32) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(cache_id).u64(cache_size).u8(dict_id).i32(dict_window);
    w.into_vec()
}

#[tokio::test]
async fn init_handshake_attaches_caches() {
    let mut rig = TestRig::filter_rig();
    let client = rig
        .worker
        .state
        .attach_client(0xa100, ClientCaps::default())
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        let body = init_body(2, 1 << 20, 1, 512);
        let mut msg = Vec::new();
        msg.extend_from_slice(&msgc::INIT.to_le_bytes());
        msg.extend_from_slice(&(body.len() as u32).to_le_bytes());
        msg.extend_from_slice(&body);
        tcp.write_all(&msg).await.unwrap();
        // Keep the socket open until the server is done with the
        // handshake.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    });

    let (tcp, _) = listener.accept().await.unwrap();
    rig.worker
        .attach_transport(client, lumen_transport::TransportStream::new(tcp));
    rig.worker.run_client_init(client).await.unwrap();

    let dcc = rig.worker.state.client(client).unwrap();
    assert!(dcc.pixmap_cache.is_some());
    assert!(dcc.glz_dict.is_some());
    assert!(!dcc.expect_init);
    // The zeroed window re-enabled message flow.
    assert_eq!(dcc.ack_window, 0);

    client_task.await.unwrap();
}

#[tokio::test]
async fn init_aborts_when_the_peer_closes() {
    let mut rig = TestRig::filter_rig();
    let client = rig
        .worker
        .state
        .attach_client(0xa200, ClientCaps::default())
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_task = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        drop(tcp);
    });

    let (tcp, _) = listener.accept().await.unwrap();
    rig.worker
        .attach_transport(client, lumen_transport::TransportStream::new(tcp));
    assert!(rig.worker.run_client_init(client).await.is_err());
    // The failed init tore the client down like a normal disconnect.
    assert!(rig.worker.state.client(client).is_none());

    client_task.await.unwrap();
}

#[test]
fn unexpected_init_is_a_protocol_violation() {
    let mut rig = TestRig::filter_rig();
    let client = rig
        .worker
        .state
        .attach_client(0xa300, ClientCaps::default())
        .unwrap();

    let message = ClientMessage::Init(DisplayInit {
        pixmap_cache_id: 9,
        pixmap_cache_size: 1024,
        glz_dict_id: 9,
        glz_dict_window: 64,
    });
    assert!(rig.worker.state.handle_client_message(client, message).is_err());
}

#[test]
fn pixmap_cache_add_routes_evictions_into_the_free_list() {
    let mut rig = TestRig::filter_rig();
    let state = &mut rig.worker.state;
    let client = state.attach_client(0xa400, ClientCaps::default()).unwrap();
    {
        let dcc = state.client_mut(client).unwrap();
        dcc.expect_init = true;
    }
    state
        .handle_init(
            client,
            &DisplayInit {
                pixmap_cache_id: 4,
                pixmap_cache_size: 1024,
                glz_dict_id: 4,
                glz_dict_window: 64,
            },
        )
        .unwrap();

    // Bump the serial between adds so the second may evict the first.
    assert!(state.pixmap_cache_add(client, 1, 700, false));
    state.client_mut(client).unwrap().message_serial += 1;
    assert!(state.pixmap_cache_add(client, 2, 400, false));
    let dcc = state.client(client).unwrap();
    assert_eq!(dcc.free_list.res, vec![(1u8, 1u64)]);

    // Same serial as id 2's insert: blocked, nothing more evicted.
    assert!(!state.pixmap_cache_add(client, 3, 900, false));
    assert_eq!(state.client(client).unwrap().free_list.res.len(), 1);
}

#[test]
fn migration_restore_enables_wan_compression_and_surfaces() {
    let mut rig = TestRig::filter_rig();
    assert_eq!(rig.worker.state.config.jpeg_state, WanCompression::Auto);
    let state = &mut rig.worker.state;
    let client = state.attach_client(0xa500, ClientCaps::default()).unwrap();

    let lossy_rect = Rect::new(4, 4, 60, 40);
    let payload = MigrationData {
        pixmap_cache_id: 5,
        pixmap_cache_size: 64 * 1024 * 1024,
        pixmap_cache_clients: [10, 20, 30, 40],
        pixmap_cache_freezer: true,
        glz_dict_id: 5,
        glz_dict_data: DictRestoreData {
            window_size: 512,
            last_image_id: 7,
        },
        low_bandwidth: true,
        surfaces: SurfacesAtClient::Lossy(vec![(0, lossy_rect), (3, Rect::new(0, 0, 8, 8))]),
    }
    .encode();

    state.handle_migrate_data(client, &payload).unwrap();

    assert!(state.enable_jpeg);
    assert!(state.enable_zlib_glz_wrap);
    let dcc = state.client(client).unwrap();
    assert!(dcc.is_low_bandwidth);
    assert_eq!(dcc.ack_window, WIDE_CLIENT_ACK_WINDOW);
    assert!(dcc.surface_client_created[0]);
    assert!(dcc.surface_client_created[3]);
    assert_eq!(dcc.surface_client_lossy_region[0].extents(), lossy_rect);
    let cache = dcc.pixmap_cache.clone().unwrap();
    assert_eq!(
        count_pipe_items(state, client, |i| matches!(i, PipeItem::PixmapReset)),
        1
    );
    assert_eq!(
        count_pipe_items(state, client, |i| matches!(i, PipeItem::PaletteInvalAll)),
        1
    );
    // Serial vectors merged element-wise.
    assert_eq!(cache.sync_vector(), [10, 20, 30, 40]);

    // The cache stays blocked until the reset item actually goes out.
    let mut ev = Vec::new();
    assert_eq!(
        cache.add(0, cache.generation(), 1, 9, 16, false, &mut ev),
        lumen_cache::AddOutcome::Blocked
    );
    let frames = rig.worker.drain_client(client);
    assert!(!frames.is_empty());
    let cache = rig
        .worker
        .state
        .client(client)
        .unwrap()
        .pixmap_cache
        .clone()
        .unwrap();
    assert_eq!(cache.available(), 64 * 1024 * 1024);
    let generation = rig
        .worker
        .state
        .client(client)
        .unwrap()
        .pixmap_cache_generation;
    assert_eq!(cache.generation(), generation);
}

#[test]
fn migration_marshall_round_trips_surface_state() {
    let mut rig = TestRig::filter_rig();
    let state = &mut rig.worker.state;
    state.enable_jpeg = true;
    let client = state.attach_client(0xa600, ClientCaps::default()).unwrap();
    {
        let dcc = state.client_mut(client).unwrap();
        dcc.expect_init = true;
    }
    state
        .handle_init(
            client,
            &DisplayInit {
                pixmap_cache_id: 6,
                pixmap_cache_size: 4096,
                glz_dict_id: 6,
                glz_dict_window: 128,
            },
        )
        .unwrap();
    {
        let dcc = state.client_mut(client).unwrap();
        dcc.surface_client_created[0] = true;
        dcc.surface_client_created[2] = true;
    }
    let lossy = Rect::new(1, 2, 30, 40);
    state.note_lossy_area(client, 2, &lossy);

    let payload = state.marshall_migrate_data(client).unwrap();
    let decoded = MigrationData::decode(&payload, true).unwrap();
    assert!(decoded.pixmap_cache_freezer);
    assert_eq!(decoded.pixmap_cache_id, 6);
    match &decoded.surfaces {
        SurfacesAtClient::Lossy(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0], (0, Rect::default()));
            assert_eq!(entries[1], (2, lossy));
        }
        other => panic!("unexpected surfaces payload: {other:?}"),
    }
    // Marshalling froze the shared cache.
    let cache = state.client(client).unwrap().pixmap_cache.clone().unwrap();
    assert!(cache.is_frozen());
}
