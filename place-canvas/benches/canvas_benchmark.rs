use criterion::{black_box, criterion_group, criterion_main, Criterion};
use place_canvas::codec::CodecKind;
use place_canvas::protocol::ClientMessage;
use place_canvas::raster::{parse_hex_color, Raster, Rgba};
use place_canvas::room::{RoomRegistry, RoomSpec};
use place_canvas::storage::{ChunkStore, StorageRoots};
use place_canvas::ChunkKey;
use std::sync::Arc;

const CHUNK: u32 = 64;

/// A chunk with a scattered mix of painted pixels.
fn sample_raster() -> Raster {
    let mut raster = Raster::new(CHUNK, CHUNK);
    for i in 0..CHUNK * CHUNK / 3 {
        let x = (i * 7) % CHUNK;
        let y = (i * 13) % CHUNK;
        let shade = (i % 32) as u8 * 8;
        raster.put(x, y, Rgba::opaque(shade, 255 - shade, shade / 2));
    }
    raster
}

fn bench_codec_encode(c: &mut Criterion) {
    let raster = sample_raster();
    for kind in [CodecKind::Qoi, CodecKind::Png, CodecKind::Lz4] {
        let codec = kind.codec();
        c.bench_function(&format!("encode_{}_64x64", kind.extension()), |b| {
            b.iter(|| {
                black_box(codec.encode(black_box(&raster)).unwrap());
            })
        });
    }
}

fn bench_codec_decode(c: &mut Criterion) {
    let raster = sample_raster();
    for kind in [CodecKind::Qoi, CodecKind::Png, CodecKind::Lz4] {
        let codec = kind.codec();
        let encoded = codec.encode(&raster).unwrap();
        c.bench_function(&format!("decode_{}_64x64", kind.extension()), |b| {
            b.iter(|| {
                black_box(codec.decode(black_box(&encoded)).unwrap());
            })
        });
    }
}

fn bench_parse_color(c: &mut Criterion) {
    c.bench_function("parse_hex_color", |b| {
        b.iter(|| {
            black_box(parse_hex_color(black_box("#be0039")).unwrap());
        })
    });
}

fn bench_validate_write(c: &mut Criterion) {
    let mut rooms = RoomRegistry::new();
    rooms
        .create_room(RoomSpec {
            id: "room1".into(),
            width: 1024,
            height: 1024,
            chunk_size: CHUNK,
            palette: Some(
                place_canvas::config::DEFAULT_PALETTE
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
        })
        .unwrap();

    c.bench_function("validate_write_palette_32", |b| {
        b.iter(|| {
            black_box(
                rooms
                    .validate_write("room1", black_box(700), black_box(300), "#ffffff")
                    .unwrap(),
            );
        })
    });
}

fn bench_decode_pxl_message(c: &mut Criterion) {
    let text = r##"{"type":"pxl","x":700,"y":300,"color":"#ffffff"}"##;
    c.bench_function("decode_pxl_message", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(text)).unwrap());
        })
    });
}

fn bench_draw_pixel(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let roots = StorageRoots::new(dir.path().join("images"), dir.path().join("history"), "images");
    let key = ChunkKey::new("room1", 0, 0);
    let mut store = ChunkStore::new(key.clone(), CHUNK, roots.chunk(&key), Arc::from(CodecKind::Qoi.codec()));
    runtime.block_on(store.load()).unwrap();

    let mut i = 0u32;
    c.bench_function("draw_pixel", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            store
                .draw_pixel(i % CHUNK, (i / CHUNK) % CHUNK, black_box("#000000"))
                .unwrap();
        })
    });
}

fn bench_save_chunk(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let roots = StorageRoots::new(dir.path().join("images"), dir.path().join("history"), "images");
    let key = ChunkKey::new("room1", 0, 0);
    let mut store = ChunkStore::new(key.clone(), CHUNK, roots.chunk(&key), Arc::from(CodecKind::Qoi.codec()));
    runtime.block_on(store.load()).unwrap();

    let mut i = 0u32;
    c.bench_function("save_chunk_qoi_16_edits", |b| {
        b.iter(|| {
            for _ in 0..16 {
                i = i.wrapping_add(1);
                store
                    .draw_pixel(i % CHUNK, (i / CHUNK) % CHUNK, "#ffffff")
                    .unwrap();
            }
            black_box(runtime.block_on(store.save()).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_codec_encode,
    bench_codec_decode,
    bench_parse_color,
    bench_validate_write,
    bench_decode_pxl_message,
    bench_draw_pixel,
    bench_save_chunk,
);
criterion_main!(benches);
