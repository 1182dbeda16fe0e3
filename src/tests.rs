// Cache behavior tests, driven through the headless platform
//
// Austin Shafer - 2024

use crate as vx;
use vx::gcn::{
    BufferResource, ConvertedShader, Environment, Expr, PointerResource, Resources,
    SamplerResource, ShaderFrontend, ShaderInfo, Stage, TextureResource,
};
use vx::gnm::{DataFormat, IndexType, NumericFormat, PrimitiveType, TextureType};
use vx::keys::{ImageKey, ImageKind, ShaderKey};
use vx::page_map::PageMap;
use vx::platform::headless::{tiled_offset, HeadlessPlatform, HeadlessScheduler, HeadlessTiler};
use vx::platform::Extent;
use vx::range_map::RangeMap;
use vx::remote::RemoteMemory;
use vx::resources::{eval_expr, ShaderResources};
use vx::tiler::{compute_surface_info, TileMode};
use vx::{Access, AddressRange, Cache, CacheCreateInfo, VortxError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

const GUEST_SIZE: u64 = 0x100000;

/// Front end stub: serves canned ShaderInfo per address and counts
/// real translations.
#[derive(Default)]
struct TestFrontend {
    tf_infos: Mutex<HashMap<u64, ShaderInfo>>,
    tf_compiles: AtomicUsize,
}

impl TestFrontend {
    fn set_info(&self, address: u64, info: ShaderInfo) {
        self.tf_infos.lock().unwrap().insert(address, info);
    }

    fn compiles(&self) -> usize {
        self.tf_compiles.load(Ordering::SeqCst)
    }
}

impl ShaderFrontend for TestFrontend {
    fn convert(
        &self,
        address: u64,
        _stage: Stage,
        _env: &Environment,
        read_memory: &mut dyn FnMut(u64) -> u32,
    ) -> Option<ConvertedShader> {
        // A poison first word stands in for unparseable bytecode
        if read_memory(address) == 0xdeadc0de {
            return None;
        }

        self.tf_compiles.fetch_add(1, Ordering::SeqCst);
        let info = self
            .tf_infos
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default();

        Some(ConvertedShader {
            spv: vec![0x0723_0203, 0x0001_0000, 0, 1, 0],
            info,
        })
    }
}

struct TestEnv {
    // Backs the guest address space; the cache reads it through the
    // raw pointer in `te_mem`, so it has to stay boxed and alive
    #[allow(dead_code)]
    te_guest: Box<[u8]>,
    te_mem: RemoteMemory,
    te_platform: Arc<HeadlessPlatform>,
    te_frontend: Arc<TestFrontend>,
    te_pages: Arc<PageMap>,
    te_cache: Cache,
}

fn make_env() -> TestEnv {
    let mut guest = vec![0u8; GUEST_SIZE as usize].into_boxed_slice();
    let mem = RemoteMemory::new(0, guest.as_mut_ptr(), GUEST_SIZE);

    let platform = HeadlessPlatform::new();
    let frontend = Arc::new(TestFrontend::default());
    let pages = Arc::new(PageMap::new((GUEST_SIZE / vx::page_map::PAGE_SIZE) as usize));

    let cache = Cache::new(CacheCreateInfo {
        platform: platform.clone(),
        tiler: Arc::new(HeadlessTiler::new(platform.clone())),
        frontend: frontend.clone(),
        memory: mem,
        pages: pages.clone(),
        vm_id: 0,
        enable_gpu_cache: true,
    })
    .unwrap();

    TestEnv {
        te_guest: guest,
        te_mem: mem,
        te_platform: platform,
        te_frontend: frontend,
        te_pages: pages,
        te_cache: cache,
    }
}

impl TestEnv {
    fn sched(&self) -> HeadlessScheduler {
        HeadlessScheduler::new(self.te_platform.clone())
    }
}

fn c(v: u64) -> vx::gcn::ExprRef {
    Arc::new(Expr::Const(v))
}

// ---------------------------------------------------------------
// Leaf containers
// ---------------------------------------------------------------

#[test]
fn range_map_insert_and_query() {
    let mut map: RangeMap<u32> = RangeMap::new();

    map.map(AddressRange::from_begin_end(0x1000, 0x2000), 1, false, false);
    map.map(AddressRange::from_begin_end(0x3000, 0x4000), 2, false, false);

    let (range, &v) = map.query_area(0x1800).unwrap();
    assert_eq!(range, AddressRange::from_begin_end(0x1000, 0x2000));
    assert_eq!(v, 1);

    assert!(map.query_area(0x2800).is_none());
    assert!(map.query_area(0x4000).is_none());

    let all: Vec<_> = map.iter().map(|(r, &v)| (r.begin(), r.end(), v)).collect();
    assert_eq!(all, vec![(0x1000, 0x2000, 1), (0x3000, 0x4000, 2)]);
}

#[test]
fn range_map_split_preserves_payloads() {
    let mut map: RangeMap<u32> = RangeMap::new();
    map.map(AddressRange::from_begin_end(0x1000, 0x4000), 7, false, false);

    // Carving the middle keeps the covering payload on all pieces
    let v = *map.map(AddressRange::from_begin_end(0x2000, 0x3000), 9, false, true);
    assert_eq!(v, 7);

    let all: Vec<_> = map.iter().map(|(r, &v)| (r.begin(), r.end(), v)).collect();
    assert_eq!(
        all,
        vec![
            (0x1000, 0x2000, 7),
            (0x2000, 0x3000, 7),
            (0x3000, 0x4000, 7)
        ]
    );
}

#[test]
fn range_map_replace_takes_new_payload() {
    let mut map: RangeMap<u32> = RangeMap::new();
    map.map(AddressRange::from_begin_end(0x1000, 0x4000), 7, false, false);

    let v = *map.map(AddressRange::from_begin_end(0x2000, 0x3000), 9, false, false);
    assert_eq!(v, 9);

    let all: Vec<_> = map.iter().map(|(r, &v)| (r.begin(), r.end(), v)).collect();
    assert_eq!(
        all,
        vec![
            (0x1000, 0x2000, 7),
            (0x2000, 0x3000, 9),
            (0x3000, 0x4000, 7)
        ]
    );
}

#[test]
fn range_map_merge_adjacent() {
    let mut map: RangeMap<u32> = RangeMap::new();
    map.map(AddressRange::from_begin_end(0x1000, 0x2000), 5, false, false);
    map.map(AddressRange::from_begin_end(0x2000, 0x3000), 5, true, false);

    let all: Vec<_> = map.iter().map(|(r, &v)| (r.begin(), r.end(), v)).collect();
    assert_eq!(all, vec![(0x1000, 0x3000, 5)]);
}

#[test]
fn range_map_unmap_splits_edges() {
    let mut map: RangeMap<u32> = RangeMap::new();
    map.map(AddressRange::from_begin_end(0x1000, 0x4000), 3, false, false);
    map.map(AddressRange::from_begin_end(0x5000, 0x6000), 4, false, false);

    let erased = map.unmap(AddressRange::from_begin_end(0x2000, 0x5800));

    // The wholly covered range reports, the split one does not
    assert_eq!(erased, Vec::<u32>::new());

    let all: Vec<_> = map.iter().map(|(r, &v)| (r.begin(), r.end(), v)).collect();
    assert_eq!(all, vec![(0x1000, 0x2000, 3), (0x5800, 0x6000, 4)]);

    let erased = map.unmap(AddressRange::from_begin_end(0x0, 0x10000));
    assert_eq!(erased, vec![3, 4]);
    assert!(map.is_empty());
}

#[test]
fn range_map_lower_bound_walk() {
    let mut map: RangeMap<u32> = RangeMap::new();
    map.map(AddressRange::from_begin_end(0x1000, 0x2000), 1, false, false);
    map.map(AddressRange::from_begin_end(0x3000, 0x4000), 2, false, false);

    // Starting inside the first range returns it first
    let walk: Vec<u32> = map.lower_bound(0x1800).map(|(_, &v)| v).collect();
    assert_eq!(walk, vec![1, 2]);

    let walk: Vec<u32> = map.lower_bound(0x2800).map(|(_, &v)| v).collect();
    assert_eq!(walk, vec![2]);
}

#[test]
fn page_map_flags() {
    let pages = PageMap::new(16);
    let range = AddressRange::from_begin_end(0x1000, 0x1100);

    assert!(!pages.test(range));
    pages.mark(range);
    assert!(pages.test(range));

    // handle() consumes the flag
    assert!(pages.handle(range));
    assert!(!pages.test(range));
    assert!(!pages.handle(range));
}

// ---------------------------------------------------------------
// The symbolic evaluator
// ---------------------------------------------------------------

#[test]
fn evaluator_reduces_expressions() {
    let env = make_env();

    // sgpr arithmetic
    let expr = Expr::BinOp(
        vx::gcn::BinOp::Add,
        Arc::new(Expr::UserSgpr(0)),
        Arc::new(Expr::BinOp(vx::gcn::BinOp::Shl, c(1), c(8))),
    );
    let v = eval_expr(&expr, &[0x40], &env.te_mem).unwrap();
    assert_eq!(v.zext_scalar(), Some(0x140));

    // pointer load through guest memory
    env.te_mem
        .write(AddressRange::from_begin_size(0x6008, 4), &0x12345678u32.to_le_bytes());
    let expr = Expr::Pointer {
        size: 4,
        base: Arc::new(Expr::UserSgpr(1)),
        offset: c(8),
    };
    let v = eval_expr(&expr, &[0, 0x6000], &env.te_mem).unwrap();
    assert_eq!(v.zext_scalar(), Some(0x12345678));

    // immediate dereference
    env.te_mem
        .write(AddressRange::from_begin_size(0x7000, 4), &0xaabbccddu32.to_le_bytes());
    let v = eval_expr(&Expr::Imm(0x7000), &[], &env.te_mem).unwrap();
    assert_eq!(v.zext_scalar(), Some(0xaabbccdd));
}

#[test]
fn evaluator_rejects_unknown_sgprs() {
    let env = make_env();

    let result = eval_expr(&Expr::UserSgpr(5), &[1, 2], &env.te_mem);
    assert_eq!(result.unwrap_err(), VortxError::UNRESOLVABLE_RESOURCE);
}

// ---------------------------------------------------------------
// S1/S2: buffers and invalidation
// ---------------------------------------------------------------

#[test]
fn buffer_round_trip() {
    let env = make_env();
    let range = AddressRange::from_begin_end(0x1000, 0x1100);

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::WRITE).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(b.data, 0x100).fill(0xaa);
        }
        tag.release().unwrap();
    }

    // The buffer is below a page, so release flushed it straight back
    assert!(env.te_mem.slice(range).iter().all(|&b| b == 0xaa));

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::READ).unwrap();
        let data = unsafe { std::slice::from_raw_parts(b.data, 0x100) };
        assert!(data.iter().all(|&b| b == 0xaa));
        tag.release().unwrap();
    }
}

#[test]
fn guest_invalidation_forces_reupload() {
    let env = make_env();
    let range = AddressRange::from_begin_end(0x1000, 0x1100);

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::WRITE).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(b.data, 0x100).fill(0xaa);
        }
        tag.release().unwrap();
    }

    // The guest CPU scribbles over the range behind our back
    env.te_pages.mark(range);
    env.te_mem.slice_mut(range).fill(0x55);

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::READ).unwrap();
        let data = unsafe { std::slice::from_raw_parts(b.data, 0x100) };
        assert!(data.iter().all(|&b| b == 0x55));
        tag.release().unwrap();
    }
}

#[test]
fn expensive_buffer_defers_flush() {
    let env = make_env();
    // Two pages: release defers the write-back to guest memory
    let range = AddressRange::from_begin_size(0x8000, 0x2000);

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::WRITE).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(b.data, 0x2000).fill(0xbb);
        }
        tag.release().unwrap();
    }

    // Still owed: guest memory untouched
    assert!(env.te_mem.slice(range).iter().all(|&b| b == 0));

    // read_memory flushes before looking
    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let mut bytes = vec![0u8; 0x2000];
        tag.read_memory(&mut bytes, range).unwrap();
        assert!(bytes.iter().all(|&b| b == 0xbb));
        tag.release().unwrap();
    }

    assert!(env.te_mem.slice(range).iter().all(|&b| b == 0xbb));
}

#[test]
fn in_sync_expensive_buffer_skips_upload() {
    let env = make_env();
    let range = AddressRange::from_begin_size(0x8000, 0x2000);

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::WRITE).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(b.data, 0x2000).fill(0xcc);
        }
        tag.release().unwrap();
    }

    // Guest memory still stale, but the cached content is
    // authoritative and in sync, so a read sees the cached bytes
    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let b = tag.get_buffer(range, Access::READ).unwrap();
        let data = unsafe { std::slice::from_raw_parts(b.data, 0x2000) };
        assert!(data.iter().all(|&b| b == 0xcc));
        tag.release().unwrap();
    }
}

// ---------------------------------------------------------------
// S3: index conversion
// ---------------------------------------------------------------

#[test]
fn quad_list_expansion() {
    let env = make_env();

    let indices: [u16; 4] = [10, 11, 12, 13];
    let mut bytes = Vec::new();
    for i in indices {
        bytes.extend_from_slice(&i.to_le_bytes());
    }
    env.te_mem
        .write(AddressRange::from_begin_size(0x2000, 8), &bytes);

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let ib = tag
        .get_index_buffer(0x2000, 0, 4, PrimitiveType::QuadList, IndexType::Int16)
        .unwrap();

    assert_eq!(ib.index_count, 6);
    assert_eq!(ib.prim_type, PrimitiveType::TriList);
    assert_eq!(ib.index_type, IndexType::Int16);

    let data = env.te_platform.buffer_bytes(ib.handle);
    let out: Vec<u16> = data[..12]
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    assert_eq!(out, vec![10, 11, 12, 12, 13, 10]);

    // An identical request inside the same tag reuses the conversion
    let again = tag
        .get_index_buffer(0x2000, 0, 4, PrimitiveType::QuadList, IndexType::Int16)
        .unwrap();
    assert_eq!(again.handle, ib.handle);

    tag.release().unwrap();
}

#[test]
fn quad_strip_expansion_law() {
    let env = make_env();

    // Two quads worth of strip indices
    let indices: [u16; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
    let mut bytes = Vec::new();
    for i in indices {
        bytes.extend_from_slice(&i.to_le_bytes());
    }
    env.te_mem
        .write(AddressRange::from_begin_size(0x2100, 16), &bytes);

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let ib = tag
        .get_index_buffer(0x2100, 0, 8, PrimitiveType::QuadStrip, IndexType::Int16)
        .unwrap();

    // 4N source indices make 6N output indices
    assert_eq!(ib.index_count, 12);

    let data = env.te_platform.buffer_bytes(ib.handle);
    let out: Vec<u16> = data[..24]
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    assert_eq!(out, vec![0, 1, 3, 0, 3, 2, 4, 5, 7, 4, 7, 6]);

    tag.release().unwrap();
}

#[test]
fn index_expansion_widens_to_32_bits() {
    let env = make_env();

    // 11000 quads expand to 66000 indices, past the u16 limit
    let quad_count = 11000u32;
    let src_count = quad_count * 4;
    let bytes = vec![0u8; src_count as usize * 2];
    env.te_mem
        .write(AddressRange::from_begin_size(0x40000, bytes.len() as u64), &bytes);

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let ib = tag
        .get_index_buffer(0x40000, 0, src_count, PrimitiveType::QuadList, IndexType::Int16)
        .unwrap();

    assert_eq!(ib.index_count, quad_count * 6);
    assert_eq!(ib.index_type, IndexType::Int32);

    tag.release().unwrap();
}

// ---------------------------------------------------------------
// S4 and invariant 5: the image update chain
// ---------------------------------------------------------------

fn test_image_key(address: u64) -> ImageKey {
    ImageKey {
        read_address: address,
        write_address: address,
        tex_type: TextureType::Dim2D,
        dfmt: DataFormat::Fmt8_8_8_8,
        nfmt: NumericFormat::UNorm,
        // Array mode 2dThin in the packed field
        tile_mode: TileMode::from_raw(4 << 2),
        extent: Extent {
            width: 64,
            height: 64,
            depth: 1,
        },
        pitch: 64,
        base_mip_level: 0,
        mip_count: 1,
        base_array_layer: 0,
        array_layer_count: 1,
        kind: ImageKind::Color,
        pow2pad: false,
    }
}

fn texel_color(x: u64, y: u64) -> [u8; 4] {
    [x as u8, y as u8, (x ^ y) as u8, 0xff]
}

#[test]
fn image_update_chain_detiles() {
    let env = make_env();
    let key = test_image_key(0x10000);

    let info = compute_surface_info(
        key.tile_mode,
        key.tex_type,
        key.dfmt,
        64,
        64,
        1,
        64,
        0,
        1,
        0,
        1,
        false,
    );

    // Write a recognizable pattern in the guest's tiled layout
    for y in 0..64u64 {
        for x in 0..64u64 {
            let offset = 0x10000 + tiled_offset(&info, 0, x, y, 4);
            env.te_mem
                .write(AddressRange::from_begin_size(offset, 4), &texel_color(x, y));
        }
    }

    let mut sched = env.sched();
    let handle = {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let img = tag.get_image(&key, Access::READ).unwrap();
        tag.release().unwrap();
        img.handle
    };

    // The pull-in was recorded onto our command stream; run it
    use vx::scheduler::Scheduler;
    sched.submit().unwrap();

    let texels = env.te_platform.image_bytes(handle, 0, 0);
    let at = ((32 * 64) + 32) * 4;
    assert_eq!(&texels[at..at + 4], &texel_color(32, 32));
    let at = ((5 * 64) + 60) * 4;
    assert_eq!(&texels[at..at + 4], &texel_color(60, 5));
}

#[test]
fn image_write_back_tiles_to_guest() {
    let env = make_env();
    let key = test_image_key(0x20000);

    let info = compute_surface_info(
        key.tile_mode,
        key.tex_type,
        key.dfmt,
        64,
        64,
        1,
        64,
        0,
        1,
        0,
        1,
        false,
    );

    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let img = tag.get_image(&key, Access::WRITE).unwrap();

        // Stand-in for a draw: fill the image directly
        let mut pattern = Vec::with_capacity(64 * 64 * 4);
        for y in 0..64u64 {
            for x in 0..64u64 {
                pattern.extend_from_slice(&texel_color(x, y));
            }
        }
        env.te_platform.poke_image(img.handle, 0, 0, &pattern);

        // Release flows the content down: image -> image buffer ->
        // buffer, with submits between the levels
        tag.release().unwrap();
    }

    // The Buffer level deferred its guest write; force it out
    let range = AddressRange::from_begin_size(0x20000, info.si_total_tiled_size);
    let mut sched = env.sched();
    {
        let mut tag = env.te_cache.create_tag(&mut sched);
        let mut bytes = vec![0u8; range.size() as usize];
        tag.read_memory(&mut bytes, range).unwrap();
        tag.release().unwrap();
    }

    // Guest memory now holds the tiled form of the pattern
    for &(x, y) in [(32u64, 32u64), (0, 0), (63, 63), (7, 9)].iter() {
        let offset = 0x20000 + tiled_offset(&info, 0, x, y, 4);
        let mut texel = [0u8; 4];
        env.te_mem
            .read(AddressRange::from_begin_size(offset, 4), &mut texel);
        assert_eq!(texel, texel_color(x, y), "texel ({}, {})", x, y);
    }
}

#[test]
fn surface_info_spans_full_mip_chain() {
    use vx::gnm::TBuffer;

    // A T# windowing mips 2..=4 of a 64x64 RGBA8 surface at 0x10000
    let base256 = 0x10000u64 >> 8;
    let q0 = base256 | (0x0a << 52);
    let q1 = 63u64 | (63 << 14) | (2 << 44) | (4 << 48) | (9 << 60);
    let q2 = 63u64 << 13;

    let tbuffer = TBuffer::from_words([
        q0 as u32,
        (q0 >> 32) as u32,
        q1 as u32,
        (q1 >> 32) as u32,
        q2 as u32,
        (q2 >> 32) as u32,
        0,
        0,
    ]);
    let key = ImageKey::from_tbuffer(&tbuffer);
    assert_eq!(key.base_mip_level, 2);
    assert_eq!(key.mip_count, 3);

    let windowed = compute_surface_info(
        key.tile_mode,
        key.tex_type,
        key.dfmt,
        key.extent.width,
        key.extent.height,
        key.extent.depth,
        key.pitch,
        key.base_array_layer,
        key.array_layer_count,
        key.base_mip_level,
        key.mip_count,
        key.pow2pad,
    );
    let full = compute_surface_info(
        key.tile_mode,
        key.tex_type,
        key.dfmt,
        key.extent.width,
        key.extent.height,
        key.extent.depth,
        key.pitch,
        0,
        1,
        0,
        5,
        key.pow2pad,
    );

    // The layout is a property of the surface, not of the window
    assert_eq!(windowed.si_mip_count, 5);
    assert_eq!(windowed.si_total_tiled_size, full.si_total_tiled_size);
    assert_eq!(windowed.si_total_linear_size, full.si_total_linear_size);

    // Hand-computed full chain for 64x64 RGBA8, 8x8 micro tiles:
    // tiled mips 16384 + 4096 + 1024 + 256 + 256 (4x4 pads to 8x8),
    // linear mips 16384 + 4096 + 1024 + 256 + 64
    assert_eq!(windowed.si_total_tiled_size, 22016);
    assert_eq!(windowed.si_total_linear_size, 21824);

    let sub = windowed.subresource(2);
    assert_eq!(sub.sr_tiled_offset, 20480);
    assert_eq!(sub.sr_linear_offset, 20480);
    assert_eq!(sub.sr_data_width, 16);

    let sub = windowed.subresource(4);
    assert_eq!(sub.sr_tiled_size, 256);
    assert_eq!(sub.sr_linear_size, 64);
}

#[test]
fn mip_windows_share_one_image() {
    use vx::entry::EntryType;

    let env = make_env();

    let full_key = ImageKey {
        mip_count: 5,
        ..test_image_key(0x60000)
    };
    let windowed_key = ImageKey {
        base_mip_level: 2,
        mip_count: 3,
        ..full_key
    };

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let a = tag.get_image(&full_key, Access::READ).unwrap();
    let b = tag.get_image(&windowed_key, Access::READ).unwrap();

    // Both windows resolve to one canonical cached Image
    assert_eq!(a.handle, b.handle);

    let live_entries = {
        let table = env.te_cache.table(EntryType::Image).lock().unwrap();
        table.iter().filter(|(_, p)| p.is_some()).count()
    };
    assert_eq!(live_entries, 1);

    tag.release().unwrap();
}

// ---------------------------------------------------------------
// S5: shader content addressing
// ---------------------------------------------------------------

#[test]
fn shader_cache_keys_on_sgprs_and_memory() {
    let env = make_env();
    let address = 0x30000u64;

    // A fake program: 16 bytes of "bytecode"
    let program: Vec<u8> = (0u8..16).collect();
    env.te_mem
        .write(AddressRange::from_begin_size(address, 16), &program);

    env.te_frontend.set_info(
        address,
        ShaderInfo {
            required_sgprs: vec![(0, 11)],
            memory_map: vec![AddressRange::from_begin_size(address, 16)],
            ..Default::default()
        },
    );

    let key = |sgprs: Vec<u32>| ShaderKey {
        address,
        stage: Stage::VsVs,
        env: Environment {
            user_sgprs: sgprs,
            ..Default::default()
        },
    };

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let first = tag.get_shader(&key(vec![11, 22, 33]), None).unwrap();
    assert!(first.handle.is_some());
    assert_eq!(env.te_frontend.compiles(), 1);

    // Identical request: cache hit, same handle, no new translation
    let second = tag.get_shader(&key(vec![11, 22, 33]), None).unwrap();
    assert_eq!(second.handle, first.handle);
    assert_eq!(env.te_frontend.compiles(), 1);

    // A required sgpr changed: the burned-in constant is wrong now
    let third = tag.get_shader(&key(vec![99, 22, 33]), None).unwrap();
    assert!(third.handle.is_some());
    assert_ne!(third.handle, first.handle);
    assert_eq!(env.te_frontend.compiles(), 2);

    // Restore the sgpr but overwrite the program bytes
    env.te_mem
        .write(AddressRange::from_begin_size(address + 8, 4), &[0xff; 4]);
    let fourth = tag.get_shader(&key(vec![11, 22, 33]), None).unwrap();
    assert!(fourth.handle.is_some());
    assert_ne!(fourth.handle, first.handle);
    assert_eq!(env.te_frontend.compiles(), 3);

    tag.release().unwrap();
}

#[test]
fn shader_translation_failure_returns_no_handle() {
    let env = make_env();
    let address = 0x31000u64;

    env.te_mem
        .write(AddressRange::from_begin_size(address, 4), &0xdeadc0deu32.to_le_bytes());

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let shader = tag
        .get_shader(
            &ShaderKey {
                address,
                stage: Stage::Ps,
                env: Environment::default(),
            },
            None,
        )
        .unwrap();

    assert!(shader.handle.is_none());
    assert!(shader.info.is_none());

    tag.release().unwrap();
}

// ---------------------------------------------------------------
// Resource resolution and the memory table
// ---------------------------------------------------------------

#[test]
fn memory_table_packs_resolved_ranges() {
    let env = make_env();

    // One raw pointer resource at sgpr0 and one V# at a fixed
    // address; distinct ranges, two table slots
    let resources = Resources {
        slots: 2,
        pointers: vec![PointerResource {
            resource_slot: 0,
            size: 0x40,
            base: Arc::new(Expr::UserSgpr(0)),
            offset: c(0),
        }],
        buffers: vec![BufferResource {
            resource_slot: 1,
            access: Access::READ,
            words: [c(0x5000), c(0), c(0x80), c(0)],
        }],
        ..Default::default()
    };

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let mut state = ShaderResources::default();
    state
        .load_resources(&mut tag, &resources, &[0x4000])
        .unwrap();

    let table = tag.get_memory_table();
    state.build_memory_table(&mut tag, &table).unwrap();

    // bincode packs the slot vector as a u64 count then fixed-width
    // little-endian fields
    let bytes = unsafe { std::slice::from_raw_parts(table.data, 8 + 2 * 32) };
    let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    assert_eq!(count, 2);

    let slot0_address = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let slot0_size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    assert_eq!(slot0_address, 0x4000);
    assert_eq!(slot0_size, 0x40);

    let slot1_address = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
    let slot1_size = u64::from_le_bytes(bytes[48..56].try_into().unwrap());
    assert_eq!(slot1_address, 0x5000);
    assert_eq!(slot1_size, 0x80);

    // Slot fixups resolved to the enclosing table entries
    assert_eq!(state.get_resource_slot(0), 0);
    assert_eq!(state.get_resource_slot(1), 1);

    tag.release().unwrap();
}

#[test]
fn textures_and_samplers_resolve_through_tag() {
    let env = make_env();

    // Craft T# words for a 16x16 RGBA8 linear texture at 0x50000:
    //   qword0: address/256 in low bits, dfmt/nfmt at 52/58
    let base256 = 0x50000u64 >> 8;
    let q0 = base256 | (0x0a << 52) | (0 << 58);
    //   qword1: width-1, height-1 at 0/14, type Dim2D (9) at 60
    let q1 = 15u64 | (15 << 14) | (9 << 60);
    //   qword2: depth-1 at 0, pitch-1 at 13
    let q2 = 0u64 | (15 << 13);

    let resources = Resources {
        slots: 2,
        textures: vec![TextureResource {
            resource_slot: 0,
            access: Access::READ,
            words: [
                c(q0 & 0xffff_ffff),
                c(q0 >> 32),
                c(q1 & 0xffff_ffff),
                c(q1 >> 32),
            ],
            words_hi: Some([c(q2 & 0xffff_ffff), c(q2 >> 32), c(0), c(0)]),
        }],
        samplers: vec![SamplerResource {
            resource_slot: 1,
            unorm: false,
            words: [c(0), c(0), c(0), c(0)],
        }],
        ..Default::default()
    };

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let mut state = ShaderResources::default();
    state.load_resources(&mut tag, &resources, &[]).unwrap();

    // One 2D view and one sampler came out the other side
    assert_eq!(state.sr_image_resources[1].len(), 1);
    assert_eq!(state.sr_sampler_resources.len(), 1);

    tag.release().unwrap();
}

#[test]
fn samplers_deduplicate() {
    let env = make_env();

    let words = [0u32, 0, 0, 0];
    let key = vx::keys::SamplerKey::from_ssampler(&vx::gnm::SSampler::from_words(words));

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let a = tag.get_sampler(&key).unwrap();
    let b = tag.get_sampler(&key).unwrap();
    assert_eq!(a.handle, b.handle);

    let mut other = key;
    other.max_lod = 0x800;
    let c = tag.get_sampler(&other).unwrap();
    assert_ne!(a.handle, c.handle);

    tag.release().unwrap();
}

// ---------------------------------------------------------------
// S6: concurrent acquisition
// ---------------------------------------------------------------

#[test]
fn readers_share_writers_block() {
    let env = make_env();
    let range = AddressRange::from_begin_end(0x1000, 0x1100);
    let cache = &env.te_cache;

    let acquired = Barrier::new(3);
    let release = Barrier::new(3);
    let writer_done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let mut sched = env.sched();
                let mut tag = cache.create_tag(&mut sched);
                tag.get_buffer(range, Access::READ).unwrap();

                // Both readers hold the entry at this point; if read
                // acquisition serialized, one of us would never get
                // here and the barrier would hang
                acquired.wait();
                release.wait();
                tag.release().unwrap();
            });
        }

        acquired.wait();

        let writer = s.spawn(|| {
            let mut sched = env.sched();
            let mut tag = cache.create_tag(&mut sched);
            // Blocks until both readers release
            tag.get_buffer(range, Access::WRITE).unwrap();
            writer_done.store(true, Ordering::SeqCst);
            tag.release().unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!writer_done.load(Ordering::SeqCst));

        release.wait();
        writer.join().unwrap();
        assert!(writer_done.load(Ordering::SeqCst));
    });
}

#[test]
fn acquisition_state_tracks_holders() {
    use vx::entry::EntryType;

    let env = make_env();
    let small = AddressRange::from_begin_end(0x1000, 0x1100);
    let large = AddressRange::from_begin_size(0x8000, 0x2000);

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);
    tag.get_buffer(small, Access::WRITE).unwrap();
    tag.get_buffer(large, Access::WRITE).unwrap();

    let small_entry = {
        let table = env.te_cache.table(EntryType::Buffer).lock().unwrap();
        table.query_area(small.begin()).unwrap().1.clone().unwrap()
    };
    let large_entry = {
        let table = env.te_cache.table(EntryType::Buffer).lock().unwrap();
        table.query_area(large.begin()).unwrap().1.clone().unwrap()
    };

    assert!(small_entry.is_in_use());
    assert_eq!(small_entry.acquired_access(), Access::WRITE);
    assert!(!small_entry.has_delayed_flush());

    tag.release().unwrap();

    assert!(!small_entry.is_in_use());
    assert!(!large_entry.is_in_use());

    // The cheap buffer flushed inline; the page-sized one still owes
    // its write-back, and only writers ever owe one
    assert!(!small_entry.has_delayed_flush());
    assert!(large_entry.has_delayed_flush());
}

// ---------------------------------------------------------------
// Graphics and compute config plumbing
// ---------------------------------------------------------------

#[test]
fn vertex_shader_config_slots_resolve() {
    use vx::gcn::{ConfigSlot, ConfigType};

    let env = make_env();
    let address = 0x32000u64;
    env.te_mem
        .write(AddressRange::from_begin_size(address, 16), &[7u8; 16]);
    // An immediate constant the shader wants copied into its config
    env.te_mem
        .write(AddressRange::from_begin_size(0x33000, 4), &0x11112222u32.to_le_bytes());

    env.te_frontend.set_info(
        address,
        ShaderInfo {
            config_slots: vec![
                ConfigSlot {
                    cs_type: ConfigType::MemoryTable,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::MemoryTable,
                    cs_data: 1,
                },
                ConfigSlot {
                    cs_type: ConfigType::UserSgpr,
                    cs_data: 1,
                },
                ConfigSlot {
                    cs_type: ConfigType::VsPrimType,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::VsIndexOffset,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::ResourceSlot,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::Imm,
                    cs_data: 0x33000,
                },
            ],
            resources: Resources {
                slots: 1,
                pointers: vec![PointerResource {
                    resource_slot: 0,
                    size: 0x20,
                    base: Arc::new(Expr::UserSgpr(0)),
                    offset: c(0),
                }],
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_graphics_tag(&mut sched);

    let pgm = vx::ShaderPgm {
        address,
        vgpr_count: 8,
        sgpr_count: 16,
        user_sgprs: vec![0x4000, 777],
    };

    let shader = tag
        .get_vertex_shader(&pgm, PrimitiveType::TriList, 5, &vx::GraphicsContext::default())
        .unwrap();
    assert!(shader.handle.is_some());

    let sets = tag.get_descriptor_sets();
    tag.build_descriptors(sets[0]).unwrap();

    tag.release().unwrap();
}

#[test]
fn compute_shader_config_slots_resolve() {
    use vx::gcn::{ConfigSlot, ConfigType, CsDispatchInput};

    let env = make_env();
    let address = 0x34000u64;
    env.te_mem
        .write(AddressRange::from_begin_size(address, 16), &[9u8; 16]);

    env.te_frontend.set_info(
        address,
        ShaderInfo {
            config_slots: vec![
                ConfigSlot {
                    cs_type: ConfigType::Gds,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::Gds,
                    cs_data: 1,
                },
                ConfigSlot {
                    cs_type: ConfigType::CsTgIdCompCnt,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::CsInputSGpr,
                    cs_data: 0,
                },
                ConfigSlot {
                    cs_type: ConfigType::CsInputSGpr,
                    cs_data: 4,
                },
            ],
            ..Default::default()
        },
    );

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_compute_tag(&mut sched);

    let pgm = vx::ComputePgm {
        address,
        vgpr_count: 4,
        sgpr_count: 8,
        num_thread_x: 8,
        num_thread_y: 8,
        num_thread_z: 1,
        user_sgprs: vec![1, 2],
        dispatch_input: CsDispatchInput::TGID_X_EN | CsDispatchInput::TGID_Y_EN,
        tg_id_comp_count: 2,
    };

    let shader = tag.get_shader(&pgm).unwrap();
    assert!(shader.handle.is_some());

    let set = tag.get_descriptor_set();
    tag.build_descriptors(set).unwrap();

    tag.release().unwrap();
}

#[test]
fn same_tag_reacquire_ors_access() {
    let env = make_env();
    let range = AddressRange::from_begin_end(0x1000, 0x1100);

    let mut sched = env.sched();
    let mut tag = env.te_cache.create_tag(&mut sched);

    let a = tag.get_buffer(range, Access::READ).unwrap();
    // The same tag asking again must not deadlock against itself
    let b = tag.get_buffer(range, Access::WRITE).unwrap();
    assert_eq!(a.handle, b.handle);

    unsafe {
        std::slice::from_raw_parts_mut(b.data, 0x100).fill(0x42);
    }
    tag.release().unwrap();

    assert!(env.te_mem.slice(range).iter().all(|&v| v == 0x42));
}
