//! End-to-end scenarios run through a real queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinder_core::{
    BlitFlags, BlitRect, ColorMask, CompareOp, ImageFormat, Primitive, Stage, StageFlags,
};
use cinder_gpu::{
    CmdBuf, CmdBufConfig, Fence, FenceStatus, GpuError, ImageDescriptor, ImageFlags, ImageView,
    MemBlock, MemBlockConfig, QueueConfig, QueueFlags, ResHandle, Sampler, SamplerDescriptor,
    Shader, SlotState, Swapchain, SwapchainConfig,
};
use parking_lot::Mutex;

use crate::{compare_pixels, test_window, RigConfig, TestError, TestRig};

#[test]
fn grow_callback_runs_once_when_memory_runs_out() {
    let mut rig = TestRig::new().unwrap();
    let memory = rig.block(0x10000).unwrap();
    let target = rig.block(0x20000).unwrap();

    let grows = Arc::new(AtomicUsize::new(0));
    let extra: Arc<Mutex<Vec<MemBlock>>> = Arc::default();
    let config = {
        let grows = Arc::clone(&grows);
        let extra = Arc::clone(&extra);
        CmdBufConfig::new().with_grow_callback(move |cmdbuf: &mut CmdBuf, requested| {
            grows.fetch_add(1, Ordering::SeqCst);
            let size = requested.next_multiple_of(0x1000);
            let block = MemBlock::new(cmdbuf.device(), MemBlockConfig::new(size)).unwrap();
            cmdbuf.add_memory(&block, 0, size).unwrap();
            extra.lock().push(block);
        })
    };
    let mut cmdbuf = CmdBuf::new(rig.device(), config).unwrap();
    cmdbuf.add_memory(&memory, 0, 0x10000).unwrap();

    let chunk: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    for i in 0..10u64 {
        cmdbuf.push_data(target.gpu_addr() + i * 4000, &chunk).unwrap();
    }
    assert_eq!(grows.load(Ordering::SeqCst), 0);

    let tail = vec![0xAB; 30000];
    cmdbuf.push_data(target.gpu_addr() + 40000, &tail).unwrap();
    assert_eq!(grows.load(Ordering::SeqCst), 1);
    assert!(!cmdbuf.needs_memory());

    let list = cmdbuf.finish_list();
    rig.submit_and_wait(&list).unwrap();

    let mut out = vec![0u8; 4000];
    target.read_bytes(9 * 4000, &mut out).unwrap();
    assert_eq!(out, chunk);
    let mut out = vec![0u8; 30000];
    target.read_bytes(40000, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0xAB));
}

#[test]
fn submissions_execute_in_order() {
    let mut rig = TestRig::new().unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x10000).unwrap();
    let buffer = rig.block(0x1000).unwrap();
    let base = buffer.gpu_addr();

    cmdbuf.push_data(base, &[0x11; 16]).unwrap();
    let mut lists = vec![cmdbuf.finish_list()];
    // Each copy reads what the previous list wrote.
    for i in 1..8u64 {
        cmdbuf.copy_buffer(base + (i - 1) * 16, base + i * 16, 16).unwrap();
        lists.push(cmdbuf.finish_list());
    }
    for list in &lists {
        rig.queue().submit_commands(list).unwrap();
    }
    rig.queue().wait_idle().unwrap();

    let words: Vec<u8> = buffer.read_range(7 * 16, 16).unwrap();
    assert_eq!(words, vec![0x11; 16]);
    assert_eq!(rig.queue().stats().copies, 7);
}

#[test]
fn cleared_buffer_lists_are_rejected() {
    let mut rig = TestRig::new().unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.barrier(cinder_core::Barrier::Full, Default::default()).unwrap();
    let list = cmdbuf.finish_list();
    cmdbuf.clear();
    assert!(matches!(
        rig.queue().submit_commands(&list),
        Err(GpuError::StaleCommandList)
    ));
    assert!(!rig.queue().is_in_error_state());
}

#[test]
fn unsignaled_fence_times_out_immediately() {
    let rig = TestRig::new().unwrap();
    let fence = Fence::new(rig.device()).unwrap();
    assert_eq!(fence.wait(Some(Duration::ZERO)), FenceStatus::TimedOut);
    assert!(!fence.is_signaled());
}

#[test]
fn descriptors_survive_gpu_memory() {
    let mut rig = TestRig::new().unwrap();
    let images = rig.image_block(0x10000).unwrap();
    let image = rig
        .image_2d(&images, 0, 16, 16, ImageFormat::RGBA8Unorm, ImageFlags::empty())
        .unwrap();
    let descriptor = ImageDescriptor::new(&ImageView::new(&image), false, false).unwrap();
    let sampler = SamplerDescriptor::new(
        &Sampler::default().with_depth_compare(true, CompareOp::Lequal),
    );

    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    let table = rig.block(0x1000).unwrap();
    cmdbuf.push_data(table.gpu_addr(), descriptor.as_bytes()).unwrap();
    cmdbuf.push_data(table.gpu_addr() + 0x20, sampler.as_bytes()).unwrap();
    let list = cmdbuf.finish_list();
    rig.submit_and_wait(&list).unwrap();

    let mut bytes = [0u8; 32];
    table.read_bytes(0, &mut bytes).unwrap();
    let read = ImageDescriptor::from_bytes(&bytes).unwrap();
    assert_eq!(read.gpu_addr(), image.gpu_addr());
    assert_eq!(read.format(), Some(ImageFormat::RGBA8Unorm));
    assert_eq!((read.width(), read.height()), (16, 16));

    table.read_bytes(0x20, &mut bytes).unwrap();
    let read = SamplerDescriptor::from_bytes(&bytes).unwrap();
    assert_eq!(read.compare(), (true, Some(CompareOp::Lequal)));
}

#[test]
fn clear_blit_and_read_back() {
    let mut rig = TestRig::new().unwrap();
    let block = rig.image_block(0x10000).unwrap();
    let small = rig
        .image_2d(&block, 0, 4, 4, ImageFormat::RGBA8Unorm, ImageFlags::USAGE_RENDER)
        .unwrap();
    let large = rig
        .image_2d(&block, 0x1000, 8, 8, ImageFormat::RGBA8Unorm, ImageFlags::empty())
        .unwrap();
    let (small_view, large_view) = (ImageView::new(&small), ImageView::new(&large));

    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.bind_render_targets(&[&small_view], None).unwrap();
    cmdbuf
        .clear_color_float(0, ColorMask::RGBA, [0.0, 1.0, 0.0, 1.0])
        .unwrap();
    cmdbuf
        .blit_image(
            &small_view,
            &BlitRect::new(0, 0, 4, 4),
            &large_view,
            &BlitRect::new(0, 0, 8, 8),
            BlitFlags::empty(),
            0,
        )
        .unwrap();
    let list = cmdbuf.finish_list();
    rig.submit_and_wait(&list).unwrap();

    let pixels = rig.read_rgba8(&large, &block).unwrap();
    compare_pixels(&pixels, &[[0, 255, 0, 255]; 64], rig.threshold()).unwrap();
    let err = compare_pixels(&pixels, &[[255, 0, 0, 255]; 64], rig.threshold()).unwrap_err();
    assert!(matches!(err, TestError::PixelComparison(_)));
}

#[test]
fn textured_draw_is_counted() {
    let mut rig = TestRig::new().unwrap();
    let code = rig.code_block(0x1000).unwrap();
    let vertex = rig.shader(&code, 0, Stage::Vertex).unwrap();
    let fragment = rig.shader(&code, 0x100, Stage::Fragment).unwrap();

    let images = rig.image_block(0x10000).unwrap();
    let image = rig
        .image_2d(&images, 0, 16, 16, ImageFormat::RGBA8Unorm, ImageFlags::empty())
        .unwrap();
    let table = rig.block(0x1000).unwrap();
    let descriptor = ImageDescriptor::new(&ImageView::new(&image), false, false).unwrap();
    table.write_bytes(0, descriptor.as_bytes()).unwrap();
    table
        .write_bytes(0x100, SamplerDescriptor::new(&Sampler::default()).as_bytes())
        .unwrap();

    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf
        .bind_shaders(StageFlags::VERTEX | StageFlags::FRAGMENT, &[&vertex, &fragment])
        .unwrap();
    cmdbuf.bind_image_descriptor_set(table.gpu_addr(), 1).unwrap();
    cmdbuf
        .bind_sampler_descriptor_set(table.gpu_addr() + 0x100, 1)
        .unwrap();
    cmdbuf
        .bind_texture(Stage::Fragment, 0, ResHandle::texture(0, 0))
        .unwrap();
    cmdbuf.draw(Primitive::Triangles, 3, 2, 0, 0).unwrap();
    let list = cmdbuf.finish_list();
    rig.submit_and_wait(&list).unwrap();

    let stats = rig.queue().stats();
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.vertices, 6);
    assert!(rig.errors().is_empty());
}

#[test]
fn invalid_shader_faults_the_queue() {
    let mut rig = TestRig::new().unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.bind_shader(&Shader::default()).unwrap();
    cmdbuf.draw(Primitive::Triangles, 3, 1, 0, 0).unwrap();
    let list = cmdbuf.finish_list();

    assert!(rig.submit_and_wait(&list).is_err());
    assert!(rig.queue().is_in_error_state());
    assert_eq!(rig.errors().len(), 1);
    assert!(matches!(
        rig.queue().submit_commands(&list),
        Err(GpuError::QueueFaulted)
    ));
    assert!(matches!(rig.queue().wait_idle(), Err(GpuError::QueueFaulted)));
}

#[test]
fn compute_only_queue_rejects_draws() {
    let config = RigConfig {
        queue: QueueConfig::new().with_flags(QueueFlags::COMPUTE | QueueFlags::TRANSFER),
        ..RigConfig::default()
    };
    let mut rig = TestRig::with_config(config).unwrap();
    let code = rig.code_block(0x1000).unwrap();
    let compute = rig.shader(&code, 0, Stage::Compute).unwrap();
    let vertex = rig.shader(&code, 0x100, Stage::Vertex).unwrap();

    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.bind_shader(&compute).unwrap();
    cmdbuf.dispatch_compute(4, 2, 1).unwrap();
    let list = cmdbuf.finish_list();
    rig.submit_and_wait(&list).unwrap();
    assert_eq!(rig.queue().stats().workgroups, 8);

    cmdbuf.bind_shader(&vertex).unwrap();
    cmdbuf.draw(Primitive::Triangles, 3, 1, 0, 0).unwrap();
    let list = cmdbuf.finish_list();
    assert!(rig.submit_and_wait(&list).is_err());
    assert!(rig.queue().is_in_error_state());
}

#[test]
fn swapchain_rotates_through_queue() {
    let mut rig = TestRig::new().unwrap();
    let block = rig.image_block(0x10000).unwrap();
    let flags = ImageFlags::USAGE_RENDER | ImageFlags::USAGE_PRESENT;
    let images = [
        rig.image_2d(&block, 0, 32, 32, ImageFormat::BGRA8Unorm, flags).unwrap(),
        rig.image_2d(&block, 0x8000, 32, 32, ImageFormat::BGRA8Unorm, flags).unwrap(),
    ];
    let chain = Swapchain::new(
        rig.device(),
        test_window(),
        &[&images[0], &images[1]],
        SwapchainConfig::new().with_swap_interval(0),
    )
    .unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();

    let mut presented = Vec::new();
    for frame in 0..4 {
        let slot = rig.queue().acquire_image(&chain).unwrap();
        assert_eq!(chain.slot_state(slot), Some(SlotState::Acquired));
        let view = ImageView::new(chain.image(slot).unwrap());
        cmdbuf.bind_render_targets(&[&view], None).unwrap();
        cmdbuf
            .clear_color_float(0, ColorMask::RGBA, [frame as f32 / 4.0, 0.0, 0.0, 1.0])
            .unwrap();
        let list = cmdbuf.finish_list();
        rig.queue().submit_commands(&list).unwrap();
        rig.queue().present_image(&chain, slot).unwrap();
        rig.queue().wait_idle().unwrap();
        presented.push(slot);
    }

    let last = chain.last_presented().unwrap();
    assert_eq!(last.frame, 4);
    assert_eq!(last.slot, presented[3]);
    assert_ne!(presented[0], presented[1]);
    // Only the image on screen is still presenting.
    let other = 1 - last.slot;
    assert_eq!(chain.slot_state(other), Some(SlotState::Free));
    assert!(chain.slot_fence(other).unwrap().is_signaled());
    assert_eq!(rig.queue().stats().presents, 4);
}

#[test]
fn capacity_is_accounted() {
    let rig = TestRig::new().unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    assert_eq!(cmdbuf.capacity(), 0x1000);
    cmdbuf.push_data(0x1000, &[0; 64]).unwrap();
    assert!(cmdbuf.consumed() > 64);
    assert_eq!(cmdbuf.consumed() + cmdbuf.available(), cmdbuf.capacity());
}

#[test]
fn wrapping_copy_faults_the_queue() {
    let mut rig = TestRig::new().unwrap();
    let block = rig.block(0x1000).unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.copy_buffer(block.gpu_addr(), u64::MAX - 4, 16).unwrap();
    let list = cmdbuf.finish_list();

    assert!(rig.submit_and_wait(&list).is_err());
    assert!(rig.queue().is_in_error_state());
    assert_eq!(rig.errors().len(), 1);
    assert!(matches!(rig.queue().wait_idle(), Err(GpuError::QueueFaulted)));
}

#[test]
fn oversized_copy_faults_and_fails_its_fence() {
    let mut rig = TestRig::new().unwrap();
    let src = rig.block(0x1000).unwrap();
    let dst = rig.block(0x1000).unwrap();
    let fence = Fence::new(rig.device()).unwrap();
    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf.copy_buffer(src.gpu_addr(), dst.gpu_addr(), 1 << 40).unwrap();
    cmdbuf.signal_fence(&fence, true).unwrap();
    let list = cmdbuf.finish_list();

    rig.queue().submit_commands(&list).unwrap();
    rig.queue().flush().unwrap();
    assert_eq!(fence.wait(Some(Duration::from_secs(10))), FenceStatus::DeviceError);
    assert!(matches!(rig.queue().wait_idle(), Err(GpuError::QueueFaulted)));
    assert_eq!(rig.queue().stats().copies, 0);
}

#[test]
fn oversized_images_are_rejected() {
    let rig = TestRig::new().unwrap();
    let block = rig.image_block(0x1000).unwrap();
    let err = rig
        .image_2d(&block, 0, 0x4000_0000, 1, ImageFormat::RGBA8Unorm, ImageFlags::empty())
        .unwrap_err();
    assert!(matches!(err, TestError::Gpu(GpuError::InvalidArgument(_))));
}

#[test]
fn single_image_swapchain_is_rejected() {
    let rig = TestRig::new().unwrap();
    let block = rig.image_block(0x10000).unwrap();
    let image = rig
        .image_2d(&block, 0, 32, 32, ImageFormat::BGRA8Unorm, ImageFlags::USAGE_PRESENT)
        .unwrap();
    let result = Swapchain::new(rig.device(), test_window(), &[&image], SwapchainConfig::new());
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
}

#[test]
fn unmapped_descriptor_set_faults_the_draw() {
    let mut rig = TestRig::new().unwrap();
    let code = rig.code_block(0x1000).unwrap();
    let vertex = rig.shader(&code, 0, Stage::Vertex).unwrap();
    let fragment = rig.shader(&code, 0x100, Stage::Fragment).unwrap();
    let table = rig.block(0x1000).unwrap();

    let (mut cmdbuf, _cmd_mem) = rig.cmdbuf(0x1000).unwrap();
    cmdbuf
        .bind_shaders(StageFlags::VERTEX | StageFlags::FRAGMENT, &[&vertex, &fragment])
        .unwrap();
    // 0x100 descriptors of 32 bytes run past the end of the table block.
    cmdbuf.bind_image_descriptor_set(table.gpu_addr(), 0x100).unwrap();
    cmdbuf.bind_sampler_descriptor_set(table.gpu_addr(), 1).unwrap();
    cmdbuf
        .bind_texture(Stage::Fragment, 0, ResHandle::texture(0, 0))
        .unwrap();
    cmdbuf.draw(Primitive::Triangles, 3, 1, 0, 0).unwrap();
    let list = cmdbuf.finish_list();

    assert!(rig.submit_and_wait(&list).is_err());
    assert_eq!(rig.queue().stats().draws, 0);
    assert_eq!(rig.errors().len(), 1);
}
