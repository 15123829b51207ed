//! End-to-end frame loop against the host-memory backend.

use std::sync::Arc;
use gpu_allocator::MemoryLocation;
use mvr::renderer::backend::mock::MockBackend;
use mvr::renderer::backend::Backend;
use mvr::renderer::{ErrorKind, FrameState, PresentOutcome, RenderConfig, Renderer};
use mvr::{RenderFrontend, Status};

const PAGE: u64 = 256;

fn renderer_with(frames_in_flight: usize) -> (Arc<MockBackend>, Renderer<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let config = RenderConfig::default()
        .with_frames_in_flight(frames_in_flight)
        .with_page_size(PAGE)
        .with_max_allocation_size(16 * PAGE);
    let renderer = Renderer::with_backend(backend.clone(), config).unwrap();
    (backend, renderer)
}

#[test]
fn uploads_are_visible_to_draw_commands() {
    let (backend, mut renderer) = renderer_with(2);
    renderer.begin_frame().unwrap();

    let mut temps = Vec::new();
    for fill in 1..=3u8 {
        let (buffer, host) = renderer.allocate_temp_buffer(64).unwrap();
        host.fill(fill);
        temps.push(buffer);
    }

    let offsets = temps.iter().map(|t| t.descriptor.offset).collect::<Vec<_>>();
    assert_eq!(offsets, vec![0, 64, 128]);
    assert!(temps.iter().all(|t| t.descriptor.buffer == temps[0].descriptor.buffer));
    assert_eq!(renderer.page_stats(0).unwrap().pages, 1);

    let draw = renderer.draw_commands().unwrap();
    let probes = temps
        .iter()
        .map(|t| backend.cmd_probe(draw, t.descriptor.buffer, t.descriptor.offset, t.descriptor.size))
        .collect::<Vec<_>>();
    assert_eq!(renderer.end_frame().unwrap(), PresentOutcome::Optimal);

    // Queued but not yet executed
    assert!(probes.iter().all(|p| backend.probe(*p).is_none()));

    renderer.wait_idle().unwrap();
    for (fill, probe) in (1..=3u8).zip(&probes) {
        assert_eq!(backend.probe(*probe).unwrap(), vec![fill; 64]);
    }
}

#[test]
fn oversized_upload_gets_its_own_page() {
    let (backend, mut renderer) = renderer_with(2);
    renderer.begin_frame().unwrap();

    let (small, _) = renderer.allocate_temp_buffer(200).unwrap();
    let (large, host) = renderer.allocate_temp_buffer(3 * PAGE).unwrap();
    host.fill(0x5A);
    assert_ne!(small.descriptor.buffer, large.descriptor.buffer);
    assert_eq!(large.descriptor.offset, 0);

    let stats = renderer.page_stats(0).unwrap();
    assert_eq!(stats.pages, 2);
    assert_eq!(stats.capacity, 4 * PAGE);

    let draw = renderer.draw_commands().unwrap();
    let probe = backend.cmd_probe(draw, large.descriptor.buffer, 0, large.descriptor.size);
    renderer.end_frame().unwrap();
    renderer.wait_idle().unwrap();
    assert_eq!(backend.probe(probe).unwrap(), vec![0x5A; 3 * PAGE as usize]);
}

#[test]
fn permanent_buffers_round_trip() {
    let (_backend, mut renderer) = renderer_with(2);

    for size in [1, 64, 4096, PAGE, PAGE + 1] {
        let data = (0..size).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>();
        let handle = renderer.load_permanent_buffer(&data).unwrap();

        let descriptor = renderer.permanent_buffer(handle).unwrap();
        assert_eq!(descriptor.offset, 0);
        assert_eq!(descriptor.size, size);
        assert_eq!(renderer.read_permanent_buffer(handle).unwrap(), data);
    }
}

#[test]
fn freed_slots_are_reused() {
    let (backend, mut renderer) = renderer_with(2);

    let handles = (0..3u8)
        .map(|i| renderer.load_permanent_buffer(&[i; 16]).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(renderer.permanent_table().len(), 3);

    renderer.free_permanent_buffer(handles[1]).unwrap();
    assert_eq!(renderer.permanent_table().occupied(), 2);

    let reloaded = renderer.load_permanent_buffer(&[9; 16]).unwrap();
    assert_eq!(reloaded.index(), handles[1].index());
    assert_eq!(renderer.permanent_table().len(), 3);

    // The old handle does not alias the new buffer
    let err = renderer.read_permanent_buffer(handles[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    assert_eq!(renderer.read_permanent_buffer(reloaded).unwrap(), vec![9; 16]);

    // Staging buffers are gone once each upload finished
    assert_eq!(backend.live_buffers_in(MemoryLocation::CpuToGpu), 0);
}

#[test]
fn frames_in_flight_stay_bounded() {
    for ring in 1..=3usize {
        let (backend, mut renderer) = renderer_with(ring);

        for f in 0..10u64 {
            renderer.present_frame().unwrap();
            assert_eq!(renderer.frame_counter(), f);
            assert_eq!(renderer.state(), FrameState::Recording);

            let submitted = renderer.frame_counter();
            let completed = backend.completed_frames().unwrap();
            assert!(submitted - completed <= ring as u64 - 1);
            if f >= ring as u64 {
                assert!(completed >= f - ring as u64 + 1);
            }

            renderer.create_temp_buffer_from(&[f as u32; 4]).unwrap();
        }
        renderer.end_frame().unwrap();
        assert_eq!(backend.submissions().len(), 10);
    }
}

#[test]
fn temp_buffers_expire_with_their_frame() {
    let (_backend, mut renderer) = renderer_with(2);

    renderer.begin_frame().unwrap();
    let buffer = renderer.create_temp_buffer(&[1, 2, 3, 4]).unwrap();
    assert_eq!(renderer.temp_buffer_mut(&buffer).unwrap(), &[1, 2, 3, 4]);

    let mut forged = buffer;
    forged.descriptor.offset = u64::MAX - 1;
    let err = renderer.temp_buffer_mut(&forged).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    renderer.end_frame().unwrap();

    renderer.begin_frame().unwrap();
    let err = renderer.temp_buffer_mut(&buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUsage);
}

#[test]
fn dropping_the_renderer_releases_everything() {
    let backend = Arc::new(MockBackend::new());
    {
        let config = RenderConfig::default().with_page_size(PAGE).with_max_allocation_size(PAGE * 4);
        let mut renderer = Renderer::with_backend(backend.clone(), config).unwrap();
        renderer.load_permanent_buffer(&[1; 32]).unwrap();
        for _ in 0..4 {
            renderer.begin_frame().unwrap();
            renderer.allocate_temp_buffer(PAGE * 2).unwrap();
            renderer.end_frame().unwrap();
        }
        assert!(backend.live_buffers() > 0);
    }

    assert_eq!(backend.pending_submissions(), 0);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_semaphores(), 0);
    assert_eq!(backend.live_command_pools(), 0);
}

#[test]
fn failed_submit_stops_the_frame_loop() {
    let (backend, mut renderer) = renderer_with(2);
    renderer.present_frame().unwrap();
    renderer.create_temp_buffer(&[7; 16]).unwrap();

    backend.fail_next_frame_submit();
    let err = renderer.present_frame().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CriticalVulkan);
    assert_eq!(renderer.state(), FrameState::Lost);

    // Retrying must not record into the already ended command buffers
    assert!(renderer.end_frame().unwrap_err().is_fatal());
    assert!(renderer.present_frame().unwrap_err().is_fatal());
    assert!(backend.submissions().is_empty());
}

#[test]
fn frontend_reports_failed_upload() {
    let backend = Arc::new(MockBackend::new());
    let mut frontend = RenderFrontend::new();
    assert_eq!(frontend.initialize_with(backend.clone(), RenderConfig::default()), Status::Success);

    backend.fail_next_buffer(MemoryLocation::GpuOnly);
    let status = frontend.load_permanent_buffer(4, &[1, 2, 3, 4]).unwrap_err();
    assert_eq!(status.code(), 2);
    assert!(frontend.last_error().contains("permanent buffer"));
    assert_eq!(backend.live_buffers(), 0);

    assert_eq!(frontend.present_frame(), Status::Success);
    assert!(!frontend.last_error().is_empty());
}
