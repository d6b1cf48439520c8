// =============================================================================
// VK-RUNTIME DEMO - smoke test for the runtime on real hardware
// =============================================================================
//
// 1. Print the device report and the cooperative matrix configurations
// 2. Round-trip a buffer through device-local memory and check the data
// 3. Optionally load the configured SPIR-V file
// 4. Clear the window every frame until it closes (or the frame limit hits)
//
// =============================================================================

use anyhow::{ensure, Context, Result};
use ash::vk;
use std::time::Instant;
use vk_runtime::backend::barrier::{record_buffer_barrier, BufferTransition};
use vk_runtime::backend::diagnostics::{find_configuration, write_report};
use vk_runtime::backend::pipeline::{create_framebuffers, destroy_framebuffers};
use vk_runtime::config::{Config, DemoConfig};
use vk_runtime::{Swapchain, SwapchainStatus, VulkanRuntime};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, notes) = Config::load();
    init_logging(&config);
    for note in &notes {
        log::warn!("{}", note);
    }
    log::debug!("Config: {:?}", config);
    log::info!("Starting vk-runtime demo");

    let event_loop = EventLoop::new()?;
    let window_attributes = WindowAttributes::default()
        .with_title(&config.window.title)
        .with_inner_size(winit::dpi::PhysicalSize::new(
            config.window.width,
            config.window.height,
        ));
    // The runtime needs the window before the loop starts so that the
    // swapchain can borrow it for the whole run.
    #[allow(deprecated)]
    let window = event_loop
        .create_window(window_attributes)
        .context("Failed to create window")?;

    let runtime =
        VulkanRuntime::new(&window, &config.runtime).context("Failed to initialize Vulkan")?;

    report_device(&runtime)?;
    buffer_round_trip(&runtime).context("Buffer round trip failed")?;

    if let Some(path) = &config.demo.shader {
        let stage = runtime.load_shader_stage(path, vk::ShaderStageFlags::COMPUTE)?;
        log::info!("Loaded shader {:?} as {:?}", path, stage.stage());
    }

    let mut app = App::new(&window, &runtime, &config.demo);
    event_loop.run_app(&mut app)?;

    Ok(())
}

/// `config.toml` sets the level; `RUST_LOG` overrides it
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// STARTUP CHECKS
// =============================================================================

fn report_device(runtime: &VulkanRuntime) -> Result<()> {
    let configurations = runtime
        .matrix_acceleration_configurations()
        .unwrap_or_else(|e| {
            log::warn!("Cooperative matrix query failed: {}", e);
            Vec::new()
        });

    let mut stdout = std::io::stdout().lock();
    write_report(&mut stdout, runtime.device_report(), &configurations)?;

    match find_configuration(
        &configurations,
        vk::ComponentTypeKHR::UINT8,
        vk::ScopeKHR::SUBGROUP,
    ) {
        Some(configuration) => log::info!("u8 subgroup configuration: {}", configuration),
        None => log::info!("No u8 subgroup configuration"),
    }
    Ok(())
}

/// Host -> device-local -> host copy through one synchronous submission.
fn buffer_round_trip(runtime: &VulkanRuntime) -> Result<()> {
    let data: Vec<u32> = (0..4096u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
    let size = std::mem::size_of_val(data.as_slice()) as vk::DeviceSize;
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    let upload = runtime.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, host)?;
    let device_local = runtime.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let readback = runtime.create_buffer(size, vk::BufferUsageFlags::TRANSFER_DST, host)?;

    upload.write(&data)?;

    let device = runtime.device();
    let sequence = runtime.create_and_begin_command_sequence()?;
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    unsafe {
        device.cmd_copy_buffer(
            sequence.handle(),
            upload.handle(),
            device_local.handle(),
            &[region],
        );
    }
    record_buffer_barrier(
        device,
        sequence.handle(),
        &BufferTransition {
            buffer: device_local.handle(),
            size,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
        },
    );
    unsafe {
        device.cmd_copy_buffer(
            sequence.handle(),
            device_local.handle(),
            readback.handle(),
            &[region],
        );
    }
    runtime.end_and_submit_synchronously(sequence)?;

    let mut result = vec![0u32; data.len()];
    readback.read(&mut result)?;
    ensure!(result == data, "read back data differs from the upload");

    log::info!("Buffer round trip of {} bytes OK", size);
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Frame loop state. Field order does not matter for cleanup: the swapchain
/// cleans up after itself and `Drop` below handles the raw handles.
struct App<'rt> {
    window: &'rt Window,
    runtime: &'rt VulkanRuntime,
    clear_color: [f32; 4],
    frame_limit: u64,

    swapchain: Option<Swapchain<'rt>>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    /// Set on resize, suboptimal or out-of-date results
    needs_recreate: bool,
    is_minimized: bool,

    frames_rendered: u64,
    frame_count: u32,
    last_fps_update: Instant,
}

impl<'rt> App<'rt> {
    fn new(window: &'rt Window, runtime: &'rt VulkanRuntime, demo: &DemoConfig) -> Self {
        Self {
            window,
            runtime,
            clear_color: demo.clear_color,
            frame_limit: demo.frame_limit,
            swapchain: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            needs_recreate: true,
            is_minimized: false,
            frames_rendered: 0,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    /// Build the next swapchain from the current one, then the pass and
    /// framebuffers that depend on it.
    fn recreate_swapchain(&mut self) -> Result<()> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;

        self.runtime.wait_idle()?;
        let device = self.runtime.device();
        destroy_framebuffers(device, &self.framebuffers);
        self.framebuffers.clear();

        let fallback = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let swapchain = self
            .runtime
            .recreate_swapchain(self.swapchain.as_ref(), fallback)?;
        // Retires the old chain now that the new one exists
        self.swapchain = Some(swapchain);
        let swapchain = self.swapchain.as_ref().context("Swapchain missing")?;

        if self.render_pass != vk::RenderPass::null() {
            unsafe { device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = vk::RenderPass::null();
        }
        self.render_pass = self.runtime.create_render_pass(swapchain.format())?;
        self.framebuffers = create_framebuffers(
            device,
            swapchain.image_views(),
            self.render_pass,
            swapchain.extent(),
        )?;

        self.needs_recreate = false;
        Ok(())
    }

    /// Returns `false` when no frame was presented.
    fn render_frame(&mut self) -> Result<bool> {
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }
        if self.is_minimized {
            return Ok(false);
        }

        let runtime = self.runtime;
        let swapchain = self.swapchain.as_mut().context("Swapchain missing")?;

        let (index, status) = swapchain.acquire_next()?;
        match status {
            SwapchainStatus::OutOfDate => {
                self.needs_recreate = true;
                return Ok(false);
            }
            SwapchainStatus::Suboptimal => self.needs_recreate = true,
            SwapchainStatus::Optimal => {}
        }

        let sequence = runtime.create_and_begin_command_sequence()?;
        record_clear(
            runtime.device(),
            sequence.handle(),
            self.render_pass,
            self.framebuffers[index as usize],
            swapchain.extent(),
            self.clear_color,
        );
        sequence.end()?;

        runtime.submit(&[sequence.handle()], swapchain.present_ready())?;
        if swapchain.present(runtime.render_complete())? != SwapchainStatus::Optimal {
            self.needs_recreate = true;
        }

        // One frame in flight: the sequence can go back to the pool afterwards
        runtime.wait_queue_idle()?;
        runtime.release_command_sequence(sequence);

        self.frames_rendered += 1;
        Ok(true)
    }

    fn limit_reached(&self) -> bool {
        self.frame_limit > 0 && self.frames_rendered >= self.frame_limit
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            log::debug!("{:.0} FPS", fps);
            self.frame_count = 0;
            self.last_fps_update = Instant::now();
        }
    }
}

/// Clear the whole framebuffer inside the render pass.
fn record_clear(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    color: [f32; 4],
) {
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let begin_info = vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(render_area);

    let attachment = vk::ClearAttachment {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        color_attachment: 0,
        clear_value: vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
    };
    let rect = vk::ClearRect {
        rect: render_area,
        base_array_layer: 0,
        layer_count: 1,
    };

    unsafe {
        device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        device.cmd_clear_attachments(command_buffer, &[attachment], &[rect]);
        device.cmd_end_render_pass(command_buffer);
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App<'_> {
    fn resumed(&mut self, _event_loop: &ActiveEventLoop) {
        self.window.request_redraw();
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                self.needs_recreate = true;
            }
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => {
                    self.update_fps();
                    if self.limit_reached() {
                        log::info!("Rendered {} frames, exiting", self.frames_rendered);
                        event_loop.exit();
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.window.request_redraw();
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.wait_idle() {
            log::warn!("Device did not go idle: {}", e);
        }

        let device = self.runtime.device();
        destroy_framebuffers(device, &self.framebuffers);
        if self.render_pass != vk::RenderPass::null() {
            unsafe { device.destroy_render_pass(self.render_pass, None) };
        }
        self.swapchain = None;

        log::info!("Demo resources released");
    }
}
