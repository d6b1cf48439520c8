// Runtime - owner of the Vulkan connection and the single device
//
// Construction order: instance -> debug messenger -> physical device ->
// surface -> queue family -> device -> queue/pool/semaphore.
// Destruction runs the same list backwards.

use super::buffer::Buffer;
use super::device::{
    check_device_extensions, create_debug_messenger, create_instance, create_logical_device,
    find_queue_family, pick_physical_device, query_optional_features,
};
use super::diagnostics::{DeviceReport, MatrixConfiguration};
use super::memory::resolve_memory_type;
use super::pipeline;
use super::shader::ShaderStage;
use super::swapchain::Swapchain;
use super::sync::{create_semaphore, ScopedFence};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError, VkContext};
use ash::prelude::VkResult;
use ash::vk;
use std::cell::Cell;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::Path;

/// Instance-level objects. Dropped after the device is gone.
struct Connection {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Central Vulkan context: one instance, one device, one queue.
///
/// Buffers, swapchains, command sequences and shader stages borrow the
/// runtime and must be dropped before it.
pub struct VulkanRuntime {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    report: DeviceReport,
    queue_family: u32,
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    render_complete: vk::Semaphore,
    wait_stages: [vk::PipelineStageFlags; 1],
    cooperative_matrix: Option<ash::khr::cooperative_matrix::Instance>,
    // Last field: dropped after `Drop::drop` has released the device
    connection: Connection,
}

impl VulkanRuntime {
    /// Initialize the runtime for the given window.
    pub fn new<W>(window: &W, config: &RuntimeConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        log::info!("Initializing Vulkan runtime...");

        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let entry = unsafe { ash::Entry::load() }?;
        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .vk_context("vkEnumerateInstanceExtensionProperties")?;
        let instance = create_instance(
            &entry,
            &config.app_name,
            surface_extensions,
            config.validation_layers,
        )?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let mut connection = Connection {
            entry,
            instance,
            debug_utils: None,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
        };

        if config.validation_layers {
            connection.debug_utils = Some(create_debug_messenger(
                &connection.entry,
                &connection.instance,
            )?);
        }

        let instance = &connection.instance;
        let physical_device = pick_physical_device(instance, config.preferred_integrated_vendor)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let report = {
            let mut driver = vk::PhysicalDeviceDriverProperties::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut driver);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
            let core = properties2.properties;
            DeviceReport::new(&core, &driver)
        };
        log::info!("Selected GPU: {}", report.name);
        for line in report.to_string().lines() {
            log::debug!("  {}", line);
        }

        connection.surface = unsafe {
            ash_window::create_surface(
                &connection.entry,
                &connection.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .vk_context("vkCreateSurfaceKHR")?;

        let instance = &connection.instance;
        let queue_family = find_queue_family(
            instance,
            &connection.surface_loader,
            physical_device,
            connection.surface,
        )?;
        log::debug!("Using queue family {}", queue_family);

        check_device_extensions(instance, physical_device)?;

        let features = query_optional_features(instance, physical_device);
        let unsupported = features.unsupported();
        if !unsupported.is_empty() {
            log::warn!("Device lacks optional features: {}", unsupported.join(", "));
        }

        let device = create_logical_device(instance, physical_device, queue_family, &features)?;
        let (command_pool, render_complete) = match create_device_objects(&device, queue_family) {
            Ok(objects) => objects,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        let cooperative_matrix = load_cooperative_matrix(&connection.entry, instance);
        if cooperative_matrix.is_none() {
            log::warn!("vkGetPhysicalDeviceCooperativeMatrixPropertiesKHR is unavailable");
        }

        log::info!("Vulkan runtime initialized");

        Ok(Self {
            physical_device,
            properties,
            memory_properties,
            report,
            queue_family,
            device,
            swapchain_loader,
            queue,
            command_pool,
            render_complete,
            wait_stages: [vk::PipelineStageFlags::ALL_COMMANDS],
            cooperative_matrix,
            connection,
        })
    }

    /// Create a buffer with its own dedicated allocation.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer<'_>> {
        Buffer::new(&self.device, &self.memory_properties, size, usage, memory_flags)
    }

    /// Build a swapchain, chaining from `previous` when given.
    ///
    /// The caller drops `previous` once this returns.
    pub fn recreate_swapchain(
        &self,
        previous: Option<&Swapchain<'_>>,
        fallback_extent: vk::Extent2D,
    ) -> Result<Swapchain<'_>> {
        Swapchain::new(self, previous, fallback_extent)
    }

    /// Allocate a primary command buffer and begin recording into it.
    pub fn create_and_begin_command_sequence(&self) -> Result<CommandSequence<'_>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }
            .vk_context("vkAllocateCommandBuffers")?;
        let sequence = CommandSequence {
            device: &self.device,
            command_pool: self.command_pool,
            command_buffer: buffers[0],
            recording: Cell::new(false),
        };

        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { self.device.begin_command_buffer(sequence.command_buffer, &begin_info) }
            .vk_context("vkBeginCommandBuffer")?;
        sequence.recording.set(true);

        Ok(sequence)
    }

    /// End recording, submit alone, block until the device finished it.
    pub fn end_and_submit_synchronously(&self, sequence: CommandSequence<'_>) -> Result<()> {
        sequence.end()?;

        let fence = ScopedFence::new(&self.device)?;
        let command_buffers = [sequence.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), fence.handle())
        }
        .vk_context("vkQueueSubmit")?;

        fence.wait()
    }

    /// Return a sequence to the pool without submitting it.
    pub fn release_command_sequence(&self, sequence: CommandSequence<'_>) {
        drop(sequence);
    }

    /// Submit frame work: wait on `wait_semaphore` at all stages, signal
    /// the render-complete semaphore, no fence.
    pub fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let wait_semaphores = [wait_semaphore];
        let signal_semaphores = [self.render_complete];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.queue_submit(
                self.queue,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )
        }
        .vk_context("vkQueueSubmit")
    }

    /// Load a SPIR-V file as a shader stage.
    pub fn load_shader_stage(
        &self,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<ShaderStage<'_>> {
        ShaderStage::load(&self.device, path.as_ref(), stage)
    }

    /// Single-subpass color render pass over presentable images.
    pub fn create_render_pass(&self, color_format: vk::Format) -> Result<vk::RenderPass> {
        pipeline::create_render_pass(&self.device, color_format)
    }

    /// Memory type index for the given type mask and required flags.
    pub fn memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Result<u32> {
        resolve_memory_type(&self.memory_properties, type_bits, flags)
    }

    /// Every tiled multiply-accumulate configuration the device supports.
    pub fn matrix_acceleration_configurations(&self) -> Result<Vec<MatrixConfiguration>> {
        let loader = self.cooperative_matrix.as_ref().ok_or_else(|| {
            RuntimeError::CapabilityUnsupported(
                "vkGetPhysicalDeviceCooperativeMatrixPropertiesKHR could not be resolved"
                    .to_string(),
            )
        })?;

        let properties = unsafe {
            loader.get_physical_device_cooperative_matrix_properties(self.physical_device)
        }
        .vk_context("vkGetPhysicalDeviceCooperativeMatrixPropertiesKHR")?;

        Ok(properties.iter().map(MatrixConfiguration::from).collect())
    }

    /// Block until the device has no work left.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }

    /// Block until the runtime's queue has no work left.
    pub fn wait_queue_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue) }.vk_context("vkQueueWaitIdle")
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.connection.surface
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.connection.surface_loader
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn render_complete(&self) -> vk::Semaphore {
        self.render_complete
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn device_report(&self) -> &DeviceReport {
        &self.report
    }
}

impl Drop for VulkanRuntime {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan runtime...");

        if let Err(e) = self.wait_idle() {
            log::warn!("Device did not go idle before shutdown: {}", e);
        }

        unsafe {
            self.device.destroy_semaphore(self.render_complete, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

/// A primary command buffer in the recording state.
///
/// Dropping it returns the buffer to the pool.
pub struct CommandSequence<'rt> {
    device: &'rt ash::Device,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    recording: Cell<bool>,
}

impl CommandSequence<'_> {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Finish recording. Needed before handing the buffer to `submit`.
    /// Ending a sequence that is already ended does nothing.
    pub fn end(&self) -> Result<()> {
        finish_recording(&self.recording, || unsafe {
            self.device.end_command_buffer(self.command_buffer)
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording.get()
    }
}

/// Run `end` only while `recording` is set, and clear it once `end` succeeds.
fn finish_recording(
    recording: &Cell<bool>,
    end: impl FnOnce() -> VkResult<()>,
) -> Result<()> {
    if !recording.get() {
        return Ok(());
    }
    end().vk_context("vkEndCommandBuffer")?;
    recording.set(false);
    Ok(())
}

impl Drop for CommandSequence<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[self.command_buffer]);
        }
    }
}

fn create_device_objects(
    device: &ash::Device,
    queue_family: u32,
) -> Result<(vk::CommandPool, vk::Semaphore)> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);
    let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
        .vk_context("vkCreateCommandPool")?;

    match create_semaphore(device) {
        Ok(semaphore) => Ok((command_pool, semaphore)),
        Err(e) => {
            unsafe { device.destroy_command_pool(command_pool, None) };
            Err(e)
        }
    }
}

/// Resolve the cooperative matrix query once; `None` when the loader has no
/// entry point for it.
fn load_cooperative_matrix(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Option<ash::khr::cooperative_matrix::Instance> {
    let name = c"vkGetPhysicalDeviceCooperativeMatrixPropertiesKHR";
    let resolved = unsafe { entry.get_instance_proc_addr(instance.handle(), name.as_ptr()) };
    resolved.map(|_| ash::khr::cooperative_matrix::Instance::new(entry, instance))
}
