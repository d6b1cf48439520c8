// Swapchain - window presentation
//
// Negotiates the image chain from the surface's independently reported
// capability lists, then owns the images' views and the semaphore that
// signals when an acquired image is ready to be drawn into.

use super::barrier::{color_subresource_range, record_image_transition, ImageTransition};
use super::runtime::VulkanRuntime;
use crate::error::{Result, RuntimeError, VkContext};
use ash::prelude::VkResult;
use ash::vk;

/// Outcome of acquire/present as far as the swapchain's fitness is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Optimal,
    /// Still usable, but no longer matches the surface exactly
    Suboptimal,
    /// Must be recreated before the next acquire
    OutOfDate,
}

const COMPOSITE_ALPHA_PREFERENCE: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

/// MAILBOX when offered, then IMMEDIATE, then FIFO (always available).
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PREFERENCE
        .into_iter()
        .find(|&mode| supported.contains(mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// B8G8R8A8_UNORM in sRGB non-linear space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The surface's extent, or `fallback` clamped to the surface limits when the
/// surface leaves the choice to us.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: fallback.width.max(min.width).min(max.width),
        height: fallback.height.max(min.height).min(max.height),
    }
}

pub fn choose_image_usage(supported: vk::ImageUsageFlags) -> vk::ImageUsageFlags {
    if supported.contains(vk::ImageUsageFlags::TRANSFER_DST) {
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
    }
}

fn acquire_status(result: VkResult<(u32, bool)>) -> Result<(Option<u32>, SwapchainStatus)> {
    match result {
        Ok((index, false)) => Ok((Some(index), SwapchainStatus::Optimal)),
        Ok((index, true)) => Ok((Some(index), SwapchainStatus::Suboptimal)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((None, SwapchainStatus::OutOfDate)),
        Err(result) => Err(RuntimeError::from_vk("vkAcquireNextImageKHR", result)),
    }
}

fn present_status(result: VkResult<bool>) -> Result<SwapchainStatus> {
    match result {
        Ok(false) => Ok(SwapchainStatus::Optimal),
        Ok(true) => Ok(SwapchainStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapchainStatus::OutOfDate),
        Err(result) => Err(RuntimeError::from_vk("vkQueuePresentKHR", result)),
    }
}

/// The calls that create and destroy image views.
pub trait ImageViewDevice {
    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
}

impl ImageViewDevice for ash::Device {
    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { ash::Device::create_image_view(self, create_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { ash::Device::destroy_image_view(self, view, None) }
    }
}

/// One 2D color view per image, in image order.
///
/// If any view fails, the ones already created are destroyed before the
/// error is returned.
pub fn create_image_views<D: ImageViewDevice>(
    device: &D,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());

        match device.create_image_view(&create_info) {
            Ok(view) => views.push(view),
            Err(result) => {
                for view in views.drain(..).rev() {
                    device.destroy_image_view(view);
                }
                return Err(RuntimeError::from_vk("vkCreateImageView", result));
            }
        }
    }
    Ok(views)
}

pub struct Swapchain<'rt> {
    runtime: &'rt VulkanRuntime,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    present_ready: vk::Semaphore,
    current_index: u32,
}

impl<'rt> Swapchain<'rt> {
    /// Negotiate and create a swapchain, chaining from `previous` if given.
    pub fn new(
        runtime: &'rt VulkanRuntime,
        previous: Option<&Swapchain<'_>>,
        fallback_extent: vk::Extent2D,
    ) -> Result<Self> {
        let surface_loader = runtime.surface_loader();
        let physical_device = runtime.physical_device();
        let surface = runtime.surface();

        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

        let format = choose_surface_format(&formats).ok_or_else(|| {
            RuntimeError::CapabilityUnsupported("surface reports no formats".to_string())
        })?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&capabilities, fallback_extent);
        let image_count = choose_image_count(&capabilities);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(choose_image_usage(capabilities.supported_usage_flags))
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(capabilities.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |p| p.handle()));

        let handle = unsafe { runtime.swapchain_loader().create_swapchain(&create_info, None) }
            .vk_context("vkCreateSwapchainKHR")?;

        // From here on, Drop cleans up whatever has been created
        let mut swapchain = Self {
            runtime,
            swapchain: handle,
            images: Vec::new(),
            image_views: Vec::new(),
            format,
            extent,
            present_mode,
            present_ready: vk::Semaphore::null(),
            current_index: 0,
        };

        let images = unsafe { runtime.swapchain_loader().get_swapchain_images(handle) }
            .vk_context("vkGetSwapchainImagesKHR")?;
        swapchain.image_views = create_image_views(runtime.device(), &images, format.format)?;
        swapchain.images = images;
        swapchain.transition_to_present()?;
        swapchain.present_ready = super::sync::create_semaphore(runtime.device())?;

        log::debug!("Swapchain ready with {} images", swapchain.images.len());
        Ok(swapchain)
    }

    /// Move every image from UNDEFINED to PRESENT_SRC_KHR in one blocking batch.
    fn transition_to_present(&self) -> Result<()> {
        let sequence = self.runtime.create_and_begin_command_sequence()?;
        for &image in &self.images {
            record_image_transition(
                self.runtime.device(),
                sequence.handle(),
                &ImageTransition::undefined_to_present(image),
            );
        }
        self.runtime.end_and_submit_synchronously(sequence)
    }

    /// Acquire the next image, signalling the present-ready semaphore.
    ///
    /// The tracked index is left alone when the swapchain is out of date.
    pub fn acquire_next(&mut self) -> Result<(u32, SwapchainStatus)> {
        let result = unsafe {
            self.runtime.swapchain_loader().acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.present_ready,
                vk::Fence::null(),
            )
        };

        let (index, status) = acquire_status(result)?;
        if let Some(index) = index {
            self.current_index = index;
        }
        Ok((self.current_index, status))
    }

    /// Present the current image once `wait_semaphore` is signalled.
    pub fn present(&self, wait_semaphore: vk::Semaphore) -> Result<SwapchainStatus> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [self.current_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        present_status(unsafe {
            self.runtime
                .swapchain_loader()
                .queue_present(self.runtime.queue(), &present_info)
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn present_ready(&self) -> vk::Semaphore {
        self.present_ready
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }
}

impl Drop for Swapchain<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.wait_queue_idle() {
            log::warn!("Queue did not go idle before swapchain teardown: {}", e);
        }

        let device = self.runtime.device();
        unsafe {
            if self.present_ready != vk::Semaphore::null() {
                device.destroy_semaphore(self.present_ready, None);
            }
            for &view in &self.image_views {
                ImageViewDevice::destroy_image_view(device, view);
            }
            self.runtime
                .swapchain_loader()
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use ash::vk::Handle;
    use rstest::rstest;
    use std::cell::{Cell, RefCell};
    use std::collections::HashSet;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    use ash::vk::PresentModeKHR as Mode;

    #[rstest]
    #[case::none(vec![], Mode::FIFO)]
    #[case::fifo(vec![Mode::FIFO], Mode::FIFO)]
    #[case::mailbox(vec![Mode::MAILBOX], Mode::MAILBOX)]
    #[case::immediate(vec![Mode::IMMEDIATE], Mode::IMMEDIATE)]
    #[case::fifo_mailbox(vec![Mode::FIFO, Mode::MAILBOX], Mode::MAILBOX)]
    #[case::fifo_immediate(vec![Mode::FIFO, Mode::IMMEDIATE], Mode::IMMEDIATE)]
    #[case::immediate_mailbox(vec![Mode::IMMEDIATE, Mode::MAILBOX], Mode::MAILBOX)]
    #[case::all(vec![Mode::IMMEDIATE, Mode::FIFO, Mode::MAILBOX], Mode::MAILBOX)]
    fn present_mode_preference(#[case] available: Vec<Mode>, #[case] expected: Mode) {
        assert_eq!(choose_present_mode(&available), expected);
    }

    #[rstest]
    #[case::unbounded(2, 0, 3)]
    #[case::room_left(2, 8, 3)]
    #[case::clamped(3, 3, 3)]
    #[case::single(1, 0, 2)]
    fn image_count(#[case] min: u32, #[case] max: u32, #[case] expected: u32) {
        assert_eq!(choose_image_count(&capabilities(min, max)), expected);
    }

    #[rstest]
    #[case::post_and_inherit(
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED | vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
    )]
    #[case::everything(
        vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::OPAQUE
    )]
    #[case::inherit_only(vk::CompositeAlphaFlagsKHR::INHERIT, vk::CompositeAlphaFlagsKHR::INHERIT)]
    #[case::nothing(vk::CompositeAlphaFlagsKHR::empty(), vk::CompositeAlphaFlagsKHR::OPAQUE)]
    fn composite_alpha_preference(
        #[case] supported: vk::CompositeAlphaFlagsKHR,
        #[case] expected: vk::CompositeAlphaFlagsKHR,
    ) {
        assert_eq!(choose_composite_alpha(supported), expected);
    }

    #[test]
    fn preferred_format_wins_over_order() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[2]));
    }

    #[test]
    fn first_format_without_preferred() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn current_extent_is_used_as_is() {
        let caps = capabilities(2, 0);
        assert_eq!(choose_extent(&caps, extent(1920, 1080)), extent(800, 600));
    }

    #[rstest]
    #[case::inside(extent(1280, 720), extent(1280, 720))]
    #[case::too_large(extent(8000, 8000), extent(4096, 2160))]
    #[case::too_small(extent(0, 10), extent(64, 64))]
    fn fallback_extent_is_clamped(#[case] fallback: vk::Extent2D, #[case] expected: vk::Extent2D) {
        let mut caps = capabilities(2, 0);
        caps.current_extent = extent(u32::MAX, u32::MAX);
        assert_eq!(choose_extent(&caps, fallback), expected);
    }

    #[test]
    fn transfer_destination_only_when_supported() {
        let with = choose_image_usage(
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        );
        assert!(with.contains(vk::ImageUsageFlags::TRANSFER_DST));

        let without = choose_image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(without, vk::ImageUsageFlags::COLOR_ATTACHMENT);
    }

    #[test]
    fn acquire_results() {
        assert_eq!(acquire_status(Ok((2, false))).unwrap(), (Some(2), SwapchainStatus::Optimal));
        assert_eq!(acquire_status(Ok((1, true))).unwrap(), (Some(1), SwapchainStatus::Suboptimal));
        assert_eq!(
            acquire_status(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            (None, SwapchainStatus::OutOfDate)
        );

        let err = acquire_status(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
        assert!(err.to_string().contains("vkAcquireNextImageKHR"));
    }

    #[test]
    fn present_results() {
        assert_eq!(present_status(Ok(false)).unwrap(), SwapchainStatus::Optimal);
        assert_eq!(present_status(Ok(true)).unwrap(), SwapchainStatus::Suboptimal);
        assert_eq!(
            present_status(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainStatus::OutOfDate
        );
        assert_eq!(
            present_status(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
                .unwrap_err()
                .kind(),
            ErrorKind::ResourceExhausted
        );
    }

    /// Hands out view handles and fails the n-th creation if asked to.
    #[derive(Default)]
    struct ViewCounter {
        next_handle: Cell<u64>,
        live: RefCell<HashSet<u64>>,
        fail_at: Option<u64>,
    }

    impl ImageViewDevice for ViewCounter {
        fn create_image_view(
            &self,
            create_info: &vk::ImageViewCreateInfo,
        ) -> VkResult<vk::ImageView> {
            assert_eq!(create_info.view_type, vk::ImageViewType::TYPE_2D);
            let attempt = self.next_handle.get() + 1;
            self.next_handle.set(attempt);
            if self.fail_at == Some(attempt) {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            self.live.borrow_mut().insert(attempt);
            Ok(vk::ImageView::from_raw(attempt))
        }

        fn destroy_image_view(&self, view: vk::ImageView) {
            assert!(self.live.borrow_mut().remove(&view.as_raw()));
        }
    }

    fn images(count: u64) -> Vec<vk::Image> {
        (1..=count).map(vk::Image::from_raw).collect()
    }

    #[test]
    fn one_view_per_image() {
        let device = ViewCounter::default();
        let images = images(3);

        let views = create_image_views(&device, &images, vk::Format::B8G8R8A8_UNORM).unwrap();

        assert_eq!(views.len(), images.len());
        assert_eq!(device.live.borrow().len(), 3);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn failed_view_releases_earlier_views(#[case] fail_at: u64) {
        let device = ViewCounter {
            fail_at: Some(fail_at),
            ..Default::default()
        };

        let err = create_image_views(&device, &images(4), vk::Format::B8G8R8A8_SRGB).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("vkCreateImageView"));
        assert!(device.live.borrow().is_empty());
    }
}
