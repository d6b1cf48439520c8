// Render pass and framebuffer creation
//
// The runtime only provides the single color pass used to draw into
// swapchain images. Images stay in PRESENT_SRC_KHR outside the pass, so the
// attachment loads and stores in that layout.

use crate::error::{Result, VkContext};
use ash::vk;

/// Color attachment that keeps its contents and stays presentable.
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
}

/// Dependencies on the external side of the subpass: one on entry, one on exit.
pub fn external_dependencies() -> [vk::SubpassDependency; 2] {
    let color_access =
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;

    [
        // Presentation engine reads must finish before we touch the attachment.
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(color_access)
            .dependency_flags(vk::DependencyFlags::BY_REGION),
        // Attachment writes must land before anything downstream reads them.
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(color_access)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION),
    ]
}

/// Create a render pass with a single subpass writing one color attachment.
pub fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let attachments = [color_attachment(format)];

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let color_attachments = [color_attachment_ref];

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments);
    let subpasses = [subpass];

    let dependencies = external_dependencies();

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }
        .vk_context("vkCreateRenderPass")?;
    log::debug!("Created render pass for {:?}", format);
    Ok(render_pass)
}

/// Create one framebuffer per swapchain image view.
///
/// On failure the framebuffers created so far are destroyed.
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let attachments = [image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(result) => {
                destroy_framebuffers(device, &framebuffers);
                return Err(result).vk_context("vkCreateFramebuffer");
            }
        }
    }

    Ok(framebuffers)
}

pub fn destroy_framebuffers(device: &ash::Device, framebuffers: &[vk::Framebuffer]) {
    for &framebuffer in framebuffers {
        unsafe {
            device.destroy_framebuffer(framebuffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_stays_presentable() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn dependencies_guard_entry_and_exit() {
        let [entry, exit] = external_dependencies();

        assert_eq!(entry.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(entry.dst_subpass, 0);
        assert!(entry.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));

        assert_eq!(exit.src_subpass, 0);
        assert_eq!(exit.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert!(exit.src_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert_eq!(exit.dst_access_mask, vk::AccessFlags::MEMORY_READ);
    }
}
