// Instance, physical device selection and logical device creation
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device policy (first discrete GPU, else preferred-vendor iGPU)
// - Queue family policy (graphics + compute + present)
// - Required extension check and optional feature negotiation
// - Logical device creation

use crate::error::{Result, RuntimeError, VkContext};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions the runtime cannot work without.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 2] = [
    ash::khr::swapchain::NAME,
    ash::khr::cooperative_matrix::NAME,
];

/// Instance extensions: the platform surface set, properties2, and debug
/// utils when validation is on.
pub fn instance_extensions(
    surface_extensions: &[*const c_char],
    enable_validation: bool,
) -> Vec<*const c_char> {
    let mut extensions = surface_extensions.to_vec();
    extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    extensions
}

pub fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    surface_extensions: &[*const c_char],
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name).unwrap_or_default();
    let engine_name = c"vk-runtime";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extensions = instance_extensions(surface_extensions, enable_validation);
    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }.map_err(|result| match result {
        vk::Result::ERROR_EXTENSION_NOT_PRESENT
        | vk::Result::ERROR_LAYER_NOT_PRESENT
        | vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
            let names: Vec<String> = extensions
                .iter()
                .map(|&name| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
                .collect();
            RuntimeError::CapabilityUnsupported(format!(
                "vkCreateInstance returned {}; Vulkan 1.3 with {} is required{}",
                result,
                names.join(", "),
                if enable_validation {
                    " (plus VK_LAYER_KHRONOS_validation)"
                } else {
                    ""
                }
            ))
        }
        other => RuntimeError::from_vk("vkCreateInstance", other),
    })
}

/// Route validation warnings and errors to `log`.
pub fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .vk_context("vkCreateDebugUtilsMessengerEXT")?;

    Ok((debug_utils, messenger))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

/// The part of a physical device the selection policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub vendor_id: u32,
}

/// Index of the device to use: the first discrete GPU, otherwise the first
/// integrated GPU from `preferred_vendor`.
pub fn select_device_index(candidates: &[DeviceCandidate], preferred_vendor: u32) -> Option<usize> {
    candidates
        .iter()
        .position(|c| c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| {
            candidates.iter().position(|c| {
                c.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
                    && c.vendor_id == preferred_vendor
            })
        })
}

/// First family that can run graphics work and present to the surface.
///
/// COMPUTE is not required. Families without it are still accepted, so
/// compute dispatch on the selected queue is not guaranteed.
pub fn select_queue_family(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> Option<u32> {
    families
        .iter()
        .zip(present_support)
        .position(|(family, &presents)| {
            presents && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|index| index as u32)
}

/// Names from `required` that `available` does not contain.
pub fn missing_extensions(available: &[&CStr], required: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(*name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Features that are turned on when the device has them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionalFeatures {
    pub vulkan_memory_model: bool,
    pub vulkan_memory_model_device_scope: bool,
    pub storage_buffer_8bit_access: bool,
    pub storage_buffer_16bit_access: bool,
    pub shader_int8: bool,
    pub shader_float16: bool,
    pub buffer_device_address: bool,
    pub cooperative_matrix: bool,
    pub maintenance4: bool,
}

impl OptionalFeatures {
    fn named(&self) -> [(&'static str, bool); 9] {
        [
            ("vulkanMemoryModel", self.vulkan_memory_model),
            ("vulkanMemoryModelDeviceScope", self.vulkan_memory_model_device_scope),
            ("storageBuffer8BitAccess", self.storage_buffer_8bit_access),
            ("storageBuffer16BitAccess", self.storage_buffer_16bit_access),
            ("shaderInt8", self.shader_int8),
            ("shaderFloat16", self.shader_float16),
            ("bufferDeviceAddress", self.buffer_device_address),
            ("cooperativeMatrix", self.cooperative_matrix),
            ("maintenance4", self.maintenance4),
        ]
    }

    /// Names of the features the device does not support.
    pub fn unsupported(&self) -> Vec<&'static str> {
        self.named()
            .into_iter()
            .filter(|&(_, supported)| !supported)
            .map(|(name, _)| name)
            .collect()
    }
}

/// Pick the physical device. Per-device extension lists are logged only;
/// they do not take part in the choice.
pub fn pick_physical_device(
    instance: &ash::Instance,
    preferred_vendor: u32,
) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .vk_context("vkEnumeratePhysicalDevices")?;

    if devices.is_empty() {
        return Err(RuntimeError::CapabilityUnsupported(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let candidates: Vec<DeviceCandidate> = devices
        .iter()
        .map(|&device| {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let extension_count = unsafe { instance.enumerate_device_extension_properties(device) }
                .map(|extensions| extensions.len())
                .unwrap_or(0);
            log::debug!(
                "Found GPU: {:?} ({:?}, vendor 0x{:X}, {} extensions)",
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) },
                props.device_type,
                props.vendor_id,
                extension_count
            );
            DeviceCandidate {
                device_type: props.device_type,
                vendor_id: props.vendor_id,
            }
        })
        .collect();

    select_device_index(&candidates, preferred_vendor)
        .map(|index| devices[index])
        .ok_or_else(|| {
            RuntimeError::CapabilityUnsupported(format!(
                "no discrete GPU and no integrated GPU from vendor 0x{:X} among {} device(s)",
                preferred_vendor,
                devices.len()
            ))
        })
}

/// Find the queue family to create the single queue from.
pub fn find_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let present_support = (0..families.len() as u32)
        .map(|index| {
            unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, index, surface)
            }
            .vk_context("vkGetPhysicalDeviceSurfaceSupportKHR")
        })
        .collect::<Result<Vec<bool>>>()?;

    select_queue_family(&families, &present_support).ok_or_else(|| {
        RuntimeError::CapabilityUnsupported(
            "no queue family supports graphics and presentation".to_string(),
        )
    })
}

/// Fail with the names of any required device extension the device lacks.
pub fn check_device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .vk_context("vkEnumerateDeviceExtensionProperties")?;
    let available: Vec<&CStr> = extensions
        .iter()
        .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) })
        .collect();

    let missing = missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::CapabilityUnsupported(format!(
            "device extension(s) not present: {}",
            missing.join(", ")
        )))
    }
}

/// Ask the device which optional features it supports.
pub fn query_optional_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> OptionalFeatures {
    let mut cooperative_matrix = vk::PhysicalDeviceCooperativeMatrixFeaturesKHR::default();
    let mut vulkan_11 = vk::PhysicalDeviceVulkan11Features::default();
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
    {
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut cooperative_matrix)
            .push_next(&mut vulkan_11)
            .push_next(&mut vulkan_12)
            .push_next(&mut vulkan_13);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    }

    OptionalFeatures {
        vulkan_memory_model: vulkan_12.vulkan_memory_model == vk::TRUE,
        vulkan_memory_model_device_scope: vulkan_12.vulkan_memory_model_device_scope == vk::TRUE,
        storage_buffer_8bit_access: vulkan_12.storage_buffer8_bit_access == vk::TRUE,
        storage_buffer_16bit_access: vulkan_11.storage_buffer16_bit_access == vk::TRUE,
        shader_int8: vulkan_12.shader_int8 == vk::TRUE,
        shader_float16: vulkan_12.shader_float16 == vk::TRUE,
        buffer_device_address: vulkan_12.buffer_device_address == vk::TRUE,
        cooperative_matrix: cooperative_matrix.cooperative_matrix == vk::TRUE,
        maintenance4: vulkan_13.maintenance4 == vk::TRUE,
    }
}

/// Create the logical device with one queue and the given features enabled.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    features: &OptionalFeatures,
) -> Result<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities);

    let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|name| name.as_ptr())
        .collect();

    let mut cooperative_matrix = vk::PhysicalDeviceCooperativeMatrixFeaturesKHR::default()
        .cooperative_matrix(features.cooperative_matrix);
    let mut vulkan_11 = vk::PhysicalDeviceVulkan11Features::default()
        .storage_buffer16_bit_access(features.storage_buffer_16bit_access);
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .vulkan_memory_model(features.vulkan_memory_model)
        .vulkan_memory_model_device_scope(features.vulkan_memory_model_device_scope)
        .storage_buffer8_bit_access(features.storage_buffer_8bit_access)
        .shader_int8(features.shader_int8)
        .shader_float16(features.shader_float16)
        .buffer_device_address(features.buffer_device_address);
    let mut vulkan_13 =
        vk::PhysicalDeviceVulkan13Features::default().maintenance4(features.maintenance4);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut cooperative_matrix)
        .push_next(&mut vulkan_11)
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .vk_context("vkCreateDevice")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const INTEL: u32 = 0x8086;
    const AMD: u32 = 0x1002;

    fn candidate(device_type: vk::PhysicalDeviceType, vendor_id: u32) -> DeviceCandidate {
        DeviceCandidate {
            device_type,
            vendor_id,
        }
    }

    fn family(queue_flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn names(extensions: &[*const c_char]) -> Vec<String> {
        extensions
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    #[case(false, vec!["VK_KHR_surface", "VK_KHR_get_physical_device_properties2"])]
    #[case(true, vec!["VK_KHR_surface", "VK_KHR_get_physical_device_properties2", "VK_EXT_debug_utils"])]
    fn instance_extensions_follow_validation(#[case] validation: bool, #[case] expected: Vec<&str>) {
        let surface = [ash::khr::surface::NAME.as_ptr()];
        assert_eq!(names(&instance_extensions(&surface, validation)), expected);
    }

    #[test]
    fn discrete_wins_even_after_a_preferred_integrated() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, INTEL),
            candidate(vk::PhysicalDeviceType::CPU, AMD),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, AMD),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, INTEL),
        ];
        assert_eq!(select_device_index(&candidates, INTEL), Some(2));
    }

    #[test]
    fn first_preferred_integrated_without_discrete() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, AMD),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, INTEL),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, INTEL),
        ];
        assert_eq!(select_device_index(&candidates, INTEL), Some(1));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wrong_vendor(vec![candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, AMD)])]
    #[case::software_only(vec![
        candidate(vk::PhysicalDeviceType::CPU, INTEL),
        candidate(vk::PhysicalDeviceType::VIRTUAL_GPU, INTEL),
    ])]
    fn no_device_matches(#[case] candidates: Vec<DeviceCandidate>) {
        assert_eq!(select_device_index(&candidates, INTEL), None);
    }

    #[test]
    fn queue_family_needs_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families, &[true, false, true]), Some(2));
        assert_eq!(select_queue_family(&families, &[true, true, true]), Some(1));
    }

    #[test]
    fn graphics_family_without_compute_is_accepted() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families, &[true, true]), Some(1));
    }

    #[test]
    fn no_queue_family_is_a_miss_not_an_index() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert_eq!(select_queue_family(&families, &[false]), None);
        assert_eq!(select_queue_family(&[], &[]), None);
    }

    #[test]
    fn missing_extensions_are_named() {
        let available = [ash::khr::swapchain::NAME, c"VK_KHR_maintenance4"];
        let missing = missing_extensions(&available, &REQUIRED_DEVICE_EXTENSIONS);
        assert_eq!(missing, vec!["VK_KHR_cooperative_matrix".to_string()]);

        let all = [ash::khr::cooperative_matrix::NAME, ash::khr::swapchain::NAME];
        assert!(missing_extensions(&all, &REQUIRED_DEVICE_EXTENSIONS).is_empty());
    }

    #[test]
    fn unsupported_features_are_named() {
        let features = OptionalFeatures {
            vulkan_memory_model: true,
            vulkan_memory_model_device_scope: true,
            storage_buffer_8bit_access: true,
            storage_buffer_16bit_access: true,
            shader_int8: true,
            shader_float16: false,
            buffer_device_address: true,
            cooperative_matrix: false,
            maintenance4: true,
        };
        assert_eq!(features.unsupported(), vec!["shaderFloat16", "cooperativeMatrix"]);
        assert_eq!(OptionalFeatures::default().unsupported().len(), 9);
    }
}
