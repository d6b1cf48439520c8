// Device diagnostics
//
// Human-readable report of the selected device and of the cooperative
// matrix configurations it supports. Informational only.

use ash::vk;
use std::ffi::CStr;
use std::fmt;
use std::io::Write;

pub const VENDOR_INTEL: u32 = 0x8086;
pub const VENDOR_NVIDIA: u32 = 0x10DE;

/// Raw driver version followed by the vendor-specific decoding, if known.
pub fn format_driver_version(vendor_id: u32, driver_version: u32) -> String {
    let decoded = match vendor_id {
        VENDOR_INTEL => format!("{}.{}", driver_version >> 14, driver_version & 0x3FFF),
        VENDOR_NVIDIA => format!(
            "{}.{}.{}.{}",
            driver_version >> 22,
            (driver_version >> 14) & 0xFF,
            (driver_version >> 6) & 0xFF,
            driver_version & 0x3F
        ),
        _ => String::new(),
    };
    format!("{}({})", driver_version, decoded)
}

/// Identity of the selected physical device.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub name: String,
    pub device_id: u32,
    pub vendor_id: u32,
    pub driver_version: u32,
    pub driver_name: String,
    pub api_version: u32,
    pub device_type: vk::PhysicalDeviceType,
}

impl DeviceReport {
    pub fn new(
        properties: &vk::PhysicalDeviceProperties,
        driver: &vk::PhysicalDeviceDriverProperties<'_>,
    ) -> Self {
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let driver_name = unsafe { CStr::from_ptr(driver.driver_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self {
            name,
            device_id: properties.device_id,
            vendor_id: properties.vendor_id,
            driver_version: properties.driver_version,
            driver_name,
            api_version: properties.api_version,
            device_type: properties.device_type,
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (DeviceID: 0x{:X} VendorID: 0x{:X})",
            self.name, self.device_id, self.vendor_id
        )?;
        writeln!(
            f,
            "Driver version: {}",
            format_driver_version(self.vendor_id, self.driver_version)
        )?;
        if !self.driver_name.is_empty() {
            writeln!(f, "Driver: {}", self.driver_name)?;
        }
        writeln!(
            f,
            "API version: {}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        )?;
        write!(f, "is_discrete_gpu: {}", self.is_discrete())
    }
}

/// Short name for a cooperative matrix component type.
pub fn component_type_name(component_type: vk::ComponentTypeKHR) -> &'static str {
    match component_type {
        vk::ComponentTypeKHR::FLOAT16 => "f16",
        vk::ComponentTypeKHR::FLOAT32 => "f32",
        vk::ComponentTypeKHR::FLOAT64 => "f64",
        vk::ComponentTypeKHR::SINT8 => "s8",
        vk::ComponentTypeKHR::SINT16 => "s16",
        vk::ComponentTypeKHR::SINT32 => "s32",
        vk::ComponentTypeKHR::SINT64 => "s64",
        vk::ComponentTypeKHR::UINT8 => "u8",
        vk::ComponentTypeKHR::UINT16 => "u16",
        vk::ComponentTypeKHR::UINT32 => "u32",
        vk::ComponentTypeKHR::UINT64 => "u64",
        _ => "?",
    }
}

/// One supported tiled multiply-accumulate shape: `D[MxN] = A[MxK] * B[KxN] + C[MxN]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixConfiguration {
    pub m_size: u32,
    pub n_size: u32,
    pub k_size: u32,
    pub a_type: vk::ComponentTypeKHR,
    pub b_type: vk::ComponentTypeKHR,
    pub c_type: vk::ComponentTypeKHR,
    pub result_type: vk::ComponentTypeKHR,
    pub saturating_accumulate: bool,
    pub scope: vk::ScopeKHR,
}

impl From<&vk::CooperativeMatrixPropertiesKHR<'_>> for MatrixConfiguration {
    fn from(properties: &vk::CooperativeMatrixPropertiesKHR<'_>) -> Self {
        Self {
            m_size: properties.m_size,
            n_size: properties.n_size,
            k_size: properties.k_size,
            a_type: properties.a_type,
            b_type: properties.b_type,
            c_type: properties.c_type,
            result_type: properties.result_type,
            saturating_accumulate: properties.saturating_accumulation == vk::TRUE,
            scope: properties.scope,
        }
    }
}

impl fmt::Display for MatrixConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AType: {} BType: {} CType: {} M: {} N: {} K: {}",
            component_type_name(self.a_type),
            component_type_name(self.b_type),
            component_type_name(self.c_type),
            self.m_size,
            self.n_size,
            self.k_size
        )
    }
}

/// First configuration with the given A type in the given scope.
pub fn find_configuration(
    configurations: &[MatrixConfiguration],
    a_type: vk::ComponentTypeKHR,
    scope: vk::ScopeKHR,
) -> Option<MatrixConfiguration> {
    configurations
        .iter()
        .find(|c| c.scope == scope && c.a_type == a_type)
        .copied()
}

/// Write the device report and one row per subgroup-scope configuration.
///
/// Each row is also logged at debug level.
pub fn write_report<W: Write>(
    out: &mut W,
    device: &DeviceReport,
    configurations: &[MatrixConfiguration],
) -> std::io::Result<()> {
    writeln!(out, "{}", device)?;
    writeln!(out)?;
    writeln!(out, "Cooperative matrix configurations:")?;
    for configuration in configurations
        .iter()
        .filter(|c| c.scope == vk::ScopeKHR::SUBGROUP)
    {
        log::debug!("Cooperative matrix: {}", configuration);
        writeln!(out, "  {}", configuration)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(a: vk::ComponentTypeKHR, c: vk::ComponentTypeKHR, scope: vk::ScopeKHR) -> MatrixConfiguration {
        MatrixConfiguration {
            m_size: 16,
            n_size: 16,
            k_size: 32,
            a_type: a,
            b_type: a,
            c_type: c,
            result_type: c,
            saturating_accumulate: false,
            scope,
        }
    }

    fn report() -> DeviceReport {
        DeviceReport {
            name: "Test GPU".to_string(),
            device_id: 0x56A0,
            vendor_id: VENDOR_INTEL,
            driver_version: (101 << 14) | 5762,
            driver_name: "Intel open-source Mesa driver".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 280),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        }
    }

    #[test]
    fn intel_driver_version() {
        let version = (101 << 14) | 5762;
        assert_eq!(format_driver_version(VENDOR_INTEL, version), format!("{}(101.5762)", version));
    }

    #[test]
    fn nvidia_driver_version() {
        let version = (535 << 22) | (129 << 14) | (3 << 6);
        assert_eq!(format_driver_version(VENDOR_NVIDIA, version), format!("{}(535.129.3.0)", version));
    }

    #[test]
    fn unknown_vendor_keeps_raw_version() {
        assert_eq!(format_driver_version(0x1002, 42), "42()");
    }

    #[test]
    fn configuration_row() {
        let row = config(vk::ComponentTypeKHR::UINT8, vk::ComponentTypeKHR::UINT32, vk::ScopeKHR::SUBGROUP);
        assert_eq!(row.to_string(), "AType: u8 BType: u8 CType: u32 M: 16 N: 16 K: 32");
    }

    #[test]
    fn configuration_from_driver_properties() {
        let properties = vk::CooperativeMatrixPropertiesKHR {
            m_size: 8,
            n_size: 16,
            k_size: 32,
            a_type: vk::ComponentTypeKHR::SINT8,
            b_type: vk::ComponentTypeKHR::SINT8,
            c_type: vk::ComponentTypeKHR::SINT32,
            result_type: vk::ComponentTypeKHR::SINT32,
            saturating_accumulation: vk::TRUE,
            scope: vk::ScopeKHR::SUBGROUP,
            ..Default::default()
        };

        let configuration = MatrixConfiguration::from(&properties);
        assert_eq!((configuration.m_size, configuration.n_size, configuration.k_size), (8, 16, 32));
        assert_eq!(configuration.result_type, vk::ComponentTypeKHR::SINT32);
        assert!(configuration.saturating_accumulate);
        assert_eq!(configuration.to_string(), "AType: s8 BType: s8 CType: s32 M: 8 N: 16 K: 32");
    }

    #[test]
    fn find_configuration_honours_scope() {
        let configs = [
            config(vk::ComponentTypeKHR::UINT8, vk::ComponentTypeKHR::UINT32, vk::ScopeKHR::WORKGROUP),
            config(vk::ComponentTypeKHR::FLOAT16, vk::ComponentTypeKHR::FLOAT32, vk::ScopeKHR::SUBGROUP),
            config(vk::ComponentTypeKHR::UINT8, vk::ComponentTypeKHR::UINT32, vk::ScopeKHR::SUBGROUP),
        ];

        let found = find_configuration(&configs, vk::ComponentTypeKHR::UINT8, vk::ScopeKHR::SUBGROUP);
        assert_eq!(found, Some(configs[2]));
        assert_eq!(
            find_configuration(&configs, vk::ComponentTypeKHR::SINT8, vk::ScopeKHR::SUBGROUP),
            None
        );
    }

    #[test]
    fn report_lists_only_subgroup_rows() {
        let configs = [
            config(vk::ComponentTypeKHR::UINT8, vk::ComponentTypeKHR::UINT32, vk::ScopeKHR::WORKGROUP),
            config(vk::ComponentTypeKHR::FLOAT16, vk::ComponentTypeKHR::FLOAT16, vk::ScopeKHR::SUBGROUP),
        ];
        let mut out = Vec::new();
        write_report(&mut out, &report(), &configs).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Test GPU (DeviceID: 0x56A0 VendorID: 0x8086)"));
        assert!(text.contains("is_discrete_gpu: true"));
        assert!(text.contains("AType: f16 BType: f16 CType: f16"));
        assert!(!text.contains("AType: u8"));
    }

    struct Capture;

    static CAPTURED: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
    static CAPTURE: Capture = Capture;

    impl log::Log for Capture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Debug
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                CAPTURED.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    #[test]
    fn report_rows_are_logged_at_debug() {
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Debug);

        let configs = [
            config(vk::ComponentTypeKHR::FLOAT64, vk::ComponentTypeKHR::FLOAT64, vk::ScopeKHR::SUBGROUP),
            config(vk::ComponentTypeKHR::SINT16, vk::ComponentTypeKHR::SINT16, vk::ScopeKHR::WORKGROUP),
        ];
        write_report(&mut Vec::new(), &report(), &configs).unwrap();

        let captured = CAPTURED.lock().unwrap();
        assert!(captured
            .iter()
            .any(|m| m == "Cooperative matrix: AType: f64 BType: f64 CType: f64 M: 16 N: 16 K: 32"));
        assert!(!captured.iter().any(|m| m.contains("AType: s16")));
    }
}
