// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with the diagnostics extension and validation layer
// - Presentation surface (built by the platform's factory)
// - Physical adapter selection through a pluggable policy
// - Logical device + its single queue
// - Optional debug messenger forwarding driver messages to `log`

use ash::extensions::{ext::DebugUtils, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

use super::error::{RendererError, RendererResult, VkResultExt};
use super::teardown::ResourceKind;
use crate::config::{AdapterPolicy, DeviceConfig, RendererConfig};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

// =============================================================================
// ADAPTER SELECTION
// =============================================================================

/// Everything a selection policy may look at for one physical adapter.
#[derive(Clone)]
pub struct AdapterCandidate {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
}

impl AdapterCandidate {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Adapter index into the enumerated list plus the queue family to use on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterChoice {
    pub index: usize,
    pub queue_family: u32,
}

/// Picks which enumerated adapter (and queue family) the device is built on.
pub trait AdapterSelector {
    fn select(&self, candidates: &[AdapterCandidate]) -> Option<AdapterChoice>;
}

/// First-fit: adapter 0, queue family 0 unless overridden. No capability checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAdapter {
    pub queue_family: Option<u32>,
}

impl AdapterSelector for FirstAdapter {
    fn select(&self, candidates: &[AdapterCandidate]) -> Option<AdapterChoice> {
        if candidates.is_empty() {
            return None;
        }
        Some(AdapterChoice {
            index: 0,
            queue_family: self.queue_family.unwrap_or(0),
        })
    }
}

/// Prefer discrete over integrated over anything else; requires a graphics queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscreteFirst {
    pub queue_family: Option<u32>,
}

impl DiscreteFirst {
    fn score(device_type: vk::PhysicalDeviceType) -> u32 {
        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        }
    }

    fn graphics_family(&self, candidate: &AdapterCandidate) -> Option<u32> {
        if let Some(family) = self.queue_family {
            let supported = candidate
                .queue_families
                .get(family as usize)
                .is_some_and(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS));
            return supported.then_some(family);
        }

        candidate
            .queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
    }
}

impl AdapterSelector for DiscreteFirst {
    fn select(&self, candidates: &[AdapterCandidate]) -> Option<AdapterChoice> {
        let mut best: Option<(u32, AdapterChoice)> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(queue_family) = self.graphics_family(candidate) else {
                continue;
            };
            let score = Self::score(candidate.properties.device_type);
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, AdapterChoice { index, queue_family }));
            }
        }

        best.map(|(_, choice)| choice)
    }
}

/// Selection policy named by the configuration.
pub fn selector_for(config: &DeviceConfig) -> Box<dyn AdapterSelector> {
    match config.adapter_policy {
        AdapterPolicy::First => Box::new(FirstAdapter {
            queue_family: config.queue_family,
        }),
        AdapterPolicy::Discrete => Box::new(DiscreteFirst {
            queue_family: config.queue_family,
        }),
    }
}

// =============================================================================
// DEVICE CONTEXT
// =============================================================================

/// Instance, surface, adapter, logical device and queue.
///
/// Handles are released by the teardown sequencer through the `destroy_*`
/// methods, never by `Drop`.
pub struct DeviceContext {
    _entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub surface_loader: khr::Surface,
    pub surface: vk::SurfaceKHR,

    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub device: ash::Device,
    pub swapchain_loader: khr::Swapchain,
    pub queue: vk::Queue,
    pub queue_family: u32,
}

impl DeviceContext {
    /// Build the context.
    ///
    /// `surface_factory` is the platform's hook for turning its native window
    /// into a `VkSurfaceKHR`; it runs right after the instance exists. On any
    /// failure everything created so far is released before returning.
    pub fn new<F>(
        config: &RendererConfig,
        required_extensions: &[&CStr],
        surface_factory: F,
        selector: &dyn AdapterSelector,
    ) -> RendererResult<Self>
    where
        F: FnOnce(&Entry, &ash::Instance) -> VkResult<vk::SurfaceKHR>,
    {
        let app_name = &config.window.title;
        log::info!("Creating Vulkan device context: {}", app_name);

        let entry = unsafe { Entry::load() }?;
        let validation = config.debug.validation;
        let instance = Self::create_instance(&entry, app_name, required_extensions, validation)?;

        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = match surface_factory(&entry, &instance) {
            Ok(surface) => surface,
            Err(result) => {
                unsafe { instance.destroy_instance(None) };
                return Err(RendererError::Vulkan {
                    phase: "surface creation",
                    result,
                });
            }
        };

        let release = |err: RendererError| {
            unsafe {
                surface_loader.destroy_surface(surface, None);
                instance.destroy_instance(None);
            }
            err
        };

        let (candidate, queue_family) =
            Self::select_adapter(&instance, selector).map_err(&release)?;
        let physical_device = candidate.handle;
        Self::log_device_extensions(&instance, physical_device);

        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family).map_err(&release)?;

        let debug_utils = if validation {
            Self::install_diagnostics(&entry, &instance)
        } else {
            None
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = candidate.properties;

        log::info!("Selected GPU: {} (queue family {})", candidate.name(), queue_family);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            properties,
            memory_properties,
            device,
            swapchain_loader,
            queue,
            queue_family,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        required_extensions: &[&CStr],
        validation: bool,
    ) -> RendererResult<ash::Instance> {
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .phase("instance extension enumeration")?;
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .phase("instance layer enumeration")?;

        log::debug!(
            "Instance extensions: {:?}",
            available_extensions
                .iter()
                .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
                .collect::<Vec<_>>()
        );

        // Interior NULs are impossible for a window title we control; strip them anyway.
        let app_name_cstr = CString::new(app_name.replace('\0', "")).unwrap_or_default();
        let engine_name = c"triangle-renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> =
            required_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let layer_names = if validation {
            extensions.push(DebugUtils::name().as_ptr());

            let layer_present = available_layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if !layer_present {
                log::warn!(
                    "{:?} is not installed; instance creation will likely fail",
                    VALIDATION_LAYER
                );
            }
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.phase("instance creation")
    }

    fn select_adapter(
        instance: &ash::Instance,
        selector: &dyn AdapterSelector,
    ) -> RendererResult<(AdapterCandidate, u32)> {
        let adapters =
            unsafe { instance.enumerate_physical_devices() }.phase("adapter enumeration")?;

        if adapters.is_empty() {
            return Err(RendererError::NoAdaptersFound);
        }
        log::info!("Found {} physical adapter(s)", adapters.len());

        let candidates: Vec<AdapterCandidate> = adapters
            .iter()
            .map(|&handle| unsafe {
                AdapterCandidate {
                    handle,
                    properties: instance.get_physical_device_properties(handle),
                    queue_families: instance.get_physical_device_queue_family_properties(handle),
                }
            })
            .collect();

        let rejected = || RendererError::NoAdapterSelected {
            candidates: candidates.len(),
        };
        let choice = selector.select(&candidates).ok_or_else(rejected)?;
        let candidate = candidates.get(choice.index).cloned().ok_or_else(rejected)?;

        Ok((candidate, choice.queue_family))
    }

    fn log_device_extensions(instance: &ash::Instance, physical_device: vk::PhysicalDevice) {
        match unsafe { instance.enumerate_device_extension_properties(physical_device) } {
            Ok(extensions) => log::debug!(
                "Device extensions: {:?}",
                extensions
                    .iter()
                    .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
                    .collect::<Vec<_>>()
            ),
            Err(e) => log::debug!("Device extension enumeration failed: {}", e),
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> RendererResult<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .phase("logical device creation")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Install the debug messenger. Failure is logged, never fatal.
    fn install_diagnostics(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Option<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        match unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) } {
            Ok(messenger) => Some((debug_utils, messenger)),
            Err(e) => {
                log::warn!("Debug messenger creation failed with {}", e);
                None
            }
        }
    }

    pub fn has_diagnostics(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Resource kinds this context registers with the teardown graph.
    pub fn resource_kinds(&self) -> Vec<ResourceKind> {
        let mut kinds = vec![ResourceKind::Instance, ResourceKind::Surface, ResourceKind::Device];
        if self.has_diagnostics() {
            kinds.push(ResourceKind::DebugMessenger);
        }
        kinds
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device.device_wait_idle() }.phase("device wait idle")
    }

    pub(crate) fn destroy_device(&mut self) {
        unsafe { self.device.destroy_device(None) };
    }

    pub(crate) fn destroy_diagnostics(&mut self) {
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            unsafe { debug_utils.destroy_debug_utils_messenger(messenger, None) };
        }
    }

    pub(crate) fn destroy_surface(&mut self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
        self.surface = vk::SurfaceKHR::null();
    }

    pub(crate) fn destroy_instance(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    log::log!(severity_level(message_severity), "[Vulkan] {}", message.to_string_lossy());

    vk::FALSE
}

/// Log level a driver message is forwarded at. Info and verbose traffic
/// goes to debug so it stays out of the default filter.
fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn candidate(raw: u64, device_type: vk::PhysicalDeviceType, families: &[vk::QueueFlags]) -> AdapterCandidate {
        AdapterCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            queue_families: families
                .iter()
                .map(|&queue_flags| vk::QueueFamilyProperties {
                    queue_flags,
                    queue_count: 1,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn first_adapter_always_picks_index_zero() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::CPU, &[vk::QueueFlags::TRANSFER]),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
        ];

        let choice = FirstAdapter::default().select(&candidates).unwrap();
        assert_eq!(choice, AdapterChoice { index: 0, queue_family: 0 });

        let overridden = FirstAdapter { queue_family: Some(3) }.select(&candidates).unwrap();
        assert_eq!(overridden.queue_family, 3);
    }

    #[test]
    fn first_adapter_with_no_candidates_selects_nothing() {
        assert_eq!(FirstAdapter::default().select(&[]), None);
    }

    #[test]
    fn discrete_first_prefers_discrete_gpu() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, &[vk::QueueFlags::GRAPHICS]),
            candidate(
                2,
                vk::PhysicalDeviceType::DISCRETE_GPU,
                &[vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE],
            ),
        ];

        let choice = DiscreteFirst::default().select(&candidates).unwrap();
        assert_eq!(choice, AdapterChoice { index: 1, queue_family: 1 });
    }

    #[test]
    fn discrete_first_skips_adapters_without_graphics() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::COMPUTE]),
            candidate(2, vk::PhysicalDeviceType::VIRTUAL_GPU, &[vk::QueueFlags::GRAPHICS]),
        ];

        let choice = DiscreteFirst::default().select(&candidates).unwrap();
        assert_eq!(choice.index, 1);

        let none = DiscreteFirst::default().select(&candidates[..1]);
        assert_eq!(none, None);
    }

    #[test]
    fn discrete_first_respects_queue_family_override() {
        let candidates = [candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[vk::QueueFlags::GRAPHICS, vk::QueueFlags::GRAPHICS],
        )];

        let selector = DiscreteFirst { queue_family: Some(1) };
        assert_eq!(selector.select(&candidates).unwrap().queue_family, 1);

        let out_of_range = DiscreteFirst { queue_family: Some(5) };
        assert_eq!(out_of_range.select(&candidates), None);
    }

    #[test]
    fn selector_follows_config_policy() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, &[vk::QueueFlags::GRAPHICS]),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
        ];

        let first = selector_for(&DeviceConfig::default());
        assert_eq!(first.select(&candidates).unwrap().index, 0);

        let discrete = selector_for(&DeviceConfig {
            adapter_policy: AdapterPolicy::Discrete,
            queue_family: None,
        });
        assert_eq!(discrete.select(&candidates).unwrap().index, 1);
    }

    #[test]
    fn driver_messages_map_to_three_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        assert_eq!(severity_level(Severity::ERROR), log::Level::Error);
        assert_eq!(severity_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(severity_level(Severity::INFO), log::Level::Debug);
        assert_eq!(severity_level(Severity::VERBOSE), log::Level::Debug);
        assert_eq!(severity_level(Severity::WARNING | Severity::ERROR), log::Level::Error);
    }
}
