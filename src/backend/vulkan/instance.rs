//! Instance creation.
//!
//! The instance enables `VK_EXT_debug_utils` whenever the loader offers it. Validation
//! messages are forwarded to `tracing` under the `vulkan` target, so they show up next
//! to the pool and fence logs of the rest of the crate.
use std::{
    borrow::Cow,
    ffi::{CStr, c_char, c_void},
};

use ash::vk;

use crate::{Error, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Configuration for [`VulkanDevice::new`](super::VulkanDevice::new).
#[derive(Clone, Debug)]
pub struct InstanceDesc {
    /// The application name shown in debugging tools.
    pub application_name: Cow<'static, CStr>,
    pub application_version: u32,
    /// Enables the Khronos validation layer when it is installed.
    pub validation: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            application_name: Cow::Borrowed(c"Unnamed Application"),
            application_version: 0,
            validation: cfg!(debug_assertions),
        }
    }
}

pub(super) struct Instance {
    /// Keeps the loader library mapped while `raw` is alive.
    _entry: ash::Entry,
    pub raw: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub fn new(desc: &InstanceDesc) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| {
            tracing::error!(%err, "failed to load the Vulkan loader");
            Error::Unsupported("no Vulkan loader")
        })?;

        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|ext| ext == name))
        };

        let mut layers: Vec<*const c_char> = Vec::new();
        if desc.validation {
            if available_layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str().is_ok_and(|layer| layer == VALIDATION_LAYER))
            {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                tracing::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            }
        }

        let mut extensions: Vec<*const c_char> = Vec::new();
        let debug_utils_available = has_extension(ash::ext::debug_utils::NAME);
        if debug_utils_available {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let mut flags = vk::InstanceCreateFlags::empty();
        // Portability drivers are only enumerated when asked for.
        if has_extension(ash::khr::portability_enumeration::NAME) {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let application_info = vk::ApplicationInfo {
            p_application_name: desc.application_name.as_ptr(),
            application_version: desc.application_version,
            p_engine_name: c"scoria".as_ptr(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        };
        let create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            flags,
            ..Default::default()
        };
        let raw = unsafe { entry.create_instance(&create_info, None)? };

        let debug_utils = debug_utils_available
            .then(|| {
                let loader = ash::ext::debug_utils::Instance::new(&entry, &raw);
                let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(debug_callback));
                match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                    Ok(messenger) => Some((loader, messenger)),
                    Err(err) => {
                        tracing::warn!(?err, "failed to create debug messenger");
                        None
                    }
                }
            })
            .flatten();

        tracing::info!(
            validation = !layers.is_empty(),
            debug_utils = debug_utils.is_some(),
            "created Vulkan instance"
        );
        Ok(Self {
            _entry: entry,
            raw,
            debug_utils,
        })
    }

    pub fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.raw.handle(), "drop instance");
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe { data.as_ref() }
        .filter(|data| !data.p_message.is_null())
        .map(|data| unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy())
        .unwrap_or_default();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?ty, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?ty, "{message}");
    } else {
        tracing::debug!(target: "vulkan", ?ty, "{message}");
    }
    vk::FALSE
}
