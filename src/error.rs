use thiserror::Error;

/// Errors surfaced by native API calls.
///
/// Pool operations never produce these on their own; they only propagate failures
/// from native object creation, submission, or fence waits.
#[derive(Debug, Error)]
pub enum Error {
    #[error("native call `{call}` failed with code {code:#x}")]
    Native { call: &'static str, code: i64 },
    #[error("the GPU device was lost")]
    DeviceLost,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[cfg(feature = "vulkan")]
    #[error(transparent)]
    Vulkan(ash::vk::Result),
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for Error {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Error::OutOfMemory
            }
            other => Error::Vulkan(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
