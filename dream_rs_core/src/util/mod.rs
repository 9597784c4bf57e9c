mod auto_dtype;
mod device;

pub use auto_dtype::{ModelPrecision, TryIntoDType};
pub use device::{choose_device, device_name, DevicePreference};
