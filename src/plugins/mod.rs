//! Service plugins: message routing inside each of the six protocol marks.

pub mod clipboard;
pub mod file_transfer;
pub mod notifications;
pub mod opener;
pub mod remote_commands;
pub mod sync;

use crate::app::AppContext;
use crate::device::Device;
use crate::plugin::Plugin;

/// All recognized plugin marks, in the order the session server checks them.
pub const MARKS: &[&str] = &["file", "open", "rcmd", "nots", "clip", "sync"];

/// Construct a fresh plugin instance for one session, or `None` if `mark`
/// is not a registered plugin.
pub fn build(mark: &str, context: &AppContext, device: &Device) -> Option<Box<dyn Plugin>> {
    match mark {
        "file" => Some(Box::new(file_transfer::FileTransferPlugin::new(context, device))),
        "open" => Some(Box::new(opener::OpenerPlugin::new(context, device))),
        "rcmd" => Some(Box::new(remote_commands::RemoteCommandsPlugin::new(
            context, device,
        ))),
        "nots" => Some(Box::new(notifications::NotificationsPlugin::new(
            context, device,
        ))),
        "clip" => Some(Box::new(clipboard::ClipboardPlugin::new(context, device))),
        "sync" => Some(Box::new(sync::SyncPlugin::new(context, device))),
        _ => None,
    }
}

/// Load a plugin's config, preferring the per-device override file over the
/// shared main file when one exists for this device's UIN — matching the
/// source's `conf()` lookup (`DEVICE_CONFS.get(uin, MAIN_CONF)`), never a
/// field-by-field merge.
pub fn load_config<T>(context: &AppContext, mark: &str, device: &Device) -> T
where
    T: serde::de::DeserializeOwned + serde::Serialize + Default,
{
    if let Ok(Some(device_conf)) =
        crate::config::load_device_plugin_config::<T>(&context.plugins_dir, device.uin, mark)
    {
        return device_conf;
    }
    match crate::config::load_plugin_config::<T>(&context.plugins_dir, mark) {
        Ok(conf) => conf,
        Err(e) => {
            log::warn!("plugin \"{}\" config load failed, using defaults: {}", mark, e);
            T::default()
        }
    }
}
