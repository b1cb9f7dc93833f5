pub mod device {
    pub mod v1 {
        include!("gen/skiff.device.v1.rs");

        pub use device_plugin_client::DevicePluginClient;
        pub use device_plugin_server::{DevicePlugin, DevicePluginServer};
    }
}
