//! Device plugin client.
//!
//! Device plugins are external processes speaking the `skiff.device.v1`
//! contract: a fingerprint stream describing detected devices, and a
//! reserve call that returns how to expose reserved devices to a task. The
//! agent only consumes the contract; plugin internals are its own business.

use std::collections::HashMap;

use anyhow::{Context, Result};
use skiff_proto::device::v1::{
    ContainerReservation, DetectedDevices, DevicePluginClient, ReserveRequest,
};
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::debug;

/// Client for one device plugin endpoint.
pub struct DevicePlugin {
    client: DevicePluginClient<Channel>,
}

impl DevicePlugin {
    /// Connect to a device plugin.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = DevicePluginClient::connect(addr.to_string())
            .await
            .with_context(|| format!("failed to connect to device plugin at {addr}"))?;
        Ok(Self { client })
    }

    /// Open the fingerprint stream. The plugin pushes a new message every
    /// time its device set or health changes.
    pub async fn fingerprint(&mut self) -> Result<Streaming<DetectedDevices>> {
        let stream = self
            .client
            .fingerprint(())
            .await
            .context("fingerprint stream failed")?
            .into_inner();
        Ok(stream)
    }

    /// Reserve devices for a task.
    pub async fn reserve(&mut self, device_ids: Vec<String>) -> Result<ContainerReservation> {
        debug!(count = device_ids.len(), "Reserving devices");
        let response = self
            .client
            .reserve(ReserveRequest { device_ids })
            .await
            .context("device reservation failed")?
            .into_inner();
        Ok(response.container_res.unwrap_or_default())
    }
}

/// Merge reservations from multiple plugins into the union a task launch
/// needs. Later env values win on key collisions.
pub fn merge_reservations<I>(reservations: I) -> ContainerReservation
where
    I: IntoIterator<Item = ContainerReservation>,
{
    let mut envs: HashMap<String, String> = HashMap::new();
    let mut mounts = Vec::new();
    let mut devices = Vec::new();

    for reservation in reservations {
        envs.extend(reservation.envs);
        mounts.extend(reservation.mounts);
        devices.extend(reservation.devices);
    }

    ContainerReservation {
        envs,
        mounts,
        devices,
    }
}
