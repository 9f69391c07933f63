// D-Bus control interface

//! Control channel over D-Bus
//!
//! Serves `org.wglifecycle.Manager1` on the system bus. `Start`, `Stop`
//! and `GetStatus` form the provider control channel with the integer
//! result codes of [`crate::types::StartResult`] and
//! [`crate::types::StopResult`]; `Connect` and `Disconnect` are the host
//! request boundary. Every committed status transition is broadcast as the
//! `StatusChanged` signal.
//!
//! Each method hands its request to the engine over the shared input
//! channel and waits for the reply slot; the engine serializes everything,
//! so no reducer work ever happens on the bus task.

use crate::context::{CallStatus, IpDownCallback, IpUpCallback, NetworkIdentity};
use crate::engine::Input;
use crate::types::{OpMode, StartResult, StatusSink, StopResult, TunnelStatus};
use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use zbus::object_server::SignalContext;
use zbus::{interface, Connection};

/// Well-known bus name.
pub const BUS_NAME: &str = "org.wglifecycle";
/// Object path the manager interface is served at.
pub const OBJECT_PATH: &str = "/org/wglifecycle/Manager1";

/// Buffer for status broadcasts between the engine and the signal task.
const STATUS_CHANNEL_SIZE: usize = 32;

/// The served manager interface.
pub struct ControlInterface {
    inputs: mpsc::Sender<Input>,
}

#[interface(name = "org.wglifecycle.Manager1")]
impl ControlInterface {
    /// Start WireGuard with the named config. Provider mode only.
    async fn start(&self, config: String) -> i32 {
        let (reply, rx) = oneshot::channel();
        if self
            .inputs
            .send(Input::ControlStart { config, reply })
            .await
            .is_err()
        {
            log::error!("engine gone, failing control start");
            return StartResult::Failed.code();
        }
        rx.await.unwrap_or(StartResult::Failed).code()
    }

    /// Stop WireGuard. Provider mode only.
    async fn stop(&self) -> i32 {
        let (reply, rx) = oneshot::channel();
        if self
            .inputs
            .send(Input::ControlStop { reply })
            .await
            .is_err()
        {
            log::error!("engine gone, failing control stop");
            return StopResult::Refused.code();
        }
        rx.await.unwrap_or(StopResult::Refused).code()
    }

    /// Current (state, mode) pair.
    async fn get_status(&self) -> (String, String) {
        let (reply, rx) = oneshot::channel();
        if self.inputs.send(Input::GetStatus { reply }).await.is_ok() {
            if let Ok((status, mode)) = rx.await {
                return (status.as_str().to_string(), mode.as_str().to_string());
            }
        }
        log::error!("engine gone, reporting stopped");
        (
            TunnelStatus::Stopped.as_str().to_string(),
            OpMode::Normal.as_str().to_string(),
        )
    }

    /// Host boundary: request the IP layer up for an identity. Returns
    /// once the connection attempt settled; true on success.
    async fn connect(&self, network_type: String, network_attrs: u32, network_id: String) -> bool {
        let identity = NetworkIdentity {
            network_type,
            network_attrs,
            network_id,
        };
        let (tx, rx) = oneshot::channel();
        let callback: IpUpCallback = Box::new(move |status| {
            let _ = tx.send(status);
        });

        if self
            .inputs
            .send(Input::IpUp { identity, callback })
            .await
            .is_err()
        {
            return false;
        }
        matches!(rx.await, Ok(CallStatus::Success))
    }

    /// Host boundary: request the IP layer down for an identity.
    async fn disconnect(&self, network_type: String, network_attrs: u32, network_id: String) -> bool {
        let identity = NetworkIdentity {
            network_type,
            network_attrs,
            network_id,
        };
        let (tx, rx) = oneshot::channel();
        let callback: IpDownCallback = Box::new(move || {
            let _ = tx.send(());
        });

        if self
            .inputs
            .send(Input::IpDown { identity, callback })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }

    /// Broadcast on every committed state transition.
    #[zbus(signal)]
    async fn status_changed(
        ctxt: &SignalContext<'_>,
        state: &str,
        mode: &str,
    ) -> zbus::Result<()>;
}

/// Status sink handed to the engine: forwards committed transitions to the
/// signal emitter task (and the log).
pub struct StatusBroadcaster {
    tx: mpsc::Sender<(TunnelStatus, OpMode)>,
}

impl StatusSink for StatusBroadcaster {
    fn emit(&self, status: TunnelStatus, mode: OpMode) {
        log::debug!("status: {} ({})", status.as_str(), mode.as_str());
        if self.tx.try_send((status, mode)).is_err() {
            log::warn!("status broadcast channel full, dropping transition");
        }
    }
}

/// Serve the manager interface on the system bus and start the signal
/// emitter. Returns the broadcaster for the engine and the live
/// connection, which must be kept for the daemon's lifetime.
pub async fn serve(inputs: mpsc::Sender<Input>) -> Result<(StatusBroadcaster, Connection)> {
    let connection = zbus::connection::Builder::system()
        .context("Failed to connect to system D-Bus")?
        .name(BUS_NAME)
        .context("Failed to request bus name")?
        .serve_at(OBJECT_PATH, ControlInterface { inputs })
        .context("Failed to register manager interface")?
        .build()
        .await
        .context("Failed to set up D-Bus service")?;

    let (tx, mut rx) = mpsc::channel::<(TunnelStatus, OpMode)>(STATUS_CHANNEL_SIZE);

    let signal_connection = connection.clone();
    tokio::spawn(async move {
        while let Some((status, mode)) = rx.recv().await {
            let iface = match signal_connection
                .object_server()
                .interface::<_, ControlInterface>(OBJECT_PATH)
                .await
            {
                Ok(iface) => iface,
                Err(e) => {
                    log::warn!("StatusChanged signal skipped: {}", e);
                    continue;
                }
            };
            if let Err(e) = ControlInterface::status_changed(
                iface.signal_context(),
                status.as_str(),
                mode.as_str(),
            )
            .await
            {
                log::warn!("Failed to emit StatusChanged: {}", e);
            }
        }
    });

    Ok((StatusBroadcaster { tx }, connection))
}
