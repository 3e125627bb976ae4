//! D-Bus property exposition.
//!
//! Publishes `org.yktouch.Detector` on the session bus with one `u32`
//! property per backend (1 = waiting for a touch), emitting
//! `PropertiesChanged` on every transition so widgets can subscribe
//! instead of polling.

use std::sync::Arc;

use tracing::{debug, error, warn};
use zbus::Connection;
use zbus::interface;

use yktouch_core::{EventBus, Message};

pub const BUS_NAME: &str = "org.yktouch.Detector";
const OBJECT_PATH: &str = "/org/yktouch/Detector";

#[derive(Debug, Default)]
struct DetectorState {
    gpg: u32,
    u2f: u32,
    hmac: u32,
}

#[interface(name = "org.yktouch.Detector")]
impl DetectorState {
    #[zbus(property, name = "GPGState")]
    fn gpg_state(&self) -> u32 {
        self.gpg
    }

    #[zbus(property, name = "U2FState")]
    fn u2f_state(&self) -> u32 {
        self.u2f
    }

    #[zbus(property, name = "HMACState")]
    fn hmac_state(&self) -> u32 {
        self.hmac
    }
}

pub async fn run(bus: Arc<EventBus>) {
    let mut messages = bus.register("notifier/dbus");

    let conn = match Connection::session().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("cannot establish a D-Bus session connection: {e}");
            return;
        }
    };
    if let Err(e) = conn
        .object_server()
        .at(OBJECT_PATH, DetectorState::default())
        .await
    {
        error!("cannot export the D-Bus detector object: {e}");
        return;
    }
    if let Err(e) = conn.request_name(BUS_NAME).await {
        error!("cannot claim {BUS_NAME} (is another instance running?): {e}");
        return;
    }
    let iface = match conn
        .object_server()
        .interface::<_, DetectorState>(OBJECT_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            error!("cannot obtain the exported detector interface: {e}");
            return;
        }
    };
    debug!("D-Bus notifier ready on {BUS_NAME}");

    while let Some(message) = messages.recv().await {
        let value = u32::from(message.is_on());
        let mut state = iface.get_mut().await;
        let emitted = match message {
            Message::GpgOn | Message::GpgOff => {
                state.gpg = value;
                state.g_p_g_state_changed(iface.signal_emitter()).await
            }
            Message::U2fOn | Message::U2fOff => {
                state.u2f = value;
                state.u2_f_state_changed(iface.signal_emitter()).await
            }
            Message::HmacOn | Message::HmacOff => {
                state.hmac = value;
                state.h_m_a_c_state_changed(iface.signal_emitter()).await
            }
        };
        if let Err(e) = emitted {
            warn!(%message, "failed to emit D-Bus property change: {e}");
        }
    }
}
