//! BlueZ side of the registration protocol.
//!
//! `BluezStack` implements the library's `MonitorManager` and
//! `ApplicationHost` seams on top of a zbus connection: manager calls go
//! through a generated proxy for the adapter's monitor manager, and the
//! fallback application is published on the same connection's object server.

use cable_filter::defaults::{
    BLUEZ_SERVICE, MONITOR_MANAGER_INTERFACE, REGISTER_APPLICATION_METHOD,
};
use cable_filter::registration::{ApplicationHost, MonitorManager};
use cable_filter::{ManagerError, MonitorApplication};
use zbus::fdo::IntrospectableProxy;
use zbus::zvariant::ObjectPath;
use zbus::{proxy, Connection};

use crate::objects::ApplicationInterface;

#[proxy(
    interface = "org.bluez.AdvertisementMonitorManager1",
    default_service = "org.bluez",
    gen_blocking = false
)]
trait AdvertisementMonitorManager1 {
    fn register_monitor(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;

    fn register_monitor_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;

    fn unregister_monitor(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Error names meaning the manager was never reached, as opposed to a
/// manager that answered and said no.
const UNREACHABLE_ERRORS: &[&str] = &[
    "org.freedesktop.DBus.Error.ServiceUnknown",
    "org.freedesktop.DBus.Error.NameHasNoOwner",
    "org.freedesktop.DBus.Error.NoReply",
    "org.freedesktop.DBus.Error.Disconnected",
    "org.freedesktop.DBus.Error.Timeout",
    "org.freedesktop.DBus.Error.UnknownObject",
];

/// Classify an error reply by name.
pub fn classify_reply(name: &str, message: Option<String>) -> ManagerError {
    let message = message.unwrap_or_default();
    if UNREACHABLE_ERRORS.contains(&name) {
        ManagerError::Unavailable(format!("{name}: {message}"))
    } else {
        ManagerError::rejected(name, message)
    }
}

/// Map a zbus error onto the library's manager error.
pub fn classify(err: zbus::Error) -> ManagerError {
    match err {
        zbus::Error::MethodError(name, message, _) => classify_reply(name.as_str(), message),
        other => ManagerError::Unavailable(other.to_string()),
    }
}

fn object_path(path: &str) -> Result<ObjectPath<'_>, ManagerError> {
    ObjectPath::try_from(path).map_err(|e| ManagerError::Unavailable(format!("{path}: {e}")))
}

pub struct BluezStack {
    conn: Connection,
    adapter: String,
    manager: AdvertisementMonitorManager1Proxy<'static>,
}

impl BluezStack {
    pub async fn new(conn: Connection, adapter: &str) -> zbus::Result<Self> {
        let manager = AdvertisementMonitorManager1Proxy::builder(&conn)
            .path(adapter.to_owned())?
            .build()
            .await?;
        Ok(Self {
            conn,
            adapter: adapter.to_owned(),
            manager,
        })
    }
}

impl MonitorManager for BluezStack {
    async fn register_monitor(&self, path: &str) -> Result<(), ManagerError> {
        log::debug!("{} RegisterMonitor({})", self.adapter, path);
        self.manager
            .register_monitor(&object_path(path)?)
            .await
            .map_err(classify)
    }

    async fn register_monitor_application(&self, path: &str) -> Result<(), ManagerError> {
        log::debug!("{} RegisterMonitorApplication({})", self.adapter, path);
        self.manager
            .register_monitor_application(&object_path(path)?)
            .await
            .map_err(classify)
    }

    async fn supports_application_registration(&self) -> Result<bool, ManagerError> {
        let introspectable = IntrospectableProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)
            .map_err(classify)?
            .path(self.adapter.clone())
            .map_err(classify)?
            .build()
            .await
            .map_err(classify)?;
        let xml = introspectable
            .introspect()
            .await
            .map_err(|e| classify(e.into()))?;

        let supported = manager_exposes(&xml, REGISTER_APPLICATION_METHOD)?;
        log::info!(
            "{} {} {}",
            self.adapter,
            if supported { "exposes" } else { "does not expose" },
            REGISTER_APPLICATION_METHOD
        );
        Ok(supported)
    }

    async fn unregister_monitor(&self, path: &str) -> Result<(), ManagerError> {
        log::debug!("{} UnregisterMonitor({})", self.adapter, path);
        self.manager
            .unregister_monitor(&object_path(path)?)
            .await
            .map_err(classify)
    }
}

impl ApplicationHost for BluezStack {
    async fn publish(&self, app: MonitorApplication) -> Result<(), ManagerError> {
        let path = app.path().to_owned();
        let added = self
            .conn
            .object_server()
            .at(path.as_str(), ApplicationInterface::new(app))
            .await
            .map_err(classify)?;
        if !added {
            return Err(ManagerError::rejected(
                "org.freedesktop.DBus.Error.ObjectPathInUse",
                format!("{path} already serves an ObjectManager"),
            ));
        }
        log::info!("Published monitor application at {}", path);
        Ok(())
    }
}

/// Whether the monitor manager interface in an introspection document
/// declares `method`.
pub fn manager_exposes(xml: &str, method: &str) -> Result<bool, ManagerError> {
    let node = zbus_xml::Node::from_reader(xml.as_bytes())
        .map_err(|e| ManagerError::Unavailable(format!("bad introspection data: {e}")))?;
    Ok(node
        .interfaces()
        .iter()
        .filter(|i| i.name().as_str() == MONITOR_MANAGER_INTERFACE)
        .flat_map(|i| i.methods())
        .any(|m| m.name().as_str() == method))
}
