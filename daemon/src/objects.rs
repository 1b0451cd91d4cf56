//! D-Bus objects published for BlueZ.
//!
//! `MonitorInterface` serves `org.bluez.AdvertisementMonitor1` at the monitor
//! path; `ApplicationInterface` serves the ObjectManager enumeration at the
//! fallback application path. Both are thin shells over the library types.
//!
//! Property queries on the monitor path are answered by `MonitorProperties`,
//! which replaces the object server's stock `org.freedesktop.DBus.Properties`
//! handler so that `Get`/`GetAll` follow [`MonitorObject::get_property`] and
//! [`MonitorObject::get_all_properties`]: `GetAll` on an interface the
//! monitor does not implement answers an empty dictionary.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use cable_filter::application::ManagedObjects;
use cable_filter::filter::{Pattern, Properties};
use cable_filter::protocol::{self, MonitorMessage, MAX_MSG_LEN};
use cable_filter::{
    MonitorApplication, MonitorError, MonitorObject, PropertyValue, Shutdown, ShutdownReason,
};
use zbus::zvariant::{self, Array, ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{fdo, interface, Connection};

/// Wire form of [`ManagedObjects`]: `a{oa{sa{sv}}}`.
pub type WireManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

// ── Output ─────────────────────────────────────────────────────────────

/// Write one NDJSON line to stdout.
pub fn emit(msg: &MonitorMessage) {
    write_event(&mut std::io::stdout().lock(), msg);
}

/// Returns whether the line was written.
fn write_event<W: Write>(out: &mut W, msg: &MonitorMessage) -> bool {
    let Some(line) = protocol::to_line(msg) else {
        log::warn!("Event dropped: line exceeds {} bytes", MAX_MSG_LEN);
        return false;
    };
    match out.write_all(&line) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Event dropped: write failed: {}", e);
            false
        }
    }
}

pub fn millis_since(started: Instant) -> u32 {
    (started.elapsed().as_millis() & 0xFFFF_FFFF) as u32
}

// ── Value conversion ───────────────────────────────────────────────────

/// Convert a property value to its D-Bus variant.
pub fn to_wire(value: &PropertyValue) -> zvariant::Result<OwnedValue> {
    let value = match value {
        PropertyValue::Str(s) => Value::from(*s),
        PropertyValue::Patterns(patterns) => {
            let wire: Vec<(u8, u8, Vec<u8>)> = patterns.iter().map(Pattern::to_wire).collect();
            Value::from(Array::from(wire))
        }
        PropertyValue::Int16(n) => Value::from(*n),
        PropertyValue::UInt16(n) => Value::from(*n),
    };
    OwnedValue::try_from(value)
}

pub fn properties_to_wire(props: &Properties) -> zvariant::Result<HashMap<String, OwnedValue>> {
    props
        .iter()
        .map(|(name, value)| to_wire(value).map(|v| (name.to_string(), v)))
        .collect()
}

pub fn managed_objects_to_wire(objects: &ManagedObjects) -> zvariant::Result<WireManagedObjects> {
    let mut wire = WireManagedObjects::new();
    for (path, interfaces) in objects {
        let path = OwnedObjectPath::from(ObjectPath::try_from(path.as_str())?);
        let mut wire_interfaces = HashMap::new();
        for (interface, props) in interfaces {
            wire_interfaces.insert(interface.to_string(), properties_to_wire(props)?);
        }
        wire.insert(path, wire_interfaces);
    }
    Ok(wire)
}

fn lookup_error(err: MonitorError) -> fdo::Error {
    match err {
        MonitorError::UnknownInterface(_) => fdo::Error::UnknownInterface(err.to_string()),
        MonitorError::UnknownProperty(_) => fdo::Error::UnknownProperty(err.to_string()),
    }
}

fn encode_error(err: zvariant::Error) -> fdo::Error {
    fdo::Error::Failed(err.to_string())
}

// ── Monitor ────────────────────────────────────────────────────────────

pub struct MonitorInterface {
    monitor: Arc<MonitorObject>,
    shutdown: Shutdown,
    started: Instant,
}

impl MonitorInterface {
    pub fn new(monitor: Arc<MonitorObject>, shutdown: Shutdown, started: Instant) -> Self {
        Self {
            monitor,
            shutdown,
            started,
        }
    }
}

#[interface(name = "org.bluez.AdvertisementMonitor1")]
impl MonitorInterface {
    /// The stack dropped the monitor; nothing is filtered any more.
    fn release(&self) {
        self.monitor.release();
        self.shutdown.cancel(ShutdownReason::Released);
    }

    fn device_found(&self, device: OwnedObjectPath) {
        self.monitor.device_found(device.as_str());
        emit(&MonitorMessage::Found {
            device: device.as_str(),
            ts: millis_since(self.started),
        });
    }

    fn device_lost(&self, device: OwnedObjectPath) {
        self.monitor.device_lost(device.as_str());
        emit(&MonitorMessage::Lost {
            device: device.as_str(),
            ts: millis_since(self.started),
        });
    }
}

/// `org.freedesktop.DBus.Properties` for the monitor path.
pub struct MonitorProperties {
    monitor: Arc<MonitorObject>,
}

impl MonitorProperties {
    pub fn new(monitor: Arc<MonitorObject>) -> Self {
        Self { monitor }
    }
}

#[interface(name = "org.freedesktop.DBus.Properties")]
impl MonitorProperties {
    fn get(&self, interface_name: &str, property_name: &str) -> fdo::Result<OwnedValue> {
        let value = self
            .monitor
            .get_property(interface_name, property_name)
            .map_err(lookup_error)?;
        to_wire(&value).map_err(encode_error)
    }

    fn get_all(&self, interface_name: &str) -> fdo::Result<HashMap<String, OwnedValue>> {
        properties_to_wire(&self.monitor.get_all_properties(interface_name)).map_err(encode_error)
    }

    fn set(&self, interface_name: &str, property_name: &str, _value: Value<'_>) -> fdo::Result<()> {
        // Resolve first so unknown names get their own error.
        self.monitor
            .get_property(interface_name, property_name)
            .map_err(lookup_error)?;
        Err(fdo::Error::PropertyReadOnly(format!(
            "{interface_name}.{property_name} is read-only"
        )))
    }
}

/// Serve the monitor at `path` on `conn`, with property queries answered
/// by the monitor itself.
pub async fn publish_monitor(
    conn: &Connection,
    path: &str,
    iface: MonitorInterface,
) -> zbus::Result<()> {
    let monitor = iface.monitor.clone();
    let server = conn.object_server();
    if !server.at(path, iface).await? {
        return Err(zbus::Error::Failure(format!(
            "{path} already serves an advertisement monitor"
        )));
    }
    server.remove::<fdo::Properties, _>(path).await?;
    server.at(path, MonitorProperties::new(monitor)).await?;
    Ok(())
}

// ── Fallback application ───────────────────────────────────────────────

pub struct ApplicationInterface {
    app: MonitorApplication,
}

impl ApplicationInterface {
    pub fn new(app: MonitorApplication) -> Self {
        Self { app }
    }
}

#[interface(name = "org.freedesktop.DBus.ObjectManager")]
impl ApplicationInterface {
    fn get_managed_objects(&self) -> fdo::Result<WireManagedObjects> {
        log::debug!("GetManagedObjects on {}", self.app.path());
        managed_objects_to_wire(&self.app.get_managed_objects()).map_err(encode_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cable_filter::defaults::MONITOR_INTERFACE;
    use cable_filter::{FilterSpec, MonitorState, Property};
    use zbus::connection;

    const MONITOR: &str = "/com/passkey/monitor0";
    const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    const DEVICE: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    // ── Value conversion ────────────────────────────────────────────

    #[test]
    fn scalar_values_keep_their_dbus_type() {
        let spec = FilterSpec::cable();

        let t = to_wire(&spec.value(Property::Type)).unwrap();
        assert_eq!(t.value_signature().as_str(), "s");
        assert_eq!(*t, Value::from("or_patterns"));

        let low = to_wire(&spec.value(Property::RssiLowThreshold)).unwrap();
        assert_eq!(low.value_signature().as_str(), "n");
        assert_eq!(*low, Value::from(i16::MIN));

        let timeout = to_wire(&spec.value(Property::RssiHighTimeout)).unwrap();
        assert_eq!(timeout.value_signature().as_str(), "q");
        assert_eq!(*timeout, Value::from(0u16));
    }

    #[test]
    fn patterns_are_array_of_structs() {
        let spec = FilterSpec::cable();
        let p = to_wire(&spec.value(Property::Patterns)).unwrap();
        assert_eq!(p.value_signature().as_str(), "a(yyay)");
    }

    #[test]
    fn managed_objects_carry_all_monitor_properties() {
        let monitor = Arc::new(MonitorObject::new(MONITOR, FilterSpec::cable()));
        let app = MonitorApplication::new("/com/passkey", monitor);

        let wire = managed_objects_to_wire(&app.get_managed_objects()).unwrap();
        let path = OwnedObjectPath::try_from(MONITOR).unwrap();
        let props = &wire[&path][MONITOR_INTERFACE];
        assert_eq!(props.len(), 6);
        for p in Property::ALL {
            assert!(props.contains_key(p.name()), "missing {}", p.name());
        }
    }

    // ── Output ──────────────────────────────────────────────────────

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn event_is_one_line() {
        let mut out = Vec::new();
        let msg = MonitorMessage::Found { device: DEVICE, ts: 7 };
        assert!(write_event(&mut out, &msg));
        assert_eq!(out.last(), Some(&b'\n'));
        assert_eq!(out.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn oversized_event_is_dropped() {
        let mut out = Vec::new();
        let device = "/x".repeat(MAX_MSG_LEN);
        let msg = MonitorMessage::Lost { device: &device, ts: 0 };
        assert!(!write_event(&mut out, &msg));
        assert!(out.is_empty());
    }

    #[test]
    fn write_failure_is_reported() {
        let msg = MonitorMessage::Found { device: DEVICE, ts: 0 };
        assert!(!write_event(&mut BrokenPipe, &msg));
    }

    #[test]
    fn millis_since_start_is_small() {
        assert!(millis_since(Instant::now()) < 1000);
    }

    // ── Over a peer-to-peer bus ─────────────────────────────────────

    struct Peer {
        client: Connection,
        _server: Connection,
        monitor: Arc<MonitorObject>,
        shutdown: Shutdown,
    }

    async fn serve_monitor() -> Peer {
        let guid = zbus::Guid::generate();
        let (p0, p1) = tokio::net::UnixStream::pair().unwrap();
        let (server, client) = tokio::try_join!(
            connection::Builder::unix_stream(p0)
                .server(guid)
                .unwrap()
                .p2p()
                .build(),
            connection::Builder::unix_stream(p1).p2p().build(),
        )
        .unwrap();

        let monitor = Arc::new(MonitorObject::new(MONITOR, FilterSpec::cable()));
        let shutdown = Shutdown::new();
        let iface = MonitorInterface::new(monitor.clone(), shutdown.clone(), Instant::now());
        publish_monitor(&server, MONITOR, iface).await.unwrap();

        Peer {
            client,
            _server: server,
            monitor,
            shutdown,
        }
    }

    impl Peer {
        async fn call<B>(&self, interface: &str, method: &str, body: &B) -> zbus::Result<zbus::Message>
        where
            B: zbus::export::serde::Serialize + zvariant::DynamicType,
        {
            self.client
                .call_method(None::<&str>, MONITOR, Some(interface), method, body)
                .await
        }

        async fn get_all(&self, interface: &str) -> zbus::Result<HashMap<String, OwnedValue>> {
            let reply = self.call(PROPERTIES, "GetAll", &(interface,)).await?;
            reply.body().deserialize()
        }

        async fn get(&self, interface: &str, name: &str) -> zbus::Result<OwnedValue> {
            let reply = self.call(PROPERTIES, "Get", &(interface, name)).await?;
            reply.body().deserialize()
        }
    }

    fn error_name(err: zbus::Error) -> String {
        match err {
            zbus::Error::MethodError(name, _, _) => name.to_string(),
            other => panic!("expected an error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_all_on_foreign_interface_is_empty() {
        let peer = serve_monitor().await;
        let props = peer.get_all("org.bluez.Device1").await.unwrap();
        assert!(props.is_empty());
    }

    #[tokio::test]
    async fn get_all_on_monitor_interface_has_six_properties() {
        let peer = serve_monitor().await;
        let props = peer.get_all(MONITOR_INTERFACE).await.unwrap();
        assert_eq!(props.len(), 6);
        assert_eq!(*props["Type"], Value::from("or_patterns"));
        assert_eq!(*props["RSSILowThreshold"], Value::from(i16::MIN));
        assert_eq!(props["Patterns"].value_signature().as_str(), "a(yyay)");
    }

    #[tokio::test]
    async fn get_reads_one_property() {
        let peer = serve_monitor().await;
        let v = peer.get(MONITOR_INTERFACE, "RSSIHighTimeout").await.unwrap();
        assert_eq!(*v, Value::from(0u16));
    }

    #[tokio::test]
    async fn get_refuses_unknown_names() {
        let peer = serve_monitor().await;

        let err = peer.get(MONITOR_INTERFACE, "TxPower").await.unwrap_err();
        assert_eq!(error_name(err), "org.freedesktop.DBus.Error.UnknownProperty");

        let err = peer.get("org.bluez.Device1", "Type").await.unwrap_err();
        assert_eq!(error_name(err), "org.freedesktop.DBus.Error.UnknownInterface");
    }

    #[tokio::test]
    async fn set_is_refused() {
        let peer = serve_monitor().await;
        let err = peer
            .call(
                PROPERTIES,
                "Set",
                &(MONITOR_INTERFACE, "RSSIHighThreshold", Value::from(-40i16)),
            )
            .await
            .unwrap_err();
        assert_eq!(error_name(err), "org.freedesktop.DBus.Error.PropertyReadOnly");
    }

    #[tokio::test]
    async fn device_callbacks_count_without_changing_state() {
        let peer = serve_monitor().await;
        peer.monitor.begin_registration().unwrap();
        peer.monitor.activate();

        let device = ObjectPath::try_from(DEVICE).unwrap();
        peer.call(MONITOR_INTERFACE, "DeviceFound", &(&device,)).await.unwrap();
        peer.call(MONITOR_INTERFACE, "DeviceFound", &(&device,)).await.unwrap();
        peer.call(MONITOR_INTERFACE, "DeviceLost", &(&device,)).await.unwrap();

        assert_eq!(peer.monitor.found_count(), 2);
        assert_eq!(peer.monitor.lost_count(), 1);
        assert_eq!(peer.monitor.state(), MonitorState::Active);
    }

    #[tokio::test]
    async fn release_retires_monitor_and_ends_run() {
        let peer = serve_monitor().await;
        peer.monitor.begin_registration().unwrap();
        peer.monitor.activate();

        peer.call(MONITOR_INTERFACE, "Release", &()).await.unwrap();
        peer.call(MONITOR_INTERFACE, "Release", &()).await.unwrap();

        assert_eq!(peer.monitor.state(), MonitorState::Released);
        assert_eq!(peer.shutdown.cancelled().await, ShutdownReason::Released);
        assert!(!peer.shutdown.cancel(ShutdownReason::Signal));
    }
}
