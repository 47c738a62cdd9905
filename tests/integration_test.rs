//! Tests of the public surface: builder validation, the packet text form,
//! and the announce lifecycle on an instance with no interfaces (so
//! nothing touches the network). Tests that need real multicast are
//! ignored by default.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use zeroconf::{
    Config, Error, Packet, RecordType, ServiceBuilder, TxtData, Zeroconf, ZeroconfListener,
};

/// An instance with no interfaces: the engine runs but never opens a
/// socket.
fn isolated() -> Zeroconf {
    Zeroconf::with_config(
        Config::default()
            .with_local_host_name("testhost")
            .with_network_interfaces(Vec::<String>::new()),
    )
    .expect("engine starts")
}

#[test]
fn builder_validates_inputs() {
    let zc = isolated();

    let build = |b: ServiceBuilder| b.build(&zc);
    assert_eq!(
        build(ServiceBuilder::new("", "_http._tcp").port(80)).unwrap_err(),
        Error::ErrInvalidServiceName
    );
    assert_eq!(
        build(ServiceBuilder::new("Web\u{7f}", "_http._tcp").port(80)).unwrap_err(),
        Error::ErrInvalidServiceName
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "http").port(80)).unwrap_err(),
        Error::ErrInvalidServiceType
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "_http.tcp").port(80)).unwrap_err(),
        Error::ErrInvalidServiceType
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "_http._tcp")).unwrap_err(),
        Error::ErrInvalidPortNumber
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "_http._tcp").port(80).domain("local")).unwrap_err(),
        Error::ErrInvalidDomain
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "_http._tcp").port(80).ttl_srv(4)).unwrap_err(),
        Error::ErrTtlOutOfRange
    );
    assert_eq!(
        build(ServiceBuilder::new("Web", "_http._tcp").port(80).ttl_ptr(86_401)).unwrap_err(),
        Error::ErrTtlOutOfRange
    );
    assert!(build(ServiceBuilder::new("Web", "_http._tcp").port(80).ttl_txt(5)).is_ok());

    zc.close();
}

#[test]
fn service_identity_from_builder() {
    let zc = isolated();

    let service = ServiceBuilder::new("MyWeb", "_http._tcp")
        .port(8080)
        .build(&zc)
        .unwrap();
    assert_eq!(service.fqdn(), "MyWeb._http._tcp.local");
    assert_eq!(service.name(), "MyWeb");
    assert_eq!(service.service_type(), "_http._tcp");
    assert_eq!(service.domain(), ".local");
    assert_eq!(service.port(), Some(8080));
    assert!(service.is_owned());

    // Dots in the instance name are escaped in the fqdn.
    let dotted = ServiceBuilder::new("My.Web", "_http._tcp")
        .port(8080)
        .build(&zc)
        .unwrap();
    assert_eq!(dotted.fqdn(), "My\\.Web._http._tcp.local");

    zc.close();
}

#[test]
fn announce_and_cancel_lifecycle() {
    let zc = isolated();
    let service = ServiceBuilder::new("MyWeb", "_http._tcp")
        .port(8080)
        .text("path", "/path/to/service")
        .build(&zc)
        .unwrap();

    // No interfaces, so the probes hear nothing and the claim succeeds.
    assert!(service.announce());
    assert_eq!(zc.announced_services(), vec![service.clone()]);

    // A second announce of the same name is refused.
    assert!(!service.announce());

    assert!(service.cancel());
    assert!(service.is_cancelled());
    assert!(zc.announced_services().is_empty());
    assert!(!service.cancel());

    zc.close();
}

#[test]
fn query_rejects_trailing_dot() {
    let zc = isolated();
    assert_eq!(
        zc.query(Some("_http._tcp."), None).unwrap_err(),
        Error::ErrInvalidServiceType
    );
    assert!(zc.query(Some("_http._tcp"), None).is_ok());
    assert!(zc.query(None, None).is_ok());
    assert!(zc.query(Some("_http._tcp"), Some("MyWeb")).is_ok());
    zc.close();
}

#[test]
fn config_setters_rewrite_live_fields() {
    let zc = isolated();
    assert_eq!(zc.domain(), ".local");
    zc.set_domain(".example");
    assert_eq!(zc.domain(), ".example");
    zc.set_local_host_name("elsewhere");
    assert_eq!(zc.local_host_name(), "elsewhere");
    zc.close();
}

#[test]
fn txt_data_keeps_insertion_order() {
    let mut text = TxtData::new();
    text.insert("b", Some("2".to_string()));
    text.insert("a", Some("1".to_string()));
    text.insert("c", None);
    // Replacing a value keeps the key's position.
    text.insert("b", Some("2x".to_string()));

    let entries: Vec<(&str, Option<&str>)> = text.iter().collect();
    assert_eq!(
        entries,
        vec![("b", Some("2x")), ("a", Some("1")), ("c", None)]
    );
    assert_eq!(text.len(), 3);
    assert_eq!(text.get("a"), Some(&Some("1".to_string())));
    assert_eq!(text.get("missing"), None);
}

#[test]
fn packet_text_form_roundtrips() {
    let text = r#"{"id":7,"timestamp":12345,"flags":33792,"nic":"eth0","response":true,
        "answers":[
            {"type":"ptr","name":"_http._tcp.local","class":32769,"ttl":28800,
             "value":"MyWeb._http._tcp.local"},
            {"type":"srv","name":"MyWeb._http._tcp.local","class":32769,"ttl":120,
             "host":"h.local","port":8080,"priority":0,"weight":0},
            {"type":"txt","name":"MyWeb._http._tcp.local","class":32769,"ttl":4500,
             "data":{"path":"/path/to/service","flag":null}}],
        "additionals":[
            {"type":"a","name":"h.local","class":32769,"ttl":120,
             "address":"192.0.2.10"}]}"#;

    let packet = Packet::parse(text).expect("parses");
    assert_eq!(packet.id(), 7);
    assert!(packet.is_response());
    assert!(packet.is_authoritative());
    assert_eq!(packet.nic(), Some("eth0"));
    assert_eq!(packet.answers().len(), 3);
    assert_eq!(packet.additionals().len(), 1);
    assert_eq!(packet.answers()[0].rtype(), RecordType::Ptr);

    let reparsed = Packet::parse(&packet.to_string()).expect("display parses");
    assert_eq!(reparsed.id(), packet.id());
    assert_eq!(reparsed.flags(), packet.flags());
    assert_eq!(reparsed.nic(), packet.nic());
    assert_eq!(reparsed.answers(), packet.answers());
    assert_eq!(reparsed.additionals(), packet.additionals());
}

#[test]
fn packet_parse_rejects_garbage() {
    assert!(Packet::parse("not json").is_err());
    assert!(Packet::parse("[1,2,3]").is_err());
    assert!(Packet::parse(r#"{"id":0,"flags":0,"answers":[{"name":"x"}]}"#).is_err());
}

struct Discovery {
    found: Mutex<bool>,
    cond: Condvar,
}

impl ZeroconfListener for Discovery {
    fn service_named(&self, stype: &str, name: &str) {
        if stype == "_zctest._tcp.local" && name == "IntegrationProbe" {
            *self.found.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }
}

#[test]
#[ignore = "requires a multicast-capable network interface"]
fn announce_is_heard_across_instances() {
    let announcer = Zeroconf::new().expect("engine starts");
    let watcher = Zeroconf::new().expect("engine starts");

    let discovery = Arc::new(Discovery {
        found: Mutex::new(false),
        cond: Condvar::new(),
    });
    watcher.add_listener(discovery.clone());

    let service = ServiceBuilder::new("IntegrationProbe", "_zctest._tcp")
        .port(4242)
        .build(&announcer)
        .unwrap();
    assert!(service.announce());

    watcher.query(Some("_zctest._tcp"), None).unwrap();
    let guard = discovery.found.lock().unwrap();
    let (guard, _) = discovery
        .cond
        .wait_timeout_while(guard, Duration::from_secs(5), |found| !*found)
        .unwrap();
    assert!(*guard, "announcement never heard");
    drop(guard);

    service.cancel();
    announcer.close();
    watcher.close();
}
