#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use presmesh_core::ErrorKind;
use presmesh_gateway::config::{self, StoreBackend};

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
gateway:
  listen: "0.0.0.0:8080"
presence:
  ttl_mz: 1000 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn ok_minimal_config() {
    let ok = r#"
version: 1
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.store.backend, StoreBackend::Memory);
    assert_eq!(cfg.presence.ttl_ms, 30_000);

    let opts = cfg.presence_options();
    assert_eq!(opts.reaper_lookback_ms, 60_000, "lookback defaults to 2x ttl");
    assert_eq!(opts.event_name.svc, "presence");
    assert_eq!(opts.event_name.kind, "event");
}

#[test]
fn redis_backend_requires_url() {
    let bad = r#"
version: 1
store:
  backend: redis
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let ok = r#"
version: 1
store:
  backend: redis
  url: "redis://127.0.0.1:6379"
"#;
    config::load_from_str(ok).expect("must parse");
}

#[test]
fn event_name_must_be_svc_type_pair() {
    let bad = r#"
version: 1
presence:
  event_name: "presenceevent"
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn explicit_lookback_wins() {
    let ok = r#"
version: 1
presence:
  ttl_ms: 100
  reaper_interval_ms: 150
  reaper_lookback_ms: 50
"#;
    let opts = config::load_from_str(ok).unwrap().presence_options();
    assert_eq!(opts.ttl_ms, 100);
    assert_eq!(opts.reaper_interval_ms, 150);
    assert_eq!(opts.reaper_lookback_ms, 50);
}
