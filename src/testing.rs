//! Shared fixtures for the test suites.

use tracing_subscriber::EnvFilter;

use crate::transport::mock::Reply;
use crate::types::{DeviceModule, Direction, ParamSpec, ValueType};

/// A small radar: temperature read and gain written during init, range
/// read after every acquisition.
pub(crate) fn radar_module() -> DeviceModule {
    DeviceModule::builder("radar")
        .identity(&b"ID"[..], &b"RDR-24"[..])
        .param(
            ParamSpec::new("temp", Direction::Output, ValueType::I16, &b"TP"[..])
                .on_init()
                .variable("temp"),
        )
        .param(
            ParamSpec::new("gain", Direction::Input, ValueType::U8, &b"GN"[..])
                .on_init()
                .variable("gain"),
        )
        .param(
            ParamSpec::new("range", Direction::Output, ValueType::U16, &b"RG"[..])
                .on_post_acquisition()
                .variable("range"),
        )
        .build()
        .unwrap()
}

/// Answers [`radar_module`] requests; writes are echoed.
pub(crate) fn radar(request: &[u8]) -> Vec<Reply> {
    match &request[..2] {
        b"ID" => vec![Reply::frame(b"IDRDR-24")],
        b"TP" => vec![Reply::frame(b"TP\x2c\x01")],
        b"RG" => vec![Reply::frame(b"RG\x10\x00")],
        _ => vec![Reply::frame(request)],
    }
}

/// Routes logs to the test output, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
