pub mod affinity;
pub mod clock;
pub mod dispatcher;
pub mod driver;
pub mod logging;
pub mod pacer;
pub mod params;
pub mod partition;
pub mod payload;
pub mod session;
pub mod stats;

/// Abort the process on an unrecoverable socket error, with source context.
/// The harness measures steady state; a degraded run is uninformative, so
/// any I/O error on an established session takes the whole client down.
#[macro_export]
macro_rules! fatal {
    ($action:expr, $err:expr) => {{
        eprintln!(
            "ERROR: {} file:{} line:{} action:{}",
            $err,
            file!(),
            line!(),
            $action
        );
        std::process::exit(1)
    }};
}
