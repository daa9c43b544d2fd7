//! SSH endpoint tunnels through `cdswctl ssh-endpoint`.

pub mod banner;
pub mod launcher;

pub use banner::{BannerError, parse_banner};
pub use launcher::{
    DEFAULT_RUNTIME, EndpointRequest, LaunchOutcome, STDERR_CAPACITY, TunnelConfig, TunnelError,
    TunnelHandle, TunnelLauncher, TunnelState,
};
