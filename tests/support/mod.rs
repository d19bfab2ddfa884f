#![allow(dead_code)]

mod dirs;
mod harness;
mod http_utils;
mod logging;
mod net;
mod proxy_client;
mod upstream;

pub use dirs::TestDirs;
pub use harness::{ProxyHarness, ProxyHarnessBuilder, default_test_settings};
pub use http_utils::{read_http_response, read_response_status, read_until_double_crlf};
pub use logging::LogCapture;
pub use net::{find_free_port, wait_for_listener};
pub use proxy_client::ProxyClient;
pub use upstream::{MockUpstream, UpstreamReply};
