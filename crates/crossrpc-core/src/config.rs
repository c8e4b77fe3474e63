//! Centralized configuration for crossrpc.
//!
//! Well-known channel names, relay procedure names and transport limits. These
//! values are part of the wire contract shared by every context, so they are
//! constants rather than runtime settings.

use std::time::Duration;

/// Protocol-level names shared by all three contexts.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Channel every envelope travels on.
    pub const PROCESS_EVENT: &'static str = "__rpc:process";
    /// Browser-side slot holding the promise of the browser's own identity.
    pub const IDENTIFIER: &'static str = "__rpc:id";
    /// Browser -> client channel announcing ownership of a name.
    pub const BROWSER_REGISTER: &'static str = "__rpc:browserRegister";
    /// Browser -> client channel disowning a name.
    pub const BROWSER_UNREGISTER: &'static str = "__rpc:browserUnregister";

    /// Client procedure that re-issues `call_server` on behalf of a browser.
    pub const RELAY_CALL_SERVER: &'static str = "__rpc:callServer";
    /// Client procedure that re-issues `call_browsers` on behalf of a peer.
    pub const RELAY_CALL_BROWSERS: &'static str = "__rpc:callBrowsers";
    /// Client event that re-issues `trigger_server` on behalf of a browser.
    pub const RELAY_TRIGGER_SERVER: &'static str = "__rpc:triggerServer";
    /// Client event that re-issues `trigger_browsers` on behalf of a peer.
    pub const RELAY_TRIGGER_BROWSERS: &'static str = "__rpc:triggerBrowsers";

    /// Failure payload for a name with no registered handler.
    pub const ERR_NOT_FOUND: &'static str = "PROCEDURE_NOT_FOUND";
}

/// Limits for the bundled stream transports.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}
