//! Connection configuration.

use crate::credentials::{Credentials, PlainCredentials};
use crate::tuning::TuningParams;

/// Parameters for establishing a connection.
///
/// Host and port belong to whoever constructs the underlying stream; the
/// protocol's registered port is exported as `warren_wire::PROTOCOL_PORT`.
pub struct ConnectionConfig {
    /// Virtual host opened after tuning completes.
    pub virtual_host: String,
    /// Authentication credentials. Consumed during the start exchange and
    /// dropped immediately afterwards.
    pub credentials: Box<dyn Credentials>,
    /// Locally requested tuning limits, combined with the peer's offer.
    pub tuning: TuningParams,
    /// Client identification table sent in the start acknowledgement.
    pub client_properties: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            virtual_host: "/".to_string(),
            credentials: Box::new(PlainCredentials::guest()),
            tuning: TuningParams::default(),
            client_properties: vec![("product".to_string(), "warren".to_string())],
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials are intentionally not part of the debug output.
        f.debug_struct("ConnectionConfig")
            .field("virtual_host", &self.virtual_host)
            .field("tuning", &self.tuning)
            .field("client_properties", &self.client_properties)
            .finish_non_exhaustive()
    }
}
