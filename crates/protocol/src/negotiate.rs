use serde::{Deserialize, Serialize};

use crate::constants::{NEGOTIATE_VERSION, TransferFormat, TransportKind};

/// A transport the server offers, with the formats it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: TransportKind,
    pub transfer_formats: Vec<TransferFormat>,
}

impl AvailableTransport {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            transfer_formats: transport.transfer_formats().to_vec(),
        }
    }
}

/// Body returned by `POST {endpoint}/negotiate`.
///
/// Exactly one shape is populated: a connection (id, token, transports),
/// a redirect (url, access token), or an error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiate_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_transports: Vec<AvailableTransport>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_stateful_reconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NegotiateResponse {
    pub fn connection(
        connection_id: String,
        connection_token: String,
        transports: &[TransportKind],
        use_stateful_reconnect: bool,
    ) -> Self {
        Self {
            negotiate_version: Some(NEGOTIATE_VERSION),
            connection_id: Some(connection_id),
            connection_token: Some(connection_token),
            available_transports: transports.iter().copied().map(AvailableTransport::new).collect(),
            use_stateful_reconnect,
            ..Default::default()
        }
    }

    pub fn redirect(url: String, access_token: String) -> Self {
        Self {
            url: Some(url),
            access_token: Some(access_token),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Whether the server offers `kind` for the given transfer format.
    pub fn offers(&self, kind: TransportKind, format: TransferFormat) -> bool {
        self.available_transports
            .iter()
            .any(|t| t.transport == kind && t.transfer_formats.contains(&format))
    }
}
