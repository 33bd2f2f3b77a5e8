//! Key-bundle directory served by the relay.

use async_trait::async_trait;
use courier_core::{DirectoryError, Environment, KeyDirectory};
use courier_proto::{
    ErrorPayload, Payload,
    payloads::keys::{KeyBundleData, KeyBundleFetch, KeyBundlePublish},
};

use crate::{
    error::TransportError,
    transport::{Connector, Transport},
};

/// [`KeyDirectory`] over relay request/response frames.
pub struct RelayDirectory<C, E: Environment> {
    transport: Transport<C, E>,
}

impl<C, E> RelayDirectory<C, E>
where
    C: Connector,
    E: Environment,
{
    /// Directory using `transport`'s link.
    pub fn new(transport: Transport<C, E>) -> Self {
        Self { transport }
    }
}

fn unexpected(response: &Payload) -> DirectoryError {
    DirectoryError::Unavailable(format!("unexpected response {:?}", response.opcode()))
}

#[async_trait]
impl<C, E> KeyDirectory for RelayDirectory<C, E>
where
    C: Connector,
    E: Environment,
{
    async fn fetch_key_bundle(&self, peer: &str) -> Result<KeyBundleData, DirectoryError> {
        let request = Payload::KeyBundleFetch(KeyBundleFetch { user_id: peer.to_string() });

        match self.transport.request(request).await {
            Ok(Payload::KeyBundle(reply)) => {
                reply.bundle.ok_or_else(|| DirectoryError::NotFound { peer: peer.to_string() })
            },
            Ok(other) => Err(unexpected(&other)),
            Err(TransportError::Rejected { code: ErrorPayload::UNKNOWN_USER, .. }) => {
                Err(DirectoryError::NotFound { peer: peer.to_string() })
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_key_bundle(&self, bundle: KeyBundlePublish) -> Result<u32, DirectoryError> {
        let pre_keys = bundle.one_time_pre_keys.len();

        match self.transport.request(Payload::KeyBundlePublish(bundle)).await? {
            Payload::KeyBundlePublished(published) => {
                tracing::debug!(uploaded = pre_keys, available = published.available, "key bundle published");
                Ok(published.available)
            },
            other => Err(unexpected(&other)),
        }
    }
}
