//! One-time pre-key supply.
//!
//! Other users can only open sessions with this device while the relay
//! holds our one-time pre-keys. [`PreKeySupplyManager`] keeps that supply
//! topped up: below the threshold it generates a fixed batch plus a fresh
//! signed pre-key and publishes both in one call.
//!
//! Replenishment runs only when a caller asks for it (typically after every
//! successful connect), never from a timer.
//!
//! # Id allocation
//!
//! New ids start above both the highest stored id and the highest id this
//! process ever generated. A peer consuming the current highest pre-key
//! between the status read and generation therefore can't make us reissue
//! its id.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use courier_crypto::{CryptoEngine, PreKeyRecord, SignedPreKeyRecord};
use courier_proto::payloads::keys::KeyBundlePublish;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::PreKeyConfig,
    directory::KeyDirectory,
    env::Environment,
    error::PreKeyError,
    store::{KeyStore, Keyring},
};

/// Largest registration id handed out (14 bits, zero excluded).
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Snapshot of the local one-time pre-key supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreKeyStatus {
    /// Unconsumed one-time pre-keys
    pub count: usize,
    /// Highest stored id
    pub highest_id: Option<u32>,
    /// Replenishment threshold
    pub threshold: usize,
    /// `count < threshold`
    pub needs_replenishment: bool,
}

/// Result of a replenishment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replenishment {
    /// Whether new keys were generated and published
    pub replenished: bool,
    /// Number of one-time pre-keys uploaded
    pub uploaded: u32,
}

/// Result of a registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new identity was created and published
    Registered {
        /// New registration id
        registration_id: u32,
        /// One-time pre-keys published
        pre_keys: u32,
    },
    /// An identity already existed; nothing changed
    AlreadyRegistered,
}

/// Keeps the relay supplied with our one-time pre-keys.
pub struct PreKeySupplyManager<S, C, E> {
    keyring: Keyring<S>,
    directory: Arc<dyn KeyDirectory>,
    engine: C,
    env: E,
    config: PreKeyConfig,
    high_water: AtomicU32,
    publish_lock: AsyncMutex<()>,
}

impl<S, C, E> PreKeySupplyManager<S, C, E>
where
    S: KeyStore,
    C: CryptoEngine,
    E: Environment,
{
    /// Create a manager.
    pub fn new(
        store: S,
        directory: Arc<dyn KeyDirectory>,
        engine: C,
        env: E,
        config: PreKeyConfig,
    ) -> Self {
        Self {
            keyring: Keyring::new(store),
            directory,
            engine,
            env,
            config,
            high_water: AtomicU32::new(0),
            publish_lock: AsyncMutex::new(()),
        }
    }

    /// Current supply.
    pub fn status(&self) -> Result<PreKeyStatus, PreKeyError> {
        let count = self.keyring.pre_key_count()?;
        Ok(PreKeyStatus {
            count,
            highest_id: self.keyring.max_pre_key_id()?,
            threshold: self.config.threshold,
            needs_replenishment: count < self.config.threshold,
        })
    }

    /// Create and publish this device's identity, if it has none.
    pub async fn register(&self) -> Result<Registration, PreKeyError> {
        let _guard = self.publish_lock.lock().await;

        if self.keyring.identity()?.is_some() {
            return Ok(Registration::AlreadyRegistered);
        }

        let identity =
            self.engine.generate_identity(self.env.random_array(), self.env.random_array());
        let registration_id = 1 + self.env.random_u32() % MAX_REGISTRATION_ID;
        let pre_keys = self.generate_pre_keys(1, self.config.initial_batch_size);
        let signed = self.engine.generate_signed_pre_key(
            &identity,
            1,
            self.env.random_array(),
            self.env.wall_clock_millis(),
        );

        self.keyring.put_identity(&identity)?;
        self.keyring.put_registration_id(registration_id)?;
        self.store_keys(&pre_keys, &signed)?;

        let publish = KeyBundlePublish {
            identity_key: identity.public().to_bytes().to_vec(),
            registration_id,
            signed_pre_key: signed.to_data(),
            one_time_pre_keys: pre_keys.iter().map(PreKeyRecord::to_data).collect(),
        };

        if let Err(e) = self.directory.publish_key_bundle(publish).await {
            tracing::warn!(error = %e, "registration publish failed, discarding new identity");
            self.keyring.wipe()?;
            self.high_water.store(0, Ordering::SeqCst);
            return Err(e.into());
        }

        tracing::info!(registration_id, pre_keys = pre_keys.len(), "device registered");
        Ok(Registration::Registered { registration_id, pre_keys: pre_keys.len() as u32 })
    }

    /// Top up the supply if it is below the threshold.
    ///
    /// Safe to call repeatedly and concurrently: calls are serialized, and a
    /// call that finds the supply sufficient does nothing. If the relay
    /// rejects the publish the new keys are removed again. A transient
    /// failure (timeout, dropped link) leaves the outcome unknown, so the
    /// batch is kept: the relay may already be handing those keys out.
    pub async fn replenish(&self) -> Result<Replenishment, PreKeyError> {
        let _guard = self.publish_lock.lock().await;

        let identity = self.keyring.identity()?.ok_or(PreKeyError::NotRegistered)?;
        let registration_id =
            self.keyring.registration_id()?.ok_or(PreKeyError::NotRegistered)?;

        let status = self.status()?;
        if !status.needs_replenishment {
            tracing::debug!(count = status.count, "pre-key supply sufficient");
            return Ok(Replenishment { replenished: false, uploaded: 0 });
        }

        let start = status
            .highest_id
            .unwrap_or(0)
            .max(self.high_water.load(Ordering::SeqCst))
            .saturating_add(1);
        let pre_keys = self.generate_pre_keys(start, self.config.batch_size);

        let signed_id = self.keyring.max_signed_pre_key_id()?.unwrap_or(0).saturating_add(1);
        let signed = self.engine.generate_signed_pre_key(
            &identity,
            signed_id,
            self.env.random_array(),
            self.env.wall_clock_millis(),
        );

        self.store_keys(&pre_keys, &signed)?;

        let publish = KeyBundlePublish {
            identity_key: identity.public().to_bytes().to_vec(),
            registration_id,
            signed_pre_key: signed.to_data(),
            one_time_pre_keys: pre_keys.iter().map(PreKeyRecord::to_data).collect(),
        };

        match self.directory.publish_key_bundle(publish).await {
            Ok(available) => {
                let uploaded = pre_keys.len() as u32;
                tracing::info!(
                    uploaded,
                    first_id = start,
                    signed_pre_key = signed_id,
                    available,
                    "pre-keys replenished"
                );
                Ok(Replenishment { replenished: true, uploaded })
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, first_id = start, "pre-key publish outcome unknown, keeping batch");
                Err(e.into())
            },
            Err(e) => {
                tracing::warn!(error = %e, "pre-key publish rejected, rolling back batch");
                for record in &pre_keys {
                    self.keyring.remove_pre_key(record.id)?;
                }
                self.keyring.remove_signed_pre_key(signed.id)?;
                Err(e.into())
            },
        }
    }

    fn generate_pre_keys(&self, start: u32, count: u32) -> Vec<PreKeyRecord> {
        let records: Vec<_> = (0..count)
            .map(|offset| {
                self.engine.generate_pre_key(start.saturating_add(offset), self.env.random_array())
            })
            .collect();
        if let Some(last) = records.last() {
            self.high_water.fetch_max(last.id, Ordering::SeqCst);
        }
        records
    }

    fn store_keys(
        &self,
        pre_keys: &[PreKeyRecord],
        signed: &SignedPreKeyRecord,
    ) -> Result<(), PreKeyError> {
        for record in pre_keys {
            self.keyring.put_pre_key(record)?;
        }
        self.keyring.put_signed_pre_key(signed)?;
        Ok(())
    }
}
