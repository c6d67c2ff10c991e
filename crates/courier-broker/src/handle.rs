//! Broker connection ownership and channel pooling.
//!
//! A [`BrokerHandle`] owns one connection, opened lazily and never replaced,
//! and a free list of channels. Callers borrow a [`ChannelLease`] and the
//! channel goes back on the free list when the lease drops, on every exit
//! path. The free-list lock is never held across an await.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    ops::Deref,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    error::{BrokerError, Result},
    provision::QueueRecord,
    transport::{BrokerChannel, BrokerConnection, Connector},
};

type QueueSlot = Arc<OnceCell<Arc<QueueRecord>>>;

/// Owns the broker connection, its channel pool and the provisioned-queue
/// cache.
pub struct BrokerHandle {
    connector: Arc<dyn Connector>,
    connection: OnceCell<Arc<dyn BrokerConnection>>,
    pool: Arc<ChannelPool>,
    queues: Mutex<HashMap<String, QueueSlot>>,
}

impl BrokerHandle {
    /// Creates a disconnected handle that connects through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: OnceCell::new(),
            pool: Arc::new(ChannelPool::default()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the connection if it is not open yet.
    ///
    /// Concurrent callers share a single connection attempt. Once established
    /// the connection is kept for the life of the handle; if it later drops,
    /// the handle does not reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] on transport failure. A
    /// failed attempt is not cached, so a later call tries again.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        self.connection
            .get_or_try_init(|| async {
                let connection = self.connector.connect(uri).await?;
                info!(uri = %mask_credentials(uri), "connected to broker");
                Ok::<_, BrokerError>(connection)
            })
            .await?;
        Ok(())
    }

    /// Whether a connection has been established and is still open.
    pub fn is_connected(&self) -> bool {
        self.connection.get().is_some_and(|connection| connection.is_open())
    }

    /// Borrows a channel, opening a new one when none are idle.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] before [`BrokerHandle::connect`]
    /// succeeds, or the broker error if a new channel cannot be opened.
    pub async fn borrow_channel(&self) -> Result<ChannelLease> {
        if let Some(channel) = self.pool.take() {
            return Ok(ChannelLease { channel, pool: Arc::clone(&self.pool) });
        }

        let connection = self.connection.get().ok_or(BrokerError::NotConnected)?;
        let channel = connection.create_channel().await?;
        debug!(idle = self.pool.idle(), "opened broker channel");
        Ok(ChannelLease { channel, pool: Arc::clone(&self.pool) })
    }

    /// Number of channels currently on the free list.
    pub fn idle_channels(&self) -> usize {
        self.pool.idle()
    }

    /// Cache slot for `name`, created empty on first request.
    pub(crate) fn queue_slot(&self, name: &str) -> QueueSlot {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(name.to_string()).or_default())
    }
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("connected", &self.connection.initialized())
            .field("idle_channels", &self.pool.idle())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ChannelPool {
    idle: Mutex<VecDeque<Arc<dyn BrokerChannel>>>,
}

impl ChannelPool {
    fn take(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(channel) = idle.pop_front() {
            if channel.is_open() {
                return Some(channel);
            }
        }
        None
    }

    fn give_back(&self, channel: Arc<dyn BrokerChannel>) {
        if !channel.is_open() {
            debug!("discarding closed broker channel");
            return;
        }
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push_back(channel);
    }

    fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive use of a pooled channel; returns it to the pool on drop.
pub struct ChannelLease {
    channel: Arc<dyn BrokerChannel>,
    pool: Arc<ChannelPool>,
}

impl Deref for ChannelLease {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.pool.give_back(Arc::clone(&self.channel));
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease").field("open", &self.channel.is_open()).finish()
    }
}

/// Replaces the password in a broker URI for logging.
pub fn mask_credentials(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return uri.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => uri.to_string(),
    }
}
