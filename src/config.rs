//! Configuration types for dispatchers, groups and schedulers.

use crate::expiration::DEFAULT_TIMEOUT;
use smol_str::SmolStr;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Logical name of this node.
    pub node_name: SmolStr,

    /// Address to bind for command traffic.
    pub bind_addr: SocketAddr,

    /// Group membership configuration.
    pub group: GroupConfig,

    /// Command dispatcher configuration.
    pub dispatcher: DispatcherConfig,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Expiration configuration.
    pub expiration: ExpirationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], 7600));
        Self {
            node_name: SmolStr::new("node-1"),
            bind_addr,
            group: GroupConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            expiration: ExpirationConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration with the given node name and address.
    pub fn new(node_name: impl Into<SmolStr>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            ..Default::default()
        }
    }

    /// Set group configuration.
    pub fn with_group_config(mut self, group: GroupConfig) -> Self {
        self.group = group;
        self
    }

    /// Set dispatcher configuration.
    pub fn with_dispatcher_config(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set scheduler configuration.
    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set expiration configuration.
    pub fn with_expiration_config(mut self, expiration: ExpirationConfig) -> Self {
        self.expiration = expiration;
        self
    }
}

/// Group membership configuration.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Name of the cluster, used in logs.
    pub cluster_name: SmolStr,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            cluster_name: SmolStr::new("crema"),
        }
    }
}

impl GroupConfig {
    /// Set the cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.cluster_name = name.into();
        self
    }
}

/// Command dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a call may wait for its response. None waits until the
    /// response arrives or the target leaves the view.
    pub call_timeout: Option<Duration>,

    /// Connection timeout for reaching other nodes.
    pub connect_timeout: Duration,

    /// Maximum number of calls awaiting a response (backpressure).
    pub max_pending_calls: usize,

    /// Maximum size of a single framed message.
    pub max_message_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            connect_timeout: Duration::from_secs(2),
            max_pending_calls: 5000,
            max_message_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl DispatcherConfig {
    /// Set the call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the max pending calls.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending_calls = max;
        self
    }
}

/// Clustered scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hand local timers over to the new owner when a join moves ownership.
    pub handoff_on_join: bool,

    /// Re-arm schedules from the metadata store when owners depart or
    /// partitions merge.
    pub rearm_on_view_change: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            handoff_on_join: true,
            rearm_on_view_change: true,
        }
    }
}

impl SchedulerConfig {
    /// Enable or disable handoff on join.
    pub fn with_handoff_on_join(mut self, enabled: bool) -> Self {
        self.handoff_on_join = enabled;
        self
    }

    /// Enable or disable re-arming on view changes.
    pub fn with_rearm_on_view_change(mut self, enabled: bool) -> Self {
        self.rearm_on_view_change = enabled;
        self
    }
}

/// Expiration configuration.
#[derive(Debug, Clone)]
pub struct ExpirationConfig {
    /// Timeout given to freshly created entries.
    pub default_timeout: Option<Duration>,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl ExpirationConfig {
    /// Set the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Entries never expire unless given an explicit timeout.
    pub fn immortal() -> Self {
        Self {
            default_timeout: None,
        }
    }
}
